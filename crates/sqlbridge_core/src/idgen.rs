use chrono::{Datelike, Timelike, Utc};
use rand::Rng;

use crate::error::{ErrorKind, SqlError};

/// Random delay in milliseconds to apply before retrying after a
/// rollback-class error. Uniform in [10, 110]: a fixed backoff makes
/// colliding transactions re-collide, randomization de-synchronizes them.
pub fn rollback_delay_ms() -> u64 {
    rand::rng().random_range(10..=110)
}

/// Generate a time-prefixed random id suitable for primary-key use where
/// auto-increment columns are undesirable (portability, sharding).
///
/// The id is `[time prefix][random suffix]` with the prefix chosen so ids
/// are roughly monotonic, which keeps B-tree index page splits rare, while
/// the suffix keeps collisions improbable. Collisions are still possible:
/// callers handle a unique-constraint violation by regenerating and
/// retrying. `max_len` is the requested decimal digit count, valid 9-18;
/// the result is positive and never wider than `max_len` digits.
pub fn gen_timerand_id(max_len: usize) -> Result<i64, SqlError> {
    if !(9..=18).contains(&max_len) {
        return Err(SqlError::new(
            ErrorKind::InvalidUse,
            format!("timerand id length {max_len} outside valid range 9-18"),
        ));
    }

    let now = Utc::now();
    let year = now.year().unsigned_abs() as u64;
    let day = u64::from(now.ordinal0()); // 0-365
    let secs = u64::from(now.num_seconds_from_midnight()); // 0-86399

    // Time prefix by requested length. Larger budgets take more year digits
    // and finer second resolution; the random suffix fills what remains.
    let (prefix, prefix_digits) = match max_len {
        9..=10 => ((year % 10) * 1_000 + day, 4),
        11..=12 => (((year % 10) * 1_000 + day) * 100 + secs / 1_000, 6),
        13 => (((year % 10) * 1_000 + day) * 10_000 + secs / 10, 8),
        14..=15 => (((year % 10) * 1_000 + day) * 100_000 + secs, 9),
        16 => (((year % 100) * 1_000 + day) * 100_000 + secs, 10),
        _ => (((year % 1_000) * 1_000 + day) * 100_000 + secs, 11),
    };

    let rand_digits = max_len - prefix_digits;
    let rand_mod = 10u64.pow(rand_digits as u32);
    let mut rng = rand::rng();

    // A zero id is reserved for misuse; re-draw the suffix on the (rare)
    // all-zero composition.
    loop {
        let id = prefix * rand_mod + rng.random_range(0..rand_mod);
        if id > 0 {
            return Ok(id as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_within_documented_range() {
        for _ in 0..1000 {
            let delay = rollback_delay_ms();
            assert!((10..=110).contains(&delay));
        }
    }

    #[test]
    fn id_fits_requested_digit_count() {
        for len in 9..=18 {
            for _ in 0..50 {
                let id = gen_timerand_id(len).unwrap();
                assert!(id > 0);
                assert!(
                    id.to_string().len() <= len,
                    "id {id} wider than {len} digits"
                );
            }
        }
    }

    #[test]
    fn id_length_out_of_range_is_misuse() {
        assert_eq!(
            gen_timerand_id(8).unwrap_err().kind(),
            ErrorKind::InvalidUse
        );
        assert_eq!(
            gen_timerand_id(19).unwrap_err().kind(),
            ErrorKind::InvalidUse
        );
    }

    #[test]
    fn prefix_orders_ids_generated_across_seconds() {
        // Two ids generated in order within the same process should compare
        // in generation order at second granularity most of the time; at
        // minimum the prefix must be non-decreasing.
        let a = gen_timerand_id(18).unwrap();
        let b = gen_timerand_id(18).unwrap();
        assert!(b / 10_000_000 >= a / 10_000_000);
    }
}
