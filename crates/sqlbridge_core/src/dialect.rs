//! SQL portability emitters shared by the drivers.
//!
//! Row-lock hints and bitwise operations differ enough across backends that
//! queries cannot be rewritten automatically; instead callers build queries
//! with these emitters at the appropriate positions and each driver maps its
//! backend onto a small capability enum.

use crate::error::{ErrorKind, SqlError};

/// Where a row-lock hint is being emitted within the query under
/// construction. Both positions must be used on the same query: backends
/// differ on which position carries the hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdlockType {
    /// Immediately after each referenced table name.
    Table,
    /// At the very end of the query string.
    QueryEnd,
}

/// Row-lock capability of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdlockCaps {
    /// No row-level lock hints; isolation levels carry the guarantees.
    None,
    /// `FOR UPDATE` appended at query end (MySQL, Oracle).
    ForUpdate,
    /// `FOR UPDATE` with optional `OF <table>` (PostgreSQL; the OF form is
    /// needed under left outer joins).
    ForUpdateOf,
    /// `WITH (ROWLOCK, XLOCK, HOLDLOCK)` after the table reference
    /// (Microsoft SQL Server).
    Mssql,
}

/// Append the backend-specific row-lock hint for `typ` to `query`.
pub fn append_updlock(
    caps: UpdlockCaps,
    query: &mut String,
    typ: UpdlockType,
    table_name: Option<&str>,
) {
    match (caps, typ) {
        (UpdlockCaps::Mssql, UpdlockType::Table) => {
            query.push_str(" WITH (ROWLOCK, XLOCK, HOLDLOCK)");
        }
        (UpdlockCaps::ForUpdate, UpdlockType::QueryEnd) => {
            query.push_str(" FOR UPDATE");
        }
        (UpdlockCaps::ForUpdateOf, UpdlockType::QueryEnd) => {
            query.push_str(" FOR UPDATE");
            if let Some(table) = table_name {
                query.push_str(" OF ");
                query.push_str(table);
            }
        }
        _ => {}
    }
}

/// Bitwise operation to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
}

/// Bitwise-operation capability of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOpCaps {
    /// Infix `&` / `|` operators.
    Infix,
    /// `BITAND()` / `BITOR()` function calls (Oracle; BITOR is installed by
    /// the driver's run-once hook since the server only ships BITAND).
    Func,
    /// Infix operators, with the right operand cast to BIGINT (DB2).
    InfixCastBigint,
}

/// Append `exp1 <op> exp2` in the backend's bitwise syntax.
pub fn append_bitop(
    caps: BitOpCaps,
    query: &mut String,
    op: BitOp,
    exp1: &str,
    exp2: &str,
) -> Result<(), SqlError> {
    if exp1.is_empty() || exp2.is_empty() {
        return Err(SqlError::new(
            ErrorKind::InvalidUse,
            "bitop expressions must be non-empty",
        ));
    }
    match caps {
        BitOpCaps::Infix => {
            let sym = if op == BitOp::And { "&" } else { "|" };
            query.push_str(&format!("({exp1} {sym} {exp2})"));
        }
        BitOpCaps::Func => {
            let func = if op == BitOp::And { "BITAND" } else { "BITOR" };
            query.push_str(&format!("{func}({exp1}, {exp2})"));
        }
        BitOpCaps::InfixCastBigint => {
            let sym = if op == BitOp::And { "&" } else { "|" };
            query.push_str(&format!("({exp1} {sym} CAST({exp2} AS BIGINT))"));
        }
    }
    Ok(())
}

/// Reshape an index name to fit a backend identifier-length limit.
///
/// Returns `None` when the name already fits. Sections are split on
/// underscore; trailing sections are truncated right-to-left to a uniform
/// width, 6 characters down to 2, stopping at the first fit. When no
/// combination fits, `fallback_id` supplies a time-random id and the name
/// becomes `i_<id>`.
pub fn rewrite_index_name(
    name: &str,
    max_len: usize,
    fallback_id: impl FnOnce() -> i64,
) -> Option<String> {
    if name.len() <= max_len {
        return None;
    }

    let sects: Vec<&str> = name.split('_').collect();
    for width in (2..=6).rev() {
        // Section 0 is the "i" index marker; truncate from the end.
        for start in (1..sects.len()).rev() {
            let candidate = sects
                .iter()
                .enumerate()
                .map(|(idx, sect)| {
                    if idx >= start && sect.len() > width {
                        sect.get(..width).unwrap_or(sect)
                    } else {
                        sect
                    }
                })
                .collect::<Vec<_>>()
                .join("_");
            if candidate.len() <= max_len {
                return Some(candidate);
            }
        }
    }

    Some(format!("i_{}", fallback_id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mssql_lock_sits_at_table_position() {
        let mut query = String::from("SELECT * FROM \"foo\"");
        append_updlock(UpdlockCaps::Mssql, &mut query, UpdlockType::Table, None);
        query.push_str(" WHERE \"bar\" = ?");
        append_updlock(UpdlockCaps::Mssql, &mut query, UpdlockType::QueryEnd, None);
        assert_eq!(
            query,
            "SELECT * FROM \"foo\" WITH (ROWLOCK, XLOCK, HOLDLOCK) WHERE \"bar\" = ?"
        );
    }

    #[test]
    fn for_update_lock_sits_at_query_end() {
        let mut query = String::from("SELECT * FROM \"foo\"");
        append_updlock(UpdlockCaps::ForUpdate, &mut query, UpdlockType::Table, None);
        query.push_str(" WHERE \"bar\" = ?");
        append_updlock(
            UpdlockCaps::ForUpdate,
            &mut query,
            UpdlockType::QueryEnd,
            None,
        );
        assert_eq!(query, "SELECT * FROM \"foo\" WHERE \"bar\" = ? FOR UPDATE");
    }

    #[test]
    fn for_update_of_names_the_table() {
        let mut query = String::from("SELECT * FROM t");
        append_updlock(
            UpdlockCaps::ForUpdateOf,
            &mut query,
            UpdlockType::QueryEnd,
            Some("t"),
        );
        assert_eq!(query, "SELECT * FROM t FOR UPDATE OF t");
    }

    #[test]
    fn none_caps_emit_nothing() {
        let mut query = String::from("SELECT 1");
        append_updlock(UpdlockCaps::None, &mut query, UpdlockType::Table, None);
        append_updlock(UpdlockCaps::None, &mut query, UpdlockType::QueryEnd, None);
        assert_eq!(query, "SELECT 1");
    }

    #[test]
    fn bitop_styles() {
        let mut q = String::new();
        append_bitop(BitOpCaps::Infix, &mut q, BitOp::And, "\"bar\"", "?").unwrap();
        assert_eq!(q, "(\"bar\" & ?)");

        let mut q = String::new();
        append_bitop(BitOpCaps::Func, &mut q, BitOp::Or, "\"bar\"", "?").unwrap();
        assert_eq!(q, "BITOR(\"bar\", ?)");

        let mut q = String::new();
        append_bitop(BitOpCaps::InfixCastBigint, &mut q, BitOp::Or, "x", "?").unwrap();
        assert_eq!(q, "(x | CAST(? AS BIGINT))");

        let mut q = String::new();
        assert!(append_bitop(BitOpCaps::Infix, &mut q, BitOp::And, "", "?").is_err());
    }

    #[test]
    fn short_index_names_pass_unchanged() {
        assert_eq!(rewrite_index_name("i_users_email", 30, || 1), None);
    }

    #[test]
    fn long_index_names_truncate_sections_from_the_right() {
        let name = "i_transaction_history_customer_reference";
        let rewritten = rewrite_index_name(name, 30, || 1).unwrap();
        assert!(rewritten.len() <= 30, "{rewritten}");
        assert!(rewritten.starts_with("i_"));
        // Leading sections keep as much of their identity as possible.
        assert!(rewritten.contains("transa") || rewritten.contains("transaction"));
    }

    #[test]
    fn impossible_names_fall_back_to_timerand() {
        // A single giant section with no underscores cannot be shortened by
        // section truncation.
        let name = "x".repeat(64);
        let rewritten = rewrite_index_name(&name, 30, || 123456789).unwrap();
        assert_eq!(rewritten, "i_123456789");
    }
}
