//! Uniform SQL access over heterogeneous backends: a blocking connection
//! pool with primary/read-only routing, prepared statements with multi-row
//! binding, scoped transactions with deadlock retry, and coalesced group
//! inserts.
//!
//! Enable backends via features (`sqlite` is on by default) and call
//! [`init`] once at startup to register them:
//!
//! ```no_run
//! use sqlbridge::{Pool, Stmt};
//!
//! sqlbridge::init().expect("driver registration");
//! let pool = Pool::builder("sqlite", "path=/var/lib/app/app.db")
//!     .max_conns(4)
//!     .start()
//!     .expect("pool start");
//!
//! let mut stmt = Stmt::new();
//! stmt.prepare("SELECT name FROM users WHERE id = ?").expect("prepare");
//! stmt.bind_int64(42).expect("bind");
//! stmt.execute(&pool).expect("execute");
//! ```

pub use sqlbridge_core::*;

/// Register every backend enabled at compile time.
pub fn init() -> Result<(), SqlError> {
    #[cfg(feature = "sqlite")]
    sqlbridge_driver_sqlite::register()?;
    #[cfg(feature = "postgresql")]
    sqlbridge_driver_postgres::register()?;
    #[cfg(feature = "mysql")]
    sqlbridge_driver_mysql::register()?;
    Ok(())
}
