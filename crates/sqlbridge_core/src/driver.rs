use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use crate::connstr::ConnStr;
use crate::dialect::{BitOp, UpdlockType};
use crate::error::{ErrorKind, SqlError};
use crate::stmt::Stmt;
use crate::trans::Isolation;
use crate::value::DataType;

/// Everything a driver needs to build its per-pool state: the parsed
/// connection string plus the credentials shared by both sub-pools.
pub struct DriverPoolRequest<'a> {
    pub conn_str: &'a ConnStr,
    pub username: &'a str,
    pub password: &'a str,
    pub is_readonly: bool,
}

/// Outcome of one driver `execute` call.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteResult {
    /// How many of the statement's queued bind rows this execution consumed.
    /// The core re-invokes `execute` until all rows are consumed, narrowing
    /// the statement's visible bind window each time.
    pub rows_consumed: usize,
    /// A result set was produced (SELECT-like statement).
    pub has_result: bool,
    /// Rows remain server-side beyond what was buffered by this call.
    pub more_rows: bool,
}

/// A backend plugin. One value per backend, registered in the process-wide
/// [`DriverRegistry`] under its short name and shared by every pool using
/// that backend.
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Short name used in the registry and by `Pool::builder` ("sqlite",
    /// "mysql", "postgresql").
    fn name(&self) -> &'static str;

    /// Human-readable name ("SQLite", "MySQL/MariaDB", "PostgreSQL").
    fn display_name(&self) -> &'static str;

    /// Driver version tag (not the server version).
    fn version(&self) -> &'static str;

    /// One-time process-wide setup. Called once, before the first pool for
    /// this driver is created.
    fn init(&self) -> Result<(), SqlError> {
        Ok(())
    }

    /// Validate the connection string and build per-pool driver state.
    /// Called once for the primary sub-pool and once more for an attached
    /// read-only sub-pool.
    fn create_pool(&self, request: &DriverPoolRequest<'_>) -> Result<Box<dyn DriverPool>, SqlError>;
}

/// Per-sub-pool driver state: the parsed host list plus the dialect surface
/// used by query construction helpers. Shared read-only across threads.
pub trait DriverPool: Send + Sync + std::fmt::Debug {
    /// Number of hosts in the connection string; sizes the pool's rotation
    /// and fallback schedule.
    fn num_hosts(&self) -> usize;

    /// Establish one backend session against the given host index.
    fn connect(&self, host_idx: usize) -> Result<Box<dyn DriverConn>, SqlError>;

    /// Emit the backend column-type declaration for a unified type. Used by
    /// CREATE TABLE construction; `is_cast` requests the form usable inside
    /// a CAST expression.
    fn datatype(&self, buf: &mut String, dtype: DataType, max_len: usize, is_cast: bool);

    /// Append a backend-specific CREATE TABLE trailer (e.g. MySQL
    /// `ENGINE=InnoDB CHARSET=utf8mb4`).
    fn create_table_suffix(&self, _buf: &mut String) {}

    /// Emit the backend row-lock hint at the given position.
    fn append_updlock(&self, _buf: &mut String, _typ: UpdlockType, _table_name: Option<&str>) {}

    /// Emit a bitwise operation in the backend's syntax.
    fn append_bitop(
        &self,
        buf: &mut String,
        op: BitOp,
        exp1: &str,
        exp2: &str,
    ) -> Result<(), SqlError>;

    /// Reshape an over-long index name to the backend identifier limit.
    /// `None` means the name is fine as-is.
    fn rewrite_index_name(&self, _name: &str) -> Option<String> {
        None
    }
}

/// One backend session. Owned exclusively by one thread between pool
/// acquire and release, so no interior locking is required.
pub trait DriverConn: Send {
    /// Server name and version, queried at connect time.
    fn server_version(&self) -> &str;

    /// Post-connect hook. `is_first_in_pool` is true for the first
    /// connection the sub-pool ever establishes, letting a backend run
    /// one-time setup (install helper functions, run ANALYZE, set session
    /// defaults). A failure here fails the connection attempt but does not
    /// mark the host as failed.
    fn runonce(&mut self, _is_first_in_pool: bool) -> Result<(), SqlError> {
        Ok(())
    }

    /// Rewrite a `?`-placeholder query into the backend's convention. Most
    /// backends delegate to [`crate::queryformat::format_query`] with their
    /// flag set.
    fn query_format(
        &self,
        query: &str,
        num_params: usize,
        num_rows: usize,
    ) -> Result<String, SqlError>;

    /// How many of the caller's queued bind rows the next execution will
    /// consume. Lets backends with per-statement row limits chunk large
    /// multi-row inserts.
    fn query_row_count(&self, _num_params: usize, num_rows: usize) -> usize {
        num_rows
    }

    /// Create (or revalidate a cached) backend prepared-statement object for
    /// the statement's rewritten query.
    fn prepare(&mut self, stmt: &mut Stmt) -> Result<(), SqlError>;

    /// Run the prepared statement, consuming bind rows and/or buffering the
    /// first chunk of result rows into the statement.
    fn execute(&mut self, stmt: &mut Stmt) -> Result<ExecuteResult, SqlError>;

    /// Pull the next chunk of result rows into the statement's buffer.
    /// Returns whether rows remain server-side after this chunk.
    fn fetch(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError>;

    /// Begin a transaction. Unsupported isolation levels map to the closest
    /// stronger supported level.
    fn begin(&mut self, isolation: Isolation) -> Result<(), SqlError>;

    /// Roll back the open transaction. A no-op if the backend already
    /// closed it implicitly after a failure.
    fn rollback(&mut self) -> Result<(), SqlError>;

    /// Commit the open transaction. On failure the driver must leave the
    /// transaction rolled back.
    fn commit(&mut self) -> Result<(), SqlError>;

    /// After execution, whether the core should compare affected rows to
    /// expected rows and synthesize `QueryConstraint` on a shortfall. True
    /// for backends whose inserts are rewritten with an
    /// on-conflict-do-nothing clause.
    fn onconflict_rows_check(&self) -> bool {
        false
    }

    /// Close the session. Failures are logged, not propagated; this is a
    /// destroy path.
    fn disconnect(&mut self);
}

/// Process-wide registry of backend drivers, keyed by short name.
///
/// Drivers register once (typically from the backend crate's `register()`
/// function) and stay registered for the life of the process.
pub struct DriverRegistry {
    drivers: Mutex<HashMap<&'static str, Arc<dyn Driver>>>,
}

static REGISTRY: LazyLock<DriverRegistry> = LazyLock::new(|| DriverRegistry {
    drivers: Mutex::new(HashMap::new()),
});

/// The process-wide driver registry.
pub fn registry() -> &'static DriverRegistry {
    &REGISTRY
}

impl DriverRegistry {
    /// Register a driver under its short name. Re-registering the same name
    /// replaces the previous entry; the driver's `init` runs here, once.
    pub fn register(&self, driver: Arc<dyn Driver>) -> Result<(), SqlError> {
        driver.init().map_err(|err| {
            SqlError::new(
                ErrorKind::ConnDriverLoad,
                format!("driver '{}' failed to initialize: {}", driver.name(), err.message()),
            )
        })?;
        let mut drivers = lock(&self.drivers);
        drivers.insert(driver.name(), driver);
        Ok(())
    }

    /// Look up a driver by short name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Driver>, SqlError> {
        let drivers = lock(&self.drivers);
        drivers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, driver)| driver.clone())
            .ok_or_else(|| {
                SqlError::new(
                    ErrorKind::ConnNoDriver,
                    format!("no driver registered under '{name}'"),
                )
            })
    }

    /// Registered driver short names.
    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.drivers).keys().copied().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queryformat::{QueryFormatFlags, format_query};

    #[derive(Debug)]
    struct NullDriver;

    impl Driver for NullDriver {
        fn name(&self) -> &'static str {
            "null"
        }

        fn display_name(&self) -> &'static str {
            "Null"
        }

        fn version(&self) -> &'static str {
            "0.0"
        }

        fn create_pool(
            &self,
            _request: &DriverPoolRequest<'_>,
        ) -> Result<Box<dyn DriverPool>, SqlError> {
            Err(SqlError::new(ErrorKind::ConnFailed, "null driver"))
        }
    }

    #[test]
    fn registry_roundtrip_and_missing_driver() {
        registry().register(Arc::new(NullDriver)).unwrap();
        let found = registry().lookup("NULL").unwrap();
        assert_eq!(found.name(), "null");

        let err = registry().lookup("no-such-backend").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnNoDriver);
    }

    #[test]
    fn default_row_count_consumes_everything() {
        // The helper trait default is exercised through a tiny inline conn in
        // the pool tests; here we just pin the shared formatter contract the
        // drivers lean on.
        let out = format_query("SELECT ?", QueryFormatFlags::empty(), 1, 1).unwrap();
        assert_eq!(out, "SELECT ?");
    }
}
