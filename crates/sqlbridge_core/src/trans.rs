use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{ErrorKind, SqlError};
use crate::idgen::rollback_delay_ms;
use crate::pool::{ConnGuard, Pool};
use crate::stmt::Stmt;

/// Transaction isolation level.
///
/// Drivers map these onto their native set: an unsupported level is
/// replaced by the closest *stronger* supported level (upgrades silently,
/// downgrades only when the backend has nothing stronger, with a trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Isolation {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl Isolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Isolation::ReadUncommitted => "READ UNCOMMITTED",
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead => "REPEATABLE READ",
            Isolation::Snapshot => "SNAPSHOT",
            Isolation::Serializable => "SERIALIZABLE",
        }
    }

    pub fn from_str(text: &str) -> Option<Self> {
        let folded = text.trim().to_ascii_uppercase();
        match folded.as_str() {
            "READ UNCOMMITTED" => Some(Isolation::ReadUncommitted),
            "READ COMMITTED" => Some(Isolation::ReadCommitted),
            "REPEATABLE READ" => Some(Isolation::RepeatableRead),
            "SNAPSHOT" => Some(Isolation::Snapshot),
            "SERIALIZABLE" => Some(Isolation::Serializable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open transaction, pinning one primary-pool connection from begin to
/// commit or rollback. Statements executed through the transaction all run
/// on the pinned connection, in arrival order.
///
/// Dropping an unresolved transaction rolls it back.
pub struct Trans {
    guard: Option<ConnGuard>,
    finished: bool,
}

impl Trans {
    pub(crate) fn new(guard: ConnGuard) -> Self {
        Self {
            guard: Some(guard),
            finished: false,
        }
    }

    fn guard_mut(&mut self) -> Result<&mut ConnGuard, SqlError> {
        if self.finished {
            return Err(SqlError::new(
                ErrorKind::InvalidUse,
                "transaction already resolved",
            ));
        }
        self.guard.as_mut().ok_or_else(|| {
            SqlError::new(ErrorKind::InvalidUse, "transaction has no connection")
        })
    }

    /// Execute a statement on the pinned connection. Rollback-class errors
    /// are surfaced, never auto-retried: recovery inside a transaction may
    /// depend on earlier statements, so the whole transaction restarts
    /// (see [`process`]).
    pub fn execute(&mut self, stmt: &mut Stmt) -> Result<ErrorKind, SqlError> {
        stmt.begin_execution()?;
        let guard = self.guard_mut()?;
        match guard.conn_execute(stmt) {
            Ok(kind) => {
                stmt.record_ok(kind);
                Ok(kind)
            }
            Err(err) => Err(stmt.record(err)),
        }
    }

    /// Fetch the next chunk for a chunked statement executed through this
    /// transaction.
    pub fn fetch(&mut self, stmt: &mut Stmt) -> Result<ErrorKind, SqlError> {
        if !stmt.has_remaining_rows() {
            stmt.result_clear_chunk();
            return Ok(ErrorKind::Success);
        }
        let guard = self.guard_mut()?;
        stmt.result_clear_chunk();
        match guard.conn_fetch(stmt) {
            Ok(more) => {
                stmt.set_remaining_rows(more);
                let kind = if more {
                    ErrorKind::SuccessRow
                } else {
                    ErrorKind::Success
                };
                stmt.record_ok(kind);
                Ok(kind)
            }
            Err(err) => {
                stmt.set_remaining_rows(false);
                Err(stmt.record(err))
            }
        }
    }

    /// Commit. On failure the driver has already rolled the transaction
    /// back; a rollback-class failure means the work may be retried from
    /// the top.
    pub fn commit(mut self) -> Result<(), SqlError> {
        let guard = self.guard_mut()?;
        let result = guard.conn_commit();
        self.finished = true;
        self.guard = None;
        result
    }

    /// Roll back and release the pinned connection.
    pub fn rollback(mut self) -> Result<(), SqlError> {
        let guard = self.guard_mut()?;
        let result = guard.conn_rollback();
        self.finished = true;
        self.guard = None;
        result
    }
}

impl Drop for Trans {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(guard) = self.guard.as_mut() {
            if let Err(err) = guard.conn_rollback() {
                warn!("rollback of abandoned transaction failed: {err}");
            }
        }
    }
}

impl Pool {
    /// Begin a transaction at the requested isolation level, pinning a
    /// primary-pool connection. Rollback-class failures during begin are
    /// retried with the randomized backoff.
    pub fn begin(&self, isolation: Isolation) -> Result<Trans, SqlError> {
        loop {
            let mut guard = self.acquire_guard(false)?;
            match guard.conn_begin(isolation) {
                Ok(()) => return Ok(Trans::new(guard)),
                Err(err) if err.is_rollback() => {
                    drop(guard);
                    let delay = rollback_delay_ms();
                    debug!("begin failed ({err}), retrying in {delay}ms");
                    thread::sleep(Duration::from_millis(delay));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Run `func` inside a transaction, committing, rolling back, or retrying
/// based on the returned kind:
///
/// - `UserSuccess` / `Success` commit; a rollback-class commit failure
///   restarts the whole sequence.
/// - `UserRetry` or any rollback-class kind rolls back, sleeps the
///   randomized backoff, and restarts.
/// - `UserFailure` or any fatal kind rolls back and returns the error.
///
/// The callback typically maps statement errors to their kinds
/// (`stmt.error()`) and uses the `User*` kinds for its own outcomes.
pub fn process<F>(pool: &Pool, isolation: Isolation, mut func: F) -> Result<ErrorKind, SqlError>
where
    F: FnMut(&mut Trans) -> ErrorKind,
{
    loop {
        let mut trans = pool.begin(isolation)?;
        let kind = func(&mut trans);

        if matches!(kind, ErrorKind::UserSuccess | ErrorKind::Success) {
            match trans.commit() {
                Ok(()) => return Ok(kind),
                Err(err) if err.is_rollback() => {
                    let delay = rollback_delay_ms();
                    debug!("commit rolled back ({err}), retrying in {delay}ms");
                    thread::sleep(Duration::from_millis(delay));
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        if kind.is_rollback() {
            if let Err(err) = trans.rollback() {
                debug!("rollback before retry reported: {err}");
            }
            let delay = rollback_delay_ms();
            thread::sleep(Duration::from_millis(delay));
            continue;
        }

        // Fatal or UserFailure: surface to the caller.
        if let Err(err) = trans.rollback() {
            debug!("rollback after failure reported: {err}");
        }
        return Err(SqlError::from(kind));
    }
}
