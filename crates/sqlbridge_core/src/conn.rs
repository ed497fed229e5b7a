use std::time::Instant;

use crate::driver::DriverConn;
use crate::error::{ErrorKind, SqlError};
use crate::queryformat::first_keyword;
use crate::stmt::Stmt;
use crate::trans::Isolation;

/// Connection health state. Transitions are unidirectional within one
/// acquisition cycle: `Ok` may degrade to `Rollback` or `Failed`, and only
/// the pool's release path restores a `Rollback` connection to `Ok` by
/// issuing the rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Healthy, idle or in use.
    Ok,
    /// A rollback-class error occurred; the connection refuses further
    /// statements until the pool rolls it back.
    Rollback,
    /// Unusable; destroyed when returned to the pool.
    Failed,
}

/// A pooled backend session: the driver connection plus the bookkeeping the
/// pool needs for health tracking and age-based rotation.
pub(crate) struct Conn {
    driver_conn: Box<dyn DriverConn>,
    state: ConnState,
    id: u64,
    host_idx: usize,
    readonly: bool,
    in_trans: bool,
    created_at: Instant,
    last_used: Instant,
}

impl Conn {
    pub(crate) fn new(
        driver_conn: Box<dyn DriverConn>,
        id: u64,
        host_idx: usize,
        readonly: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            driver_conn,
            state: ConnState::Ok,
            id,
            host_idx,
            readonly,
            in_trans: false,
            created_at: now,
            last_used: now,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn host_idx(&self) -> usize {
        self.host_idx
    }

    pub(crate) fn readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    pub(crate) fn idle_secs(&self) -> u64 {
        self.last_used.elapsed().as_secs()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub(crate) fn in_trans(&self) -> bool {
        self.in_trans
    }

    pub(crate) fn server_version(&self) -> &str {
        self.driver_conn.server_version()
    }

    /// Degrade the connection state according to an error's class.
    pub(crate) fn mark_from_error(&mut self, err: &SqlError) {
        if err.is_disconnect() {
            self.state = ConnState::Failed;
        } else if err.is_rollback() && self.state == ConnState::Ok {
            self.state = ConnState::Rollback;
        }
    }

    fn check_usable(&self) -> Result<(), SqlError> {
        match self.state {
            ConnState::Ok => Ok(()),
            ConnState::Rollback => Err(SqlError::new(
                ErrorKind::QueryDeadlock,
                "connection requires rollback before further statements",
            )),
            ConnState::Failed => Err(SqlError::new(
                ErrorKind::ConnLost,
                "connection has failed and awaits destruction",
            )),
        }
    }

    /// Drive one statement through the driver: rewrite, prepare, execute
    /// until every bind row is consumed, then fetch per the statement's
    /// chunking configuration. The statement's error state is maintained by
    /// the caller; this returns the raw outcome.
    pub(crate) fn execute_stmt(&mut self, stmt: &mut Stmt) -> Result<ErrorKind, SqlError> {
        self.check_usable()?;
        self.touch();

        let result = self.execute_stmt_inner(stmt);
        if let Err(err) = &result {
            self.mark_from_error(err);
        }
        result
    }

    fn execute_stmt_inner(&mut self, stmt: &mut Stmt) -> Result<ErrorKind, SqlError> {
        let query = stmt
            .query()
            .ok_or_else(|| SqlError::new(ErrorKind::QueryNotPrepared, "no query prepared"))?
            .to_string();
        let num_params = stmt.bind_col_count();
        let total_rows = stmt.bind_rows_remaining();
        let is_insert = first_keyword(&query)
            .map(|word| word.eq_ignore_ascii_case("INSERT"))
            .unwrap_or(false);

        let mut has_result = false;
        let mut more_rows = false;
        let mut last_format_rows = usize::MAX;

        loop {
            let remaining = stmt.bind_rows_remaining();
            let format_rows = if remaining == 0 {
                1
            } else {
                self.driver_conn
                    .query_row_count(num_params, remaining)
                    .clamp(1, remaining)
            };

            // Re-rewrite and re-prepare only when the row chunk size
            // changes; drivers may hand back a cached prepared handle.
            if format_rows != last_format_rows {
                let rewritten = self
                    .driver_conn
                    .query_format(&query, num_params, format_rows)?;
                stmt.set_driver_query(rewritten);
                self.driver_conn.prepare(stmt)?;
                last_format_rows = format_rows;
            }

            let outcome = self.driver_conn.execute(stmt)?;
            has_result |= outcome.has_result;
            more_rows = outcome.more_rows;

            if remaining == 0 {
                break;
            }
            stmt.consume_executed(outcome.rows_consumed.max(1));
            if stmt.bind_rows_remaining() == 0 {
                break;
            }
        }

        // With no fetch limit the caller wants the whole result buffered
        // before execute returns.
        if has_result && stmt.max_fetch_rows() == 0 {
            while more_rows {
                more_rows = self.driver_conn.fetch(stmt)?;
            }
        }
        stmt.set_remaining_rows(more_rows);

        // An on-conflict-do-nothing rewrite hides conflicts from the error
        // path; a shortfall in affected rows is the only signal left.
        if is_insert
            && total_rows > 0
            && self.driver_conn.onconflict_rows_check()
            && stmt.affected_rows() < total_rows
        {
            return Err(SqlError::new(
                ErrorKind::QueryConstraint,
                format!(
                    "{} of {} rows inserted; remainder hit a conflict",
                    stmt.affected_rows(),
                    total_rows
                ),
            ));
        }

        if has_result && (stmt.result().num_rows() > 0 || more_rows) {
            Ok(ErrorKind::SuccessRow)
        } else {
            Ok(ErrorKind::Success)
        }
    }

    /// Pull the next chunk for a previously executed chunked statement.
    pub(crate) fn fetch_stmt(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError> {
        self.check_usable()?;
        self.touch();
        let result = self.driver_conn.fetch(stmt);
        if let Err(err) = &result {
            self.mark_from_error(err);
        }
        result
    }

    pub(crate) fn begin(&mut self, isolation: Isolation) -> Result<(), SqlError> {
        self.check_usable()?;
        self.touch();
        match self.driver_conn.begin(isolation) {
            Ok(()) => {
                self.in_trans = true;
                Ok(())
            }
            Err(err) => {
                self.mark_from_error(&err);
                Err(err)
            }
        }
    }

    pub(crate) fn commit(&mut self) -> Result<(), SqlError> {
        self.check_usable()?;
        self.touch();
        let result = self.driver_conn.commit();
        self.in_trans = false;
        if let Err(err) = &result {
            self.mark_from_error(err);
        }
        result.map(|_| ())
    }

    /// Roll back the open transaction (if any) and restore the connection
    /// to `Ok` unless the rollback itself reveals a dead connection.
    pub(crate) fn rollback(&mut self) -> Result<(), SqlError> {
        if self.state == ConnState::Failed {
            return Err(SqlError::new(ErrorKind::ConnLost, "connection has failed"));
        }
        self.touch();
        let result = self.driver_conn.rollback();
        self.in_trans = false;
        match result {
            Ok(()) => {
                self.state = ConnState::Ok;
                Ok(())
            }
            Err(err) => {
                if err.is_disconnect() {
                    self.state = ConnState::Failed;
                }
                Err(err)
            }
        }
    }

    pub(crate) fn disconnect(&mut self) {
        self.driver_conn.disconnect();
    }
}
