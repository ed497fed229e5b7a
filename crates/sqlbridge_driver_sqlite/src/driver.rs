use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rusqlite::types::ValueRef;
use rusqlite::{Connection as RusqliteConnection, OpenFlags};

use sqlbridge_core::{
    BitOp, BitOpCaps, ConnStrParam, ConnStrType, DataType, Driver, DriverConn, DriverPool,
    DriverPoolRequest, ErrorKind, ExecuteResult, Isolation, QueryFormatFlags, ResultCol, SqlError,
    Stmt, Value, append_bitop, registry, validate_conn_str,
};

/// SQLite limits bound variables per statement; stay under the historical
/// default rather than probing the build.
const MAX_BIND_VARS: usize = 999;

/// Lock-contention wait before SQLITE_BUSY surfaces; the pool's rollback
/// retry handles anything that outlasts it.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const CONNSTR_PARAMS: &[ConnStrParam] = &[
    ConnStrParam::new("path", ConnStrType::Any, true, 1, 4096),
    ConnStrParam::new("journal_mode", ConnStrType::Alpha, false, 1, 32),
    ConnStrParam::new("analyze", ConnStrType::Bool, false, 1, 5),
    ConnStrParam::new("integrity_check", ConnStrType::Bool, false, 1, 5),
    ConnStrParam::new("shared_cache", ConnStrType::Bool, false, 1, 5),
    ConnStrParam::new("autocreate", ConnStrType::Bool, false, 1, 5),
];

/// SQLite backend. File-backed (or `:memory:`), single host.
#[derive(Debug)]
pub struct SqliteDriver;

/// Register the sqlite driver in the process-wide registry.
pub fn register() -> Result<(), SqlError> {
    registry().register(Arc::new(SqliteDriver))
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn display_name(&self) -> &'static str {
        "SQLite"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn create_pool(&self, request: &DriverPoolRequest<'_>) -> Result<Box<dyn DriverPool>, SqlError> {
        validate_conn_str(request.conn_str, CONNSTR_PARAMS)?;
        let path = request
            .conn_str
            .get("path")
            .map(PathBuf::from)
            .ok_or_else(|| SqlError::new(ErrorKind::ConnParams, "path is required"))?;

        Ok(Box::new(SqlitePool {
            path,
            journal_mode: request
                .conn_str
                .get("journal_mode")
                .unwrap_or("WAL")
                .to_ascii_uppercase(),
            analyze: request.conn_str.get_bool("analyze", true),
            integrity_check: request.conn_str.get_bool("integrity_check", false),
            shared_cache: request.conn_str.get_bool("shared_cache", true),
            autocreate: request.conn_str.get_bool("autocreate", true),
        }))
    }
}

#[derive(Debug)]
struct SqlitePool {
    path: PathBuf,
    journal_mode: String,
    analyze: bool,
    integrity_check: bool,
    shared_cache: bool,
    autocreate: bool,
}

impl DriverPool for SqlitePool {
    fn num_hosts(&self) -> usize {
        1
    }

    fn connect(&self, _host_idx: usize) -> Result<Box<dyn DriverConn>, SqlError> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if self.autocreate {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        if self.shared_cache {
            flags |= OpenFlags::SQLITE_OPEN_SHARED_CACHE;
        }

        let conn = RusqliteConnection::open_with_flags(&self.path, flags)
            .map_err(|err| map_rusqlite_err(&err, ErrorKind::ConnFailed))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| map_rusqlite_err(&err, ErrorKind::ConnFailed))?;

        Ok(Box::new(SqliteConn {
            conn,
            version: format!("SQLite {}", rusqlite::version()),
            journal_mode: self.journal_mode.clone(),
            analyze: self.analyze,
            integrity_check: self.integrity_check,
            pending: None,
        }))
    }

    fn datatype(&self, buf: &mut String, dtype: DataType, max_len: usize, _is_cast: bool) {
        match dtype {
            DataType::Bool | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                buf.push_str("INTEGER");
            }
            DataType::Text => {
                if max_len == 0 {
                    buf.push_str("TEXT");
                } else {
                    buf.push_str(&format!("VARCHAR({max_len})"));
                }
            }
            DataType::Binary => buf.push_str("BLOB"),
        }
    }

    // Whole-database locking; row-lock hints have no meaning.

    fn append_bitop(
        &self,
        buf: &mut String,
        op: BitOp,
        exp1: &str,
        exp2: &str,
    ) -> Result<(), SqlError> {
        append_bitop(BitOpCaps::Infix, buf, op, exp1, exp2)
    }
}

struct SqliteConn {
    conn: RusqliteConnection,
    version: String,
    journal_mode: String,
    analyze: bool,
    integrity_check: bool,
    /// Rows read past the statement's fetch chunk, served by later fetches.
    pending: Option<Vec<Vec<Value>>>,
}

impl SqliteConn {
    fn serve_chunk(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError> {
        let requested = stmt.requested_fetch_rows();
        let Some(pending) = self.pending.as_mut() else {
            return Ok(false);
        };
        let take = if requested == 0 {
            pending.len()
        } else {
            requested.min(pending.len())
        };
        for row in pending.drain(..take) {
            stmt.result_add_row(row)?;
        }
        let more = !pending.is_empty();
        if !more {
            self.pending = None;
        }
        Ok(more)
    }
}

impl DriverConn for SqliteConn {
    fn server_version(&self) -> &str {
        &self.version
    }

    fn runonce(&mut self, is_first_in_pool: bool) -> Result<(), SqlError> {
        self.conn
            .pragma_update(None, "journal_mode", &self.journal_mode)
            .map_err(|err| map_rusqlite_err(&err, ErrorKind::ConnFailed))?;

        if !is_first_in_pool {
            return Ok(());
        }

        if self.integrity_check {
            let outcome: String = self
                .conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))
                .map_err(|err| map_rusqlite_err(&err, ErrorKind::ConnFailed))?;
            if !outcome.eq_ignore_ascii_case("ok") {
                return Err(SqlError::new(
                    ErrorKind::ConnFailed,
                    format!("integrity check failed: {outcome}"),
                ));
            }
        }
        if self.analyze {
            debug!("running ANALYZE on first sqlite connection");
            self.conn
                .execute_batch("ANALYZE")
                .map_err(|err| map_rusqlite_err(&err, ErrorKind::ConnFailed))?;
        }
        Ok(())
    }

    fn query_format(
        &self,
        query: &str,
        num_params: usize,
        num_rows: usize,
    ) -> Result<String, SqlError> {
        format_query_sqlite(query, num_params, num_rows)
    }

    fn query_row_count(&self, num_params: usize, num_rows: usize) -> usize {
        if num_params == 0 {
            return num_rows;
        }
        (MAX_BIND_VARS / num_params).max(1).min(num_rows)
    }

    fn prepare(&mut self, stmt: &mut Stmt) -> Result<(), SqlError> {
        let query = stmt.driver_query()?;
        // Validates the SQL and warms rusqlite's prepared-statement cache;
        // execute re-borrows the same cached handle.
        self.conn
            .prepare_cached(query)
            .map(|_| ())
            .map_err(|err| map_rusqlite_err(&err, ErrorKind::QueryPrepare))
    }

    fn execute(&mut self, stmt: &mut Stmt) -> Result<ExecuteResult, SqlError> {
        let query = stmt.driver_query()?.to_string();
        let num_params = stmt.bind_col_count();
        let remaining = stmt.bind_rows_remaining();
        let rows_consumed = self.query_row_count(num_params, remaining);

        let mut prepared = self
            .conn
            .prepare_cached(&query)
            .map_err(|err| map_rusqlite_err(&err, ErrorKind::QueryPrepare))?;

        let params = bind_params(stmt, rows_consumed, num_params)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        if prepared.column_count() > 0 {
            let cols = result_cols(&prepared);
            let num_cols = cols.len();
            let dtypes: Vec<Option<(DataType, usize)>> =
                cols.iter().map(|c| Some((c.dtype, c.max_size))).collect();
            stmt.result_set_cols(cols);

            // Embedded engine: the statement cannot be held across calls,
            // so the whole result set is read here and handed out in
            // chunks of the requested fetch size.
            let mut buffered: Vec<Vec<Value>> = Vec::new();
            let mut rows = prepared
                .query(param_refs.as_slice())
                .map_err(|err| map_rusqlite_err(&err, ErrorKind::QueryFailure))?;
            loop {
                let row = match rows.next() {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(err) => return Err(map_rusqlite_err(&err, ErrorKind::QueryFailure)),
                };
                let mut cells = Vec::with_capacity(num_cols);
                for idx in 0..num_cols {
                    let cell = match row.get_ref(idx) {
                        Ok(value) => value_from_ref(value, dtypes[idx]),
                        Err(err) => return Err(map_rusqlite_err(&err, ErrorKind::QueryFailure)),
                    };
                    cells.push(cell);
                }
                buffered.push(cells);
            }
            drop(rows);
            drop(prepared);

            self.pending = Some(buffered);
            let more = self.serve_chunk(stmt)?;
            Ok(ExecuteResult {
                rows_consumed,
                has_result: true,
                more_rows: more,
            })
        } else {
            let affected = prepared
                .execute(param_refs.as_slice())
                .map_err(|err| map_rusqlite_err(&err, ErrorKind::QueryFailure))?;
            stmt.result_add_affected_rows(affected);
            Ok(ExecuteResult {
                rows_consumed,
                has_result: false,
                more_rows: false,
            })
        }
    }

    fn fetch(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError> {
        self.serve_chunk(stmt)
    }

    fn begin(&mut self, isolation: Isolation) -> Result<(), SqlError> {
        if isolation != Isolation::Serializable {
            debug!("sqlite runs {isolation} as SERIALIZABLE");
        }
        // IMMEDIATE takes the write lock up front so lock contention
        // surfaces here as a retryable busy, not mid-transaction.
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|err| map_rusqlite_err(&err, ErrorKind::QueryFailure))
    }

    fn rollback(&mut self) -> Result<(), SqlError> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|err| map_rusqlite_err(&err, ErrorKind::ConnLost))
    }

    fn commit(&mut self) -> Result<(), SqlError> {
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => Ok(()),
            Err(err) => {
                let mapped = map_rusqlite_err(&err, ErrorKind::QueryFailure);
                if !self.conn.is_autocommit() {
                    if let Err(rb_err) = self.conn.execute_batch("ROLLBACK") {
                        warn!("rollback after failed commit failed: {rb_err}");
                    }
                }
                Err(mapped)
            }
        }
    }

    fn disconnect(&mut self) {
        debug!("closing sqlite connection");
    }
}

fn format_query_sqlite(query: &str, num_params: usize, num_rows: usize) -> Result<String, SqlError> {
    sqlbridge_core::format_query(
        query,
        QueryFormatFlags::MULTIVALUEINSERT_CD,
        num_params,
        num_rows,
    )
}

/// Flatten the statement's bind window into positional rusqlite values.
fn bind_params(
    stmt: &Stmt,
    rows: usize,
    num_params: usize,
) -> Result<Vec<rusqlite::types::Value>, SqlError> {
    let mut params = Vec::with_capacity(rows * num_params);
    for row in 0..rows {
        for col in 0..num_params {
            let value = stmt.bind_cell(row, col)?;
            params.push(match value {
                Value::Null(_) => rusqlite::types::Value::Null,
                Value::Bool(val) => rusqlite::types::Value::Integer(i64::from(*val)),
                Value::Int16(val) => rusqlite::types::Value::Integer(i64::from(*val)),
                Value::Int32(val) => rusqlite::types::Value::Integer(i64::from(*val)),
                Value::Int64(val) => rusqlite::types::Value::Integer(*val),
                Value::Text(text) => rusqlite::types::Value::Text(text.clone()),
                Value::Binary(bin) => rusqlite::types::Value::Blob(bin.clone()),
            });
        }
    }
    Ok(params)
}

fn result_cols(prepared: &rusqlite::CachedStatement<'_>) -> Vec<ResultCol> {
    (0..prepared.column_count())
        .map(|idx| {
            let name = prepared
                .column_name(idx)
                .map(|n| n.to_string())
                .unwrap_or_else(|_| format!("col{idx}"));
            ResultCol {
                name,
                dtype: DataType::Text,
                max_size: 0,
            }
        })
        .collect()
}

/// SQLite typing is per-cell, not per-column; convert what the cell
/// actually holds. REAL has no slot in the unified type universe and
/// crosses as text.
fn value_from_ref(value: ValueRef<'_>, declared: Option<(DataType, usize)>) -> Value {
    match value {
        ValueRef::Null => Value::Null(declared.map(|(d, _)| d).unwrap_or(DataType::Text)),
        ValueRef::Integer(val) => Value::Int64(val),
        ValueRef::Real(val) => Value::Text(val.to_string()),
        ValueRef::Text(text) => Value::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(blob) => Value::Binary(blob.to_vec()),
    }
}

/// Map a rusqlite error to the unified taxonomy; `fallback` classifies
/// anything without a recognized primary result code.
fn map_rusqlite_err(err: &rusqlite::Error, fallback: ErrorKind) -> SqlError {
    use rusqlite::ErrorCode;

    let kind = match err {
        rusqlite::Error::SqliteFailure(ffi_err, _) => match ffi_err.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::QueryDeadlock,
            ErrorCode::ConstraintViolation => ErrorKind::QueryConstraint,
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => ErrorKind::ConnFailed,
            ErrorCode::DiskFull | ErrorCode::SystemIoFailure => ErrorKind::ConnLost,
            ErrorCode::PermissionDenied | ErrorCode::ReadOnly => ErrorKind::ConnBadAuth,
            _ => fallback,
        },
        _ => fallback,
    };
    SqlError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connstr_requires_path() {
        let driver = SqliteDriver;
        let conn_str = sqlbridge_core::ConnStr::parse("journal_mode=WAL").unwrap();
        let err = driver
            .create_pool(&DriverPoolRequest {
                conn_str: &conn_str,
                username: "",
                password: "",
                is_readonly: false,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnParams);
    }

    #[test]
    fn connstr_rejects_unknown_keys() {
        let driver = SqliteDriver;
        let conn_str = sqlbridge_core::ConnStr::parse("path=/tmp/x.db;jornal_mode=WAL").unwrap();
        let err = driver
            .create_pool(&DriverPoolRequest {
                conn_str: &conn_str,
                username: "",
                password: "",
                is_readonly: false,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnParams);
    }

    #[test]
    fn multirow_insert_expands_values() {
        let out = format_query_sqlite("INSERT INTO t VALUES (?, ?)", 2, 3).unwrap();
        assert_eq!(out, "INSERT INTO t VALUES (?, ?), (?, ?), (?, ?)");
    }

    #[test]
    fn row_chunking_respects_bind_var_limit() {
        let conn_str = sqlbridge_core::ConnStr::parse("path=:memory:").unwrap();
        let pool = SqliteDriver
            .create_pool(&DriverPoolRequest {
                conn_str: &conn_str,
                username: "",
                password: "",
                is_readonly: false,
            })
            .unwrap();
        let conn = pool.connect(0).unwrap();

        // 10 params per row: at most 99 rows fit under 999 bind variables.
        assert_eq!(conn.query_row_count(10, 500), 99);
        assert_eq!(conn.query_row_count(10, 50), 50);
        assert_eq!(conn.query_row_count(0, 7), 7);
        // Oversized single rows still go one at a time.
        assert_eq!(conn.query_row_count(1200, 3), 1);
    }
}
