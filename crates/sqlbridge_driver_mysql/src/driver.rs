use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use mysql::consts::{ColumnFlags, ColumnType};
use mysql::prelude::Queryable;
use mysql::{Conn as MysqlNativeConn, OptsBuilder, SslOpts};

use sqlbridge_core::{
    BitOp, BitOpCaps, ConnStrParam, ConnStrType, DataType, Driver, DriverConn, DriverPool,
    DriverPoolRequest, ErrorKind, ExecuteResult, HostPort, Isolation, QueryFormatFlags, ResultCol,
    SqlError, Stmt, UpdlockCaps, UpdlockType, Value, append_bitop, append_updlock, first_keyword,
    format_query, parse_host_ports, registry, validate_conn_str,
};

/// MySQL's wire limit on bound parameters per prepared statement.
const MAX_BIND_PARAMS: usize = 65535;

const DEFAULT_PORT: u16 = 3306;

/// Known Unix socket locations tried for `socketpath=search`.
const SOCKET_SEARCH_PATHS: &[&str] = &[
    "/var/run/mysqld/mysqld.sock",
    "/var/lib/mysql/mysql.sock",
    "/tmp/mysql.sock",
];

const CONNSTR_PARAMS: &[ConnStrParam] = &[
    ConnStrParam::new("db", ConnStrType::Any, true, 1, 64),
    ConnStrParam::new("host", ConnStrType::Any, false, 1, 1024),
    ConnStrParam::new("socketpath", ConnStrType::Any, false, 1, 4096),
    ConnStrParam::new("ssl", ConnStrType::Bool, false, 1, 5),
    ConnStrParam::new("mysql_engine", ConnStrType::AlphaNum, false, 1, 32),
    ConnStrParam::new("mysql_charset", ConnStrType::AlphaNum, false, 1, 32),
    ConnStrParam::new("max_isolation", ConnStrType::Alpha, false, 1, 32),
];

/// MySQL/MariaDB backend: TCP host list or Unix socket, optional TLS, and
/// a `max_isolation` clamp for Galera-style clusters that cannot honor
/// SERIALIZABLE.
#[derive(Debug)]
pub struct MysqlDriver;

/// Register the mysql driver in the process-wide registry.
pub fn register() -> Result<(), SqlError> {
    registry().register(Arc::new(MysqlDriver))
}

impl Driver for MysqlDriver {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn display_name(&self) -> &'static str {
        "MySQL/MariaDB"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn create_pool(&self, request: &DriverPoolRequest<'_>) -> Result<Box<dyn DriverPool>, SqlError> {
        validate_conn_str(request.conn_str, CONNSTR_PARAMS)?;

        let db = request
            .conn_str
            .get("db")
            .ok_or_else(|| SqlError::new(ErrorKind::ConnParams, "db is required"))?;

        let socketpath = request.conn_str.get("socketpath");
        let host_spec = request.conn_str.get("host");
        let (hosts, socket) = match (host_spec, socketpath) {
            (Some(_), Some(_)) => {
                return Err(SqlError::new(
                    ErrorKind::ConnParams,
                    "host and socketpath are mutually exclusive",
                ));
            }
            (Some(spec), None) => (parse_host_ports(spec, DEFAULT_PORT)?, None),
            (None, Some(path)) => (Vec::new(), Some(resolve_socket_path(path)?)),
            (None, None) => {
                return Err(SqlError::new(
                    ErrorKind::ConnParams,
                    "one of host or socketpath is required",
                ));
            }
        };

        let max_isolation = match request.conn_str.get("max_isolation") {
            None => None,
            Some(raw) => Some(Isolation::from_str(raw).ok_or_else(|| {
                SqlError::new(
                    ErrorKind::ConnParams,
                    format!("unrecognized max_isolation '{raw}'"),
                )
            })?),
        };

        Ok(Box::new(MysqlPool {
            hosts,
            socket,
            db: db.to_string(),
            username: request.username.to_string(),
            password: request.password.to_string(),
            ssl: request.conn_str.get_bool("ssl", false),
            engine: request
                .conn_str
                .get("mysql_engine")
                .unwrap_or("INNODB")
                .to_string(),
            charset: request
                .conn_str
                .get("mysql_charset")
                .unwrap_or("utf8mb4")
                .to_string(),
            max_isolation,
        }))
    }
}

fn resolve_socket_path(path: &str) -> Result<String, SqlError> {
    if !path.eq_ignore_ascii_case("search") {
        return Ok(path.to_string());
    }
    for candidate in SOCKET_SEARCH_PATHS {
        if Path::new(candidate).exists() {
            return Ok((*candidate).to_string());
        }
    }
    Err(SqlError::new(
        ErrorKind::ConnParams,
        "socketpath=search found no known MySQL socket",
    ))
}

#[derive(Debug)]
struct MysqlPool {
    hosts: Vec<HostPort>,
    socket: Option<String>,
    db: String,
    username: String,
    password: String,
    ssl: bool,
    engine: String,
    charset: String,
    max_isolation: Option<Isolation>,
}

impl DriverPool for MysqlPool {
    fn num_hosts(&self) -> usize {
        self.hosts.len().max(1)
    }

    fn connect(&self, host_idx: usize) -> Result<Box<dyn DriverConn>, SqlError> {
        let mut opts = OptsBuilder::new()
            .user(Some(&self.username))
            .pass(Some(&self.password))
            .db_name(Some(&self.db));

        match &self.socket {
            Some(socket) => {
                opts = opts.socket(Some(socket.clone()));
            }
            None => {
                let host = self.hosts.get(host_idx).ok_or_else(|| {
                    SqlError::new(
                        ErrorKind::ConnParams,
                        format!("host index {host_idx} out of range"),
                    )
                })?;
                opts = opts
                    .ip_or_hostname(Some(host.host.clone()))
                    .tcp_port(host.port);
            }
        }
        if self.ssl {
            opts = opts.ssl_opts(Some(SslOpts::default()));
        }

        let conn = MysqlNativeConn::new(opts).map_err(|err| map_mysql_err(&err, ErrorKind::ConnFailed))?;
        let (major, minor, patch) = conn.server_version();

        Ok(Box::new(MysqlConn {
            conn,
            version: format!("MySQL {major}.{minor}.{patch}"),
            prepared: HashMap::new(),
            max_isolation: self.max_isolation,
            in_trans: false,
            pending: None,
        }))
    }

    fn datatype(&self, buf: &mut String, dtype: DataType, max_len: usize, _is_cast: bool) {
        match dtype {
            DataType::Bool => buf.push_str("BOOL"),
            DataType::Int16 => buf.push_str("SMALLINT"),
            DataType::Int32 => buf.push_str("INT"),
            DataType::Int64 => buf.push_str("BIGINT"),
            DataType::Text => {
                if max_len == 0 || max_len > 16383 {
                    buf.push_str("LONGTEXT");
                } else {
                    buf.push_str(&format!("VARCHAR({max_len})"));
                }
            }
            DataType::Binary => {
                if max_len == 0 || max_len > 65535 {
                    buf.push_str("LONGBLOB");
                } else {
                    buf.push_str(&format!("VARBINARY({max_len})"));
                }
            }
        }
    }

    fn create_table_suffix(&self, buf: &mut String) {
        buf.push_str(&format!(
            " ENGINE={} CHARSET={}",
            self.engine, self.charset
        ));
    }

    fn append_updlock(&self, buf: &mut String, typ: UpdlockType, table_name: Option<&str>) {
        append_updlock(UpdlockCaps::ForUpdate, buf, typ, table_name);
    }

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

struct MysqlConn {
    conn: MysqlNativeConn,
    version: String,
    /// Prepared statements keyed by rewritten query text.
    prepared: HashMap<String, mysql::Statement>,
    max_isolation: Option<Isolation>,
    in_trans: bool,
    /// Rows read past the statement's fetch chunk, served by later fetches.
    pending: Option<Vec<Vec<Value>>>,
}

impl MysqlConn {
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

    fn prepared_for(&mut self, query: &str) -> Result<mysql::Statement, SqlError> {
        if let Some(prepared) = self.prepared.get(query) {
            return Ok(prepared.clone());
        }
        let prepared = self
            .conn
            .prep(query)
            .map_err(|err| map_mysql_err(&err, ErrorKind::QueryPrepare))?;
        self.prepared.insert(query.to_string(), prepared.clone());
        Ok(prepared)
    }
}

impl DriverConn for MysqlConn {
    fn server_version(&self) -> &str {
        &self.version
    }

    fn query_format(
        &self,
        query: &str,
        num_params: usize,
        num_rows: usize,
    ) -> Result<String, SqlError> {
        format_query(
            query,
            QueryFormatFlags::MULTIVALUEINSERT_CD,
            num_params,
            num_rows,
        )
    }

    fn query_row_count(&self, num_params: usize, num_rows: usize) -> usize {
        if num_params == 0 {
            return num_rows;
        }
        (MAX_BIND_PARAMS / num_params).max(1).min(num_rows)
    }

    fn prepare(&mut self, stmt: &mut Stmt) -> Result<(), SqlError> {
        let query = stmt.driver_query()?.to_string();
        self.prepared_for(&query).map(|_| ())
    }

    fn execute(&mut self, stmt: &mut Stmt) -> Result<ExecuteResult, SqlError> {
        let query = stmt.driver_query()?.to_string();
        let num_params = stmt.bind_col_count();
        let remaining = stmt.bind_rows_remaining();
        let rows_consumed = self.query_row_count(num_params, remaining);

        let prepared = self.prepared_for(&query)?;
        let params = bind_params(stmt, rows_consumed, num_params)?;

        let mut result = self
            .conn
            .exec_iter(&prepared, params)
            .map_err(|err| {
                self.prepared.remove(&query);
                map_mysql_err(&err, ErrorKind::QueryFailure)
            })?;

        let columns = result.columns();
        let column_slice = columns.as_ref();
        if column_slice.is_empty() {
            let affected = result.affected_rows();
            drop(result);
            stmt.result_add_affected_rows(affected as usize);
            return Ok(ExecuteResult {
                rows_consumed,
                has_result: false,
                more_rows: false,
            });
        }

        let cols: Vec<ResultCol> = column_slice
            .iter()
            .map(|col| ResultCol {
                name: col.name_str().into_owned(),
                dtype: datatype_of(col.column_type(), col.flags()),
                max_size: col.column_length() as usize,
            })
            .collect();
        let dtypes: Vec<DataType> = cols.iter().map(|col| col.dtype).collect();

        // The client protocol streams the whole result set; read it all
        // here and hand it out in chunks of the requested fetch size.
        let mut buffered: Vec<Vec<Value>> = Vec::new();
        for row in result.by_ref() {
            let row = row.map_err(|err| map_mysql_err(&err, ErrorKind::QueryFailure))?;
            buffered.push(row_values(row, &dtypes)?);
        }
        drop(result);

        stmt.result_set_cols(cols);
        self.pending = Some(buffered);
        let more = self.serve_chunk(stmt)?;

        Ok(ExecuteResult {
            rows_consumed,
            has_result: true,
            more_rows: more,
        })
    }

    fn fetch(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError> {
        self.serve_chunk(stmt)
    }

    fn begin(&mut self, isolation: Isolation) -> Result<(), SqlError> {
        let mut effective = isolation;
        if let Some(max) = self.max_isolation {
            if effective > max {
                debug!("max_isolation caps {effective} to {max}");
                effective = max;
            }
        }
        let level = match effective {
            Isolation::ReadUncommitted => "READ UNCOMMITTED",
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead | Isolation::Snapshot => "REPEATABLE READ",
            Isolation::Serializable => "SERIALIZABLE",
        };
        self.conn
            .query_drop(format!("SET TRANSACTION ISOLATION LEVEL {level}"))
            .and_then(|_| self.conn.query_drop("START TRANSACTION"))
            .map(|_| {
                self.in_trans = true;
            })
            .map_err(|err| map_mysql_err(&err, ErrorKind::QueryFailure))
    }

    fn rollback(&mut self) -> Result<(), SqlError> {
        if !self.in_trans {
            return Ok(());
        }
        self.in_trans = false;
        self.conn
            .query_drop("ROLLBACK")
            .map_err(|err| map_mysql_err(&err, ErrorKind::ConnLost))
    }

    fn commit(&mut self) -> Result<(), SqlError> {
        self.in_trans = false;
        match self.conn.query_drop("COMMIT") {
            Ok(()) => Ok(()),
            Err(err) => {
                let mapped = map_mysql_err(&err, ErrorKind::QueryFailure);
                if let Err(rb_err) = self.conn.query_drop("ROLLBACK") {
                    warn!("rollback after failed commit failed: {rb_err}");
                }
                Err(mapped)
            }
        }
    }

    fn disconnect(&mut self) {
        debug!("closing mysql connection");
    }
}

/// Flatten the bind window into positional mysql values.
fn bind_params(stmt: &Stmt, rows: usize, num_params: usize) -> Result<mysql::Params, SqlError> {
    if rows * num_params == 0 {
        return Ok(mysql::Params::Empty);
    }
    let mut params = Vec::with_capacity(rows * num_params);
    for row in 0..rows {
        for col in 0..num_params {
            let value = stmt.bind_cell(row, col)?;
            params.push(match value {
                Value::Null(_) => mysql::Value::NULL,
                Value::Bool(val) => mysql::Value::Int(i64::from(*val)),
                Value::Int16(val) => mysql::Value::Int(i64::from(*val)),
                Value::Int32(val) => mysql::Value::Int(i64::from(*val)),
                Value::Int64(val) => mysql::Value::Int(*val),
                Value::Text(text) => mysql::Value::Bytes(text.clone().into_bytes()),
                Value::Binary(bin) => mysql::Value::Bytes(bin.clone()),
            });
        }
    }
    Ok(mysql::Params::Positional(params))
}

fn datatype_of(column_type: ColumnType, flags: ColumnFlags) -> DataType {
    match column_type {
        ColumnType::MYSQL_TYPE_TINY => DataType::Int16,
        ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => DataType::Int16,
        ColumnType::MYSQL_TYPE_INT24 | ColumnType::MYSQL_TYPE_LONG => DataType::Int32,
        ColumnType::MYSQL_TYPE_LONGLONG => DataType::Int64,
        ColumnType::MYSQL_TYPE_TINY_BLOB
        | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
        | ColumnType::MYSQL_TYPE_LONG_BLOB
        | ColumnType::MYSQL_TYPE_BLOB
        | ColumnType::MYSQL_TYPE_VAR_STRING
        | ColumnType::MYSQL_TYPE_STRING
        | ColumnType::MYSQL_TYPE_VARCHAR => {
            if flags.contains(ColumnFlags::BINARY_FLAG) {
                DataType::Binary
            } else {
                DataType::Text
            }
        }
        _ => DataType::Text,
    }
}

fn row_values(row: mysql::Row, dtypes: &[DataType]) -> Result<Vec<Value>, SqlError> {
    let raw = row.unwrap();
    let mut values = Vec::with_capacity(raw.len());
    for (idx, cell) in raw.into_iter().enumerate() {
        let dtype = dtypes.get(idx).copied().unwrap_or(DataType::Text);
        values.push(match cell {
            mysql::Value::NULL => Value::Null(dtype),
            mysql::Value::Int(val) => int_value(val, dtype),
            mysql::Value::UInt(val) => int_value(val as i64, dtype),
            mysql::Value::Bytes(bytes) => match dtype {
                DataType::Binary => Value::Binary(bytes),
                _ => Value::Text(String::from_utf8_lossy(&bytes).into_owned()),
            },
            // Floats, dates, and times have no slot in the unified type
            // universe; they cross as text.
            other => Value::Text(value_as_text(other)),
        });
    }
    Ok(values)
}

fn int_value(val: i64, dtype: DataType) -> Value {
    match dtype {
        DataType::Bool => Value::Bool(val != 0),
        DataType::Int16 => i16::try_from(val).map(Value::Int16).unwrap_or(Value::Int64(val)),
        DataType::Int32 => i32::try_from(val).map(Value::Int32).unwrap_or(Value::Int64(val)),
        _ => Value::Int64(val),
    }
}

fn value_as_text(value: mysql::Value) -> String {
    let rendered = value.as_sql(true);
    rendered.trim_matches('\'').to_string()
}

/// Server error-code mapping; `fallback` classifies anything unlisted.
fn map_mysql_err(err: &mysql::Error, fallback: ErrorKind) -> SqlError {
    let kind = match err {
        mysql::Error::MySqlError(server_err) => match server_err.code {
            1205 | 1213 => ErrorKind::QueryDeadlock,
            1022 | 1062 | 1169 | 1216 | 1217 | 1451 | 1452 | 1557 | 1586 | 3819 => {
                ErrorKind::QueryConstraint
            }
            1044 | 1045 | 1698 => ErrorKind::ConnBadAuth,
            1927 | 2002 | 2003 | 2006 | 2013 => ErrorKind::ConnLost,
            1064 => ErrorKind::QueryPrepare,
            _ => fallback,
        },
        mysql::Error::IoError(_) => ErrorKind::ConnLost,
        _ => fallback,
    };
    SqlError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_for(conn_str: &str) -> Result<Box<dyn DriverPool>, SqlError> {
        let conn_str = sqlbridge_core::ConnStr::parse(conn_str).unwrap();
        MysqlDriver.create_pool(&DriverPoolRequest {
            conn_str: &conn_str,
            username: "app",
            password: "secret",
            is_readonly: false,
        })
    }

    #[test]
    fn host_and_socketpath_are_mutually_exclusive() {
        let err = pool_for("db=app;host=h;socketpath=/tmp/mysql.sock").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnParams);
    }

    #[test]
    fn one_of_host_or_socketpath_is_required() {
        let err = pool_for("db=app;ssl=true").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnParams);
    }

    #[test]
    fn multi_host_spec_sizes_rotation() {
        let pool = pool_for("db=app;host=10.40.30.2,10.50.30.2:13306").unwrap();
        assert_eq!(pool.num_hosts(), 2);
    }

    #[test]
    fn bad_max_isolation_is_rejected() {
        let err = pool_for("db=app;host=h;max_isolation=chaotic").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnParams);

        let pool = pool_for("db=app;host=h;max_isolation='REPEATABLE READ'").unwrap();
        assert_eq!(pool.num_hosts(), 1);
    }

    #[test]
    fn create_table_suffix_carries_engine_and_charset() {
        let pool = pool_for("db=app;host=h;mysql_engine=ARIA;mysql_charset=utf8mb4").unwrap();
        let mut buf = String::from("CREATE TABLE x (a INT)");
        pool.create_table_suffix(&mut buf);
        assert_eq!(buf, "CREATE TABLE x (a INT) ENGINE=ARIA CHARSET=utf8mb4");
    }
}
