use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use postgres::error::SqlState;
use postgres::types::{ToSql, Type};
use postgres::{Client, Config, NoTls};

use sqlbridge_core::{
    BitOp, BitOpCaps, ConnStrParam, ConnStrType, DataType, Driver, DriverConn, DriverPool,
    DriverPoolRequest, ErrorKind, ExecuteResult, HostPort, Isolation, QueryFormatFlags, ResultCol,
    SqlError, Stmt, UpdlockCaps, UpdlockType, Value, append_bitop, append_updlock, first_keyword,
    format_query, parse_host_ports, registry, validate_conn_str,
};

/// PostgreSQL's wire limit on bound parameters per statement.
const MAX_BIND_PARAMS: usize = 65535;

const DEFAULT_PORT: u16 = 5432;

const CURSOR_NAME: &str = "sqlbridge_cursor";

const CONNSTR_PARAMS: &[ConnStrParam] = &[
    ConnStrParam::new("db", ConnStrType::Any, true, 1, 64),
    ConnStrParam::new("host", ConnStrType::Any, true, 1, 1024),
    ConnStrParam::new("application_name", ConnStrType::Any, false, 1, 64),
];

const FORMAT_FLAGS: QueryFormatFlags = QueryFormatFlags::ENUMPARAM_DOLLAR
    .union(QueryFormatFlags::MULTIVALUEINSERT_CD)
    .union(QueryFormatFlags::INSERT_ONCONFLICT_DONOTHING);

/// PostgreSQL backend. Multi-host failover/load-balancing via the `host`
/// list; inserts are rewritten with an on-conflict-do-nothing clause, so
/// conflicts surface as an affected-row shortfall.
#[derive(Debug)]
pub struct PostgresDriver;

/// Register the postgresql driver in the process-wide registry.
pub fn register() -> Result<(), SqlError> {
    registry().register(Arc::new(PostgresDriver))
}

impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn display_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn create_pool(&self, request: &DriverPoolRequest<'_>) -> Result<Box<dyn DriverPool>, SqlError> {
        validate_conn_str(request.conn_str, CONNSTR_PARAMS)?;
        let hosts = parse_host_ports(
            request
                .conn_str
                .get("host")
                .ok_or_else(|| SqlError::new(ErrorKind::ConnParams, "host is required"))?,
            DEFAULT_PORT,
        )?;
        let db = request
            .conn_str
            .get("db")
            .ok_or_else(|| SqlError::new(ErrorKind::ConnParams, "db is required"))?;

        Ok(Box::new(PostgresPool {
            hosts,
            db: db.to_string(),
            username: request.username.to_string(),
            password: request.password.to_string(),
            application_name: request
                .conn_str
                .get("application_name")
                .map(|s| s.to_string()),
        }))
    }
}

#[derive(Debug)]
struct PostgresPool {
    hosts: Vec<HostPort>,
    db: String,
    username: String,
    password: String,
    application_name: Option<String>,
}

impl DriverPool for PostgresPool {
    fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    fn connect(&self, host_idx: usize) -> Result<Box<dyn DriverConn>, SqlError> {
        let host = self.hosts.get(host_idx).ok_or_else(|| {
            SqlError::new(ErrorKind::ConnParams, format!("host index {host_idx} out of range"))
        })?;

        let mut config = Config::new();
        config
            .host(&host.host)
            .port(host.port)
            .user(&self.username)
            .password(&self.password)
            .dbname(&self.db);
        if let Some(app) = &self.application_name {
            config.application_name(app);
        }

        let mut client = config
            .connect(NoTls)
            .map_err(|err| map_pg_err(&err, ErrorKind::ConnFailed))?;

        let version_row = client
            .query_one("SHOW server_version", &[])
            .map_err(|err| map_pg_err(&err, ErrorKind::ConnFailed))?;
        let version: String = version_row.get(0);

        Ok(Box::new(PostgresConn {
            client,
            version: format!("PostgreSQL {version}"),
            prepared: HashMap::new(),
            cursor_open: false,
            in_trans: false,
        }))
    }

    fn datatype(&self, buf: &mut String, dtype: DataType, max_len: usize, _is_cast: bool) {
        match dtype {
            DataType::Bool => buf.push_str("BOOLEAN"),
            DataType::Int16 => buf.push_str("SMALLINT"),
            DataType::Int32 => buf.push_str("INTEGER"),
            DataType::Int64 => buf.push_str("BIGINT"),
            DataType::Text => {
                if max_len == 0 {
                    buf.push_str("TEXT");
                } else {
                    buf.push_str(&format!("VARCHAR({max_len})"));
                }
            }
            DataType::Binary => buf.push_str("BYTEA"),
        }
    }

    fn append_updlock(&self, buf: &mut String, typ: UpdlockType, table_name: Option<&str>) {
        append_updlock(UpdlockCaps::ForUpdateOf, buf, typ, table_name);
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

struct PostgresConn {
    client: Client,
    version: String,
    /// Prepared statements keyed by rewritten query text.
    prepared: HashMap<String, postgres::Statement>,
    cursor_open: bool,
    in_trans: bool,
}

impl PostgresConn {
    fn prepared_for(&mut self, query: &str) -> Result<postgres::Statement, SqlError> {
        if let Some(prepared) = self.prepared.get(query) {
            return Ok(prepared.clone());
        }
        let prepared = self
            .client
            .prepare(query)
            .map_err(|err| map_pg_err(&err, ErrorKind::QueryPrepare))?;
        self.prepared.insert(query.to_string(), prepared.clone());
        Ok(prepared)
    }

    fn close_cursor(&mut self) {
        if self.cursor_open {
            if let Err(err) = self.client.batch_execute(&format!("CLOSE {CURSOR_NAME}")) {
                warn!("closing result cursor failed: {err}");
            }
            self.cursor_open = false;
        }
    }

    /// FETCH one chunk from the open cursor into the statement buffer.
    fn fetch_chunk(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError> {
        let chunk = stmt.requested_fetch_rows().max(1);
        let rows = self
            .client
            .query(&format!("FETCH FORWARD {chunk} FROM {CURSOR_NAME}"), &[])
            .map_err(|err| {
                self.cursor_open = false;
                map_pg_err(&err, ErrorKind::QueryFailure)
            })?;

        if stmt.result().num_cols() == 0 {
            if let Some(first) = rows.first() {
                stmt.result_set_cols(columns_of(first));
            }
        }
        let fetched = rows.len();
        for row in &rows {
            stmt.result_add_row(row_values(row)?)?;
        }

        let more = fetched == chunk;
        if !more {
            self.close_cursor();
        }
        Ok(more)
    }
}

impl DriverConn for PostgresConn {
    fn server_version(&self) -> &str {
        &self.version
    }

    fn query_format(
        &self,
        query: &str,
        num_params: usize,
        num_rows: usize,
    ) -> Result<String, SqlError> {
        format_query(query, FORMAT_FLAGS, num_params, num_rows)
    }

    fn query_row_count(&self, num_params: usize, num_rows: usize) -> usize {
        if num_params == 0 {
            return num_rows;
        }
        (MAX_BIND_PARAMS / num_params).max(1).min(num_rows)
    }

    fn prepare(&mut self, stmt: &mut Stmt) -> Result<(), SqlError> {
        let query = stmt.driver_query()?.to_string();
        // SELECTs run through a cursor DECLARE when chunked; preparing the
        // bare query up front still validates it either way.
        self.prepared_for(&query).map(|_| ())
    }

    fn execute(&mut self, stmt: &mut Stmt) -> Result<ExecuteResult, SqlError> {
        let query = stmt.driver_query()?.to_string();
        let num_params = stmt.bind_col_count();
        let remaining = stmt.bind_rows_remaining();
        let rows_consumed = self.query_row_count(num_params, remaining);

        let params = bind_params(stmt, rows_consumed, num_params)?;
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let is_select = first_keyword(&query)
            .map(|word| word.eq_ignore_ascii_case("SELECT"))
            .unwrap_or(false);

        if is_select && stmt.requested_fetch_rows() > 0 {
            // Server-side cursor so each fetch is one round trip. WITH HOLD
            // keeps the cursor alive outside an explicit transaction.
            self.close_cursor();
            let declare =
                format!("DECLARE {CURSOR_NAME} NO SCROLL CURSOR WITH HOLD FOR {query}");
            self.client
                .execute(declare.as_str(), param_refs.as_slice())
                .map_err(|err| map_pg_err(&err, ErrorKind::QueryFailure))?;
            self.cursor_open = true;

            let more = self.fetch_chunk(stmt)?;
            return Ok(ExecuteResult {
                rows_consumed,
                has_result: true,
                more_rows: more,
            });
        }

        let prepared = self.prepared_for(&query)?;
        if is_select || !prepared.columns().is_empty() {
            let rows = self
                .client
                .query(&prepared, param_refs.as_slice())
                .map_err(|err| {
                    self.prepared.remove(&query);
                    map_pg_err(&err, ErrorKind::QueryFailure)
                })?;
            stmt.result_set_cols(
                prepared
                    .columns()
                    .iter()
                    .map(|col| ResultCol {
                        name: col.name().to_string(),
                        dtype: datatype_of(col.type_()),
                        max_size: 0,
                    })
                    .collect(),
            );
            for row in &rows {
                stmt.result_add_row(row_values(row)?)?;
            }
            Ok(ExecuteResult {
                rows_consumed,
                has_result: true,
                more_rows: false,
            })
        } else {
            let affected = self
                .client
                .execute(&prepared, param_refs.as_slice())
                .map_err(|err| {
                    self.prepared.remove(&query);
                    map_pg_err(&err, ErrorKind::QueryFailure)
                })?;
            stmt.result_add_affected_rows(affected as usize);
            Ok(ExecuteResult {
                rows_consumed,
                has_result: false,
                more_rows: false,
            })
        }
    }

    fn fetch(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError> {
        if !self.cursor_open {
            return Ok(false);
        }
        self.fetch_chunk(stmt)
    }

    fn begin(&mut self, isolation: Isolation) -> Result<(), SqlError> {
        let level = match isolation {
            Isolation::ReadUncommitted => "READ UNCOMMITTED",
            Isolation::ReadCommitted => "READ COMMITTED",
            // No native snapshot level; repeatable read is the snapshot
            // isolation PostgreSQL actually implements.
            Isolation::RepeatableRead | Isolation::Snapshot => "REPEATABLE READ",
            Isolation::Serializable => "SERIALIZABLE",
        };
        if isolation == Isolation::Snapshot {
            debug!("postgresql maps SNAPSHOT to REPEATABLE READ");
        }
        self.client
            .batch_execute(&format!("BEGIN ISOLATION LEVEL {level}"))
            .map(|_| {
                self.in_trans = true;
            })
            .map_err(|err| map_pg_err(&err, ErrorKind::QueryFailure))
    }

    fn rollback(&mut self) -> Result<(), SqlError> {
        if !self.in_trans {
            return Ok(());
        }
        self.in_trans = false;
        self.client
            .batch_execute("ROLLBACK")
            .map_err(|err| map_pg_err(&err, ErrorKind::ConnLost))
    }

    fn commit(&mut self) -> Result<(), SqlError> {
        self.in_trans = false;
        match self.client.batch_execute("COMMIT") {
            Ok(()) => Ok(()),
            Err(err) => {
                // COMMIT of an aborted transaction rolls back server-side;
                // nothing further to clean up.
                Err(map_pg_err(&err, ErrorKind::QueryFailure))
            }
        }
    }

    fn onconflict_rows_check(&self) -> bool {
        true
    }

    fn disconnect(&mut self) {
        self.close_cursor();
        debug!("closing postgresql connection");
    }
}

/// Flatten the bind window into owned ToSql boxes, typed nulls included.
fn bind_params(
    stmt: &Stmt,
    rows: usize,
    num_params: usize,
) -> Result<Vec<Box<dyn ToSql + Sync>>, SqlError> {
    let mut params: Vec<Box<dyn ToSql + Sync>> = Vec::with_capacity(rows * num_params);
    for row in 0..rows {
        for col in 0..num_params {
            let value = stmt.bind_cell(row, col)?;
            params.push(match value {
                Value::Null(dtype) => null_param(*dtype),
                Value::Bool(val) => Box::new(*val),
                Value::Int16(val) => Box::new(*val),
                Value::Int32(val) => Box::new(*val),
                Value::Int64(val) => Box::new(*val),
                Value::Text(text) => Box::new(text.clone()),
                Value::Binary(bin) => Box::new(bin.clone()),
            });
        }
    }
    Ok(params)
}

fn null_param(dtype: DataType) -> Box<dyn ToSql + Sync> {
    match dtype {
        DataType::Bool => Box::new(Option::<bool>::None),
        DataType::Int16 => Box::new(Option::<i16>::None),
        DataType::Int32 => Box::new(Option::<i32>::None),
        DataType::Int64 => Box::new(Option::<i64>::None),
        DataType::Text => Box::new(Option::<String>::None),
        DataType::Binary => Box::new(Option::<Vec<u8>>::None),
    }
}

fn datatype_of(pg_type: &Type) -> DataType {
    match *pg_type {
        Type::BOOL => DataType::Bool,
        Type::INT2 => DataType::Int16,
        Type::INT4 => DataType::Int32,
        Type::INT8 => DataType::Int64,
        Type::BYTEA => DataType::Binary,
        _ => DataType::Text,
    }
}

fn columns_of(row: &postgres::Row) -> Vec<ResultCol> {
    row.columns()
        .iter()
        .map(|col| ResultCol {
            name: col.name().to_string(),
            dtype: datatype_of(col.type_()),
            max_size: 0,
        })
        .collect()
}

fn row_values(row: &postgres::Row) -> Result<Vec<Value>, SqlError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, col) in row.columns().iter().enumerate() {
        let dtype = datatype_of(col.type_());
        let value = match dtype {
            DataType::Bool => cell(row, idx, dtype, |v: bool| Value::Bool(v))?,
            DataType::Int16 => cell(row, idx, dtype, Value::Int16)?,
            DataType::Int32 => cell(row, idx, dtype, Value::Int32)?,
            DataType::Int64 => cell(row, idx, dtype, Value::Int64)?,
            DataType::Binary => cell(row, idx, dtype, Value::Binary)?,
            // Everything else crosses as its text form.
            DataType::Text => cell(row, idx, dtype, Value::Text)?,
        };
        values.push(value);
    }
    Ok(values)
}

fn cell<'a, T>(
    row: &'a postgres::Row,
    idx: usize,
    dtype: DataType,
    wrap: impl FnOnce(T) -> Value,
) -> Result<Value, SqlError>
where
    T: postgres::types::FromSql<'a>,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(val)) => Ok(wrap(val)),
        Ok(None) => Ok(Value::Null(dtype)),
        Err(err) => Err(SqlError::new(
            ErrorKind::InvalidType,
            format!("column {idx} conversion failed: {err}"),
        )),
    }
}

/// SQLSTATE class mapping; `fallback` covers codes without a class match.
fn map_pg_err(err: &postgres::Error, fallback: ErrorKind) -> SqlError {
    let kind = match err.code() {
        Some(state) => {
            let code = state.code();
            if *state == SqlState::T_R_DEADLOCK_DETECTED
                || *state == SqlState::T_R_SERIALIZATION_FAILURE
            {
                ErrorKind::QueryDeadlock
            } else if code.starts_with("23") {
                ErrorKind::QueryConstraint
            } else if code.starts_with("08") || *state == SqlState::ADMIN_SHUTDOWN {
                ErrorKind::ConnLost
            } else if code.starts_with("28") {
                ErrorKind::ConnBadAuth
            } else if *state == SqlState::SYNTAX_ERROR {
                ErrorKind::QueryPrepare
            } else {
                fallback
            }
        }
        None => {
            if err.is_closed() {
                ErrorKind::ConnLost
            } else {
                fallback
            }
        }
    };
    SqlError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connstr_requires_db_and_host() {
        let conn_str = sqlbridge_core::ConnStr::parse("db=app").unwrap();
        let err = PostgresDriver
            .create_pool(&DriverPoolRequest {
                conn_str: &conn_str,
                username: "u",
                password: "p",
                is_readonly: false,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnParams);
    }

    #[test]
    fn host_list_sizes_rotation() {
        let conn_str =
            sqlbridge_core::ConnStr::parse("db=app;host=10.1.2.3:5432,10.1.2.4").unwrap();
        let pool = PostgresDriver
            .create_pool(&DriverPoolRequest {
                conn_str: &conn_str,
                username: "u",
                password: "p",
                is_readonly: false,
            })
            .unwrap();
        assert_eq!(pool.num_hosts(), 2);
    }

    #[test]
    fn queries_rewrite_to_dollar_params_with_onconflict() {
        let out = format_query("INSERT INTO t VALUES (?, ?)", FORMAT_FLAGS, 2, 2).unwrap();
        assert_eq!(
            out,
            "INSERT INTO t VALUES ($1, $2), ($3, $4) ON CONFLICT DO NOTHING"
        );

        let out = format_query("SELECT a FROM t WHERE b = ?", FORMAT_FLAGS, 1, 1).unwrap();
        assert_eq!(out, "SELECT a FROM t WHERE b = $1");
    }

    #[test]
    fn updlock_is_for_update_of() {
        let conn_str = sqlbridge_core::ConnStr::parse("db=app;host=h").unwrap();
        let pool = PostgresDriver
            .create_pool(&DriverPoolRequest {
                conn_str: &conn_str,
                username: "u",
                password: "p",
                is_readonly: false,
            })
            .unwrap();
        let mut query = String::from("SELECT * FROM t");
        pool.append_updlock(&mut query, UpdlockType::QueryEnd, Some("t"));
        assert_eq!(query, "SELECT * FROM t FOR UPDATE OF t");
    }
}
