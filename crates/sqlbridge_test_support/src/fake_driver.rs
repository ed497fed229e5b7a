use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use sqlbridge_core::{
    BitOp, BitOpCaps, ConnStrParam, ConnStrType, DataType, Driver, DriverConn, DriverPool,
    DriverPoolRequest, ErrorKind, ExecuteResult, Isolation, QueryFormatFlags, ResultCol, SqlError,
    Stmt, Value, append_bitop, first_keyword, format_query, parse_host_ports, registry,
    validate_conn_str,
};

const CONNSTR_PARAMS: &[ConnStrParam] = &[
    ConnStrParam::new("host", ConnStrType::Any, false, 1, 1024),
    ConnStrParam::new("db", ConnStrType::Any, false, 1, 128),
];

/// One recorded driver-level execute call.
#[derive(Debug, Clone)]
pub struct ExecRecord {
    pub query: String,
    pub readonly: bool,
    pub host_idx: usize,
    /// Bind rows consumed by this execute.
    pub rows: usize,
}

/// Snapshot of everything the fake driver observed.
#[derive(Debug, Clone, Default)]
pub struct FakeStats {
    pub executes: Vec<ExecRecord>,
    pub connects: usize,
    pub disconnects: usize,
    pub runonce_calls: usize,
    pub runonce_firsts: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub isolations: Vec<Isolation>,
}

#[derive(Default, Debug)]
struct FakeState {
    /// host index -> remaining connect failures to report.
    connect_failures: Mutex<HashMap<usize, usize>>,
    /// query -> remaining (kind, count) execute failures to report.
    execute_failures: Mutex<HashMap<String, (ErrorKind, usize)>>,
    /// query -> scripted result set.
    results: RwLock<HashMap<String, (Vec<ResultCol>, Vec<Vec<Value>>)>>,
    /// remaining begin failures to report.
    begin_failures: Mutex<usize>,
    executes: Mutex<Vec<ExecRecord>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    runonce_calls: AtomicUsize,
    runonce_firsts: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    isolations: Mutex<Vec<Isolation>>,
}

/// A scriptable in-memory backend.
///
/// Registers under a caller-chosen name so concurrently running tests do
/// not share state; each test registers its own instance:
///
/// ```ignore
/// let fake = FakeDriver::new("fake-routing").with_hosts(2);
/// fake.register();
/// let pool = Pool::builder("fake-routing", "host=a,b").max_conns(4).start()?;
/// ```
#[derive(Clone, Debug)]
pub struct FakeDriver {
    name: &'static str,
    state: Arc<FakeState>,
}

impl FakeDriver {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(FakeState::default()),
        }
    }

    /// Make connects against `host_idx` fail `count` times with a
    /// connection failure before succeeding.
    pub fn fail_connects(self, host_idx: usize, count: usize) -> Self {
        mutex(&self.state.connect_failures).insert(host_idx, count);
        self
    }

    /// Make the next `count` executes of `query` fail with `kind`.
    pub fn fail_executes(self, query: &str, kind: ErrorKind, count: usize) -> Self {
        mutex(&self.state.execute_failures).insert(query.to_string(), (kind, count));
        self
    }

    /// Make the next `count` transaction begins fail with a deadlock.
    pub fn fail_begins(self, count: usize) -> Self {
        *mutex(&self.state.begin_failures) = count;
        self
    }

    /// Script the result set served for `query`. Columns are
    /// `(name, type)` pairs.
    pub fn with_query_result(
        self,
        query: &str,
        cols: &[(&str, DataType)],
        rows: Vec<Vec<Value>>,
    ) -> Self {
        let cols = cols
            .iter()
            .map(|(name, dtype)| ResultCol {
                name: (*name).to_string(),
                dtype: *dtype,
                max_size: 0,
            })
            .collect();
        rwlock_write(&self.state.results).insert(query.to_string(), (cols, rows));
        self
    }

    /// Register in the process-wide driver registry under this instance's
    /// name.
    pub fn register(&self) {
        // Registration only fails when a driver's init fails; ours cannot.
        let _ = registry().register(Arc::new(self.clone()));
    }

    pub fn stats(&self) -> FakeStats {
        FakeStats {
            executes: mutex(&self.state.executes).clone(),
            connects: self.state.connects.load(Ordering::Relaxed),
            disconnects: self.state.disconnects.load(Ordering::Relaxed),
            runonce_calls: self.state.runonce_calls.load(Ordering::Relaxed),
            runonce_firsts: self.state.runonce_firsts.load(Ordering::Relaxed),
            begins: self.state.begins.load(Ordering::Relaxed),
            commits: self.state.commits.load(Ordering::Relaxed),
            rollbacks: self.state.rollbacks.load(Ordering::Relaxed),
            isolations: mutex(&self.state.isolations).clone(),
        }
    }

    /// Total executes recorded for queries whose first keyword is INSERT.
    pub fn insert_execute_count(&self) -> usize {
        mutex(&self.state.executes)
            .iter()
            .filter(|rec| {
                first_keyword(&rec.query)
                    .map(|word| word.eq_ignore_ascii_case("INSERT"))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Sum of bind rows consumed across all INSERT executes.
    pub fn insert_row_count(&self) -> usize {
        mutex(&self.state.executes)
            .iter()
            .filter(|rec| {
                first_keyword(&rec.query)
                    .map(|word| word.eq_ignore_ascii_case("INSERT"))
                    .unwrap_or(false)
            })
            .map(|rec| rec.rows)
            .sum()
    }
}

impl Driver for FakeDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn display_name(&self) -> &'static str {
        "Fake"
    }

    fn version(&self) -> &'static str {
        "0.0-test"
    }

    fn create_pool(&self, request: &DriverPoolRequest<'_>) -> Result<Box<dyn DriverPool>, SqlError> {
        validate_conn_str(request.conn_str, CONNSTR_PARAMS)?;
        let hosts = match request.conn_str.get("host") {
            Some(spec) => parse_host_ports(spec, 1)?.len(),
            None => 1,
        };
        Ok(Box::new(FakePool {
            state: self.state.clone(),
            readonly: request.is_readonly,
            num_hosts: hosts,
        }))
    }
}

#[derive(Debug)]
struct FakePool {
    state: Arc<FakeState>,
    readonly: bool,
    num_hosts: usize,
}

impl DriverPool for FakePool {
    fn num_hosts(&self) -> usize {
        self.num_hosts
    }

    fn connect(&self, host_idx: usize) -> Result<Box<dyn DriverConn>, SqlError> {
        {
            let mut failures = mutex(&self.state.connect_failures);
            if let Some(remaining) = failures.get_mut(&host_idx) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SqlError::new(
                        ErrorKind::ConnFailed,
                        format!("scripted connect failure for host {host_idx}"),
                    ));
                }
            }
        }
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FakeConn {
            state: self.state.clone(),
            readonly: self.readonly,
            host_idx,
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

struct FakeConn {
    state: Arc<FakeState>,
    readonly: bool,
    host_idx: usize,
    /// Remaining scripted rows for a chunked SELECT in progress.
    pending: Option<Vec<Vec<Value>>>,
}

impl FakeConn {
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

impl DriverConn for FakeConn {
    fn server_version(&self) -> &str {
        "Fake 0.0"
    }

    fn runonce(&mut self, is_first_in_pool: bool) -> Result<(), SqlError> {
        self.state.runonce_calls.fetch_add(1, Ordering::Relaxed);
        if is_first_in_pool {
            self.state.runonce_firsts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn query_format(
        &self,
        query: &str,
        num_params: usize,
        num_rows: usize,
    ) -> Result<String, SqlError> {
        // Rows bind natively, no VALUES expansion.
        format_query(query, QueryFormatFlags::empty(), num_params, num_rows)
    }

    fn prepare(&mut self, stmt: &mut Stmt) -> Result<(), SqlError> {
        stmt.driver_query()?;
        Ok(())
    }

    fn execute(&mut self, stmt: &mut Stmt) -> Result<ExecuteResult, SqlError> {
        let query = stmt.driver_query()?.to_string();
        let rows = stmt.bind_rows_remaining();

        {
            let mut failures = mutex(&self.state.execute_failures);
            if let Some((kind, remaining)) = failures.get_mut(&query) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SqlError::new(*kind, "scripted execute failure"));
                }
            }
        }

        debug!(
            "fake execute: {:?} rows={rows} readonly={} host={}",
            query, self.readonly, self.host_idx
        );
        mutex(&self.state.executes).push(ExecRecord {
            query: query.clone(),
            readonly: self.readonly,
            host_idx: self.host_idx,
            rows,
        });

        let scripted = rwlock_read(&self.state.results).get(&query).cloned();
        if let Some((cols, rows_scripted)) = scripted {
            stmt.result_set_cols(cols);
            self.pending = Some(rows_scripted);
            let more = self.serve_chunk(stmt)?;
            return Ok(ExecuteResult {
                rows_consumed: rows,
                has_result: true,
                more_rows: more,
            });
        }

        let is_select = first_keyword(&query)
            .map(|word| word.eq_ignore_ascii_case("SELECT"))
            .unwrap_or(false);
        if is_select {
            // Unscripted SELECT: empty single-column result.
            stmt.result_set_cols(vec![ResultCol {
                name: "value".to_string(),
                dtype: DataType::Text,
                max_size: 0,
            }]);
            return Ok(ExecuteResult {
                rows_consumed: rows,
                has_result: true,
                more_rows: false,
            });
        }

        stmt.result_add_affected_rows(rows.max(1));
        Ok(ExecuteResult {
            rows_consumed: rows,
            has_result: false,
            more_rows: false,
        })
    }

    fn fetch(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError> {
        self.serve_chunk(stmt)
    }

    fn begin(&mut self, isolation: Isolation) -> Result<(), SqlError> {
        {
            let mut remaining = mutex(&self.state.begin_failures);
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SqlError::new(
                    ErrorKind::QueryDeadlock,
                    "scripted begin failure",
                ));
            }
        }
        self.state.begins.fetch_add(1, Ordering::Relaxed);
        mutex(&self.state.isolations).push(isolation);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SqlError> {
        self.state.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SqlError> {
        self.state.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state.disconnects.fetch_add(1, Ordering::Relaxed);
    }
}

fn mutex<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn rwlock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn rwlock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
