use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::conn::{Conn, ConnState};
use crate::connstr::ConnStr;
use crate::dialect::{BitOp, UpdlockType};
use crate::driver::{Driver, DriverPool, DriverPoolRequest, registry};
use crate::error::{ErrorKind, SqlError};
use crate::group_insert::GroupEntry;
use crate::idgen::{gen_timerand_id, rollback_delay_ms};
use crate::queryformat::first_keyword;
use crate::stmt::Stmt;
use crate::trace::{TraceEvent, TraceEventKind, TraceFn};
use crate::trans::Isolation;
use crate::value::DataType;

bitflags! {
    /// Pool behavior flags, fixed at build time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        /// Establish every connection slot at start instead of only the
        /// first; remaining slots otherwise fill on demand under
        /// contention.
        const PRESPAWN_ALL       = 1 << 0;
        /// Disable the automatic retry of standalone statements that fail
        /// with a rollback-class error.
        const NO_AUTORETRY_QUERY = 1 << 1;
        /// Spread connection establishment across all configured hosts
        /// instead of treating later hosts as failover targets.
        const LOAD_BALANCE       = 1 << 2;
    }
}

/// Maximum connections per sub-pool.
const MAX_POOL_CONNS: usize = 1000;

struct Timeouts {
    reconnect_s: AtomicU64,
    max_idle_s: AtomicU64,
    fallback_s: AtomicU64,
}

struct SubPoolState {
    idle: VecDeque<Conn>,
    /// Live connections, idle plus checked out.
    total: usize,
    ever_connected: bool,
    /// Per-host timestamp of the last disconnect-class connect failure.
    host_failures: Vec<Option<Instant>>,
    rr_counter: usize,
}

struct SubPool {
    readonly: bool,
    driver_pool: Box<dyn DriverPool>,
    max_conns: usize,
    state: Mutex<SubPoolState>,
    available: Condvar,
}

impl SubPool {
    fn new(readonly: bool, driver_pool: Box<dyn DriverPool>, max_conns: usize) -> Self {
        let num_hosts = driver_pool.num_hosts();
        Self {
            readonly,
            driver_pool,
            max_conns,
            state: Mutex::new(SubPoolState {
                idle: VecDeque::new(),
                total: 0,
                ever_connected: false,
                host_failures: vec![None; num_hosts.max(1)],
                rr_counter: 0,
            }),
            available: Condvar::new(),
        }
    }
}

pub(crate) struct PoolShared {
    driver: Arc<dyn Driver>,
    flags: PoolFlags,
    primary: SubPool,
    readonly: Option<SubPool>,
    timeouts: Timeouts,
    next_conn_id: AtomicU64,
    shutdown: AtomicBool,
    trace: Option<Arc<TraceFn>>,
    pub(crate) groups: Mutex<HashMap<String, Arc<GroupEntry>>>,
    server_version: OnceLock<String>,
}

/// Connection pool: one primary sub-pool plus an optional read-only
/// sub-pool sharing driver and credentials. SELECT statements outside a
/// transaction route to the read-only sub-pool when one exists; everything
/// else, and anything marked master-only, runs on the primary.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

/// Configuration for a [`Pool`], consumed by [`PoolBuilder::start`].
/// Read-only sub-pool and trace attachment happen here: after start the
/// descriptor set is frozen except for timeout adjustments.
pub struct PoolBuilder {
    driver_name: String,
    conn_str: String,
    username: String,
    password: String,
    max_conns: usize,
    flags: PoolFlags,
    readonly: Option<(String, usize)>,
    trace: Option<Arc<TraceFn>>,
    reconnect_s: u64,
    max_idle_s: u64,
    fallback_s: u64,
}

impl Pool {
    /// Start building a pool for the named driver and connection string.
    pub fn builder(driver: &str, conn_str: &str) -> PoolBuilder {
        PoolBuilder {
            driver_name: driver.to_string(),
            conn_str: conn_str.to_string(),
            username: String::new(),
            password: String::new(),
            max_conns: 1,
            flags: PoolFlags::empty(),
            readonly: None,
            trace: None,
            reconnect_s: 0,
            max_idle_s: 0,
            fallback_s: 0,
        }
    }
}

impl PoolBuilder {
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    pub fn max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;
        self
    }

    pub fn flags(mut self, flags: PoolFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Attach a read-only sub-pool fed by asynchronous replication.
    /// Shares the primary's driver and credentials; only the connection
    /// string and size differ. One per pool.
    pub fn readonly_pool(mut self, conn_str: &str, max_conns: usize) -> Self {
        self.readonly = Some((conn_str.to_string(), max_conns));
        self
    }

    /// Attach a trace callback. Must be thread-safe; invocations are
    /// serialized per connection but pool-level events arrive concurrently.
    pub fn trace(mut self, callback: impl Fn(&TraceEvent<'_>) + Send + Sync + 'static) -> Self {
        self.trace = Some(Arc::new(callback));
        self
    }

    /// Lifecycle timers, each 0 = disabled: `reconnect_s` retires
    /// connections of that age on release, `max_idle_s` discards idle
    /// connections instead of reusing them, `fallback_s` is how long a
    /// failed host stays deprioritized.
    pub fn timeouts(mut self, reconnect_s: u64, max_idle_s: u64, fallback_s: u64) -> Self {
        self.reconnect_s = reconnect_s;
        self.max_idle_s = max_idle_s;
        self.fallback_s = fallback_s;
        self
    }

    /// Validate configuration, spawn the initial connections, and hand back
    /// the running pool.
    pub fn start(self) -> Result<Pool, SqlError> {
        if self.max_conns == 0 || self.max_conns > MAX_POOL_CONNS {
            return Err(SqlError::new(
                ErrorKind::InvalidUse,
                format!("max_conns must be 1-{MAX_POOL_CONNS}"),
            ));
        }
        if let Some((_, ro_max)) = &self.readonly {
            if *ro_max == 0 || *ro_max > MAX_POOL_CONNS {
                return Err(SqlError::new(
                    ErrorKind::InvalidUse,
                    format!("read-only max_conns must be 1-{MAX_POOL_CONNS}"),
                ));
            }
        }

        let driver = registry().lookup(&self.driver_name)?;

        let conn_str = ConnStr::parse(&self.conn_str)?;
        let primary_dpool = driver.create_pool(&DriverPoolRequest {
            conn_str: &conn_str,
            username: &self.username,
            password: &self.password,
            is_readonly: false,
        })?;

        let readonly = match &self.readonly {
            None => None,
            Some((ro_str, ro_max)) => {
                let ro_conn_str = ConnStr::parse(ro_str)?;
                let dpool = driver.create_pool(&DriverPoolRequest {
                    conn_str: &ro_conn_str,
                    username: &self.username,
                    password: &self.password,
                    is_readonly: true,
                })?;
                Some(SubPool::new(true, dpool, *ro_max))
            }
        };

        let shared = Arc::new(PoolShared {
            driver,
            flags: self.flags,
            primary: SubPool::new(false, primary_dpool, self.max_conns),
            readonly,
            timeouts: Timeouts {
                reconnect_s: AtomicU64::new(self.reconnect_s),
                max_idle_s: AtomicU64::new(self.max_idle_s),
                fallback_s: AtomicU64::new(self.fallback_s),
            },
            next_conn_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            trace: self.trace,
            groups: Mutex::new(HashMap::new()),
            server_version: OnceLock::new(),
        });

        let pool = Pool { shared };
        pool.prespawn(&pool.shared.primary)?;
        if let Some(ro) = &pool.shared.readonly {
            pool.prespawn(ro)?;
        }

        info!(
            "pool started: driver={} conns={}{}",
            pool.driver_name(),
            self.max_conns,
            if pool.shared.readonly.is_some() {
                " +readonly"
            } else {
                ""
            }
        );
        Ok(pool)
    }
}

impl Pool {
    // -- Introspection --

    pub fn driver_name(&self) -> &'static str {
        self.shared.driver.name()
    }

    pub fn driver_display_name(&self) -> &'static str {
        self.shared.driver.display_name()
    }

    pub fn driver_version(&self) -> &'static str {
        self.shared.driver.version()
    }

    /// Server name/version string captured from the first connection.
    pub fn server_version(&self) -> &str {
        self.shared.server_version.get().map(|s| s.as_str()).unwrap_or("")
    }

    /// Count of live (established) connections for the given role.
    pub fn active_conns(&self, readonly: bool) -> usize {
        match self.subpool(readonly) {
            Some(sub) => lock(&sub.state).total,
            None => 0,
        }
    }

    pub fn flags(&self) -> PoolFlags {
        self.shared.flags
    }

    /// Adjust lifecycle timers on a running pool; each 0 disables the
    /// timer. The only configuration that may change after start.
    pub fn set_timeouts(&self, reconnect_s: u64, max_idle_s: u64, fallback_s: u64) {
        self.shared
            .timeouts
            .reconnect_s
            .store(reconnect_s, Ordering::Relaxed);
        self.shared
            .timeouts
            .max_idle_s
            .store(max_idle_s, Ordering::Relaxed);
        self.shared
            .timeouts
            .fallback_s
            .store(fallback_s, Ordering::Relaxed);
    }

    /// Close every connection and refuse further use. Fails with `InUse`
    /// while any connection is checked out; callers must return all
    /// statement and transaction handles first.
    pub fn destroy(&self) -> Result<(), SqlError> {
        for sub in self.subpools() {
            let state = lock(&sub.state);
            if state.total != state.idle.len() {
                return Err(SqlError::new(
                    ErrorKind::InUse,
                    "connections still checked out",
                ));
            }
        }

        self.shared.shutdown.store(true, Ordering::SeqCst);
        for sub in self.subpools() {
            let mut conns = {
                let mut state = lock(&sub.state);
                state.total = 0;
                std::mem::take(&mut state.idle)
            };
            for conn in conns.iter_mut() {
                self.emit(
                    TraceEvent::new(TraceEventKind::Disconnecting)
                        .readonly(sub.readonly)
                        .conn_id(conn.id()),
                );
                conn.disconnect();
                self.emit(
                    TraceEvent::new(TraceEventKind::Disconnected)
                        .readonly(sub.readonly)
                        .conn_id(conn.id()),
                );
            }
            sub.available.notify_all();
        }
        info!("pool destroyed: driver={}", self.driver_name());
        Ok(())
    }

    // -- Query construction helpers (delegating to the primary driver) --

    /// Append the backend row-lock hint at the given position. See
    /// [`UpdlockType`] for the two-position protocol.
    pub fn append_updlock(&self, query: &mut String, typ: UpdlockType, table_name: Option<&str>) {
        self.shared
            .primary
            .driver_pool
            .append_updlock(query, typ, table_name);
    }

    /// Append `exp1 <op> exp2` in the backend's bitwise syntax.
    pub fn append_bitop(
        &self,
        query: &mut String,
        op: BitOp,
        exp1: &str,
        exp2: &str,
    ) -> Result<(), SqlError> {
        self.shared
            .primary
            .driver_pool
            .append_bitop(query, op, exp1, exp2)
    }

    /// Emit the backend column-type declaration for CREATE TABLE or CAST.
    pub fn datatype(&self, buf: &mut String, dtype: DataType, max_len: usize, is_cast: bool) {
        self.shared
            .primary
            .driver_pool
            .datatype(buf, dtype, max_len, is_cast);
    }

    /// Append the backend CREATE TABLE trailer, if any.
    pub fn create_table_suffix(&self, buf: &mut String) {
        self.shared.primary.driver_pool.create_table_suffix(buf);
    }

    /// Reshape an index name to the backend identifier limit; `None` means
    /// it already fits.
    pub fn rewrite_index_name(&self, name: &str) -> Option<String> {
        self.shared.primary.driver_pool.rewrite_index_name(name)
    }

    /// Time-prefixed random id for primary-key use; see
    /// [`crate::idgen::gen_timerand_id`].
    pub fn gen_timerand_id(&self, max_len: usize) -> Result<i64, SqlError> {
        gen_timerand_id(max_len)
    }

    /// Randomized backoff for rollback retry loops, in milliseconds.
    pub fn rollback_delay_ms(&self) -> u64 {
        rollback_delay_ms()
    }

    // -- Internals --

    fn subpools(&self) -> impl Iterator<Item = &SubPool> {
        std::iter::once(&self.shared.primary).chain(self.shared.readonly.as_ref())
    }

    fn subpool(&self, readonly: bool) -> Option<&SubPool> {
        if readonly {
            self.shared.readonly.as_ref()
        } else {
            Some(&self.shared.primary)
        }
    }

    pub(crate) fn emit(&self, event: TraceEvent<'_>) {
        if let Some(trace) = &self.shared.trace {
            trace(&event);
        }
    }

    fn prespawn(&self, sub: &SubPool) -> Result<(), SqlError> {
        let count = if self.shared.flags.contains(PoolFlags::PRESPAWN_ALL) {
            sub.max_conns
        } else {
            1
        };
        for _ in 0..count {
            let conn = self.establish(sub)?;
            if self.shared.server_version.get().is_none() {
                let _ = self.shared.server_version.set(conn.server_version().to_string());
            }
            let mut state = lock(&sub.state);
            state.total += 1;
            state.idle.push_back(conn);
        }
        Ok(())
    }

    /// Hosts currently worth attempting, in preference order. A host inside
    /// the fallback window after a failure is skipped unless every host has
    /// failed, in which case all are eligible.
    fn eligible_hosts(&self, sub: &SubPool) -> Vec<usize> {
        let fallback_s = self.shared.timeouts.fallback_s.load(Ordering::Relaxed);
        let state = lock(&sub.state);
        let num_hosts = state.host_failures.len();

        let eligible: Vec<usize> = (0..num_hosts)
            .filter(|&idx| match state.host_failures[idx] {
                None => true,
                Some(when) => fallback_s > 0 && when.elapsed().as_secs() >= fallback_s,
            })
            .collect();
        if eligible.is_empty() {
            (0..num_hosts).collect()
        } else {
            eligible
        }
    }

    /// Establish one connection for the sub-pool, rotating through hosts on
    /// disconnect-class failures for up to one full pass.
    fn establish(&self, sub: &SubPool) -> Result<Conn, SqlError> {
        let eligible = self.eligible_hosts(sub);

        // Failover prefers the lowest eligible index; load balancing walks
        // the round-robin counter. Either way every eligible host gets one
        // attempt before giving up.
        let start = if self.shared.flags.contains(PoolFlags::LOAD_BALANCE) {
            let mut state = lock(&sub.state);
            let slot = state.rr_counter % eligible.len();
            state.rr_counter = state.rr_counter.wrapping_add(1);
            slot
        } else {
            0
        };

        let mut last_err = None;
        for attempt in 0..eligible.len() {
            let host_idx = eligible[(start + attempt) % eligible.len()];
            self.emit(
                TraceEvent::new(TraceEventKind::ConnectStart)
                    .readonly(sub.readonly)
                    .host_idx(host_idx),
            );

            match sub.driver_pool.connect(host_idx) {
                Ok(mut driver_conn) => {
                    let is_first = {
                        let state = lock(&sub.state);
                        !state.ever_connected
                    };
                    // A run-once failure is fatal for this attempt but says
                    // nothing about host health.
                    if let Err(err) = driver_conn.runonce(is_first) {
                        self.emit(
                            TraceEvent::new(TraceEventKind::ConnectFailed)
                                .readonly(sub.readonly)
                                .host_idx(host_idx)
                                .error(err.kind())
                                .message(err.message()),
                        );
                        driver_conn.disconnect();
                        return Err(err);
                    }
                    {
                        let mut state = lock(&sub.state);
                        state.ever_connected = true;
                        state.host_failures[host_idx] = None;
                    }
                    let id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    self.emit(
                        TraceEvent::new(TraceEventKind::Connected)
                            .readonly(sub.readonly)
                            .host_idx(host_idx)
                            .conn_id(id),
                    );
                    debug!(
                        "established conn #{id} host={host_idx} readonly={}",
                        sub.readonly
                    );
                    return Ok(Conn::new(driver_conn, id, host_idx, sub.readonly));
                }
                Err(err) => {
                    self.emit(
                        TraceEvent::new(TraceEventKind::ConnectFailed)
                            .readonly(sub.readonly)
                            .host_idx(host_idx)
                            .error(err.kind())
                            .message(err.message()),
                    );
                    if err.is_disconnect() {
                        warn!("connect to host {host_idx} failed: {err}");
                        let mut state = lock(&sub.state);
                        state.host_failures[host_idx] = Some(Instant::now());
                        last_err = Some(err);
                    } else {
                        return Err(err);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            SqlError::new(ErrorKind::ConnFailed, "no host accepted the connection")
        }))
    }

    /// Check a connection out of the given role's sub-pool, blocking until
    /// one is idle, a slot frees up for establishment, or the pool shuts
    /// down.
    pub(crate) fn acquire_guard(&self, readonly: bool) -> Result<ConnGuard, SqlError> {
        let use_readonly = readonly && self.shared.readonly.is_some();
        let sub = match self.subpool(use_readonly) {
            Some(sub) => sub,
            None => &self.shared.primary,
        };

        let max_idle_s = self.shared.timeouts.max_idle_s.load(Ordering::Relaxed);
        let mut state = lock(&sub.state);
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Err(SqlError::new(ErrorKind::InvalidUse, "pool is shut down"));
            }

            // Reuse most-recently-released first; the front of the queue is
            // then the most idle and the next candidate for expiry.
            let mut expired = Vec::new();
            if max_idle_s > 0 {
                while state
                    .idle
                    .front()
                    .is_some_and(|conn| conn.idle_secs() >= max_idle_s)
                {
                    if let Some(conn) = state.idle.pop_front() {
                        state.total -= 1;
                        expired.push(conn);
                    }
                }
            }
            if !expired.is_empty() {
                drop(state);
                for mut conn in expired {
                    debug!("discarding idle-expired conn #{}", conn.id());
                    conn.disconnect();
                }
                sub.available.notify_all();
                state = lock(&sub.state);
                continue;
            }

            if let Some(mut conn) = state.idle.pop_back() {
                conn.touch();
                return Ok(ConnGuard {
                    pool: self.clone(),
                    readonly: use_readonly,
                    conn: Some(conn),
                });
            }

            if state.total < sub.max_conns {
                state.total += 1;
                drop(state);
                return match self.establish(sub) {
                    Ok(conn) => {
                        if self.shared.server_version.get().is_none() {
                            let _ = self
                                .shared
                                .server_version
                                .set(conn.server_version().to_string());
                        }
                        Ok(ConnGuard {
                            pool: self.clone(),
                            readonly: use_readonly,
                            conn: Some(conn),
                        })
                    }
                    Err(err) => {
                        let mut state = lock(&sub.state);
                        state.total -= 1;
                        drop(state);
                        sub.available.notify_one();
                        Err(err)
                    }
                };
            }

            state = wait(&sub.available, state);
        }
    }

    /// Return a connection to its sub-pool: destroy failed or retired ones,
    /// roll back rollback-pending ones, then signal waiters.
    pub(crate) fn release(&self, mut conn: Conn, readonly: bool) {
        let sub = match self.subpool(readonly) {
            Some(sub) => sub,
            None => &self.shared.primary,
        };

        let mut destroy = self.shared.shutdown.load(Ordering::SeqCst);

        match conn.state() {
            ConnState::Failed => destroy = true,
            ConnState::Rollback => {
                self.emit(
                    TraceEvent::new(TraceEventKind::RollbackStart)
                        .readonly(readonly)
                        .conn_id(conn.id()),
                );
                let result = conn.rollback();
                self.emit(
                    TraceEvent::new(TraceEventKind::RollbackFinish)
                        .readonly(readonly)
                        .conn_id(conn.id()),
                );
                if let Err(err) = result {
                    warn!("rollback on release failed: {err}");
                    destroy = true;
                }
            }
            ConnState::Ok => {
                // A dangling transaction here is a caller bug; clear it
                // rather than poisoning the next user of the connection.
                if conn.in_trans() {
                    warn!("connection released with open transaction; rolling back");
                    if conn.rollback().is_err() {
                        destroy = true;
                    }
                }
            }
        }

        // Age-based retirement happens on release so callers never wait on
        // a teardown.
        let reconnect_s = self.shared.timeouts.reconnect_s.load(Ordering::Relaxed);
        if !destroy && reconnect_s > 0 && conn.age_secs() >= reconnect_s {
            debug!("retiring conn #{} after {}s", conn.id(), conn.age_secs());
            destroy = true;
        }

        if destroy {
            self.emit(
                TraceEvent::new(TraceEventKind::Disconnecting)
                    .readonly(readonly)
                    .conn_id(conn.id()),
            );
            conn.disconnect();
            self.emit(
                TraceEvent::new(TraceEventKind::Disconnected)
                    .readonly(readonly)
                    .conn_id(conn.id()),
            );
            let mut state = lock(&sub.state);
            state.total -= 1;
        } else {
            conn.touch();
            self.emit(
                TraceEvent::new(TraceEventKind::ConnIdle)
                    .readonly(readonly)
                    .conn_id(conn.id()),
            );
            let mut state = lock(&sub.state);
            state.idle.push_back(conn);
        }
        sub.available.notify_one();
    }

    pub(crate) fn has_readonly(&self) -> bool {
        self.shared.readonly.is_some()
    }

    pub(crate) fn shared_groups(&self) -> &Mutex<HashMap<String, Arc<GroupEntry>>> {
        &self.shared.groups
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("driver", &self.driver_name())
            .field("primary_conns", &self.active_conns(false))
            .field("readonly_conns", &self.active_conns(true))
            .finish()
    }
}

/// Exclusive ownership of one pooled connection for the duration of a
/// statement or transaction. Dropping the guard returns the connection to
/// the pool, which recycles or destroys it based on the state the guard's
/// operations left behind.
pub struct ConnGuard {
    pool: Pool,
    readonly: bool,
    conn: Option<Conn>,
}

impl ConnGuard {
    fn conn_mut(&mut self) -> Result<&mut Conn, SqlError> {
        self.conn.as_mut().ok_or_else(|| {
            SqlError::new(ErrorKind::InvalidUse, "connection already released")
        })
    }

    pub(crate) fn conn_id(&self) -> Option<u64> {
        self.conn.as_ref().map(Conn::id)
    }

    pub(crate) fn conn_execute(&mut self, stmt: &mut Stmt) -> Result<ErrorKind, SqlError> {
        let readonly = self.readonly;
        let trace = self.pool.clone();
        let conn_id = self.conn_id().unwrap_or(0);
        let conn = self.conn_mut()?;
        if let Some(query) = stmt.query() {
            trace.emit(
                TraceEvent::new(TraceEventKind::ExecuteStart)
                    .readonly(readonly)
                    .conn_id(conn_id)
                    .query(query),
            );
        }
        let result = conn.execute_stmt(stmt);
        let mut finish = TraceEvent::new(TraceEventKind::ExecuteFinish)
            .readonly(readonly)
            .conn_id(conn_id);
        if let Err(err) = &result {
            finish = finish.error(err.kind());
        }
        trace.emit(finish);
        result
    }

    pub(crate) fn conn_fetch(&mut self, stmt: &mut Stmt) -> Result<bool, SqlError> {
        let readonly = self.readonly;
        let trace = self.pool.clone();
        let conn_id = self.conn_id().unwrap_or(0);
        let conn = self.conn_mut()?;
        trace.emit(
            TraceEvent::new(TraceEventKind::FetchStart)
                .readonly(readonly)
                .conn_id(conn_id),
        );
        let result = conn.fetch_stmt(stmt);
        trace.emit(
            TraceEvent::new(TraceEventKind::FetchFinish)
                .readonly(readonly)
                .conn_id(conn_id),
        );
        result
    }

    pub(crate) fn conn_begin(&mut self, isolation: Isolation) -> Result<(), SqlError> {
        let readonly = self.readonly;
        let trace = self.pool.clone();
        let conn_id = self.conn_id().unwrap_or(0);
        let conn = self.conn_mut()?;
        trace.emit(
            TraceEvent::new(TraceEventKind::BeginStart)
                .readonly(readonly)
                .conn_id(conn_id),
        );
        let result = conn.begin(isolation);
        trace.emit(
            TraceEvent::new(TraceEventKind::BeginFinish)
                .readonly(readonly)
                .conn_id(conn_id),
        );
        result
    }

    pub(crate) fn conn_commit(&mut self) -> Result<(), SqlError> {
        let readonly = self.readonly;
        let trace = self.pool.clone();
        let conn_id = self.conn_id().unwrap_or(0);
        let conn = self.conn_mut()?;
        trace.emit(
            TraceEvent::new(TraceEventKind::CommitStart)
                .readonly(readonly)
                .conn_id(conn_id),
        );
        let result = conn.commit();
        let mut finish = TraceEvent::new(TraceEventKind::CommitFinish)
            .readonly(readonly)
            .conn_id(conn_id);
        if let Err(err) = &result {
            finish = finish.error(err.kind());
        }
        trace.emit(finish);
        result
    }

    pub(crate) fn conn_rollback(&mut self) -> Result<(), SqlError> {
        let readonly = self.readonly;
        let trace = self.pool.clone();
        let conn_id = self.conn_id().unwrap_or(0);
        let conn = self.conn_mut()?;
        trace.emit(
            TraceEvent::new(TraceEventKind::RollbackStart)
                .readonly(readonly)
                .conn_id(conn_id),
        );
        let result = conn.rollback();
        trace.emit(
            TraceEvent::new(TraceEventKind::RollbackFinish)
                .readonly(readonly)
                .conn_id(conn_id),
        );
        result
    }

    pub(crate) fn mark_from_error(&mut self, err: &SqlError) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_from_error(err);
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.readonly);
        }
    }
}

impl Stmt {
    /// Execute the statement against the pool, auto-committing.
    ///
    /// Routing: SELECT statements go to the read-only sub-pool when one
    /// exists and the statement is not marked master-only; everything else
    /// runs on the primary. Within an explicit transaction use
    /// [`crate::trans::Trans::execute`] instead.
    ///
    /// Rollback-class failures (deadlocks, lost connections) are retried
    /// with a randomized backoff, indefinitely, unless the pool carries
    /// `NO_AUTORETRY_QUERY`; callers needing a ceiling wrap this call with
    /// their own deadline.
    ///
    /// Returns `SuccessRow` when result rows are available. With a nonzero
    /// `max_fetch_rows` the statement keeps its connection checked out
    /// until [`Stmt::fetch`] drains the remaining rows.
    pub fn execute(&mut self, pool: &Pool) -> Result<ErrorKind, SqlError> {
        self.begin_execution()?;

        let readonly = pool.has_readonly()
            && !self.master_only()
            && self
                .query()
                .and_then(first_keyword)
                .map(|word| word.eq_ignore_ascii_case("SELECT"))
                .unwrap_or(false);

        loop {
            let mut guard = match pool.acquire_guard(readonly) {
                Ok(guard) => guard,
                Err(err) => return Err(self.record(err)),
            };

            match guard.conn_execute(self) {
                Ok(kind) => {
                    if self.has_remaining_rows() {
                        self.held = Some(guard);
                    }
                    self.record_ok(kind);
                    return Ok(kind);
                }
                Err(err) => {
                    drop(guard);
                    if err.is_rollback()
                        && !pool.flags().contains(PoolFlags::NO_AUTORETRY_QUERY)
                    {
                        let delay = rollback_delay_ms();
                        debug!("standalone statement rolled back ({err}), retrying in {delay}ms");
                        thread::sleep(Duration::from_millis(delay));
                        self.begin_execution()?;
                        continue;
                    }
                    return Err(self.record(err));
                }
            }
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match condvar.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_flags_compose() {
        let flags = PoolFlags::PRESPAWN_ALL | PoolFlags::LOAD_BALANCE;
        assert!(flags.contains(PoolFlags::PRESPAWN_ALL));
        assert!(!flags.contains(PoolFlags::NO_AUTORETRY_QUERY));
    }

    #[test]
    fn builder_rejects_bad_sizes() {
        let err = Pool::builder("sqlite", "path=:memory:")
            .max_conns(0)
            .start()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUse);

        let err = Pool::builder("sqlite", "path=:memory:")
            .max_conns(1001)
            .start()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUse);
    }

    #[test]
    fn unknown_driver_is_reported_at_start() {
        let err = Pool::builder("vaporware", "host=1.2.3.4")
            .max_conns(2)
            .start()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnNoDriver);
    }
}
