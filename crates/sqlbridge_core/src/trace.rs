use crate::error::ErrorKind;

/// What happened. Lifecycle events pair `*Start`/`*Finish` so a callback
/// can measure durations; `Driver*` events carry messages emitted by the
/// backend drivers themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    ConnectStart,
    Connected,
    ConnectFailed,
    Disconnecting,
    Disconnected,
    BeginStart,
    BeginFinish,
    RollbackStart,
    RollbackFinish,
    CommitStart,
    CommitFinish,
    ExecuteStart,
    ExecuteFinish,
    FetchStart,
    FetchFinish,
    ConnIdle,
    DriverDebug,
    DriverError,
}

/// One trace record. Fields are populated where they make sense for the
/// event kind; everything else is `None`.
#[derive(Debug)]
pub struct TraceEvent<'a> {
    pub kind: TraceEventKind,
    /// True when the event concerns the read-only sub-pool.
    pub readonly: bool,
    /// Pool-unique connection id, when a connection is involved.
    pub conn_id: Option<u64>,
    /// Host index the event concerns (connect/disconnect events).
    pub host_idx: Option<usize>,
    pub error: Option<ErrorKind>,
    pub message: Option<&'a str>,
    pub query: Option<&'a str>,
}

impl<'a> TraceEvent<'a> {
    pub(crate) fn new(kind: TraceEventKind) -> Self {
        Self {
            kind,
            readonly: false,
            conn_id: None,
            host_idx: None,
            error: None,
            message: None,
            query: None,
        }
    }

    pub(crate) fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub(crate) fn conn_id(mut self, id: u64) -> Self {
        self.conn_id = Some(id);
        self
    }

    pub(crate) fn host_idx(mut self, idx: usize) -> Self {
        self.host_idx = Some(idx);
        self
    }

    pub(crate) fn error(mut self, kind: ErrorKind) -> Self {
        self.error = Some(kind);
        self
    }

    pub(crate) fn message(mut self, message: &'a str) -> Self {
        self.message = Some(message);
        self
    }

    pub(crate) fn query(mut self, query: &'a str) -> Self {
        self.query = Some(query);
        self
    }
}

/// Trace callback. Invocations are serialized per connection (a connection
/// is owned by one thread at a time); pool-level events may arrive from any
/// thread concurrently, so the callback must be thread-safe.
pub type TraceFn = dyn Fn(&TraceEvent<'_>) + Send + Sync;
