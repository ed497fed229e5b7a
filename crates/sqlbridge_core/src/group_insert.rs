use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{ErrorKind, SqlError};
use crate::pool::{Pool, lock};
use crate::stmt::Stmt;
use crate::value::{DataType, Value};

/// How long the first executor waits before sealing the batch, giving
/// concurrently-arriving threads a window to append their rows. The
/// original implementation used a bare scheduler yield here; a short
/// bounded sleep keeps the window's size predictable.
const JOIN_WINDOW: Duration = Duration::from_micros(100);

pub(crate) struct GroupEntryState {
    /// The shared statement rows accumulate into. Taken by the executor;
    /// `None` afterward.
    stmt: Option<Stmt>,
    executing: bool,
    outcome: Option<Result<ErrorKind, SqlError>>,
}

/// One rendezvous for a query key: the shared statement, its guard, and
/// the condition the non-executor participants wait on. Lifetime rides the
/// `Arc`: the key map holds one reference, each participant another.
pub(crate) struct GroupEntry {
    query: String,
    state: Mutex<GroupEntryState>,
    ready: Condvar,
}

impl GroupEntry {
    fn open(query: &str) -> Result<Arc<Self>, SqlError> {
        let mut stmt = Stmt::new();
        stmt.prepare(query)?;
        Ok(Arc::new(GroupEntry {
            query: query.to_string(),
            state: Mutex::new(GroupEntryState {
                stmt: Some(stmt),
                executing: false,
                outcome: None,
            }),
            ready: Condvar::new(),
        }))
    }
}

/// A participant's handle on a coalesced insert.
///
/// Created by [`Pool::group_insert_prepare`]; each holder binds one row of
/// parameters and calls [`GroupStmt::execute`]. The row joins whichever
/// batch is open for the query key when execute runs; whichever
/// participant executes first runs the accumulated batch as one multi-row
/// insert and every other participant receives the shared outcome.
///
/// The affected-row count of the underlying execution reflects the batch,
/// not any one caller's row, so it is not exposed here. On a constraint
/// (or other fatal) error every participant of the batch sees it; retry
/// the insert solo with a plain [`Stmt`] to learn whether your row was the
/// culprit.
pub struct GroupStmt {
    pool: Pool,
    entry: Arc<GroupEntry>,
    row: Vec<Value>,
}

impl Pool {
    /// Join (or open) the coalesced insert batch for the exact query
    /// string. Statements obtained this way are preconfigured: `prepare`
    /// does not apply, only binding and execute.
    pub fn group_insert_prepare(&self, query: &str) -> Result<GroupStmt, SqlError> {
        let entry = self.open_group_entry(query)?;
        Ok(GroupStmt {
            pool: self.clone(),
            entry,
            row: Vec::new(),
        })
    }

    /// The currently open entry for the key, replacing a sealed one with a
    /// fresh batch.
    pub(crate) fn open_group_entry(&self, query: &str) -> Result<Arc<GroupEntry>, SqlError> {
        let mut groups = lock(self.shared_groups());
        if let Some(entry) = groups.get(query) {
            let entry = entry.clone();
            let state = lock(&entry.state);
            let reusable = state.stmt.is_some() && !state.executing;
            drop(state);
            if reusable {
                return Ok(entry);
            }
            // The batch is departing; open a new one in its map slot.
        }
        let entry = GroupEntry::open(query)?;
        groups.insert(query.to_string(), entry.clone());
        Ok(entry)
    }

    pub(crate) fn remove_group_entry(&self, query: &str, entry: &Arc<GroupEntry>) {
        let mut groups = lock(self.shared_groups());
        if let Some(current) = groups.get(query) {
            if Arc::ptr_eq(current, entry) {
                groups.remove(query);
            }
        }
    }
}

impl GroupStmt {
    // The caller's row accumulates locally and is appended to the shared
    // statement in one critical section at execute, so concurrent callers
    // can never interleave columns.

    pub fn bind_bool(&mut self, val: bool) {
        self.row.push(Value::Bool(val));
    }

    pub fn bind_bool_null(&mut self) {
        self.row.push(Value::Null(DataType::Bool));
    }

    pub fn bind_int16(&mut self, val: i16) {
        self.row.push(Value::Int16(val));
    }

    pub fn bind_int16_null(&mut self) {
        self.row.push(Value::Null(DataType::Int16));
    }

    pub fn bind_int32(&mut self, val: i32) {
        self.row.push(Value::Int32(val));
    }

    pub fn bind_int32_null(&mut self) {
        self.row.push(Value::Null(DataType::Int32));
    }

    pub fn bind_int64(&mut self, val: i64) {
        self.row.push(Value::Int64(val));
    }

    pub fn bind_int64_null(&mut self) {
        self.row.push(Value::Null(DataType::Int64));
    }

    pub fn bind_text(&mut self, text: impl Into<String>) {
        self.row.push(Value::Text(text.into()));
    }

    pub fn bind_text_null(&mut self) {
        self.row.push(Value::Null(DataType::Text));
    }

    pub fn bind_binary(&mut self, bin: impl Into<Vec<u8>>) {
        self.row.push(Value::Binary(bin.into()));
    }

    pub fn bind_binary_null(&mut self) {
        self.row.push(Value::Null(DataType::Binary));
    }

    pub fn bind_value(&mut self, value: Value) {
        self.row.push(value);
    }

    /// Append the caller's row to the open batch; when the joined batch
    /// sealed in the meantime, re-join a fresh one.
    fn append_row(&mut self) -> Result<(), SqlError> {
        loop {
            {
                let mut state = lock(&self.entry.state);
                if state.outcome.is_none() && !state.executing {
                    if let Some(stmt) = state.stmt.as_mut() {
                        stmt.new_row();
                        for value in self.row.drain(..) {
                            if let Err(err) = stmt.bind_value(value) {
                                // Leave no partial row behind for the rest
                                // of the batch.
                                stmt.discard_last_row();
                                return Err(err);
                            }
                        }
                        return Ok(());
                    }
                }
            }
            debug!("group insert batch sealed before append; joining a fresh batch");
            self.entry = self.pool.open_group_entry(&self.entry.query.clone())?;
        }
    }

    /// Execute the batch, or wait for whoever does. Every participant of
    /// the batch receives its outcome.
    pub fn execute(&mut self) -> Result<ErrorKind, SqlError> {
        self.append_row()?;

        // Give concurrent appenders a moment to join before sealing.
        thread::sleep(JOIN_WINDOW);

        let mut state = lock(&self.entry.state);
        if state.outcome.is_none() && !state.executing {
            state.executing = true;
            let Some(mut stmt) = state.stmt.take() else {
                return Err(SqlError::new(
                    ErrorKind::InvalidUse,
                    "group insert batch lost its statement",
                ));
            };
            drop(state);

            // Seal the batch: no new joiners may attach once execution is
            // underway. A fresh entry under the same key replaces this one.
            self.pool.remove_group_entry(&self.entry.query, &self.entry);

            debug!(
                "executing group insert batch: {} rows for {:?}",
                stmt.bind_row_count(),
                self.entry.query
            );
            let result = stmt.execute(&self.pool);

            let mut state = lock(&self.entry.state);
            state.outcome = Some(result.clone());
            self.entry.ready.notify_all();
            result
        } else {
            loop {
                if let Some(outcome) = state.outcome.clone() {
                    return outcome;
                }
                state = match self.entry.ready.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
    }
}
