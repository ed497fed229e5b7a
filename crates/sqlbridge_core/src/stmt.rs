use crate::error::{ErrorKind, SqlError};
use crate::pool::ConnGuard;
use crate::queryformat::count_placeholders;
use crate::result::{ResultBuffer, ResultCol};
use crate::value::{DataType, Value};

/// Prepared statement handle.
///
/// Owns the request side (query text, bound parameter rows, execution
/// flags) and the response side (result buffer, column metadata, affected
/// row count, error state). Parameters bind in query order as the next
/// column of the current row; `new_row` starts another row for multi-row
/// inserts. All rows must agree with row 0 on column count and per-column
/// type, with null compatible with any type.
#[derive(Default)]
pub struct Stmt {
    query: Option<String>,
    rewritten: Option<String>,
    placeholders: usize,
    bind_rows: Vec<Vec<Value>>,
    bind_offset: usize,
    max_fetch_rows: usize,
    master_only: bool,
    executed: bool,
    affected_rows: usize,
    result: ResultBuffer,
    remaining_rows: bool,
    pub(crate) held: Option<ConnGuard>,
    last_kind: ErrorKind,
    last_message: String,
}

impl Stmt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare the statement from a query string. Question marks are the
    /// placeholder convention regardless of backend; inline string literals
    /// are rejected, values must be bound.
    pub fn prepare(&mut self, query: &str) -> Result<(), SqlError> {
        if self.executed && self.remaining_rows {
            return Err(self.record(SqlError::new(
                ErrorKind::InvalidUse,
                "statement still has unfetched rows",
            )));
        }
        let placeholders = match count_placeholders(query) {
            Ok(count) => count,
            Err(err) => return Err(self.record(err)),
        };
        self.query = Some(query.to_string());
        self.placeholders = placeholders;
        self.rewritten = None;
        self.executed = false;
        self.last_kind = ErrorKind::Success;
        self.last_message.clear();
        Ok(())
    }

    /// Prepare from an owned buffer, consuming it regardless of outcome.
    pub fn prepare_buf(&mut self, query: String) -> Result<(), SqlError> {
        self.prepare(&query)
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    // -- Execution flags --

    /// Cache at most `num` rows client-side per fetch; 0 (the default)
    /// buffers the entire result set during execute. Rejected once the
    /// statement has executed.
    pub fn set_max_fetch_rows(&mut self, num: usize) -> Result<(), SqlError> {
        if self.executed {
            return Err(SqlError::new(
                ErrorKind::InvalidUse,
                "cannot change fetch size after execute",
            ));
        }
        self.max_fetch_rows = num;
        Ok(())
    }

    /// Force routing to the primary sub-pool even for SELECT statements.
    /// Rejected once the statement has executed.
    pub fn set_master_only(&mut self) -> Result<(), SqlError> {
        if self.executed {
            return Err(SqlError::new(
                ErrorKind::InvalidUse,
                "cannot change routing after execute",
            ));
        }
        self.master_only = true;
        Ok(())
    }

    pub fn master_only(&self) -> bool {
        self.master_only
    }

    pub fn max_fetch_rows(&self) -> usize {
        self.max_fetch_rows
    }

    // -- Parameter binding --

    fn bind(&mut self, value: Value) -> Result<(), SqlError> {
        if self.bind_rows.is_empty() {
            self.bind_rows.push(Vec::new());
        }
        let row_idx = self.bind_rows.len() - 1;
        let col_idx = self.bind_rows[row_idx].len();

        if row_idx > 0 {
            let first = &self.bind_rows[0];
            let Some(reference) = first.get(col_idx) else {
                return Err(SqlError::new(
                    ErrorKind::InvalidUse,
                    format!(
                        "row {row_idx} binds more than the {} columns of row 0",
                        first.len()
                    ),
                ));
            };
            if !reference.is_type_compatible(&value) {
                return Err(SqlError::new(
                    ErrorKind::InvalidType,
                    format!(
                        "column {col_idx} bound as {} in row 0 but {} in row {row_idx}",
                        reference.data_type().as_str(),
                        value.data_type().as_str()
                    ),
                ));
            }
        }

        self.bind_rows[row_idx].push(value);
        Ok(())
    }

    pub fn bind_bool(&mut self, val: bool) -> Result<(), SqlError> {
        self.bind(Value::Bool(val))
    }

    pub fn bind_bool_null(&mut self) -> Result<(), SqlError> {
        self.bind(Value::Null(DataType::Bool))
    }

    pub fn bind_int16(&mut self, val: i16) -> Result<(), SqlError> {
        self.bind(Value::Int16(val))
    }

    pub fn bind_int16_null(&mut self) -> Result<(), SqlError> {
        self.bind(Value::Null(DataType::Int16))
    }

    pub fn bind_int32(&mut self, val: i32) -> Result<(), SqlError> {
        self.bind(Value::Int32(val))
    }

    pub fn bind_int32_null(&mut self) -> Result<(), SqlError> {
        self.bind(Value::Null(DataType::Int32))
    }

    pub fn bind_int64(&mut self, val: i64) -> Result<(), SqlError> {
        self.bind(Value::Int64(val))
    }

    pub fn bind_int64_null(&mut self) -> Result<(), SqlError> {
        self.bind(Value::Null(DataType::Int64))
    }

    pub fn bind_text(&mut self, text: impl Into<String>) -> Result<(), SqlError> {
        self.bind(Value::Text(text.into()))
    }

    pub fn bind_text_null(&mut self) -> Result<(), SqlError> {
        self.bind(Value::Null(DataType::Text))
    }

    pub fn bind_binary(&mut self, bin: impl Into<Vec<u8>>) -> Result<(), SqlError> {
        self.bind(Value::Binary(bin.into()))
    }

    pub fn bind_binary_null(&mut self) -> Result<(), SqlError> {
        self.bind(Value::Null(DataType::Binary))
    }

    /// Bind an already-constructed value as the next column.
    pub fn bind_value(&mut self, value: Value) -> Result<(), SqlError> {
        self.bind(value)
    }

    /// Advance to the next bind row. Subsequent binds must repeat the
    /// column count and types of row 0.
    pub fn new_row(&mut self) {
        if !self.bind_rows.last().is_some_and(|row| row.is_empty()) {
            self.bind_rows.push(Vec::new());
        }
    }

    /// Drop all bound rows, preserving the prepared query.
    pub fn bind_clear(&mut self) {
        self.bind_rows.clear();
        self.bind_offset = 0;
    }

    /// Total bound rows (independent of execution progress).
    pub fn bind_row_count(&self) -> usize {
        self.bind_rows.iter().filter(|row| !row.is_empty()).count()
    }

    // -- Error state --

    pub fn error(&self) -> ErrorKind {
        self.last_kind
    }

    pub fn error_string(&self) -> &str {
        &self.last_message
    }

    pub(crate) fn record(&mut self, err: SqlError) -> SqlError {
        self.last_kind = err.kind();
        self.last_message = err.message().to_string();
        err
    }

    pub(crate) fn record_ok(&mut self, kind: ErrorKind) {
        self.last_kind = kind;
        self.last_message.clear();
    }

    // -- Results --

    /// Result rows and metadata for the current fetch chunk.
    pub fn result(&self) -> &ResultBuffer {
        &self.result
    }

    /// Rows affected by a non-query execution. Meaningless for SELECT, and
    /// backends disagree on whether no-op updates count; callers must not
    /// use this for change detection.
    pub fn affected_rows(&self) -> usize {
        self.affected_rows
    }

    /// Whether unfetched rows remain server-side; fetch with
    /// [`Stmt::fetch`] (or `Trans::fetch` inside a transaction) until this
    /// turns false.
    pub fn has_remaining_rows(&self) -> bool {
        self.remaining_rows
    }

    /// Fetch the next chunk of rows for a standalone (non-transactional)
    /// chunked statement, replacing the current buffer. Returns
    /// `SuccessRow` while more rows may remain, `Success` once drained.
    pub fn fetch(&mut self) -> Result<ErrorKind, SqlError> {
        if !self.remaining_rows {
            self.result.clear_chunk();
            return Ok(ErrorKind::Success);
        }
        let mut guard = self.held.take().ok_or_else(|| {
            SqlError::new(
                ErrorKind::InvalidUse,
                "statement is not holding a connection; use Trans::fetch inside a transaction",
            )
        })?;

        self.result.clear_chunk();
        match guard.conn_fetch(self) {
            Ok(true) => {
                self.held = Some(guard);
                self.remaining_rows = true;
                self.record_ok(ErrorKind::SuccessRow);
                Ok(ErrorKind::SuccessRow)
            }
            Ok(false) => {
                self.remaining_rows = false;
                self.record_ok(ErrorKind::Success);
                Ok(ErrorKind::Success)
            }
            Err(err) => {
                self.remaining_rows = false;
                guard.mark_from_error(&err);
                Err(self.record(err))
            }
        }
    }

    // -- Driver-facing API ------------------------------------------------
    //
    // Everything below is for driver implementations: the bind window view
    // narrows as executions consume rows, and the result setters populate
    // the buffer the accessors above read.

    /// The rewritten (backend-convention) query for the current execution.
    pub fn driver_query(&self) -> Result<&str, SqlError> {
        self.rewritten.as_deref().ok_or_else(|| {
            SqlError::new(ErrorKind::QueryNotPrepared, "statement has not been prepared")
        })
    }

    /// Placeholders per bind row in the user query.
    pub fn num_params(&self) -> usize {
        self.placeholders
    }

    /// Bind rows not yet consumed by an execution.
    pub fn bind_rows_remaining(&self) -> usize {
        self.bind_row_count().saturating_sub(self.bind_offset)
    }

    /// Columns per bind row.
    pub fn bind_col_count(&self) -> usize {
        self.bind_rows.first().map(Vec::len).unwrap_or(0)
    }

    /// Cell from the unconsumed bind window; `row` 0 is the first
    /// unconsumed row.
    pub fn bind_cell(&self, row: usize, col: usize) -> Result<&Value, SqlError> {
        self.bind_rows
            .get(self.bind_offset + row)
            .and_then(|r| r.get(col))
            .ok_or_else(|| {
                SqlError::new(
                    ErrorKind::InvalidUse,
                    format!("bind cell ({row}, {col}) out of range"),
                )
            })
    }

    /// Effective type of a bind column: the first non-null cell in the
    /// window decides, since null cells carry only a declared type.
    pub fn bind_col_type(&self, col: usize) -> DataType {
        for row in &self.bind_rows[self.bind_offset.min(self.bind_rows.len())..] {
            if let Some(value) = row.get(col) {
                if !value.is_null() {
                    return value.data_type();
                }
            }
        }
        self.bind_rows
            .get(self.bind_offset)
            .and_then(|row| row.get(col))
            .map(Value::data_type)
            .unwrap_or(DataType::Text)
    }

    /// Largest cell size in the window for this column, for bind buffer
    /// sizing.
    pub fn bind_col_max_size(&self, col: usize) -> usize {
        self.bind_rows[self.bind_offset.min(self.bind_rows.len())..]
            .iter()
            .filter_map(|row| row.get(col))
            .map(Value::size)
            .max()
            .unwrap_or(0)
    }

    /// The user's requested fetch chunk size; 0 means the user wants all
    /// rows and the driver may pick its own prefetch size.
    pub fn requested_fetch_rows(&self) -> usize {
        self.max_fetch_rows
    }

    /// Declare the result column set. Resets any previous metadata.
    pub fn result_set_cols(&mut self, cols: Vec<ResultCol>) {
        self.result.set_cols(cols);
    }

    /// Append one fetched row; cell count must match the declared columns.
    pub fn result_add_row(&mut self, row: Vec<Value>) -> Result<(), SqlError> {
        self.result.push_row(row)
    }

    /// Accumulate the affected-row count reported by one execution.
    pub fn result_add_affected_rows(&mut self, count: usize) {
        self.affected_rows += count;
    }

    // -- Core-internal execution plumbing --

    pub(crate) fn begin_execution(&mut self) -> Result<(), SqlError> {
        if self.query.is_none() {
            return Err(self.record(SqlError::new(
                ErrorKind::QueryNotPrepared,
                "statement has not been prepared",
            )));
        }
        // A trailing new_row with nothing bound is not a row.
        self.bind_rows.retain(|row| !row.is_empty());
        // Uniform row shape: every row matches row 0's width.
        let width = self.bind_col_count();
        for (idx, row) in self.bind_rows.iter().enumerate() {
            if !row.is_empty() && row.len() != width {
                return Err(self.record(SqlError::new(
                    ErrorKind::QueryWrongNumParams,
                    format!("row {idx} has {} columns, row 0 has {width}", row.len()),
                )));
            }
        }
        if self.placeholders != width {
            return Err(self.record(SqlError::new(
                ErrorKind::QueryWrongNumParams,
                format!(
                    "query has {} placeholders per row, {} columns bound",
                    self.placeholders, width
                ),
            )));
        }

        self.executed = true;
        self.bind_offset = 0;
        self.affected_rows = 0;
        self.result.reset();
        self.remaining_rows = false;
        self.last_kind = ErrorKind::Success;
        self.last_message.clear();
        Ok(())
    }

    pub(crate) fn set_driver_query(&mut self, rewritten: String) {
        self.rewritten = Some(rewritten);
    }

    /// Drop the most recent bind row entirely (partial-append cleanup).
    pub(crate) fn discard_last_row(&mut self) {
        self.bind_rows.pop();
    }

    pub(crate) fn consume_executed(&mut self, rows: usize) {
        self.bind_offset = (self.bind_offset + rows).min(self.bind_rows.len());
    }

    pub(crate) fn set_remaining_rows(&mut self, remaining: bool) {
        self.remaining_rows = remaining;
    }

    pub(crate) fn result_clear_chunk(&mut self) {
        self.result.clear_chunk();
    }
}
