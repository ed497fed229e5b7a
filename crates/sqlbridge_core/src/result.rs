use crate::error::{ErrorKind, SqlError};
use crate::value::{DataType, Value};

/// Result column descriptor: name, declared type, and declared maximum
/// length (0 = bounded only by the backend).
#[derive(Debug, Clone)]
pub struct ResultCol {
    pub name: String,
    pub dtype: DataType,
    pub max_size: usize,
}

/// Row-structured, column-typed value store for fetched result rows.
///
/// Holds the current fetch chunk; `total_rows` accumulates across chunks.
/// Checked accessors return `InvalidType` on a type mismatch and
/// `InvalidUse` on out-of-range indexes; the `_direct` variants return a
/// zero/empty sentinel instead, for fast-path code that has already
/// validated the schema.
#[derive(Debug, Default)]
pub struct ResultBuffer {
    cols: Vec<ResultCol>,
    rows: Vec<Vec<Value>>,
    total_rows: usize,
}

impl ResultBuffer {
    pub(crate) fn reset(&mut self) {
        self.cols.clear();
        self.rows.clear();
        self.total_rows = 0;
    }

    /// Drop the current chunk, keeping column metadata and the cumulative
    /// row count. Called at the start of each fetch.
    pub(crate) fn clear_chunk(&mut self) {
        self.rows.clear();
    }

    pub(crate) fn set_cols(&mut self, cols: Vec<ResultCol>) {
        self.cols = cols;
    }

    pub(crate) fn push_row(&mut self, row: Vec<Value>) -> Result<(), SqlError> {
        if row.len() != self.cols.len() {
            return Err(SqlError::new(
                ErrorKind::InvalidUse,
                format!(
                    "result row has {} cells, {} columns declared",
                    row.len(),
                    self.cols.len()
                ),
            ));
        }
        self.rows.push(row);
        self.total_rows += 1;
        Ok(())
    }

    /// Number of rows in the current chunk.
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Cumulative number of rows fetched across all chunks.
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    pub fn col_name(&self, col: usize) -> Option<&str> {
        self.cols.get(col).map(|c| c.name.as_str())
    }

    /// Declared column type and maximum size.
    pub fn col_type(&self, col: usize) -> Option<(DataType, usize)> {
        self.cols.get(col).map(|c| (c.dtype, c.max_size))
    }

    /// Column index by case-insensitive name.
    pub fn col_idx(&self, name: &str) -> Option<usize> {
        self.cols
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn cell(&self, row: usize, col: usize) -> Result<&Value, SqlError> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .ok_or_else(|| {
                SqlError::new(
                    ErrorKind::InvalidUse,
                    format!("result cell ({row}, {col}) out of range"),
                )
            })
    }

    fn cell_byname(&self, row: usize, col: &str) -> Result<&Value, SqlError> {
        let idx = self.col_idx(col).ok_or_else(|| {
            SqlError::new(ErrorKind::InvalidUse, format!("no result column '{col}'"))
        })?;
        self.cell(row, idx)
    }

    // -- Checked accessors (by index) --

    pub fn is_null(&self, row: usize, col: usize) -> Result<bool, SqlError> {
        Ok(self.cell(row, col)?.is_null())
    }

    /// Textual form of the cell; every type converts. `None` for NULL.
    pub fn text(&self, row: usize, col: usize) -> Result<Option<String>, SqlError> {
        Ok(self.cell(row, col)?.to_text())
    }

    pub fn boolean(&self, row: usize, col: usize) -> Result<Option<bool>, SqlError> {
        Ok(self.cell(row, col)?.as_bool())
    }

    pub fn int16(&self, row: usize, col: usize) -> Result<Option<i16>, SqlError> {
        match self.cell(row, col)?.as_int64() {
            None => Ok(None),
            Some(val) => i16::try_from(val).map(Some).map_err(|_| {
                SqlError::new(
                    ErrorKind::InvalidType,
                    format!("value {val} out of range for int16"),
                )
            }),
        }
    }

    pub fn int32(&self, row: usize, col: usize) -> Result<Option<i32>, SqlError> {
        match self.cell(row, col)?.as_int64() {
            None => Ok(None),
            Some(val) => i32::try_from(val).map(Some).map_err(|_| {
                SqlError::new(
                    ErrorKind::InvalidType,
                    format!("value {val} out of range for int32"),
                )
            }),
        }
    }

    pub fn int64(&self, row: usize, col: usize) -> Result<Option<i64>, SqlError> {
        Ok(self.cell(row, col)?.as_int64())
    }

    /// Binary cell contents. Only `Binary`-typed cells qualify; `None` for
    /// NULL.
    pub fn binary(&self, row: usize, col: usize) -> Result<Option<&[u8]>, SqlError> {
        match self.cell(row, col)? {
            Value::Null(_) => Ok(None),
            Value::Binary(bin) => Ok(Some(bin.as_slice())),
            other => Err(SqlError::new(
                ErrorKind::InvalidType,
                format!("column is {}, not binary", other.data_type().as_str()),
            )),
        }
    }

    // -- Checked accessors (by name, case-insensitive) --

    pub fn is_null_byname(&self, row: usize, col: &str) -> Result<bool, SqlError> {
        Ok(self.cell_byname(row, col)?.is_null())
    }

    pub fn text_byname(&self, row: usize, col: &str) -> Result<Option<String>, SqlError> {
        Ok(self.cell_byname(row, col)?.to_text())
    }

    pub fn boolean_byname(&self, row: usize, col: &str) -> Result<Option<bool>, SqlError> {
        Ok(self.cell_byname(row, col)?.as_bool())
    }

    pub fn int16_byname(&self, row: usize, col: &str) -> Result<Option<i16>, SqlError> {
        let idx = self.col_idx(col).ok_or_else(|| {
            SqlError::new(ErrorKind::InvalidUse, format!("no result column '{col}'"))
        })?;
        self.int16(row, idx)
    }

    pub fn int32_byname(&self, row: usize, col: &str) -> Result<Option<i32>, SqlError> {
        let idx = self.col_idx(col).ok_or_else(|| {
            SqlError::new(ErrorKind::InvalidUse, format!("no result column '{col}'"))
        })?;
        self.int32(row, idx)
    }

    pub fn int64_byname(&self, row: usize, col: &str) -> Result<Option<i64>, SqlError> {
        Ok(self.cell_byname(row, col)?.as_int64())
    }

    pub fn binary_byname(&self, row: usize, col: &str) -> Result<Option<&[u8]>, SqlError> {
        let idx = self.col_idx(col).ok_or_else(|| {
            SqlError::new(ErrorKind::InvalidUse, format!("no result column '{col}'"))
        })?;
        self.binary(row, idx)
    }

    // -- Direct accessors: sentinel values instead of errors --

    pub fn is_null_direct(&self, row: usize, col: usize) -> bool {
        self.is_null(row, col).unwrap_or(true)
    }

    pub fn text_direct(&self, row: usize, col: usize) -> String {
        self.text(row, col).ok().flatten().unwrap_or_default()
    }

    pub fn boolean_direct(&self, row: usize, col: usize) -> bool {
        self.boolean(row, col).ok().flatten().unwrap_or(false)
    }

    pub fn int16_direct(&self, row: usize, col: usize) -> i16 {
        self.int16(row, col).ok().flatten().unwrap_or(0)
    }

    pub fn int32_direct(&self, row: usize, col: usize) -> i32 {
        self.int32(row, col).ok().flatten().unwrap_or(0)
    }

    pub fn int64_direct(&self, row: usize, col: usize) -> i64 {
        self.int64(row, col).ok().flatten().unwrap_or(0)
    }

    pub fn binary_direct(&self, row: usize, col: usize) -> &[u8] {
        self.binary(row, col).ok().flatten().unwrap_or(&[])
    }

    pub fn text_byname_direct(&self, row: usize, col: &str) -> String {
        self.text_byname(row, col).ok().flatten().unwrap_or_default()
    }

    pub fn int64_byname_direct(&self, row: usize, col: &str) -> i64 {
        self.int64_byname(row, col).ok().flatten().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultBuffer {
        let mut buf = ResultBuffer::default();
        buf.set_cols(vec![
            ResultCol {
                name: "id".into(),
                dtype: DataType::Int64,
                max_size: 0,
            },
            ResultCol {
                name: "Name".into(),
                dtype: DataType::Text,
                max_size: 32,
            },
            ResultCol {
                name: "payload".into(),
                dtype: DataType::Binary,
                max_size: 0,
            },
        ]);
        buf.push_row(vec![
            Value::Int64(42),
            Value::Text("hello".into()),
            Value::Binary(vec![1, 2, 3]),
        ])
        .unwrap();
        buf.push_row(vec![
            Value::Int64(7),
            Value::Null(DataType::Text),
            Value::Null(DataType::Binary),
        ])
        .unwrap();
        buf
    }

    #[test]
    fn metadata_accessors() {
        let buf = sample();
        assert_eq!(buf.num_cols(), 3);
        assert_eq!(buf.num_rows(), 2);
        assert_eq!(buf.total_rows(), 2);
        assert_eq!(buf.col_name(1), Some("Name"));
        assert_eq!(buf.col_type(1), Some((DataType::Text, 32)));
        assert_eq!(buf.col_idx("NAME"), Some(1));
        assert_eq!(buf.col_idx("missing"), None);
    }

    #[test]
    fn typed_cell_access() {
        let buf = sample();
        assert_eq!(buf.int64(0, 0).unwrap(), Some(42));
        assert_eq!(buf.int32(0, 0).unwrap(), Some(42));
        assert_eq!(buf.text(0, 1).unwrap().as_deref(), Some("hello"));
        assert_eq!(buf.binary(0, 2).unwrap(), Some(&[1u8, 2, 3][..]));
        assert!(buf.is_null(1, 1).unwrap());
        assert_eq!(buf.text(1, 1).unwrap(), None);
        assert_eq!(buf.int64_byname(0, "ID").unwrap(), Some(42));
    }

    #[test]
    fn type_mismatch_is_an_error_checked_and_sentinel_direct() {
        let buf = sample();
        assert_eq!(
            buf.binary(0, 1).unwrap_err().kind(),
            ErrorKind::InvalidType
        );
        assert_eq!(buf.binary_direct(0, 1), &[] as &[u8]);
        assert_eq!(buf.int64_direct(5, 0), 0);
        assert!(buf.is_null_direct(5, 0));
    }

    #[test]
    fn numeric_conversions_from_text_cells() {
        let mut buf = ResultBuffer::default();
        buf.set_cols(vec![ResultCol {
            name: "n".into(),
            dtype: DataType::Text,
            max_size: 0,
        }]);
        buf.push_row(vec![Value::Text("123".into())]).unwrap();
        assert_eq!(buf.int32(0, 0).unwrap(), Some(123));
        assert_eq!(buf.int16(0, 0).unwrap(), Some(123));
        assert_eq!(buf.boolean(0, 0).unwrap(), Some(true));

        buf.push_row(vec![Value::Text("70000".into())]).unwrap();
        assert_eq!(
            buf.int16(1, 0).unwrap_err().kind(),
            ErrorKind::InvalidType
        );
    }

    #[test]
    fn chunk_clear_preserves_totals() {
        let mut buf = sample();
        buf.clear_chunk();
        assert_eq!(buf.num_rows(), 0);
        assert_eq!(buf.total_rows(), 2);
        buf.push_row(vec![
            Value::Int64(1),
            Value::Text("x".into()),
            Value::Null(DataType::Binary),
        ])
        .unwrap();
        assert_eq!(buf.num_rows(), 1);
        assert_eq!(buf.total_rows(), 3);
    }
}
