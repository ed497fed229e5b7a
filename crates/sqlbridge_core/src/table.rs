use crate::error::{ErrorKind, SqlError};
use crate::pool::Pool;
use crate::stmt::Stmt;
use crate::value::DataType;

struct ColumnDef {
    name: String,
    dtype: DataType,
    max_len: usize,
    not_null: bool,
}

struct IndexDef {
    cols: Vec<String>,
}

/// Portable CREATE TABLE construction.
///
/// Column types are declared in the unified type system and rendered
/// through the driver's `datatype` emitter, the table picks up the
/// backend's create-table suffix, and index names are passed through the
/// backend identifier-length rewrite. Always executed against the primary
/// sub-pool.
pub struct TableBuilder {
    name: String,
    cols: Vec<ColumnDef>,
    primary_key: Vec<String>,
    indexes: Vec<IndexDef>,
}

impl TableBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cols: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column. `max_len` applies to text and binary columns; 0 means
    /// bounded only by the backend.
    pub fn add_col(mut self, name: &str, dtype: DataType, max_len: usize, not_null: bool) -> Self {
        self.cols.push(ColumnDef {
            name: name.to_string(),
            dtype,
            max_len,
            not_null,
        });
        self
    }

    pub fn primary_key(mut self, cols: &[&str]) -> Self {
        self.primary_key = cols.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Add a secondary index over the listed columns. The index is named
    /// `i_<table>_<col>...`, reshaped by the driver when that exceeds the
    /// backend identifier limit.
    pub fn add_index(mut self, cols: &[&str]) -> Self {
        self.indexes.push(IndexDef {
            cols: cols.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    fn create_table_sql(&self, pool: &Pool) -> Result<String, SqlError> {
        if self.cols.is_empty() {
            return Err(SqlError::new(
                ErrorKind::InvalidUse,
                "table has no columns",
            ));
        }

        let mut sql = String::with_capacity(128);
        sql.push_str("CREATE TABLE \"");
        sql.push_str(&self.name);
        sql.push_str("\" (");
        for (idx, col) in self.cols.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            sql.push('"');
            sql.push_str(&col.name);
            sql.push_str("\" ");
            pool.datatype(&mut sql, col.dtype, col.max_len, false);
            if col.not_null {
                sql.push_str(" NOT NULL");
            }
        }
        if !self.primary_key.is_empty() {
            sql.push_str(", PRIMARY KEY (");
            for (idx, col) in self.primary_key.iter().enumerate() {
                if idx > 0 {
                    sql.push_str(", ");
                }
                sql.push('"');
                sql.push_str(col);
                sql.push('"');
            }
            sql.push(')');
        }
        sql.push(')');
        pool.create_table_suffix(&mut sql);
        Ok(sql)
    }

    fn create_index_sql(&self, pool: &Pool, index: &IndexDef) -> String {
        let mut name = format!("i_{}", self.name);
        for col in &index.cols {
            name.push('_');
            name.push_str(col);
        }
        let name = pool.rewrite_index_name(&name).unwrap_or(name);

        let mut sql = String::with_capacity(96);
        sql.push_str("CREATE INDEX \"");
        sql.push_str(&name);
        sql.push_str("\" ON \"");
        sql.push_str(&self.name);
        sql.push_str("\" (");
        for (idx, col) in index.cols.iter().enumerate() {
            if idx > 0 {
                sql.push_str(", ");
            }
            sql.push('"');
            sql.push_str(col);
            sql.push('"');
        }
        sql.push(')');
        sql
    }

    /// Create the table and its indexes on the primary sub-pool.
    pub fn execute(self, pool: &Pool) -> Result<(), SqlError> {
        let table_sql = self.create_table_sql(pool)?;
        let mut stmt = Stmt::new();
        stmt.prepare_buf(table_sql)?;
        stmt.set_master_only()?;
        stmt.execute(pool)?;

        for index in &self.indexes {
            let mut stmt = Stmt::new();
            stmt.prepare_buf(self.create_index_sql(pool, index))?;
            stmt.set_master_only()?;
            stmt.execute(pool)?;
        }
        Ok(())
    }
}
