/// Column data type.
///
/// Every value crossing the application/database boundary carries one of
/// these. Text and binary columns additionally declare a maximum length,
/// where 0 means "unbounded up to the backend limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int16,
    Int32,
    Int64,
    Text,
    Binary,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Text => "text",
            DataType::Binary => "binary",
        }
    }
}

/// A bound parameter or result cell.
///
/// Nulls are typed: ODBC-style backends must know the column type of a null
/// bind, so a bare "null" does not exist. The bind API offers a typed null
/// per data type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null(DataType),
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null(dtype) => *dtype,
            Value::Bool(_) => DataType::Bool,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Text(_) => DataType::Text,
            Value::Binary(_) => DataType::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }

    /// Whether two bind rows agree on this column. Nulls are compatible with
    /// any type; everything else must match exactly.
    pub fn is_type_compatible(&self, other: &Value) -> bool {
        if self.is_null() || other.is_null() {
            return true;
        }
        self.data_type() == other.data_type()
    }

    /// Wire size of the cell in bytes, used by drivers to size bind buffers
    /// for multi-row execution.
    pub fn size(&self) -> usize {
        match self {
            Value::Null(_) => 0,
            Value::Bool(_) => 1,
            Value::Int16(_) => 2,
            Value::Int32(_) => 4,
            Value::Int64(_) => 8,
            Value::Text(text) => text.len(),
            Value::Binary(bin) => bin.len(),
        }
    }

    /// Render the cell as text. Every type has a textual form; integers and
    /// booleans print in decimal, binary prints as lowercase hex.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null(_) => None,
            Value::Bool(val) => Some(if *val { "1" } else { "0" }.to_string()),
            Value::Int16(val) => Some(val.to_string()),
            Value::Int32(val) => Some(val.to_string()),
            Value::Int64(val) => Some(val.to_string()),
            Value::Text(text) => Some(text.clone()),
            Value::Binary(bin) => {
                let mut out = String::with_capacity(bin.len() * 2);
                for byte in bin {
                    out.push_str(&format!("{byte:02x}"));
                }
                Some(out)
            }
        }
    }

    /// Interpret the cell as a 64-bit integer. Text cells parse leading
    /// decimal digits the way the original text-backed storage did; anything
    /// unparseable is 0.
    pub fn as_int64(&self) -> Option<i64> {
        match self {
            Value::Null(_) => None,
            Value::Bool(val) => Some(i64::from(*val)),
            Value::Int16(val) => Some(i64::from(*val)),
            Value::Int32(val) => Some(i64::from(*val)),
            Value::Int64(val) => Some(*val),
            Value::Text(text) => Some(parse_leading_i64(text)),
            Value::Binary(_) => Some(0),
        }
    }

    /// Interpret the cell as a boolean: numeric non-zero, or a string
    /// starting with 't'/'y' (true/yes), is truth.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Null(_) => None,
            Value::Bool(val) => Some(*val),
            Value::Text(text) => {
                let trimmed = text.trim();
                let first = trimmed.chars().next().map(|c| c.to_ascii_lowercase());
                Some(matches!(first, Some('t') | Some('y')) || parse_leading_i64(trimmed) != 0)
            }
            other => other.as_int64().map(|val| val != 0),
        }
    }
}

fn parse_leading_i64(text: &str) -> i64 {
    let trimmed = text.trim();
    let mut end = 0;
    for (idx, ch) in trimmed.char_indices() {
        if ch.is_ascii_digit() || (idx == 0 && (ch == '-' || ch == '+')) {
            end = idx + ch.len_utf8();
        } else {
            break;
        }
    }
    trimmed[..end].parse::<i64>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_compatible_with_any_type() {
        let null_text = Value::Null(DataType::Text);
        assert!(null_text.is_type_compatible(&Value::Int64(5)));
        assert!(Value::Int64(5).is_type_compatible(&null_text));
        assert!(!Value::Int64(5).is_type_compatible(&Value::Text("x".into())));
        assert!(Value::Int32(1).is_type_compatible(&Value::Int32(2)));
    }

    #[test]
    fn text_coerces_to_integer_and_bool() {
        assert_eq!(Value::Text("42".into()).as_int64(), Some(42));
        assert_eq!(Value::Text("-7 trailing".into()).as_int64(), Some(-7));
        assert_eq!(Value::Text("junk".into()).as_int64(), Some(0));
        assert_eq!(Value::Text("yes".into()).as_bool(), Some(true));
        assert_eq!(Value::Text("TRUE".into()).as_bool(), Some(true));
        assert_eq!(Value::Text("0".into()).as_bool(), Some(false));
        assert_eq!(Value::Null(DataType::Bool).as_bool(), None);
    }

    #[test]
    fn binary_renders_as_hex_text() {
        assert_eq!(
            Value::Binary(vec![0xde, 0xad, 0x01]).to_text().as_deref(),
            Some("dead01")
        );
    }
}
