use std::collections::HashMap;

use crate::error::{ErrorKind, SqlError};

/// Parsed connection string: case-insensitive `key=value` pairs separated by
/// semicolons. Values may be single-quoted, with `''` as the escaped quote:
///
/// ```text
/// host=10.1.2.3:5432,10.1.2.4;db=mydb;ssl=true
/// dsn='(DESCRIPTION = (ADDRESS = ...))'
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConnStr {
    values: HashMap<String, String>,
}

impl ConnStr {
    pub fn parse(input: &str) -> Result<Self, SqlError> {
        let mut values = HashMap::new();
        let mut chars = input.chars().peekable();

        loop {
            // Key runs to '='; surrounding whitespace is insignificant.
            let mut key = String::new();
            for ch in chars.by_ref() {
                if ch == '=' {
                    break;
                }
                key.push(ch);
            }
            let key = key.trim().to_ascii_lowercase();
            if key.is_empty() {
                if chars.peek().is_none() {
                    break;
                }
                return Err(SqlError::new(
                    ErrorKind::ConnParams,
                    "empty key in connection string",
                ));
            }

            // Skip whitespace before the value.
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }

            let mut value = String::new();
            if chars.peek() == Some(&'\'') {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                value.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => value.push(ch),
                        None => {
                            return Err(SqlError::new(
                                ErrorKind::ConnParams,
                                format!("unterminated quote in value for '{key}'"),
                            ));
                        }
                    }
                }
                // Only a separator (or end) may follow a closing quote.
                while chars.peek().is_some_and(|c| c.is_whitespace()) {
                    chars.next();
                }
                match chars.next() {
                    None | Some(';') => {}
                    Some(ch) => {
                        return Err(SqlError::new(
                            ErrorKind::ConnParams,
                            format!("unexpected '{ch}' after quoted value for '{key}'"),
                        ));
                    }
                }
            } else {
                for ch in chars.by_ref() {
                    if ch == ';' {
                        break;
                    }
                    value.push(ch);
                }
                value = value.trim().to_string();
            }

            values.insert(key, value);
            if chars.peek().is_none() {
                break;
            }
        }

        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// Boolean option with a default. Accepts true/false, yes/no, on/off, 1/0.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(raw) => matches!(
                raw.to_ascii_lowercase().as_str(),
                "true" | "yes" | "on" | "1"
            ),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }
}

/// Allowed value shape for a connection string parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStrType {
    Bool,
    Num,
    Alpha,
    AlphaNum,
    Any,
}

/// Declared schema entry for one connection string parameter. Drivers
/// validate their parsed dictionary against a static slice of these so
/// typos surface as `ConnParams` errors instead of silent defaults.
#[derive(Debug, Clone, Copy)]
pub struct ConnStrParam {
    pub name: &'static str,
    pub ctype: ConnStrType,
    pub required: bool,
    pub min_len: usize,
    pub max_len: usize,
}

impl ConnStrParam {
    pub const fn new(
        name: &'static str,
        ctype: ConnStrType,
        required: bool,
        min_len: usize,
        max_len: usize,
    ) -> Self {
        Self {
            name,
            ctype,
            required,
            min_len,
            max_len,
        }
    }
}

/// Validate a parsed connection string against a declared parameter schema.
pub fn validate_conn_str(conn_str: &ConnStr, params: &[ConnStrParam]) -> Result<(), SqlError> {
    for key in conn_str.keys() {
        if !params.iter().any(|p| p.name.eq_ignore_ascii_case(key)) {
            return Err(SqlError::new(
                ErrorKind::ConnParams,
                format!("unknown connection string parameter '{key}'"),
            ));
        }
    }

    for param in params {
        let value = match conn_str.get(param.name) {
            Some(value) => value,
            None => {
                if param.required {
                    return Err(SqlError::new(
                        ErrorKind::ConnParams,
                        format!("missing required connection string parameter '{}'", param.name),
                    ));
                }
                continue;
            }
        };

        if value.len() < param.min_len || (param.max_len > 0 && value.len() > param.max_len) {
            return Err(SqlError::new(
                ErrorKind::ConnParams,
                format!(
                    "connection string parameter '{}' length out of range ({}-{})",
                    param.name, param.min_len, param.max_len
                ),
            ));
        }

        let ok = match param.ctype {
            ConnStrType::Bool => matches!(
                value.to_ascii_lowercase().as_str(),
                "true" | "false" | "yes" | "no" | "on" | "off" | "0" | "1"
            ),
            ConnStrType::Num => !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()),
            ConnStrType::Alpha => value.chars().all(|c| c.is_ascii_alphabetic() || c == ' '),
            ConnStrType::AlphaNum => value.chars().all(|c| c.is_ascii_alphanumeric()),
            ConnStrType::Any => true,
        };
        if !ok {
            return Err(SqlError::new(
                ErrorKind::ConnParams,
                format!("connection string parameter '{}' has invalid value", param.name),
            ));
        }
    }

    Ok(())
}

/// One host of a multi-host specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

/// Parse a comma-separated `host[:port]` list, filling in the driver's
/// default port. The order is significant: it is the failover preference.
pub fn parse_host_ports(input: &str, default_port: u16) -> Result<Vec<HostPort>, SqlError> {
    let mut out = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (host, port) = match part.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    SqlError::new(ErrorKind::ConnParams, format!("invalid port in '{part}'"))
                })?;
                (host, port)
            }
            None => (part, default_port),
        };
        if host.is_empty() {
            return Err(SqlError::new(
                ErrorKind::ConnParams,
                format!("empty host in '{input}'"),
            ));
        }
        out.push(HostPort {
            host: host.to_string(),
            port,
        });
    }

    if out.is_empty() {
        return Err(SqlError::new(ErrorKind::ConnParams, "no hosts specified"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let cs = ConnStr::parse("host=10.1.2.3:5432,10.1.2.4;db=mydb;ssl=true").unwrap();
        assert_eq!(cs.get("host"), Some("10.1.2.3:5432,10.1.2.4"));
        assert_eq!(cs.get("DB"), Some("mydb"));
        assert!(cs.get_bool("ssl", false));
        assert!(cs.get_bool("missing", true));
    }

    #[test]
    fn parses_quoted_values_with_escapes() {
        let cs = ConnStr::parse("dsn='it''s (a = b;c)';db=x").unwrap();
        assert_eq!(cs.get("dsn"), Some("it's (a = b;c)"));
        assert_eq!(cs.get("db"), Some("x"));
    }

    #[test]
    fn rejects_unterminated_quote() {
        let err = ConnStr::parse("dsn='oops").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnParams);
    }

    #[test]
    fn validation_flags_unknown_and_missing_params() {
        const PARAMS: &[ConnStrParam] = &[
            ConnStrParam::new("db", ConnStrType::Any, true, 1, 64),
            ConnStrParam::new("ssl", ConnStrType::Bool, false, 1, 5),
        ];

        let cs = ConnStr::parse("db=mydb;ssl=yes").unwrap();
        assert!(validate_conn_str(&cs, PARAMS).is_ok());

        let cs = ConnStr::parse("db=mydb;sssl=yes").unwrap();
        assert_eq!(
            validate_conn_str(&cs, PARAMS).unwrap_err().kind(),
            ErrorKind::ConnParams
        );

        let cs = ConnStr::parse("ssl=yes").unwrap();
        assert_eq!(
            validate_conn_str(&cs, PARAMS).unwrap_err().kind(),
            ErrorKind::ConnParams
        );

        let cs = ConnStr::parse("db=mydb;ssl=sometimes").unwrap();
        assert_eq!(
            validate_conn_str(&cs, PARAMS).unwrap_err().kind(),
            ErrorKind::ConnParams
        );
    }

    #[test]
    fn host_list_fills_default_port_and_keeps_order() {
        let hosts = parse_host_ports("10.40.30.2,10.50.30.2:13306", 3306).unwrap();
        assert_eq!(
            hosts,
            vec![
                HostPort {
                    host: "10.40.30.2".into(),
                    port: 3306
                },
                HostPort {
                    host: "10.50.30.2".into(),
                    port: 13306
                },
            ]
        );
        assert!(parse_host_ports("", 3306).is_err());
        assert!(parse_host_ports("host:badport", 3306).is_err());
    }
}
