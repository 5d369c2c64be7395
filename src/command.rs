//! Parameterized text commands
//!
//! Every parameter declares its SQL type and maximum size explicitly. Values
//! are checked against the declaration when bound, before any I/O happens.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Declared type of a bound parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    /// Unicode string, size in characters
    NVarChar(usize),
    /// Binary payload, size in bytes
    VarBinary(usize),
    /// UTC timestamp with nanosecond precision
    DateTime2,
}

impl SqlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::NVarChar(_) => "nvarchar",
            SqlType::VarBinary(_) => "varbinary",
            SqlType::DateTime2 => "datetime2",
        }
    }

    /// Declared maximum size, when the type has one
    pub fn size(&self) -> Option<usize> {
        match self {
            SqlType::NVarChar(n) | SqlType::VarBinary(n) => Some(*n),
            SqlType::DateTime2 => None,
        }
    }
}

/// A single column or parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Integer(i64),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::DateTime(_) => "datetime",
            Value::Integer(_) => "integer",
        }
    }
}

/// Fixed-width UTC text form: lexical order equals chronological order.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_datetime(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::invalid(format!("malformed timestamp {text:?}: {e}")))
}

/// A named, typed, sized parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub sql_type: SqlType,
    pub value: Value,
}

impl Param {
    /// Build a parameter, rejecting values that do not fit the declaration
    pub fn new(name: impl Into<String>, sql_type: SqlType, value: Value) -> Result<Self> {
        let name = name.into();
        if !name.starts_with('@') || name.len() < 2 {
            return Err(Error::invalid(format!("parameter name must start with '@': {name:?}")));
        }

        match (&sql_type, &value) {
            (_, Value::Null) => {}
            (SqlType::NVarChar(size), Value::Text(s)) => {
                let len = s.chars().count();
                if len > *size {
                    return Err(Error::invalid(format!(
                        "{name} is {len} characters, declared size is {size}"
                    )));
                }
            }
            (SqlType::VarBinary(size), Value::Bytes(b)) => {
                if b.len() > *size {
                    return Err(Error::invalid(format!(
                        "{name} is {} bytes, declared size is {size}",
                        b.len()
                    )));
                }
            }
            (SqlType::DateTime2, Value::DateTime(_)) => {}
            (ty, v) => {
                return Err(Error::invalid(format!(
                    "{name} declared as {} but bound to a {} value",
                    ty.as_str(),
                    v.kind()
                )));
            }
        }

        Ok(Self { name, sql_type, value })
    }
}

/// A text command plus its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    sql: String,
    params: Vec<Param>,
}

impl Command {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Bind a parameter; a name bound twice keeps the latest value
    pub fn bind(mut self, param: Param) -> Self {
        self.params.retain(|p| p.name != param.name);
        self.params.push(param);
        self
    }

    pub fn bind_text(self, name: &str, value: &str, size: usize) -> Result<Self> {
        let param = Param::new(name, SqlType::NVarChar(size), Value::Text(value.to_string()))?;
        Ok(self.bind(param))
    }

    pub fn bind_bytes(self, name: &str, value: &[u8], size: usize) -> Result<Self> {
        let param = Param::new(name, SqlType::VarBinary(size), Value::Bytes(value.to_vec()))?;
        Ok(self.bind(param))
    }

    pub fn bind_datetime(self, name: &str, value: DateTime<Utc>) -> Result<Self> {
        let param = Param::new(name, SqlType::DateTime2, Value::DateTime(value))?;
        Ok(self.bind(param))
    }
}

/// One materialized result row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn get(&self, idx: usize) -> Result<&Value> {
        self.values
            .get(idx)
            .ok_or_else(|| Error::invalid(format!("column {idx} out of range ({} columns)", self.values.len())))
    }

    pub fn text(&self, idx: usize) -> Result<String> {
        match self.get(idx)? {
            Value::Text(s) => Ok(s.clone()),
            other => Err(Error::invalid(format!("column {idx} is {}, expected text", other.kind()))),
        }
    }

    /// Binary column; NULL reads as an empty payload
    pub fn bytes(&self, idx: usize) -> Result<Vec<u8>> {
        match self.get(idx)? {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::invalid(format!("column {idx} is {}, expected bytes", other.kind()))),
        }
    }

    pub fn datetime(&self, idx: usize) -> Result<DateTime<Utc>> {
        match self.get(idx)? {
            Value::DateTime(dt) => Ok(*dt),
            Value::Text(s) => parse_datetime(s),
            other => Err(Error::invalid(format!("column {idx} is {}, expected datetime", other.kind()))),
        }
    }

    pub fn integer(&self, idx: usize) -> Result<i64> {
        match self.get(idx)? {
            Value::Integer(n) => Ok(*n),
            other => Err(Error::invalid(format!("column {idx} is {}, expected integer", other.kind()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_string_size_counts_characters() {
        assert!(Command::new("x").bind_text("@Id", "ééé", 3).is_ok());
        let err = Command::new("x").bind_text("@Id", "abcd", 3).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_binary_size_enforced() {
        assert!(Command::new("x").bind_bytes("@Data", &[0u8; 8000], 8000).is_ok());
        assert!(Command::new("x").bind_bytes("@Data", &[0u8; 8001], 8000).is_err());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = Param::new("@Id", SqlType::NVarChar(10), Value::Bytes(vec![1])).unwrap_err();
        assert!(err.to_string().contains("nvarchar"));
        assert!(Param::new("Id", SqlType::NVarChar(10), Value::Text("a".into())).is_err());
        assert!(Param::new("@Data", SqlType::VarBinary(10), Value::Null).is_ok());
    }

    #[test]
    fn test_rebinding_replaces_value() {
        let cmd = Command::new("SELECT 1")
            .bind_text("@Id", "a", 8)
            .unwrap()
            .bind_text("@Id", "b", 8)
            .unwrap();
        assert_eq!(cmd.params().len(), 1);
        assert_eq!(cmd.params()[0].value, Value::Text("b".into()));
    }

    #[test]
    fn test_datetime_text_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::nanoseconds(1);
        let (a, b) = (format_datetime(&early), format_datetime(&late));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b).unwrap(), late);
    }

    #[test]
    fn test_row_getters() {
        let now = Utc::now();
        let row = Row::new(vec![
            Value::Text("id".into()),
            Value::Null,
            Value::Text(format_datetime(&now)),
        ]);
        assert_eq!(row.text(0).unwrap(), "id");
        assert!(row.bytes(1).unwrap().is_empty());
        assert_eq!(row.datetime(2).unwrap(), now);
        assert!(row.text(5).is_err());
        assert!(row.integer(0).is_err());
    }
}
