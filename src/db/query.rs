use async_trait::async_trait;

use crate::dialect::Dialect;
use crate::error::DriverError;

/// A single SQL statement with positional parameters.
///
/// Placeholders inside `sql` already follow the target dialect
/// (`$1`, `?` or `@P1`); `params[i]` binds to the i-th placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Parameter value bound into a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    /// Structured payload. Bound natively where the driver supports a JSON
    /// type, otherwise as its compact text encoding.
    Json(serde_json::Value),
}

impl SqlParam {
    pub fn text(value: impl Into<String>) -> Self {
        SqlParam::Text(value.into())
    }

    /// Text form used by drivers without a native JSON binding.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlParam::Null => None,
            SqlParam::Int(i) => Some(i.to_string()),
            SqlParam::Float(f) => Some(f.to_string()),
            SqlParam::Text(s) => Some(s.clone()),
            SqlParam::Json(v) => Some(v.to_string()),
        }
    }
}

/// A column value read back from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view. Text and byte values are parsed, since MySQL's text
    /// protocol returns every column as bytes.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            SqlValue::Json(v) => v.as_i64(),
            SqlValue::Null | SqlValue::Float(_) => None,
        }
    }

    /// Text view; bytes are decoded lossily.
    pub fn into_text(self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Text(s) => Some(s),
            SqlValue::Bytes(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            SqlValue::Json(v) => Some(v.to_string()),
        }
    }
}

/// One result row: column names paired with their values, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: SqlValue) {
        self.columns.push((name.into(), value));
    }

    pub fn with(mut self, name: impl Into<String>, value: SqlValue) -> Self {
        self.push(name, value);
        self
    }

    /// Column lookup by name. Matching is case-insensitive because some
    /// catalogs (MySQL's information_schema) report upper-case names.
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(col, _)| col.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn take(&mut self, name: &str) -> Option<SqlValue> {
        let idx = self
            .columns
            .iter()
            .position(|(col, _)| col.eq_ignore_ascii_case(name))?;
        Some(std::mem::replace(&mut self.columns[idx].1, SqlValue::Null))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// An open backend connection, exclusively owned by one adapter.
///
/// Implementations translate driver errors into [`DriverError`] and rows into
/// [`SqlRow`]; they never interpret error codes themselves.
#[async_trait]
pub trait Connection: Send {
    fn dialect(&self) -> Dialect;

    /// Run a statement that returns no rows; yields the affected row count.
    async fn execute(&mut self, stmt: &Statement) -> Result<u64, DriverError>;

    /// Run a statement and collect every row it returns.
    async fn query(&mut self, stmt: &Statement) -> Result<Vec<SqlRow>, DriverError>;

    /// Cheap liveness probe.
    async fn ping(&mut self) -> Result<(), DriverError> {
        self.query(&Statement::new("SELECT 1")).await.map(|_| ())
    }
}
