//! Logical data model shared by the adapter and the dialect strategies.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dialect::Dialect;
use crate::error::{Result, StoreError};

pub const ID_COLUMN: &str = "id";
pub const DATA_COLUMN: &str = "data";
pub const TIMESTAMP_COLUMN: &str = "__timestamp";

/// Prefix reserved for the adapter's own tables.
pub const INTERNAL_PREFIX: &str = "__sqldoc_";
pub const METADATA_TABLE: &str = "__sqldoc_collections";
pub const KV_TABLE: &str = "__sqldoc_kv";

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_KEY_LEN: usize = 255;

/// Check a collection (or queue) name.
///
/// Names are limited to ASCII letters, digits, `_` and `-` so they are valid
/// table names on every backend; a `.` would read as a schema separator.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::Validation(
            "collection name must not be empty".to_string(),
        ));
    }
    if name.contains('.') {
        return Err(StoreError::Validation(format!(
            "collection name {:?} must not contain '.'",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::Validation(format!(
            "collection name {:?} is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(StoreError::Validation(format!(
            "collection name {:?} contains invalid character {:?}",
            name, bad
        )));
    }
    if name.starts_with(INTERNAL_PREFIX) {
        return Err(StoreError::Validation(format!(
            "collection name {:?} uses the reserved prefix {}",
            name, INTERNAL_PREFIX
        )));
    }
    Ok(())
}

/// Check an indexed or filtered field name: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_field_name(field: &str) -> Result<()> {
    let mut chars = field.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || field.len() > MAX_NAME_LEN {
        return Err(StoreError::Validation(format!(
            "invalid field name {:?}",
            field
        )));
    }
    Ok(())
}

/// Check a field to build a secondary index on. `id` and `__timestamp`
/// always resolve to their own columns, so they cannot be indexed fields.
pub fn validate_index_field(field: &str) -> Result<()> {
    validate_field_name(field)?;
    if field == ID_COLUMN || field == TIMESTAMP_COLUMN {
        return Err(StoreError::Validation(format!(
            "{:?} is a reserved column and cannot be indexed",
            field
        )));
    }
    Ok(())
}

pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::Validation("key must not be empty".to_string()));
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(StoreError::Validation(format!(
            "key is longer than {} characters",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: Map<String, Value>,
    /// Creation time in microseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Tag stored next to every key-value entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvType {
    String,
    Object,
    Buffer,
}

impl KvType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvType::String => "string",
            KvType::Object => "object",
            KvType::Buffer => "buffer",
        }
    }
}

impl fmt::Display for KvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KvType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(KvType::String),
            "object" => Ok(KvType::Object),
            "buffer" => Ok(KvType::Buffer),
            other => Err(StoreError::Codec(format!("unknown key-value type {:?}", other))),
        }
    }
}

/// A value handed to `write_key`; its shape decides the stored tag.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    String(String),
    Buffer(Vec<u8>),
    Object(Value),
}

impl KvValue {
    pub fn kind(&self) -> KvType {
        match self {
            KvValue::String(_) => KvType::String,
            KvValue::Buffer(_) => KvType::Buffer,
            KvValue::Object(_) => KvType::Object,
        }
    }

    /// Text stored in the value column.
    ///
    /// Buffers are decoded lossily, so non-UTF-8 bytes do not survive;
    /// objects are stored (and later returned) as compact JSON text.
    pub fn into_stored(self) -> String {
        match self {
            KvValue::String(s) => s,
            KvValue::Buffer(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            KvValue::Object(value) => value.to_string(),
        }
    }
}

impl From<&str> for KvValue {
    fn from(value: &str) -> Self {
        KvValue::String(value.to_string())
    }
}

impl From<String> for KvValue {
    fn from(value: String) -> Self {
        KvValue::String(value)
    }
}

impl From<Vec<u8>> for KvValue {
    fn from(value: Vec<u8>) -> Self {
        KvValue::Buffer(value)
    }
}

impl From<&[u8]> for KvValue {
    fn from(value: &[u8]) -> Self {
        KvValue::Buffer(value.to_vec())
    }
}

impl From<Value> for KvValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => KvValue::String(s),
            other => KvValue::Object(other),
        }
    }
}

impl From<Map<String, Value>> for KvValue {
    fn from(value: Map<String, Value>) -> Self {
        KvValue::Object(Value::Object(value))
    }
}

/// Result of `read_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    #[serde(rename = "type")]
    pub kind: KvType,
    pub value: String,
}

/// Result of `save_database`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub dialect: Dialect,
    /// Whether a checkpoint statement was actually issued.
    pub checkpointed: bool,
}
