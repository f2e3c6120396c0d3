use std::fmt;

use thiserror::Error;

use crate::dialect::Dialect;

/// Normalized error category, independent of the backend that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller input rejected before any SQL was issued.
    Validation,
    /// Primary-key uniqueness violation.
    DuplicateKey,
    /// Malformed filter condition or unknown filter field.
    Syntax,
    /// Operation targeted a collection that does not exist.
    NotFound,
    /// Backend unreachable or transport failure.
    Connection,
    /// `initialize()` has not completed yet.
    NotReady,
    /// The adapter was closed.
    Closed,
    /// Unrecognized dialect identifier.
    UnknownDialect,
    /// A stored value could not be decoded.
    Codec,
    /// Any other server-side failure.
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::DuplicateKey => write!(f, "Duplicate Key Error"),
            ErrorKind::Syntax => write!(f, "Syntax Error"),
            ErrorKind::NotFound => write!(f, "Not Found Error"),
            ErrorKind::Connection => write!(f, "Connection Error"),
            ErrorKind::NotReady => write!(f, "Not Ready Error"),
            ErrorKind::Closed => write!(f, "Closed Error"),
            ErrorKind::UnknownDialect => write!(f, "Unknown Dialect Error"),
            ErrorKind::Codec => write!(f, "Codec Error"),
            ErrorKind::Backend => write!(f, "Error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("duplicate key {key:?} in collection {collection:?}")]
    DuplicateKey { collection: String, key: String },

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("adapter is not initialized")]
    NotReady,

    #[error("adapter is closed")]
    Closed,

    #[error("unknown dialect: {0:?}")]
    UnknownDialect(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("{dialect} error{}: {message}", .code.as_deref().map(|c| format!(" {}", c)).unwrap_or_default())]
    Backend {
        dialect: Dialect,
        code: Option<String>,
        message: String,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            StoreError::Syntax(_) => ErrorKind::Syntax,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Connection(_) => ErrorKind::Connection,
            StoreError::NotReady => ErrorKind::NotReady,
            StoreError::Closed => ErrorKind::Closed,
            StoreError::UnknownDialect(_) => ErrorKind::UnknownDialect,
            StoreError::Codec(_) => ErrorKind::Codec,
            StoreError::Backend { .. } => ErrorKind::Backend,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Raw failure reported by a connection binding, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    /// Native error code: SQLSTATE for PostgreSQL, the numeric server
    /// error number for MySQL and SQL Server.
    pub code: Option<String>,
    pub message: String,
    /// Set when the failure happened below the SQL layer (socket, TLS, protocol).
    pub transport: bool,
}

impl DriverError {
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            transport: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            transport: true,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            transport: false,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DriverError {}
