//! Error types shared across the crate.
//!
//! Every fallible operation returns [`Result`], whose error carries a
//! [`ErrorKind`] plus a human-readable message and (optionally) the
//! underlying cause. Lower layers wrap causes with context but never
//! change the kind; the RPC boundary maps kinds to JSON-RPC codes via
//! [`Error::rpc_code`].

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of failures, stable across layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller-supplied values do not meet a published contract.
    InvalidParams,
    /// A path failed safety validation.
    InvalidPath,
    /// Requested chunk / connector / resource does not exist.
    NotFound,
    /// `add` with a duplicate connector id.
    ConnectorExists,
    /// get/update/remove of an unknown connector id.
    ConnectorNotFound,
    /// Vector dimension differs from the store dimension.
    DimensionMismatch,
    /// Storage-engine failure.
    Storage,
    /// Context cancelled or deadline exceeded.
    Canceled,
    /// A singleton operation (e.g. an indexing pass) is already running.
    Busy,
    /// Unexpected failure with no more specific kind.
    Internal,
}

/// Error carrying a [`ErrorKind`], a message, and an optional cause.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause, preserving the kind.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidPath, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn connector_exists(id: &str) -> Self {
        Self::new(
            ErrorKind::ConnectorExists,
            format!("connector already exists: {id}"),
        )
    }

    pub fn connector_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::ConnectorNotFound,
            format!("connector not found: {id}"),
        )
    }

    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::new(
            ErrorKind::DimensionMismatch,
            format!("vector dimension {got} does not match store dimension {expected}"),
        )
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Wrap with additional context, keeping the kind and chaining self
    /// as the cause.
    pub fn context(self, message: impl Into<String>) -> Self {
        let kind = self.kind;
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(self)),
        }
    }

    /// JSON-RPC error code for this error, per the boundary mapping:
    /// caller-contract violations become `-32602`, lookup failures the
    /// server-specific `-32000`, cancellation `-32001`, busy `-32003`,
    /// and everything engine-level or unexpected `-32603`.
    pub fn rpc_code(&self) -> i64 {
        match self.kind {
            ErrorKind::InvalidParams | ErrorKind::InvalidPath | ErrorKind::DimensionMismatch => {
                crate::rpc::INVALID_PARAMS
            }
            ErrorKind::NotFound | ErrorKind::ConnectorExists | ErrorKind::ConnectorNotFound => {
                crate::rpc::SERVER_NOT_FOUND
            }
            ErrorKind::Canceled => crate::rpc::SERVER_CANCELED,
            ErrorKind::Busy => crate::rpc::SERVER_BUSY,
            ErrorKind::Storage | ErrorKind::Internal => crate::rpc::INTERNAL_ERROR,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::not_found("row not found"),
            other => Error::with_source(ErrorKind::Storage, "database operation failed", other),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Storage,
        };
        Error::with_source(kind, e.to_string(), e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(ErrorKind::Internal, format!("JSON error: {e}"), e)
    }
}
