//! Error types shared by the store, the activation registry and the REST layer.
//!
//! Probe failures are deliberately absent here: a broker that cannot be reached
//! is an ordinary test outcome and travels as data inside
//! [`ProbeResult`](crate::probe::ProbeResult).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed input: missing or out-of-range fields.
    #[error("{0}")]
    Validation(String),

    #[error("Broker configuration {0} not found")]
    NotFound(i64),

    #[error("Broker configuration with id {0} already exists")]
    DuplicateId(i64),

    /// The storage backend failed; nothing about the operation can be salvaged.
    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl BrokerError {
    /// Stable identifier used on the wire so clients can branch on the failure.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Validation(_) => "ValidationError",
            BrokerError::NotFound(_) => "NotFound",
            BrokerError::DuplicateId(_) => "DuplicateId",
            BrokerError::Persistence(_) => "PersistenceFailure",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BrokerError::Validation(message.into())
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        BrokerError::Persistence(e.to_string())
    }
}

impl From<r2d2::Error> for BrokerError {
    fn from(e: r2d2::Error) -> Self {
        BrokerError::Persistence(format!("connection pool: {}", e))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Persistence(format!("encoding: {}", e))
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
