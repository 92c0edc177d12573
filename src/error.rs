//! Error types for the screener.

use std::time::Duration;

/// Errors returned by the inbound router.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Concurrent update rejected for {entity} {id} (expected version {expected})")]
    Conflict {
        entity: String,
        id: String,
        expected: u64,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while loading or validating the instrument catalogue.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to parse instrument catalogue: {0}")]
    Parse(String),

    #[error("Instrument {instrument} is invalid: {reason}")]
    Invalid { instrument: String, reason: String },

    #[error("Instrument id {0} is defined more than once")]
    DuplicateId(String),

    #[error("Keyword {keyword} is claimed by both {first} and {second}")]
    DuplicateKeyword {
        keyword: String,
        first: String,
        second: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound event errors. Every variant is a malformed event: discarded, logged,
/// never applied to a session.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Malformed event: body is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("Malformed event: missing or empty field {0}")]
    MissingField(&'static str),

    #[error("Malformed event: invalid phone number {0:?}")]
    InvalidPhone(String),
}

/// Raw failure from a single transport send attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),
}

/// Classified delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transient delivery failure: {reason}")]
    Transient { reason: String },

    #[error("Permanent delivery failure: {reason}")]
    Permanent { reason: String },
}

impl From<&TransportError> for DeliveryError {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Timeout(_) | TransportError::Network(_) => DeliveryError::Transient {
                reason: err.to_string(),
            },
            TransportError::Status { status, .. } if *status >= 500 || *status == 429 => {
                DeliveryError::Transient {
                    reason: err.to_string(),
                }
            }
            TransportError::Status { .. } => DeliveryError::Permanent {
                reason: err.to_string(),
            },
        }
    }
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }
}

/// Result Sink handoff errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Result sink request failed: {0}")]
    RequestFailed(String),

    #[error("Result sink rejected result with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Result store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
