//! Error taxonomy for the synchronization layer.
//!
//! `TransportError` is produced at the transport boundary; `SyncError` is
//! what consumers of the cache see. A discarded stale fetch result is not an
//! error in either taxonomy: it is logged and dropped.

use thiserror::Error;

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The request never reached the server, the response never arrived, or
    /// the server answered with a 5xx. Retryable.
    #[error("network failure: {message}")]
    Network { message: String },
    /// The server explicitly refused the request (4xx). Not retryable.
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The payload or response body failed shape validation. Not retryable.
    #[error("validation failed: {message}")]
    Validation { message: String },
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Whether the fetch coordinator may retry after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Failure surfaced to cache consumers.
///
/// All three variants roll a mutation back identically; they differ only in
/// the message and detail the UI is expected to show.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("network failure: {message}")]
    NetworkFailure { message: String },
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("validation failed: {message}")]
    ValidationFailed { message: String },
}

impl SyncError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure {
            message: message.into(),
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Network { message } => Self::NetworkFailure { message },
            TransportError::Rejected { status, message } => Self::Rejected { status, message },
            TransportError::Validation { message } => Self::ValidationFailed { message },
        }
    }
}

/// Failure while loading the synchronization configuration.
#[derive(Debug, Error)]
pub enum SyncConfigError {
    #[error("configuration error: {0}")]
    Source(#[from] config::ConfigError),
}

/// Failure while installing the tracing and metrics stack.
#[derive(Debug, Error)]
#[error("telemetry error: {message}")]
pub struct TelemetryError {
    message: String,
}

impl TelemetryError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
