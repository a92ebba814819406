//! The `error` module defines the error types returned by the broker core.
//!
//! Every broker operation reports failures to its immediate caller through
//! [`BrokerError`]. Transport and client layers wrap these in their own
//! error types where they add failure modes of their own.

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur while connecting, subscribing or publishing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Bad credentials. Fatal to the connection attempt.
    #[error("authentication failed for '{login}'")]
    Auth { login: String },

    /// Malformed or unrecognized destination. The caller may retry with
    /// corrected input.
    #[error("invalid destination '{destination}': {reason}")]
    InvalidDestination { destination: String, reason: String },

    /// A recipient's outbound buffer is full. The caller may retry later.
    #[error("outbound buffer full for connection {connection}")]
    Backpressure { connection: String },

    #[error("connection {0} is not authenticated")]
    NotAuthenticated(String),

    #[error("connection {0} is disconnected")]
    Disconnected(String),

    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("message has no reply-to header")]
    NoReplyDestination,

    #[error("token error: {0}")]
    Token(String),
}

impl BrokerError {
    pub(crate) fn invalid_destination(destination: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDestination {
            destination: destination.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the operation on the same connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidDestination { .. } | Self::Backpressure { .. } | Self::NoReplyDestination
        )
    }
}
