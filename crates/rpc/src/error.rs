//! Error types for RPC calls.

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::error_envelope::RemoteError;

/// Result type alias for RPC operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for RPC operations.
///
/// A call fails with exactly one of these. [`Error::Timeout`],
/// [`Error::Remote`] and [`Error::Transport`] are deliberately distinct:
/// "nobody answered", "the handler answered with a failure" and "the request
/// never left" call for different reactions.
#[derive(Debug, Error)]
pub enum Error {
    /// No reply arrived before the deadline.
    #[error("Timeout waiting for reply to {correlation_id} on `{routing_key}` after {timeout:?}")]
    Timeout {
        /// The routing key the request was sent on.
        routing_key: String,
        /// The correlation id of the abandoned call.
        correlation_id: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The remote handler ran and reported a failure.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The broker rejected a publish, declare or subscribe.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection was reset while the call was waiting.
    #[error("Connection reset while waiting for reply to {correlation_id}")]
    ConnectionReset {
        /// The correlation id of the failed call.
        correlation_id: String,
    },

    /// Local serialization or deserialization failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The routing key was empty.
    #[error("Routing key must not be empty")]
    InvalidRoutingKey,

    /// A correlation id was registered twice.
    #[error("Correlation id {0} is already in flight")]
    DuplicateCorrelationId(String),

    /// The client or server has been shut down.
    #[error("Shut down")]
    Shutdown,
}

impl Error {
    /// Wraps a broker error.
    pub fn transport<E: std::error::Error>(error: &E) -> Self {
        Self::Transport(error.to_string())
    }

    /// Whether this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The remote error, if the remote handler failed.
    #[must_use]
    pub const fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}
