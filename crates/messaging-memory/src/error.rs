use courier_messaging::BrokerError;
use thiserror::Error;

/// Errors that can occur in the in-memory broker.
#[derive(Debug, Error)]
pub enum Error {
    /// The broker connection is down.
    #[error("broker disconnected")]
    Disconnected,

    /// The destination has not been declared.
    #[error("unknown destination `{0}`")]
    UnknownDestination(String),

    /// The dispatch task has stopped.
    #[error("dispatcher stopped")]
    DispatcherStopped,

    /// Publishing was rejected by an injected fault.
    #[error("publish rejected: {0}")]
    PublishRejected(String),
}

impl BrokerError for Error {}
