use thiserror::Error;

use crate::envelope::Envelope;

/// Errors a delivery handler reports back to the broker.
///
/// Brokers log these and keep dispatching; they never tear down the
/// dispatch context.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// A message arrived without the correlation id the handler needs.
    #[error("invalid correlation id: got a missing or empty one")]
    MissingCorrelationId,

    /// The handler could not accept the message.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Callback invoked by a broker for every message delivered to a subscription.
///
/// Runs on the broker's dispatch context, so implementations must return
/// promptly and must not wait on other broker operations.
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Handles one delivered message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed or cannot be accepted.
    fn handle_delivery(&self, envelope: Envelope) -> Result<(), DeliveryError>;
}

impl<F> DeliveryHandler for F
where
    F: Fn(Envelope) -> Result<(), DeliveryError> + Send + Sync + 'static,
{
    fn handle_delivery(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self(envelope)
    }
}
