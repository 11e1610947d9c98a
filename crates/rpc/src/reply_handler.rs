//! Matches replies arriving on reply destinations to waiting calls.

use courier_messaging::{DeliveryError, DeliveryHandler, Envelope};
use tracing::{debug, error};

use crate::registry::PendingCalls;

/// The delivery handler subscribed to every reply destination of a client.
///
/// Never blocks: it only touches the registry map and a oneshot channel.
#[derive(Clone, Debug)]
pub struct ReplyHandler {
    pending: PendingCalls,
}

impl ReplyHandler {
    /// Creates a handler resolving calls in `pending`.
    #[must_use]
    pub const fn new(pending: PendingCalls) -> Self {
        Self { pending }
    }
}

impl DeliveryHandler for ReplyHandler {
    fn handle_delivery(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        let Some(correlation_id) = envelope.correlation_id().map(ToString::to_string) else {
            error!(
                delivery = ?envelope.delivery(),
                "reply without correlation id on a reply destination"
            );
            return Err(DeliveryError::MissingCorrelationId);
        };

        if !self.pending.resolve(&correlation_id, envelope) {
            debug!(%correlation_id, "orphaned reply discarded");
        }

        Ok(())
    }
}
