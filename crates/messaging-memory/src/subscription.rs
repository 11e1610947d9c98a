use std::sync::Weak;

use async_trait::async_trait;
use courier_messaging::Subscription;
use tracing::debug;

use crate::broker::State;

/// A subscription to a destination of a [`MemoryBroker`](crate::MemoryBroker).
///
/// Dropping the handle leaves the subscription active; call
/// [`Subscription::cancel`] to stop delivery.
#[derive(Debug)]
pub struct MemorySubscription {
    consumer_tag: String,
    destination: String,
    state: Weak<State>,
}

impl MemorySubscription {
    pub(crate) const fn new(state: Weak<State>, destination: String, consumer_tag: String) -> Self {
        Self {
            consumer_tag,
            destination,
            state,
        }
    }

    /// The destination this subscription consumes from.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    async fn cancel(&self) {
        if let Some(state) = self.state.upgrade() {
            if state.remove_consumer(&self.destination, &self.consumer_tag) {
                debug!(destination = %self.destination, consumer_tag = %self.consumer_tag, "subscription cancelled");
            }
        }
    }
}
