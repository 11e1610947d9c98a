//! Broker wrappers shared by unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_messaging::{Broker, DeliveryHandler, MessageProperties};
use courier_messaging_memory::{Error as MemoryError, MemoryBroker, MemorySubscription};
use tokio::sync::Notify;

/// Holds every `declare_temporary_destination` until [`Self::open`] is called.
#[derive(Debug, Clone)]
pub struct GatedBroker {
    pub inner: MemoryBroker,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

impl GatedBroker {
    pub fn new(inner: MemoryBroker) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
        }
    }

    /// Waits until a declaration is parked at the gate.
    pub async fn declaring(&self) {
        self.entered.notified().await;
    }

    /// Lets one parked declaration through.
    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Broker for GatedBroker {
    type Error = MemoryError;

    type Subscription = MemorySubscription;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: Bytes,
    ) -> Result<(), MemoryError> {
        self.inner
            .publish(exchange, routing_key, properties, payload)
            .await
    }

    async fn declare_temporary_destination(&self) -> Result<String, MemoryError> {
        self.entered.notify_one();
        self.gate.notified().await;
        self.inner.declare_temporary_destination().await
    }

    async fn declare_destination(&self, name: &str) -> Result<String, MemoryError> {
        self.inner.declare_destination(name).await
    }

    async fn bind_destination(
        &self,
        destination: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MemoryError> {
        self.inner
            .bind_destination(destination, exchange, routing_key)
            .await
    }

    async fn subscribe_no_ack(
        &self,
        destination: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<MemorySubscription, MemoryError> {
        self.inner.subscribe_no_ack(destination, handler).await
    }
}
