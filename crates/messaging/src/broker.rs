use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::delivery::DeliveryHandler;
use crate::envelope::MessageProperties;

/// The nameless exchange that routes by destination name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Marker trait for broker errors
pub trait BrokerError: Debug + Error + Send + Sync + 'static {}

/// A handle to an active subscription.
#[async_trait]
pub trait Subscription: Debug + Send + Sync + 'static {
    /// The broker-assigned consumer tag.
    fn consumer_tag(&self) -> &str;

    /// Stops delivery to this subscription.
    async fn cancel(&self);
}

/// A trait representing a connection to a publish/subscribe broker.
#[async_trait]
pub trait Broker
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// The subscription handle returned by [`Broker::subscribe_no_ack`].
    type Subscription: Subscription;

    /// Publishes a payload to an exchange with the given routing key.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: Bytes,
    ) -> Result<(), Self::Error>;

    /// Declares a temporary, exclusive destination with a broker-assigned name.
    async fn declare_temporary_destination(&self) -> Result<String, Self::Error>;

    /// Declares a named destination. Declaring an existing one is a no-op.
    async fn declare_destination(&self, name: &str) -> Result<String, Self::Error>;

    /// Routes messages published to `exchange` with `routing_key` into `destination`.
    async fn bind_destination(
        &self,
        destination: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Self::Error>;

    /// Subscribes to a destination without acknowledgements.
    async fn subscribe_no_ack(
        &self,
        destination: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Self::Subscription, Self::Error>;

    /// Whether `publish` and the declare operations may be called concurrently.
    ///
    /// Brokers backed by a single channel return `false`; callers then
    /// serialize access themselves.
    fn supports_concurrent_publish(&self) -> bool {
        false
    }
}
