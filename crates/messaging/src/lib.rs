//! Abstract interface for publish/subscribe message brokers.
//!
//! This crate defines the pieces every broker implementation and every
//! consumer of a broker agree on:
//!
//! - [`Envelope`]: a payload plus its transport metadata
//! - [`Broker`]: publish, declare and subscribe operations
//! - [`DeliveryHandler`]: the callback a broker invokes per delivered message
//! - [`ConnectionSettings`]: where and as whom to connect
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Brokers publish payloads and deliver them to subscriptions.
pub mod broker;

/// Connection settings for brokers.
pub mod config;

/// Delivery handlers process messages delivered to a subscription.
pub mod delivery;

/// Envelopes wrap payloads with transport metadata.
pub mod envelope;

pub use broker::{Broker, BrokerError, DEFAULT_EXCHANGE, Subscription};
pub use config::{ConfigError, ConnectionSettings};
pub use delivery::{DeliveryError, DeliveryHandler};
pub use envelope::{DeliveryMetadata, Envelope, HeaderValue, Headers, MessageProperties};

pub use bytes::Bytes;
