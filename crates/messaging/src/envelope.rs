use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Header map carried in [`MessageProperties`].
pub type Headers = HashMap<String, HeaderValue>;

/// A single header value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl HeaderValue {
    /// Returns the value as a string slice if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a bool if it is a bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::String(s) => f.write_str(s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Transport metadata attached to an outgoing or received message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Correlates a reply with the request that caused it.
    pub correlation_id: Option<String>,

    /// Destination replies should be published to.
    pub reply_to: Option<String>,

    /// Advisory time-to-live of the message.
    pub expiration: Option<Duration>,

    /// Serialization format of the payload, e.g. `application/json`.
    pub content_type: Option<String>,

    /// Free-form headers.
    pub headers: Headers,
}

impl MessageProperties {
    /// Creates empty properties.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply destination.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets the expiration.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Gets a header value by key.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    /// Returns the correlation id if present and non-empty.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Where a received message came from. Only set on delivered envelopes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryMetadata {
    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Broker-assigned tag, unique per connection.
    pub delivery_tag: u64,

    /// Whether the broker has delivered this message before.
    pub redelivered: bool,

    /// Tag of the subscription that received the message.
    pub consumer_tag: String,
}

/// An immutable message: payload plus transport metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    payload: Bytes,
    properties: MessageProperties,
    delivery: Option<DeliveryMetadata>,
}

impl Envelope {
    /// Creates an envelope for publishing.
    pub fn new(payload: impl Into<Bytes>, properties: MessageProperties) -> Self {
        Self {
            payload: payload.into(),
            properties,
            delivery: None,
        }
    }

    /// Creates an envelope as received from a broker.
    pub fn delivered(
        payload: impl Into<Bytes>,
        properties: MessageProperties,
        delivery: DeliveryMetadata,
    ) -> Self {
        Self {
            payload: payload.into(),
            properties,
            delivery: Some(delivery),
        }
    }

    /// The raw payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The transport properties.
    #[must_use]
    pub const fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Delivery metadata, if this envelope was received from a broker.
    #[must_use]
    pub const fn delivery(&self) -> Option<&DeliveryMetadata> {
        self.delivery.as_ref()
    }

    /// Shorthand for the non-empty correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id()
    }

    /// Splits the envelope into payload and properties.
    #[must_use]
    pub fn into_parts(self) -> (Bytes, MessageProperties) {
        (self.payload, self.properties)
    }
}
