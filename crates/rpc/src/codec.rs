//! Payload serialization with content-type hints.
//!
//! Outgoing messages record their format in
//! [`MessageProperties::content_type`]; incoming messages are decoded with
//! the format their properties name, falling back to the local codec when
//! the sender left it unset.

use std::fmt::Debug;

use bytes::Bytes;
use courier_messaging::MessageProperties;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Content type written by [`Codec::Json`].
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type written by [`Codec::Cbor`].
pub const CBOR_CONTENT_TYPE: &str = "application/cbor";

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),

    /// The payload names a content type no codec understands.
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Turns typed values into payloads and back.
pub trait Serializer: Clone + Debug + Send + Sync + 'static {
    /// Serializes `value`, recording the format in `properties`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    fn serialize<T: Serialize>(
        &self,
        value: &T,
        properties: &mut MessageProperties,
    ) -> Result<Bytes, CodecError>;

    /// Deserializes `payload` using the format hinted by `properties`.
    ///
    /// # Errors
    ///
    /// Returns an error if the content type is unknown or the payload does
    /// not decode into `T`.
    fn deserialize<T: DeserializeOwned>(
        &self,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<T, CodecError>;
}

/// The built-in payload formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    /// JSON via `serde_json`.
    #[default]
    Json,
    /// CBOR via `ciborium`.
    Cbor,
}

impl Codec {
    /// The content type this codec writes.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Json => JSON_CONTENT_TYPE,
            Self::Cbor => CBOR_CONTENT_TYPE,
        }
    }

    /// Finds the codec for a content type, ignoring parameters such as `charset`.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();

        if essence.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
            Some(Self::Json)
        } else if essence.eq_ignore_ascii_case(CBOR_CONTENT_TYPE) {
            Some(Self::Cbor)
        } else {
            None
        }
    }

    fn encode<T: Serialize>(self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            Self::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| CodecError::SerializationFailed(e.to_string())),
            Self::Cbor => {
                let mut vec = Vec::new();
                ciborium::ser::into_writer(value, &mut vec)
                    .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
                Ok(Bytes::from(vec))
            }
        }
    }

    fn decode<T: DeserializeOwned>(self, payload: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => serde_json::from_slice(payload)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
            Self::Cbor => ciborium::de::from_reader(payload)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
        }
    }
}

impl Serializer for Codec {
    fn serialize<T: Serialize>(
        &self,
        value: &T,
        properties: &mut MessageProperties,
    ) -> Result<Bytes, CodecError> {
        let payload = self.encode(value)?;
        properties.content_type = Some(self.content_type().to_string());
        Ok(payload)
    }

    fn deserialize<T: DeserializeOwned>(
        &self,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<T, CodecError> {
        let codec = match properties.content_type.as_deref() {
            Some(content_type) => Self::from_content_type(content_type)
                .ok_or_else(|| CodecError::UnsupportedContentType(content_type.to_string()))?,
            None => *self,
        };
        codec.decode(payload)
    }
}
