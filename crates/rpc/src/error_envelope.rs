//! The error reply convention.
//!
//! A responder that fails publishes a [`RemoteError`] body and sets the
//! [`ERROR_FLAG_HEADER`] header, so the caller can tell "the handler ran and
//! failed" apart from a normal reply.

use std::error::Error as StdError;

use courier_messaging::{HeaderValue, MessageProperties};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header marking a reply as an error envelope.
pub const ERROR_FLAG_HEADER: &str = "x-rpc-error";

/// An error raised by a remote handler, as carried back to the caller.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Classification of the error, usually the remote error type's name.
    pub kind: String,

    /// Human-readable error message.
    pub message: String,

    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Captures a local error, naming it after its type.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: StdError + ?Sized,
    {
        Self::new(short_type_name::<E>(), error.to_string())
    }
}

fn short_type_name<E: ?Sized>() -> &'static str {
    let full = std::any::type_name::<E>();
    if full.starts_with("dyn ") {
        return "Error";
    }
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Marks `properties` as carrying an error envelope.
pub fn set_error_flag(properties: &mut MessageProperties) {
    properties
        .headers
        .insert(ERROR_FLAG_HEADER.to_string(), HeaderValue::Bool(true));
}

/// Whether `properties` mark an error envelope.
///
/// Accepts a boolean `true` or the string `"true"` in any case.
#[must_use]
pub fn has_error_flag(properties: &MessageProperties) -> bool {
    match properties.header(ERROR_FLAG_HEADER) {
        Some(HeaderValue::Bool(flag)) => *flag,
        Some(HeaderValue::String(flag)) => flag.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
