//! Request/response RPC over a publish/subscribe broker.
//!
//! A caller publishes a request on a routing key and waits for the one reply
//! carrying its correlation id. Replies arrive on a per-routing-key reply
//! destination owned by the client and are matched to waiting calls in any
//! order.
//!
//! # Features
//!
//! - **Typed calls**: requests and replies are any serde types
//! - **Timeouts**: every call has a finite deadline; late replies are dropped
//! - **Remote errors**: responder failures come back as [`Error::Remote`]
//! - **Pluggable codecs**: JSON by default, CBOR via ciborium
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use courier_messaging_memory::MemoryBroker;
//! use courier_rpc::{ConsumerOptions, Delivery, RespondHandler, RpcClient, RpcServer};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl RespondHandler for Echo {
//!     type Request = String;
//!     type Response = String;
//!     type Error = std::convert::Infallible;
//!
//!     async fn respond(&self, request: Delivery<String>) -> Result<String, Self::Error> {
//!         Ok(request.into_body())
//!     }
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(MemoryBroker::default());
//!
//!     let server = RpcServer::new(Arc::clone(&broker));
//!     server.respond(Echo, ConsumerOptions::for_routing_key("echo")).await?;
//!
//!     let client = RpcClient::new(broker);
//!     let reply: String = client.request("echo", &"Hello!").await?;
//!     assert_eq!(reply, "Hello!");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod error_envelope;
pub mod registry;
pub mod reply_destinations;
pub mod reply_handler;
pub mod server;

#[cfg(test)]
mod test_support;

pub use client::{RpcClient, RpcClientBuilder, SendOptions};
pub use codec::{Codec, CodecError, Serializer};
pub use config::RpcConfig;
pub use error::{Error, Result};
pub use error_envelope::{ERROR_FLAG_HEADER, RemoteError};
pub use server::{
    ConsumeHandler, ConsumerOptions, Delivery, RespondHandler, RpcServer, ServerSubscription,
};
