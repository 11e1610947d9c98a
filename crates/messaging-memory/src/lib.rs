//! In-memory implementation of the messaging crate.
//!
//! [`MemoryBroker`] keeps destinations, bindings and subscriptions in
//! process. Every delivery goes through a single dispatch task per broker,
//! mirroring the one-delivery-thread-per-connection model of networked
//! brokers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod dispatch;
mod error;
mod subscription;

pub use broker::{MemoryBroker, MemoryBrokerOptions};
pub use error::Error;
pub use subscription::MemorySubscription;
