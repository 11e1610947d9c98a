//! One reply destination per outbound routing key.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use courier_messaging::{Broker, DeliveryHandler, Subscription};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Lazily declares and subscribes the reply destination for each routing key.
///
/// Each key owns a [`OnceCell`]: the first caller for a key declares the
/// destination and subscribes to it, concurrent callers for the same key
/// wait on that cell, and callers for other keys never contend. A failed
/// creation leaves the cell empty so the next caller retries.
///
/// Every [`reset`](Self::reset) starts a new generation. A creation that
/// finishes after a reset, or after [`close`](Self::close), cancels its own
/// subscription instead of registering it.
pub struct ReplyDestinations<B: Broker> {
    broker: Arc<B>,
    closed: AtomicBool,
    entries: DashMap<String, Arc<OnceCell<String>>>,
    generation: AtomicU64,
    handler: Arc<dyn DeliveryHandler>,
    subscriptions: Mutex<Vec<B::Subscription>>,
}

/// Why a creation did not produce a destination.
enum Creation {
    Failed(Error),
    Superseded,
}

impl<B: Broker> Debug for ReplyDestinations<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyDestinations")
            .field("broker", &self.broker)
            .field("destinations", &self.len())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl<B: Broker> ReplyDestinations<B> {
    /// Creates an empty cache that subscribes `handler` to every destination.
    pub fn new(broker: Arc<B>, handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            broker,
            closed: AtomicBool::new(false),
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            handler,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Returns the reply destination for `routing_key`, creating it on first use.
    ///
    /// Returns `Ok(None)` when the cache was reset or closed while the
    /// destination was being created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if declaring or subscribing fails.
    pub async fn get_or_create(&self, routing_key: &str) -> Result<Option<String>> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let generation = self.generation();
        let cell = Arc::clone(self.entries.entry(routing_key.to_string()).or_default().value());

        match cell
            .get_or_try_init(|| self.create(routing_key, generation))
            .await
        {
            Ok(destination) => Ok(Some(destination.clone())),
            Err(Creation::Superseded) => Ok(None),
            Err(Creation::Failed(e)) => Err(e),
        }
    }

    async fn create(&self, routing_key: &str, generation: u64) -> std::result::Result<String, Creation> {
        let destination = self
            .broker
            .declare_temporary_destination()
            .await
            .map_err(|e| Creation::Failed(Error::transport(&e)))?;

        let subscription = self
            .broker
            .subscribe_no_ack(&destination, Arc::clone(&self.handler))
            .await
            .map_err(|e| Creation::Failed(Error::transport(&e)))?;

        let superseded = {
            let mut subscriptions = self.subscriptions.lock();
            if self.closed.load(Ordering::SeqCst) || self.generation() != generation {
                Some(subscription)
            } else {
                subscriptions.push(subscription);
                None
            }
        };
        if let Some(subscription) = superseded {
            subscription.cancel().await;
            debug!(routing_key, %destination, "reply destination reset while being created");
            return Err(Creation::Superseded);
        }

        info!(routing_key, %destination, "created reply destination");

        Ok(destination)
    }

    /// Current generation. Bumped by every reset.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The reply destination for `routing_key`, if already created.
    #[must_use]
    pub fn get(&self, routing_key: &str) -> Option<String> {
        self.entries
            .get(routing_key)
            .and_then(|cell| cell.get().cloned())
    }

    /// Forgets every destination and cancels their subscriptions.
    ///
    /// Returns how many subscriptions were cancelled.
    pub async fn reset(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());

        for subscription in &subscriptions {
            subscription.cancel().await;
        }
        debug!(count = subscriptions.len(), "reset reply destinations");

        subscriptions.len()
    }

    /// Resets the cache and refuses to create destinations from now on.
    pub async fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.reset().await
    }

    /// Number of created destinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|cell| cell.value().initialized())
            .count()
    }

    /// Whether no destination has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
