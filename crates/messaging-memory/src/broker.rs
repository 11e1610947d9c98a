use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use courier_messaging::{
    Broker, DEFAULT_EXCHANGE, DeliveryHandler, DeliveryMetadata, Envelope, MessageProperties,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, instrument};
use uuid::Uuid;

use crate::dispatch::{self, Dispatch};
use crate::error::Error;
use crate::subscription::MemorySubscription;

/// Options for the in-memory broker.
#[derive(Clone, Debug, Default)]
pub struct MemoryBrokerOptions {
    /// Report publishing as safe for concurrent use.
    ///
    /// Defaults to `false`, which makes clients serialize publishes the way
    /// they must on a single shared channel.
    pub concurrent_publish: bool,
}

/// A message sitting in a destination with no consumer yet.
struct Queued {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    payload: Bytes,
    delivery_tag: u64,
}

#[derive(Clone)]
struct Consumer {
    tag: String,
    handler: Arc<dyn DeliveryHandler>,
}

#[derive(Default)]
struct Destination {
    temporary: bool,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    backlog: VecDeque<Queued>,
}

pub struct State {
    bindings: DashMap<(String, String), Vec<String>>,
    connected: AtomicBool,
    destinations: DashMap<String, Destination>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    next_delivery_tag: AtomicU64,
    options: MemoryBrokerOptions,
    publish_fault: Mutex<Option<String>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
    temporary_declared: AtomicUsize,
}

impl State {
    pub fn is_subscribed(&self, destination: &str, consumer_tag: &str) -> bool {
        self.destinations
            .get(destination)
            .is_some_and(|d| d.consumers.iter().any(|c| c.tag == consumer_tag))
    }

    /// Removes a consumer. A temporary destination left without consumers is
    /// deleted along with its bindings and backlog.
    pub fn remove_consumer(&self, destination: &str, consumer_tag: &str) -> bool {
        let removed = self
            .destinations
            .get_mut(destination)
            .is_some_and(|mut d| {
                let before = d.consumers.len();
                d.consumers.retain(|c| c.tag != consumer_tag);
                before != d.consumers.len()
            });

        if removed
            && self
                .destinations
                .remove_if(destination, |_, d| d.temporary && d.consumers.is_empty())
                .is_some()
        {
            self.unbind_all(destination);
            debug!(destination, "auto-deleted temporary destination");
        }

        removed
    }

    fn unbind_all(&self, destination: &str) {
        self.bindings.retain(|_, bound| {
            bound.retain(|d| d != destination);
            !bound.is_empty()
        });
    }

    fn ensure_connected(&self) -> Result<(), Error> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    fn dispatch(
        &self,
        destination: &str,
        consumer: &Consumer,
        queued: Queued,
    ) -> Result<(), Error> {
        let envelope = Envelope::delivered(
            queued.payload,
            queued.properties,
            DeliveryMetadata {
                exchange: queued.exchange,
                routing_key: queued.routing_key,
                delivery_tag: queued.delivery_tag,
                redelivered: false,
                consumer_tag: consumer.tag.clone(),
            },
        );

        self.dispatch_tx
            .send(Dispatch {
                destination: destination.to_string(),
                consumer_tag: consumer.tag.clone(),
                handler: Arc::clone(&consumer.handler),
                envelope,
            })
            .map_err(|_| Error::DispatcherStopped)
    }

    fn enqueue(&self, destination_name: &str, queued: Queued) -> Result<(), Error> {
        let Some(mut destination) = self.destinations.get_mut(destination_name) else {
            debug!(destination = destination_name, "destination vanished, dropping message");
            return Ok(());
        };

        if destination.consumers.is_empty() {
            destination.backlog.push_back(queued);
            return Ok(());
        }

        let index = destination.next_consumer % destination.consumers.len();
        destination.next_consumer = destination.next_consumer.wrapping_add(1);
        let consumer = destination.consumers[index].clone();
        drop(destination);

        self.dispatch(destination_name, &consumer, queued)
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

/// An in-process broker.
///
/// Cloning is cheap and yields a handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<State>,
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connected", &self.is_connected())
            .field("destinations", &self.state.destinations.len())
            .field("options", &self.state.options)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerOptions::default())
    }
}

impl MemoryBroker {
    /// Creates a broker and starts its dispatch task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(options: MemoryBrokerOptions) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let state = Arc::new(State {
            bindings: DashMap::new(),
            connected: AtomicBool::new(true),
            destinations: DashMap::new(),
            dispatch_tx,
            next_delivery_tag: AtomicU64::new(1),
            options,
            publish_fault: Mutex::new(None),
            shutdown_token: shutdown_token.clone(),
            task_tracker: task_tracker.clone(),
            temporary_declared: AtomicUsize::new(0),
        });

        task_tracker.spawn(
            dispatch::run(dispatch_rx, Arc::downgrade(&state), shutdown_token).in_current_span(),
        );
        task_tracker.close();

        Self { state }
    }

    /// Whether the simulated connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Simulates losing the connection.
    ///
    /// Every subscription is dropped and temporary destinations are deleted,
    /// as a broker does for exclusive destinations of a closed connection.
    /// Operations fail with [`Error::Disconnected`] until [`Self::reconnect`].
    pub fn disconnect(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.destinations.retain(|_, d| !d.temporary);
        for mut destination in self.state.destinations.iter_mut() {
            destination.consumers.clear();
        }
        info!("memory broker disconnected");
    }

    /// Restores the simulated connection.
    pub fn reconnect(&self) {
        self.state.connected.store(true, Ordering::SeqCst);
        info!("memory broker reconnected");
    }

    /// Makes every publish fail with the given reason until cleared with `None`.
    pub fn set_publish_fault(&self, reason: Option<impl Into<String>>) {
        *self.state.publish_fault.lock() = reason.map(Into::into);
    }

    /// Number of temporary destinations currently declared.
    #[must_use]
    pub fn temporary_destination_count(&self) -> usize {
        self.state
            .destinations
            .iter()
            .filter(|d| d.temporary)
            .count()
    }

    /// Number of temporary destinations declared over the broker's lifetime.
    #[must_use]
    pub fn temporary_destinations_declared(&self) -> usize {
        self.state.temporary_declared.load(Ordering::SeqCst)
    }

    /// Whether the named destination exists.
    #[must_use]
    pub fn destination_exists(&self, name: &str) -> bool {
        self.state.destinations.contains_key(name)
    }

    /// Number of consumers subscribed to the named destination.
    #[must_use]
    pub fn consumer_count(&self, destination: &str) -> usize {
        self.state
            .destinations
            .get(destination)
            .map_or(0, |d| d.consumers.len())
    }

    /// Number of messages waiting in the named destination for a consumer.
    #[must_use]
    pub fn backlog_len(&self, destination: &str) -> usize {
        self.state
            .destinations
            .get(destination)
            .map_or(0, |d| d.backlog.len())
    }

    /// Stops the dispatch task and waits for it to exit.
    pub async fn shutdown(&self) {
        self.state.shutdown_token.cancel();
        self.state.task_tracker.wait().await;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;

    type Subscription = MemorySubscription;

    #[instrument(skip(self, properties, payload), fields(len = payload.len()))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.state.ensure_connected()?;
        if let Some(reason) = self.state.publish_fault.lock().clone() {
            return Err(Error::PublishRejected(reason));
        }

        let targets = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            self.state
                .bindings
                .get(&(exchange.to_string(), routing_key.to_string()))
                .map(|b| b.value().clone())
                .unwrap_or_default()
        };

        if targets.is_empty() {
            debug!("no binding matches, dropping unroutable message");
            return Ok(());
        }

        for target in targets {
            let queued = Queued {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                payload: payload.clone(),
                delivery_tag: self.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst),
            };
            self.state.enqueue(&target, queued)?;
        }

        Ok(())
    }

    async fn declare_temporary_destination(&self) -> Result<String, Error> {
        self.state.ensure_connected()?;

        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        self.state.destinations.insert(
            name.clone(),
            Destination {
                temporary: true,
                ..Destination::default()
            },
        );
        self.state.temporary_declared.fetch_add(1, Ordering::SeqCst);
        debug!(destination = %name, "declared temporary destination");

        Ok(name)
    }

    async fn declare_destination(&self, name: &str) -> Result<String, Error> {
        self.state.ensure_connected()?;

        self.state
            .destinations
            .entry(name.to_string())
            .or_default();

        Ok(name.to_string())
    }

    async fn bind_destination(
        &self,
        destination: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.state.ensure_connected()?;
        if !self.state.destinations.contains_key(destination) {
            return Err(Error::UnknownDestination(destination.to_string()));
        }

        let mut bound = self
            .state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|d| d == destination) {
            bound.push(destination.to_string());
        }

        Ok(())
    }

    async fn subscribe_no_ack(
        &self,
        destination: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<MemorySubscription, Error> {
        self.state.ensure_connected()?;

        let consumer = Consumer {
            tag: format!("ctag-{}", Uuid::new_v4().simple()),
            handler,
        };

        {
            let mut entry = self
                .state
                .destinations
                .get_mut(destination)
                .ok_or_else(|| Error::UnknownDestination(destination.to_string()))?;
            // Publishers wait on the entry, so the backlog stays ahead of them.
            for queued in std::mem::take(&mut entry.backlog) {
                self.state.dispatch(destination, &consumer, queued)?;
            }
            entry.consumers.push(consumer.clone());
        }

        debug!(%destination, consumer_tag = %consumer.tag, "subscribed");

        Ok(MemorySubscription::new(
            Arc::downgrade(&self.state),
            destination.to_string(),
            consumer.tag,
        ))
    }

    fn supports_concurrent_publish(&self) -> bool {
        self.state.options.concurrent_publish
    }
}
