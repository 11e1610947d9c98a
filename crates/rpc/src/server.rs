//! Consumers and responders.
//!
//! The broker callback only enqueues the delivery; a worker task per
//! subscription hands each message to its own task on the server's
//! [`TaskTracker`], so slow or panicking handlers never stall the broker's
//! dispatch context.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt::{self, Debug};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use courier_messaging::{
    Broker, DEFAULT_EXCHANGE, DeliveryError, DeliveryHandler, Envelope, MessageProperties,
    Subscription,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::codec::{Codec, Serializer};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::error_envelope::{RemoteError, set_error_flag};

/// A received message with its decoded body.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    body: T,
    envelope: Envelope,
}

impl<T> Delivery<T> {
    /// Pairs a decoded body with the envelope it came from.
    pub const fn new(body: T, envelope: Envelope) -> Self {
        Self { body, envelope }
    }

    /// The decoded body.
    pub const fn body(&self) -> &T {
        &self.body
    }

    /// Takes the decoded body.
    pub fn into_body(self) -> T {
        self.body
    }

    /// The original envelope.
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The message properties.
    pub const fn properties(&self) -> &MessageProperties {
        self.envelope.properties()
    }

    /// The correlation id of the request, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.correlation_id()
    }

    /// Where the reply goes, if the sender expects one.
    pub fn reply_to(&self) -> Option<&str> {
        self.envelope
            .properties()
            .reply_to
            .as_deref()
            .filter(|r| !r.is_empty())
    }
}

/// Handles one-way messages.
#[async_trait]
pub trait ConsumeHandler: Send + Sync + 'static {
    /// The decoded message type.
    type Message: DeserializeOwned + Send + 'static;

    /// The handler's error type.
    type Error: StdError + Send + Sync + 'static;

    /// Handle one message.
    async fn consume(&self, delivery: Delivery<Self::Message>) -> Result<(), Self::Error>;
}

/// Handles requests and produces replies.
#[async_trait]
pub trait RespondHandler: Send + Sync + 'static {
    /// The decoded request type.
    type Request: DeserializeOwned + Send + 'static;

    /// The reply type.
    type Response: Serialize + Send + 'static;

    /// The handler's error type. A [`RemoteError`] is sent back unchanged;
    /// any other error is named after its type.
    type Error: StdError + Send + Sync + 'static;

    /// Handle one request.
    async fn respond(
        &self,
        request: Delivery<Self::Request>,
    ) -> Result<Self::Response, Self::Error>;
}

/// Where a consumer or responder takes its messages from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Destination to declare and subscribe to.
    pub destination: String,
    /// Exchange to bind the destination to. Empty means the default
    /// exchange, which needs no binding.
    pub exchange: String,
    /// Routing key of the binding.
    pub routing_key: String,
}

impl ConsumerOptions {
    /// Options that consume `routing_key` from the default request exchange
    /// through a destination of the same name.
    #[must_use]
    pub fn for_routing_key(routing_key: impl Into<String>) -> Self {
        let routing_key = routing_key.into();
        Self {
            destination: routing_key.clone(),
            exchange: crate::config::DEFAULT_REQUEST_EXCHANGE.to_string(),
            routing_key,
        }
    }

    /// Use a different destination name.
    #[must_use]
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Bind to a different exchange.
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }
}

/// A running consumer or responder.
#[derive(Debug)]
pub struct ServerSubscription<S: Subscription> {
    destination: String,
    subscription: Arc<S>,
    token: CancellationToken,
}

impl<S: Subscription> ServerSubscription<S> {
    /// The destination being consumed.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The broker consumer tag.
    pub fn consumer_tag(&self) -> &str {
        self.subscription.consumer_tag()
    }

    /// Stop taking messages. Handlers already running finish normally.
    pub async fn cancel(&self) {
        self.token.cancel();
        self.subscription.cancel().await;
        debug!(destination = %self.destination, "server subscription cancelled");
    }
}

#[async_trait]
trait Process: Send + Sync + 'static {
    async fn process(&self, envelope: Envelope);
}

/// Broker-facing side of a subscription: never blocks, only enqueues.
struct Intake {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl DeliveryHandler for Intake {
    fn handle_delivery(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.tx
            .send(envelope)
            .map_err(|_| DeliveryError::Rejected("server subscription stopped".to_string()))
    }
}

struct Consumer<H, C> {
    codec: C,
    handler: Arc<H>,
}

#[async_trait]
impl<H: ConsumeHandler, C: Serializer> Process for Consumer<H, C> {
    async fn process(&self, envelope: Envelope) {
        let message: H::Message = match self
            .codec
            .deserialize(envelope.payload(), envelope.properties())
        {
            Ok(message) => message,
            Err(e) => {
                error!(delivery = ?envelope.delivery(), "failed to decode message: {e}");
                return;
            }
        };

        let delivery = Delivery::new(message, envelope);
        match AssertUnwindSafe(self.handler.consume(delivery))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("consume handler failed: {e}"),
            Err(panic) => error!("consume handler panicked: {}", panic_message(&*panic)),
        }
    }
}

struct Responder<B, H, C> {
    broker: Arc<B>,
    codec: C,
    handler: Arc<H>,
}

impl<B: Broker, H: RespondHandler, C: Serializer> Responder<B, H, C> {
    async fn invoke(&self, envelope: Envelope) -> Result<H::Response, RemoteError> {
        let request: H::Request = self
            .codec
            .deserialize(envelope.payload(), envelope.properties())
            .map_err(|e| {
                error!("failed to decode request: {e}");
                RemoteError::from_error(&e)
            })?;

        match AssertUnwindSafe(self.handler.respond(Delivery::new(request, envelope)))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                error!("respond handler failed: {e}");
                Err(remote_error_of(&e))
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!("respond handler panicked: {message}");
                Err(RemoteError::new("Panic", message))
            }
        }
    }

    fn encode_reply(
        &self,
        outcome: Result<H::Response, RemoteError>,
        properties: &mut MessageProperties,
    ) -> Result<bytes::Bytes> {
        let remote = match outcome {
            Ok(response) => match self.codec.serialize(&response, properties) {
                Ok(payload) => return Ok(payload),
                Err(e) => {
                    error!("failed to encode reply: {e}");
                    RemoteError::from_error(&e)
                }
            },
            Err(remote) => remote,
        };

        set_error_flag(properties);
        Ok(self.codec.serialize(&remote, properties)?)
    }
}

#[async_trait]
impl<B: Broker, H: RespondHandler, C: Serializer> Process for Responder<B, H, C> {
    async fn process(&self, envelope: Envelope) {
        let correlation_id = envelope.correlation_id().map(ToString::to_string);
        let reply_to = envelope
            .properties()
            .reply_to
            .clone()
            .filter(|r| !r.is_empty());

        let outcome = self.invoke(envelope).await;

        let Some(reply_to) = reply_to else {
            warn!(?correlation_id, "request has no reply destination, dropping reply");
            return;
        };

        let mut properties = MessageProperties::new();
        properties.correlation_id = correlation_id;

        let payload = match self.encode_reply(outcome, &mut properties) {
            Ok(payload) => payload,
            Err(e) => {
                error!(%reply_to, "failed to encode error reply: {e}");
                return;
            }
        };

        if let Err(e) = self
            .broker
            .publish(DEFAULT_EXCHANGE, &reply_to, properties, payload)
            .await
        {
            warn!(%reply_to, "failed to publish reply: {e}");
        }
    }
}

fn remote_error_of<E: StdError + 'static>(error: &E) -> RemoteError {
    (error as &dyn Any)
        .downcast_ref::<RemoteError>()
        .cloned()
        .unwrap_or_else(|| RemoteError::from_error(error))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

/// Runs consumers and responders against a broker.
pub struct RpcServer<B: Broker, C: Serializer = Codec> {
    broker: Arc<B>,
    codec: C,
    config: RpcConfig,
    shutdown_token: CancellationToken,
    subscriptions: Mutex<Vec<Arc<B::Subscription>>>,
    task_tracker: TaskTracker,
}

impl<B: Broker, C: Serializer> Debug for RpcServer<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("broker", &self.broker)
            .field("codec", &self.codec)
            .field("config", &self.config)
            .field("subscriptions", &self.subscriptions.lock().len())
            .field("tasks", &self.task_tracker.len())
            .finish_non_exhaustive()
    }
}

impl<B: Broker> RpcServer<B> {
    /// Create a server with the default configuration and JSON payloads.
    #[must_use]
    pub fn new(broker: Arc<B>) -> Self {
        Self::with_options(broker, RpcConfig::default(), Codec::default())
    }
}

impl<B: Broker, C: Serializer> RpcServer<B, C> {
    /// Create a server with explicit configuration and codec.
    #[must_use]
    pub fn with_options(broker: Arc<B>, config: RpcConfig, codec: C) -> Self {
        Self {
            broker,
            codec,
            config,
            shutdown_token: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Options for `routing_key` with the configured prefixes applied.
    #[must_use]
    pub fn options_for(&self, routing_key: &str) -> ConsumerOptions {
        ConsumerOptions::for_routing_key(routing_key)
            .destination(self.config.queue_name(routing_key))
            .exchange(self.config.request_exchange())
    }

    /// Start consuming one-way messages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the destination cannot be declared,
    /// bound or subscribed, and [`Error::Shutdown`] after [`RpcServer::shutdown`].
    pub async fn consume<H: ConsumeHandler>(
        &self,
        handler: H,
        options: ConsumerOptions,
    ) -> Result<ServerSubscription<B::Subscription>> {
        let consumer = Consumer {
            codec: self.codec.clone(),
            handler: Arc::new(handler),
        };
        self.serve(options, consumer).await
    }

    /// Start consuming `routing_key` with options from [`RpcServer::options_for`].
    ///
    /// # Errors
    ///
    /// See [`RpcServer::consume`].
    pub async fn consume_on<H: ConsumeHandler>(
        &self,
        handler: H,
        routing_key: &str,
    ) -> Result<ServerSubscription<B::Subscription>> {
        self.consume(handler, self.options_for(routing_key)).await
    }

    /// Start answering requests.
    ///
    /// Replies go to the request's reply destination on the default exchange
    /// and carry the request's correlation id. Handler errors, panics and
    /// undecodable requests are answered with an error envelope.
    ///
    /// # Errors
    ///
    /// See [`RpcServer::consume`].
    pub async fn respond<H: RespondHandler>(
        &self,
        handler: H,
        options: ConsumerOptions,
    ) -> Result<ServerSubscription<B::Subscription>> {
        let responder = Responder {
            broker: Arc::clone(&self.broker),
            codec: self.codec.clone(),
            handler: Arc::new(handler),
        };
        self.serve(options, responder).await
    }

    /// Start answering `routing_key` with options from [`RpcServer::options_for`].
    ///
    /// # Errors
    ///
    /// See [`RpcServer::consume`].
    pub async fn respond_on<H: RespondHandler>(
        &self,
        handler: H,
        routing_key: &str,
    ) -> Result<ServerSubscription<B::Subscription>> {
        self.respond(handler, self.options_for(routing_key)).await
    }

    #[instrument(skip(self, processor), fields(scope = self.config.scope.as_deref()))]
    async fn serve<P: Process>(
        &self,
        options: ConsumerOptions,
        processor: P,
    ) -> Result<ServerSubscription<B::Subscription>> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let destination = self
            .broker
            .declare_destination(&options.destination)
            .await
            .map_err(|e| Error::transport(&e))?;

        if !options.exchange.is_empty() {
            self.broker
                .bind_destination(&destination, &options.exchange, &options.routing_key)
                .await
                .map_err(|e| Error::transport(&e))?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .broker
            .subscribe_no_ack(&destination, Arc::new(Intake { tx }))
            .await
            .map_err(|e| Error::transport(&e))?;
        let subscription = Arc::new(subscription);
        self.subscriptions.lock().push(Arc::clone(&subscription));

        let token = self.shutdown_token.child_token();
        self.task_tracker.spawn(
            run_worker(
                rx,
                Arc::new(processor),
                self.task_tracker.clone(),
                token.clone(),
            )
            .in_current_span(),
        );

        info!(%destination, consumer_tag = subscription.consumer_tag(), "server subscription started");

        Ok(ServerSubscription {
            destination,
            subscription,
            token,
        })
    }

    /// Stop all subscriptions and wait for running handlers to finish.
    pub async fn shutdown(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in &subscriptions {
            subscription.cancel().await;
        }

        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("rpc server shut down");
    }

    /// Number of handler and worker tasks still running.
    #[must_use]
    pub fn running_tasks(&self) -> usize {
        self.task_tracker.len()
    }
}

impl<B: Broker, C: Serializer> Drop for RpcServer<B, C> {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

async fn run_worker<P: Process>(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    processor: Arc<P>,
    task_tracker: TaskTracker,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                // Accepted requests still get processed.
                let mut drained = 0usize;
                while let Ok(envelope) = rx.try_recv() {
                    spawn_process(&task_tracker, &processor, envelope);
                    drained += 1;
                }
                debug!(drained, "server worker shutting down");
                break;
            }
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                spawn_process(&task_tracker, &processor, envelope);
            }
        }
    }
}

fn spawn_process<P: Process>(task_tracker: &TaskTracker, processor: &Arc<P>, envelope: Envelope) {
    let processor = Arc::clone(processor);
    task_tracker.spawn(
        async move {
            processor.process(envelope).await;
        }
        .in_current_span(),
    );
}
