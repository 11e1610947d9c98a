//! RPC client implementation.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use courier_messaging::{Broker, Envelope, MessageProperties};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::codec::{Codec, Serializer};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::error_envelope::{RemoteError, has_error_flag};
use crate::registry::{PendingCall, PendingCalls, WaitError};
use crate::reply_destinations::ReplyDestinations;
use crate::reply_handler::ReplyHandler;

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// How long to wait for the reply. Defaults to
    /// [`RpcConfig::default_timeout`].
    pub timeout: Option<Duration>,
}

impl SendOptions {
    /// Options with the given timeout.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Builder for creating RPC clients.
pub struct RpcClientBuilder<B: Broker, C: Serializer = Codec> {
    broker: Arc<B>,
    codec: C,
    config: RpcConfig,
}

impl<B: Broker> RpcClientBuilder<B> {
    /// Create a new client builder.
    #[must_use]
    pub fn new(broker: Arc<B>) -> Self {
        Self {
            broker,
            codec: Codec::default(),
            config: RpcConfig::default(),
        }
    }
}

impl<B: Broker, C: Serializer> RpcClientBuilder<B, C> {
    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the exchange requests are published to.
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.config.exchange = exchange.into();
        self
    }

    /// Use a different serializer.
    #[must_use]
    pub fn codec<S: Serializer>(self, codec: S) -> RpcClientBuilder<B, S> {
        RpcClientBuilder {
            broker: self.broker,
            codec,
            config: self.config,
        }
    }

    /// Build the RPC client.
    #[must_use]
    pub fn build(self) -> RpcClient<B, C> {
        let pending = PendingCalls::new();
        let handler = Arc::new(ReplyHandler::new(pending.clone()));

        RpcClient {
            reply_destinations: ReplyDestinations::new(Arc::clone(&self.broker), handler),
            broker: self.broker,
            closed: AtomicBool::new(false),
            codec: self.codec,
            config: self.config,
            pending,
            publish_lock: Mutex::new(()),
        }
    }
}

/// Sends requests over a broker and waits for their correlated replies.
///
/// Owns its pending-call registry and reply destinations; two clients on the
/// same broker never see each other's replies.
pub struct RpcClient<B: Broker, C: Serializer = Codec> {
    broker: Arc<B>,
    closed: AtomicBool,
    codec: C,
    config: RpcConfig,
    pending: PendingCalls,
    publish_lock: Mutex<()>,
    reply_destinations: ReplyDestinations<B>,
}

impl<B: Broker, C: Serializer> Debug for RpcClient<B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("broker", &self.broker)
            .field("codec", &self.codec)
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .field("reply_destinations", &self.reply_destinations)
            .finish_non_exhaustive()
    }
}

impl<B: Broker> RpcClient<B> {
    /// Create a client with the default configuration and JSON payloads.
    #[must_use]
    pub fn new(broker: Arc<B>) -> Self {
        Self::builder(broker).build()
    }

    /// Create a new client builder.
    #[must_use]
    pub fn builder(broker: Arc<B>) -> RpcClientBuilder<B> {
        RpcClientBuilder::new(broker)
    }
}

impl<B: Broker, C: Serializer> RpcClient<B, C> {
    /// Send a request and wait for its typed response.
    ///
    /// `properties` are merged into the outgoing message; the correlation id,
    /// reply destination and expiration are always set by the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no reply arrives in time,
    /// [`Error::Remote`] if the responder failed, [`Error::Transport`] if the
    /// request could not be published and [`Error::Codec`] if either side of
    /// the exchange could not be (de)serialized.
    pub async fn send_request<Req, Resp>(
        &self,
        request: &Req,
        routing_key: &str,
        properties: Option<MessageProperties>,
        options: Option<SendOptions>,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut properties = properties.unwrap_or_default();
        let payload = self.codec.serialize(request, &mut properties)?;

        let reply = self
            .send_raw(payload, routing_key, Some(properties), options)
            .await?;

        let (payload, properties) = reply.into_parts();
        Ok(self.codec.deserialize(&payload, &properties)?)
    }

    /// Send a request with default properties and options.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send_request`].
    pub async fn request<Req, Resp>(&self, routing_key: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send_request(request, routing_key, None, None).await
    }

    /// Send a request with custom options.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send_request`].
    pub async fn request_with_options<Req, Resp>(
        &self,
        routing_key: &str,
        request: &Req,
        options: SendOptions,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send_request(request, routing_key, None, Some(options))
            .await
    }

    /// Send an already encoded payload and return the raw reply.
    ///
    /// A reply flagged as an error envelope is still turned into
    /// [`Error::Remote`].
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send_request`].
    #[instrument(
        skip(self, payload, properties, options),
        fields(scope = self.config.scope.as_deref())
    )]
    pub async fn send_raw(
        &self,
        payload: Bytes,
        routing_key: &str,
        properties: Option<MessageProperties>,
        options: Option<SendOptions>,
    ) -> Result<Envelope> {
        if routing_key.is_empty() {
            return Err(Error::InvalidRoutingKey);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let timeout = options
            .and_then(|o| o.timeout)
            .unwrap_or(self.config.default_timeout);
        let correlation_id = Uuid::new_v4().to_string();

        let properties = properties
            .unwrap_or_default()
            .with_correlation_id(correlation_id.clone())
            .with_expiration(timeout);

        let call = self
            .publish_request(routing_key, &correlation_id, properties, payload)
            .await?;

        let reply = match call.wait(timeout).await {
            Ok(reply) => reply,
            Err(WaitError::TimedOut) => {
                debug!(%correlation_id, "request timed out");
                return Err(Error::Timeout {
                    routing_key: routing_key.to_string(),
                    correlation_id,
                    timeout,
                });
            }
            Err(WaitError::Abandoned) => {
                debug!(%correlation_id, "request abandoned by connection reset");
                return Err(self.interrupted(&correlation_id));
            }
        };

        debug!(%correlation_id, "received reply");

        if has_error_flag(reply.properties()) {
            return Err(Error::Remote(self.decode_remote_error(&reply)));
        }

        Ok(reply)
    }

    async fn publish_request(
        &self,
        routing_key: &str,
        correlation_id: &str,
        mut properties: MessageProperties,
        payload: Bytes,
    ) -> Result<PendingCall> {
        // Brokers sharing one channel must not see interleaved declare/publish calls.
        let _guard = if self.broker.supports_concurrent_publish() {
            None
        } else {
            Some(self.publish_lock.lock().await)
        };

        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let generation = self.reply_destinations.generation();
        let Some(reply_to) = self.reply_destinations.get_or_create(routing_key).await? else {
            return Err(self.interrupted(correlation_id));
        };
        properties.reply_to = Some(reply_to);

        let call = self.pending.register(correlation_id)?;
        // A reset from here on fails the registered call; one that already
        // happened would leave it waiting on a cancelled destination.
        if self.reply_destinations.generation() != generation || self.closed.load(Ordering::Acquire) {
            return Err(self.interrupted(correlation_id));
        }

        self.broker
            .publish(
                &self.config.request_exchange(),
                routing_key,
                properties,
                payload,
            )
            .await
            .map_err(|e| Error::transport(&e))?;

        debug!(%correlation_id, routing_key, "published request");

        Ok(call)
    }

    fn interrupted(&self, correlation_id: &str) -> Error {
        if self.closed.load(Ordering::Acquire) {
            Error::Shutdown
        } else {
            Error::ConnectionReset {
                correlation_id: correlation_id.to_string(),
            }
        }
    }

    fn decode_remote_error(&self, reply: &Envelope) -> RemoteError {
        self.codec
            .deserialize(reply.payload(), reply.properties())
            .unwrap_or_else(|e| {
                debug!("undecodable error envelope: {e}");
                RemoteError::new(
                    "Unknown",
                    String::from_utf8_lossy(reply.payload()).into_owned(),
                )
            })
    }

    /// Fail every in-flight call and forget all reply destinations.
    ///
    /// Call this after the broker connection has been lost. Waiting callers
    /// get [`Error::ConnectionReset`]; the next call on each routing key
    /// declares and subscribes a fresh reply destination.
    pub async fn reset_connection(&self) {
        let cancelled = self.reply_destinations.reset().await;
        let failed = self.pending.fail_all();

        info!(failed, cancelled, "reset rpc client connection state");
    }

    /// Stop the client.
    ///
    /// Cancels reply subscriptions and fails pending calls with
    /// [`Error::Shutdown`]. Calls still creating their reply destination
    /// fail the same way, as do later calls.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reply_destinations.close().await;
        self.pending.fail_all();

        info!("rpc client shut down");
    }

    /// Number of calls waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of reply destinations created.
    #[must_use]
    pub fn reply_destination_count(&self) -> usize {
        self.reply_destinations.len()
    }

    /// The reply destination used for `routing_key`, if created.
    #[must_use]
    pub fn reply_destination(&self, routing_key: &str) -> Option<String> {
        self.reply_destinations.get(routing_key)
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &RpcConfig {
        &self.config
    }
}
