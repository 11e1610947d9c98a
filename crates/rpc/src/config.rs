//! RPC naming and timeout configuration.

use std::time::Duration;

/// Exchange requests are published to unless configured otherwise.
pub const DEFAULT_REQUEST_EXCHANGE: &str = "rpc";

/// Per-call timeout used when a call does not name one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration shared by [`RpcClient`](crate::RpcClient) and
/// [`RpcServer`](crate::RpcServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// Logical scope of this application, recorded as `scope` on client call
    /// and server consumer spans.
    pub scope: Option<String>,
    /// Unprefixed exchange requests are published to and responders bind to.
    pub exchange: String,
    /// Prefix applied to exchange names.
    pub exchange_name_prefix: String,
    /// Prefix applied to responder destination names.
    pub queue_name_prefix: String,
    /// Default per-call timeout.
    pub default_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            scope: None,
            exchange: DEFAULT_REQUEST_EXCHANGE.to_string(),
            exchange_name_prefix: String::new(),
            queue_name_prefix: String::new(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RpcConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scope.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the request exchange.
    #[must_use]
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set the exchange name prefix.
    #[must_use]
    pub fn exchange_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.exchange_name_prefix = prefix.into();
        self
    }

    /// Set the destination name prefix.
    #[must_use]
    pub fn queue_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_name_prefix = prefix.into();
        self
    }

    /// Set the default per-call timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Applies the exchange prefix to `name`.
    ///
    /// The nameless default exchange is never prefixed.
    #[must_use]
    pub fn exchange_name(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }
        format!("{}{name}", self.exchange_name_prefix)
    }

    /// Applies the destination prefix to `name`.
    #[must_use]
    pub fn queue_name(&self, name: &str) -> String {
        format!("{}{name}", self.queue_name_prefix)
    }

    /// The prefixed request exchange.
    #[must_use]
    pub fn request_exchange(&self) -> String {
        self.exchange_name(&self.exchange)
    }
}
