//! In-flight calls keyed by correlation id.

use std::sync::Arc;
use std::time::Duration;

use courier_messaging::Envelope;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};

type Waiters = DashMap<String, oneshot::Sender<Envelope>>;

/// Why a [`PendingCall`] stopped waiting without a reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline elapsed.
    #[error("timed out")]
    TimedOut,

    /// The registry dropped the call, e.g. on connection reset.
    #[error("abandoned")]
    Abandoned,
}

/// The set of calls waiting for a reply.
///
/// Each correlation id maps to the sending half of a oneshot channel. A
/// reply and a retraction race for the same map entry; whichever removes it
/// first wins and the other finds nothing.
#[derive(Clone, Debug, Default)]
pub struct PendingCalls {
    waiters: Arc<Waiters>,
}

impl PendingCalls {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call. Must happen before the request is published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateCorrelationId`] if the id is already in flight.
    pub fn register(&self, correlation_id: impl Into<String>) -> Result<PendingCall> {
        let correlation_id = correlation_id.into();
        let (sender, receiver) = oneshot::channel();

        match self.waiters.entry(correlation_id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateCorrelationId(correlation_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(sender);
                debug!(%correlation_id, "registered pending call");
                Ok(PendingCall {
                    correlation_id,
                    receiver,
                    waiters: Arc::clone(&self.waiters),
                })
            }
        }
    }

    /// Hands `envelope` to the call waiting on `correlation_id`.
    ///
    /// Returns `false` if no call is waiting or the waiter has already gone;
    /// the envelope is dropped in both cases.
    pub fn resolve(&self, correlation_id: &str, envelope: Envelope) -> bool {
        let Some((_, sender)) = self.waiters.remove(correlation_id) else {
            debug!(%correlation_id, "no pending call, dropping reply");
            return false;
        };

        if sender.send(envelope).is_err() {
            debug!(%correlation_id, "waiter already gone, reply orphaned");
            return false;
        }

        true
    }

    /// Removes the call waiting on `correlation_id`.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.waiters.remove(correlation_id).is_some()
    }

    /// Drops every waiting call. Each waiter sees [`WaitError::Abandoned`].
    pub fn fail_all(&self) -> usize {
        let ids: Vec<String> = self.waiters.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.waiters.remove(id.as_str()).is_some())
            .count()
    }

    /// Whether a call is waiting on `correlation_id`.
    #[must_use]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.waiters.contains_key(correlation_id)
    }

    /// Number of calls waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no call is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// A registered call. Dropping it retracts the registration.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: String,
    receiver: oneshot::Receiver<Envelope>,
    waiters: Arc<Waiters>,
}

impl PendingCall {
    /// The correlation id this call waits on.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the reply, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] if the deadline elapses and
    /// [`WaitError::Abandoned`] if the registry dropped the call.
    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope, WaitError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(WaitError::Abandoned),
            Err(_) => {
                self.retract();
                if self.receiver.try_recv().is_ok() {
                    debug!(correlation_id = %self.correlation_id, "discarding reply that raced the deadline");
                }
                Err(WaitError::TimedOut)
            }
        }
    }

    fn retract(&self) {
        if self.waiters.remove(&self.correlation_id).is_some() {
            debug!(correlation_id = %self.correlation_id, "retracted pending call");
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.retract();
    }
}
