//! Publish/subscribe broker client.
//!
//! Publishers call [`Broker::publish`] after persisting a business event;
//! streaming sessions call [`Broker::subscribe`] and drain the returned
//! [`Subscription`]. Delivery is at-most-once and best-effort.

use crate::fanout::{Fanout, Subscription};
use async_trait::async_trait;
use beacon_protocol::{validate_channel_name, Envelope};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// The broker service cannot be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The envelope could not be serialized.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The broker service failed a command.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A publish/subscribe broker reachable from every server instance.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an envelope to every current subscriber of a channel.
    ///
    /// Returns the number of receivers reached, as reported by the broker.
    /// The count is informational; delivery is never confirmed.
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<usize, BrokerError>;

    /// Subscribe to a channel.
    ///
    /// Only envelopes published after this call returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError>;

    /// Get the broker name (e.g., "local", "redis").
    fn name(&self) -> &'static str;

    /// Check if the broker can currently accept subscriptions.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Single-process broker.
///
/// Suitable when only one server instance runs, and in tests.
#[derive(Debug, Default)]
pub struct LocalBroker {
    fanout: Arc<Fanout>,
}

impl LocalBroker {
    /// Create a local broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a local broker with a specific per-channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fanout: Arc::new(Fanout::with_capacity(capacity)),
        }
    }

    /// Get the underlying fanout.
    #[must_use]
    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<usize, BrokerError> {
        validate_channel_name(channel).map_err(BrokerError::InvalidChannel)?;
        Ok(self.fanout.dispatch(channel, Arc::new(envelope.clone())))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        self.fanout.subscribe(channel)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Error type returned by subscription handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Keeps a callback subscription alive. Dropping it unsubscribes.
#[derive(Debug)]
pub struct HandlerGuard {
    channel: String,
    task: Option<JoinHandle<()>>,
}

impl HandlerGuard {
    /// Get the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop invoking the handler. Calling this more than once is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(channel = %self.channel, "Handler unsubscribed");
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Drive a subscription with a callback.
///
/// Each invocation runs in its own error boundary: a handler that returns an
/// error or panics is logged and keeps receiving subsequent envelopes, and
/// never affects other subscribers of the same channel.
pub fn spawn_handler<F>(mut subscription: Subscription, handler: F) -> HandlerGuard
where
    F: Fn(Arc<Envelope>) -> Result<(), HandlerError> + Send + 'static,
{
    let channel = subscription.channel().to_string();
    let task_channel = channel.clone();

    let task = tokio::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(channel = %task_channel, error = %e, "Subscription handler failed");
                }
                Err(_) => {
                    error!(channel = %task_channel, "Subscription handler panicked");
                }
            }
        }
    });

    HandlerGuard {
        channel,
        task: Some(task),
    }
}
