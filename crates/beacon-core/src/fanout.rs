//! Process-local fan-out of envelopes to subscriptions.
//!
//! The fanout is the only channel registry in the system: a channel exists
//! while at least one local subscription is attached to it and disappears
//! with the last one. Every broker implementation delivers through it.

use crate::broker::BrokerError;
use beacon_protocol::{validate_channel_name, Envelope};
use dashmap::DashMap;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace, warn};

/// Default per-channel buffer capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Registry of live channels in this process.
#[derive(Debug)]
pub struct Fanout {
    /// Broadcast senders indexed by channel name.
    channels: DashMap<String, broadcast::Sender<Arc<Envelope>>>,
    /// Per-channel buffer capacity.
    capacity: usize,
}

impl Fanout {
    /// Create a fanout with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a fanout with a specific channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Attach a new subscription to a channel, creating the channel if needed.
    ///
    /// Only envelopes dispatched after this call are delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid.
    pub fn subscribe(self: &Arc<Self>, channel: &str) -> Result<Subscription, BrokerError> {
        validate_channel_name(channel).map_err(BrokerError::InvalidChannel)?;

        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel, "Creating channel");
                broadcast::channel(self.capacity).0
            })
            .subscribe();

        debug!(channel = %channel, "Subscribed");

        Ok(Subscription {
            channel: channel.to_string(),
            stream: Some(BroadcastStream::new(receiver)),
            fanout: Arc::clone(self),
        })
    }

    /// Deliver an envelope to every local subscription of a channel.
    ///
    /// Returns the number of subscriptions reached. Dispatching to a channel
    /// with no subscriptions drops the envelope.
    pub fn dispatch(&self, channel: &str, envelope: Arc<Envelope>) -> usize {
        match self.channels.get(channel) {
            Some(sender) => {
                let count = sender.send(envelope).unwrap_or_default();
                trace!(channel = %channel, recipients = count, "Dispatched envelope");
                count
            }
            None => {
                trace!(channel = %channel, "No local subscribers");
                0
            }
        }
    }

    /// Check if a channel currently exists.
    #[must_use]
    pub fn channel_exists(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Get the number of live channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Get the number of subscriptions on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Get all live channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop a channel once its last subscription is gone.
    fn release(&self, channel: &str) {
        if self
            .channels
            .remove_if(channel, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            debug!(channel = %channel, "Deleted empty channel");
        }
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

/// A live binding between one consumer and one channel.
///
/// Envelopes are received by polling the subscription as a stream (or with
/// [`Subscription::recv`]). Dropping the subscription unsubscribes it.
pub struct Subscription {
    channel: String,
    stream: Option<BroadcastStream<Arc<Envelope>>>,
    fanout: Arc<Fanout>,
}

impl Subscription {
    /// Get the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Check if the subscription is still attached.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Receive the next envelope.
    ///
    /// Returns `None` once the subscription has been released.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        futures_util::StreamExt::next(self).await
    }

    /// Detach from the channel. Calling this more than once is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            self.fanout.release(&self.channel);
            debug!(channel = %self.channel, "Unsubscribed");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Stream for Subscription {
    type Item = Arc<Envelope>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(stream) = this.stream.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(Pin::new(stream).poll_next(cx)) {
                Some(Ok(envelope)) => return Poll::Ready(Some(envelope)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(channel = %this.channel, skipped, "Subscriber lagged, envelopes dropped");
                }
                None => {
                    this.unsubscribe();
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::kinds;

    fn envelope(text: &str) -> Arc<Envelope> {
        Arc::new(Envelope::new(kinds::NEW_MESSAGE).with_field("content", text))
    }

    #[test]
    fn test_channel_lifecycle() {
        let fanout = Arc::new(Fanout::new());

        let mut sub = fanout.subscribe("chat-room:a").unwrap();
        assert!(fanout.channel_exists("chat-room:a"));
        assert_eq!(fanout.subscriber_count("chat-room:a"), 1);

        sub.unsubscribe();
        assert!(!fanout.channel_exists("chat-room:a"));
        assert!(!sub.is_active());

        // Second call is a no-op
        sub.unsubscribe();
        assert_eq!(fanout.channel_count(), 0);
    }

    #[test]
    fn test_drop_releases_channel() {
        let fanout = Arc::new(Fanout::new());

        let first = fanout.subscribe("room").unwrap();
        let second = fanout.subscribe("room").unwrap();
        assert_eq!(fanout.subscriber_count("room"), 2);

        drop(first);
        assert!(fanout.channel_exists("room"));

        drop(second);
        assert!(!fanout.channel_exists("room"));
    }

    #[test]
    fn test_invalid_channel() {
        let fanout = Arc::new(Fanout::new());

        assert!(matches!(
            fanout.subscribe(""),
            Err(BrokerError::InvalidChannel(_))
        ));
        assert!(fanout.subscribe("$system").is_err());
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_subscriber() {
        let fanout = Arc::new(Fanout::new());

        let mut a = fanout.subscribe("room").unwrap();
        let mut b = fanout.subscribe("room").unwrap();

        assert_eq!(fanout.dispatch("room", envelope("hello")), 2);

        assert_eq!(a.recv().await.unwrap().str_field("content"), Some("hello"));
        assert_eq!(b.recv().await.unwrap().str_field("content"), Some("hello"));
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let fanout = Arc::new(Fanout::new());
        let _early = fanout.subscribe("room").unwrap();

        fanout.dispatch("room", envelope("before"));
        let mut late = fanout.subscribe("room").unwrap();
        fanout.dispatch("room", envelope("after"));

        assert_eq!(late.recv().await.unwrap().str_field("content"), Some("after"));
    }

    #[tokio::test]
    async fn test_no_delivery_after_unsubscribe() {
        let fanout = Arc::new(Fanout::new());
        let _other = fanout.subscribe("room").unwrap();
        let mut sub = fanout.subscribe("room").unwrap();

        sub.unsubscribe();
        assert_eq!(fanout.dispatch("room", envelope("late")), 1);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_ahead() {
        let fanout = Arc::new(Fanout::with_capacity(2));
        let mut sub = fanout.subscribe("room").unwrap();

        for i in 0..5 {
            fanout.dispatch("room", envelope(&i.to_string()));
        }

        // The oldest envelopes were overwritten; delivery resumes with what is buffered.
        assert_eq!(sub.recv().await.unwrap().str_field("content"), Some("3"));
        assert_eq!(sub.recv().await.unwrap().str_field("content"), Some("4"));
    }
}
