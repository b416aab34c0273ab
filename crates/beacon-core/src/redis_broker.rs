//! Redis-backed broker for multi-instance deployments.
//!
//! Publishing issues `PUBLISH <prefix><channel>` on a managed connection.
//! Each process keeps a single listener connection pattern-subscribed to
//! `<prefix>*`; incoming envelopes are dispatched into the local [`Fanout`],
//! so a publish from any instance reaches subscribers on every instance.

use crate::broker::{Broker, BrokerError};
use crate::fanout::{Fanout, Subscription};
use async_trait::async_trait;
use beacon_protocol::{validate_channel_name, Envelope};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// First reconnect delay of the listener.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Upper bound on the listener reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Broker over Redis pub/sub.
pub struct RedisBroker {
    /// Connection used for `PUBLISH`.
    publisher: ConnectionManager,
    /// Local subscriptions fed by the listener.
    fanout: Arc<Fanout>,
    /// Whether the listener currently holds a live pattern subscription.
    listening: Arc<AtomicBool>,
    /// Key prefix shared by every channel.
    prefix: String,
    /// Background listener task.
    listener: JoinHandle<()>,
}

impl RedisBroker {
    /// Start a broker on an existing client and publishing connection.
    ///
    /// The listener connects in the background; until it is established,
    /// [`Broker::subscribe`] returns [`BrokerError::Unavailable`].
    #[must_use]
    pub fn start(
        client: redis::Client,
        publisher: ConnectionManager,
        prefix: impl Into<String>,
        channel_capacity: usize,
    ) -> Self {
        let prefix = prefix.into();
        let fanout = Arc::new(Fanout::with_capacity(channel_capacity));
        let listening = Arc::new(AtomicBool::new(false));

        let listener = tokio::spawn(listen(
            client,
            Arc::clone(&fanout),
            Arc::clone(&listening),
            prefix.clone(),
        ));

        Self {
            publisher,
            fanout,
            listening,
            prefix,
            listener,
        }
    }

    /// Connect to Redis and start a broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the publishing connection
    /// cannot be established.
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        channel_capacity: usize,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self::start(client, publisher, prefix, channel_capacity))
    }

    /// Get the local fanout.
    #[must_use]
    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    fn key(&self, channel: &str) -> String {
        format!("{}{}", self.prefix, channel)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<usize, BrokerError> {
        validate_channel_name(channel).map_err(BrokerError::InvalidChannel)?;
        let payload = serde_json::to_string(envelope)?;

        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(self.key(channel), payload).await?;

        trace!(channel = %channel, receivers, "Published envelope");
        Ok(usize::try_from(receivers).unwrap_or_default())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        if !self.is_healthy() {
            return Err(BrokerError::Unavailable(
                "pub/sub listener is not connected".to_string(),
            ));
        }
        self.fanout.subscribe(channel)
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Keep a pattern subscription alive, reconnecting with capped backoff.
async fn listen(
    client: redis::Client,
    fanout: Arc<Fanout>,
    listening: Arc<AtomicBool>,
    prefix: String,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match run_listener(&client, &fanout, &listening, &prefix).await {
            Ok(()) => warn!("Broker listener stream ended"),
            Err(e) => warn!(error = %e, "Broker listener failed"),
        }

        // A listener that got as far as subscribing starts over from the shortest delay.
        if listening.swap(false, Ordering::AcqRel) {
            backoff = INITIAL_BACKOFF;
        }

        debug!(delay_ms = backoff.as_millis() as u64, "Reconnecting broker listener");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_listener(
    client: &redis::Client,
    fanout: &Fanout,
    listening: &AtomicBool,
    prefix: &str,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{prefix}*")).await?;

    listening.store(true, Ordering::Release);
    info!(pattern = %format!("{prefix}*"), "Broker listener subscribed");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        relay(fanout, prefix, msg.get_channel_name(), msg.get_payload_bytes());
    }

    Ok(())
}

/// Hand one pub/sub message to local subscribers.
///
/// Returns the number of local receivers, or `None` if the message was
/// outside this broker's prefix or not an envelope.
fn relay(fanout: &Fanout, prefix: &str, channel_name: &str, payload: &[u8]) -> Option<usize> {
    let channel = channel_name.strip_prefix(prefix)?;

    match serde_json::from_slice::<Envelope>(payload) {
        Ok(envelope) => Some(fanout.dispatch(channel, Arc::new(envelope))),
        Err(e) => {
            warn!(channel = %channel, error = %e, "Dropping malformed envelope");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_protocol::kinds;

    const PREFIX: &str = "beacon:";

    #[tokio::test]
    async fn test_relay_strips_prefix_and_dispatches() {
        let fanout = Arc::new(Fanout::new());
        let mut subscription = fanout.subscribe("chat-room:m1").unwrap();

        let envelope = Envelope::new(kinds::NEW_MESSAGE).with_field("content", "hi");
        let payload = serde_json::to_vec(&envelope).unwrap();

        assert_eq!(relay(&fanout, PREFIX, "beacon:chat-room:m1", &payload), Some(1));
        assert_eq!(subscription.recv().await.unwrap().as_ref(), &envelope);
    }

    #[test]
    fn test_relay_ignores_foreign_prefix() {
        let fanout = Arc::new(Fanout::new());
        let _subscription = fanout.subscribe("chat-room:m1").unwrap();
        let payload = serde_json::to_vec(&Envelope::ping()).unwrap();

        assert_eq!(relay(&fanout, PREFIX, "other:chat-room:m1", &payload), None);
        assert_eq!(relay(&fanout, PREFIX, "chat-room:m1", &payload), None);
    }

    #[test]
    fn test_relay_drops_malformed_payload() {
        let fanout = Arc::new(Fanout::new());
        let _subscription = fanout.subscribe("chat-room:m1").unwrap();

        assert_eq!(relay(&fanout, PREFIX, "beacon:chat-room:m1", b"not json"), None);
        assert_eq!(relay(&fanout, PREFIX, "beacon:chat-room:m1", b"[1,2]"), None);
    }

    #[test]
    fn test_relay_without_local_subscribers() {
        let fanout = Arc::new(Fanout::new());
        let payload = serde_json::to_vec(&Envelope::ping()).unwrap();

        assert_eq!(relay(&fanout, PREFIX, "beacon:chat-room:m1", &payload), Some(0));
    }

    async fn wait_until_listening(broker: &RedisBroker) {
        for _ in 0..100 {
            if broker.is_healthy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("broker listener never subscribed");
    }

    /// Live-Redis test: `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.
    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn test_publish_reaches_other_instance() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let prefix = format!("beacon-test:{}:", uuid::Uuid::new_v4());

        let sender = RedisBroker::connect(&url, prefix.clone(), 16).await.unwrap();
        let receiver = RedisBroker::connect(&url, prefix, 16).await.unwrap();
        wait_until_listening(&sender).await;
        wait_until_listening(&receiver).await;

        let mut subscription = receiver.subscribe("user-notifications:u1").await.unwrap();
        let notice = Envelope::new("notification").with_field("title", "New like");

        let receivers = sender
            .publish("user-notifications:u1", &notice)
            .await
            .unwrap();
        assert_eq!(receivers, 2);

        let delivered = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.as_ref(), &notice);
        assert_eq!(sender.fanout().subscriber_count("user-notifications:u1"), 0);
    }
}
