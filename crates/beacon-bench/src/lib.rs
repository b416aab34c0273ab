//! Shared fixtures for the Beacon benchmarks.

use beacon_core::{
    Fanout, Gateway, GatewayConfig, LocalBroker, MemoryPresenceStore, PresenceTracker,
    Subscription,
};
use beacon_protocol::{kinds, Envelope};
use std::sync::Arc;
use std::time::Duration;

/// A chat message envelope with a `size`-byte body.
#[must_use]
pub fn message(size: usize) -> Envelope {
    Envelope::new(kinds::NEW_MESSAGE)
        .with_field("matchId", "m1")
        .with_field("senderId", "u2")
        .with_field("content", "x".repeat(size))
}

/// A fanout with `subscribers` live subscriptions to `channel`.
///
/// Keep the returned subscriptions alive for as long as the channel should exist.
///
/// # Panics
///
/// Panics if `channel` is not a valid channel name.
#[must_use]
pub fn subscribed_fanout(channel: &str, subscribers: usize) -> (Arc<Fanout>, Vec<Subscription>) {
    let fanout = Arc::new(Fanout::with_capacity(1 << 16));
    let subscriptions = (0..subscribers)
        .map(|_| fanout.subscribe(channel).expect("valid channel"))
        .collect();
    (fanout, subscriptions)
}

/// A single-process gateway whose keep-alive never fires during a benchmark.
#[must_use]
pub fn local_gateway() -> (Arc<LocalBroker>, Gateway) {
    let broker = Arc::new(LocalBroker::with_capacity(1 << 16));
    let presence = Arc::new(PresenceTracker::new(Arc::new(MemoryPresenceStore::new())));
    let gateway = Gateway::new(
        broker.clone(),
        presence,
        GatewayConfig {
            keepalive_interval: Duration::from_secs(3600),
            max_rooms: 32,
        },
    );
    (broker, gateway)
}
