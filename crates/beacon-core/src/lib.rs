//! # beacon-core
//!
//! The realtime delivery layer of Beacon.
//!
//! This crate provides the building blocks behind the streaming endpoint:
//!
//! - **Broker** - Cross-process publish/subscribe over Redis, or in-process
//! - **Presence** - Online/offline tracking with debounced heartbeat expiry
//! - **Rate Governor** - Sliding-window request limiting that fails open
//! - **Gateway** - One long-lived session per client multiplexing its channels
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Publisher  │────▶│   Broker    │────▶│   Fanout    │
//! └─────────────┘     └─────────────┘     └──────┬──────┘
//!                                                │
//!                     ┌─────────────┐     ┌──────▼──────┐
//!                     │  Presence   │◀────│   Session   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod broker;
pub mod fanout;
pub mod gateway;
pub mod presence;
pub mod ratelimit;
pub mod redis_broker;
pub mod redis_store;
pub mod store;

pub use broker::{spawn_handler, Broker, BrokerError, HandlerGuard, LocalBroker};
pub use fanout::{Fanout, Subscription};
pub use gateway::{Gateway, GatewayConfig, GatewayError, Session};
pub use presence::{
    MemoryPresenceStore, PresenceRecord, PresenceStatus, PresenceStore, PresenceTracker,
};
pub use ratelimit::{MemoryRateStore, RateDecision, RateGovernor, RateHit, RateQuota, RateStore};
pub use redis_broker::RedisBroker;
pub use redis_store::{RedisPresenceStore, RedisRateStore};
pub use store::{StoreError, DEFAULT_STORE_TIMEOUT};
