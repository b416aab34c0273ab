//! Request-rate governor.
//!
//! Counts requests per `scope:identity` in windows of a fixed length: the
//! first request after a window has elapsed starts a new one. Counters live
//! in the distributed store when one is configured; any store failure, or a
//! store call that outlives its time budget, is logged and the request is
//! re-evaluated against an in-process store, so an infrastructure outage
//! never turns into rejected or stalled traffic.

use crate::store::{bounded, StoreError, DEFAULT_STORE_TIMEOUT};
use async_trait::async_trait;
use beacon_protocol::now_millis;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Number of hits between lazy evictions of elapsed windows.
const EVICTION_INTERVAL: u64 = 1024;

/// A request quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuota {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateQuota {
    /// Create a quota.
    #[must_use]
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    /// Get the window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests allowed per window.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Time until the current window ends, in milliseconds.
    pub reset_in_ms: u64,
}

impl RateDecision {
    /// Seconds a rejected client should wait, rounded up, at least one.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_in_ms.div_ceil(1000).max(1)
    }
}

/// Counter state after recording one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateHit {
    /// Hits in the current window, including this one.
    pub count: u64,
    /// Time until the current window ends, in milliseconds.
    pub reset_in_ms: u64,
}

/// Storage for rate-limit counters.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Record one hit for `key` at `now` and return the window's state.
    async fn hit(&self, key: &str, window: Duration, now: u64) -> Result<RateHit, StoreError>;
}

#[derive(Debug)]
struct Bucket {
    window_start: u64,
    window_ms: u64,
    count: u64,
}

impl Bucket {
    fn is_elapsed(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) >= self.window_ms
    }
}

/// In-process rate-limit counters.
#[derive(Debug, Default)]
pub struct MemoryRateStore {
    buckets: DashMap<String, Bucket>,
    hits: AtomicU64,
}

impl MemoryRateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of live buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Record one hit at `now`.
    pub fn hit_at(&self, key: &str, window: Duration, now: u64) -> RateHit {
        let window_ms = window.as_millis().max(1) as u64;

        let hit = {
            let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
                window_start: now,
                window_ms,
                count: 0,
            });

            if bucket.is_elapsed(now) || bucket.window_ms != window_ms {
                bucket.window_start = now;
                bucket.window_ms = window_ms;
                bucket.count = 0;
            }
            bucket.count += 1;

            RateHit {
                count: bucket.count,
                reset_in_ms: (bucket.window_start + window_ms).saturating_sub(now),
            }
        };

        if self.hits.fetch_add(1, Ordering::Relaxed) % EVICTION_INTERVAL == EVICTION_INTERVAL - 1 {
            self.evict_elapsed(now);
        }

        hit
    }

    /// Drop every bucket whose window has elapsed.
    pub fn evict_elapsed(&self, now: u64) {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_elapsed(now));
        trace!(evicted = before.saturating_sub(self.buckets.len()), "Evicted rate buckets");
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn hit(&self, key: &str, window: Duration, now: u64) -> Result<RateHit, StoreError> {
        Ok(self.hit_at(key, window, now))
    }
}

/// Sliding-window rate limiter with in-process fallback.
pub struct RateGovernor {
    store: Option<Arc<dyn RateStore>>,
    store_timeout: Duration,
    fallback: MemoryRateStore,
}

impl RateGovernor {
    /// Create a governor that only counts in process.
    #[must_use]
    pub fn local() -> Self {
        Self {
            store: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            fallback: MemoryRateStore::new(),
        }
    }

    /// Create a governor backed by a shared store.
    #[must_use]
    pub fn with_store(store: Arc<dyn RateStore>) -> Self {
        Self {
            store: Some(store),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            fallback: MemoryRateStore::new(),
        }
    }

    /// Set how long a shared-store call may take before counting locally.
    #[must_use]
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Get the shared-store time budget.
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Check whether a shared store is configured.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.store.is_some()
    }

    /// Count a request and decide whether it may proceed.
    pub async fn limit(
        &self,
        identity: &str,
        scope: &str,
        max_requests: u32,
        window_secs: u64,
    ) -> RateDecision {
        self.limit_at(identity, scope, max_requests, window_secs, now_millis())
            .await
    }

    /// Count a request against a quota.
    pub async fn check(&self, identity: &str, scope: &str, quota: RateQuota) -> RateDecision {
        self.limit(identity, scope, quota.max_requests, quota.window_secs)
            .await
    }

    /// Count a request at an explicit time.
    pub async fn limit_at(
        &self,
        identity: &str,
        scope: &str,
        max_requests: u32,
        window_secs: u64,
        now: u64,
    ) -> RateDecision {
        let key = format!("{scope}:{identity}");
        let window = Duration::from_secs(window_secs);

        let hit = match &self.store {
            Some(store) => match bounded(self.store_timeout, store.hit(&key, window, now)).await {
                Ok(hit) => hit,
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Rate store unavailable, counting locally");
                    self.fallback.hit_at(&key, window, now)
                }
            },
            None => self.fallback.hit_at(&key, window, now),
        };

        let decision = RateDecision {
            allowed: hit.count <= u64::from(max_requests),
            limit: max_requests,
            remaining: u32::try_from(u64::from(max_requests).saturating_sub(hit.count))
                .unwrap_or(0),
            reset_in_ms: hit.reset_in_ms,
        };

        trace!(
            scope = %scope,
            count = hit.count,
            allowed = decision.allowed,
            "Rate check"
        );

        decision
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::local()
    }
}
