//! Presence tracking for Beacon.
//!
//! A user is online while heartbeats keep arriving. Every [`PresenceTracker::touch`]
//! (re)arms a per-user timer that marks the user offline once the offline
//! threshold passes without another touch. Timers live in process memory, so
//! [`PresenceTracker::sweep_stale`] corrects records left online by a process
//! that died before its timers fired.
//!
//! Every store call is bounded by a time budget, so a stalled store surfaces
//! as [`StoreError::Timeout`] instead of holding up the caller.

use crate::store::{bounded, StoreError, DEFAULT_STORE_TIMEOUT};
use async_trait::async_trait;
use beacon_protocol::now_millis;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Reference offline threshold.
pub const DEFAULT_OFFLINE_THRESHOLD: Duration = Duration::from_secs(300);

/// Stored presence of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// User identifier.
    pub user_id: String,
    /// Whether the user is currently online.
    pub is_online: bool,
    /// Last activity, in milliseconds since the Unix epoch.
    pub last_seen: u64,
}

/// Presence as reported to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    /// Whether the user is currently online.
    pub is_online: bool,
    /// Last activity, or `None` for users never seen.
    pub last_seen: Option<u64>,
}

impl PresenceStatus {
    /// Status of a user with no record.
    pub const UNKNOWN: Self = Self {
        is_online: false,
        last_seen: None,
    };
}

impl From<&PresenceRecord> for PresenceStatus {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            is_online: record.is_online,
            last_seen: Some(record.last_seen),
        }
    }
}

/// Shared storage for presence records.
///
/// Implementations must be safe under concurrent writes for the same user;
/// the last completed write wins.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Mark a user online as of `now`.
    async fn set_online(&self, user_id: &str, now: u64) -> Result<(), StoreError>;

    /// Mark a user offline as of `now`.
    async fn set_offline(&self, user_id: &str, now: u64) -> Result<(), StoreError>;

    /// Read the records of the given users. Unknown users are omitted.
    async fn get_many(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>, StoreError>;

    /// Flip every online record last seen before `cutoff` to offline.
    ///
    /// Returns the number of records changed.
    async fn sweep_stale(&self, cutoff: u64) -> Result<usize, StoreError>;
}

/// In-process presence store.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    records: DashMap<String, PresenceRecord>,
}

impl MemoryPresenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn write(&self, user_id: &str, is_online: bool, now: u64) {
        self.records.insert(
            user_id.to_string(),
            PresenceRecord {
                user_id: user_id.to_string(),
                is_online,
                last_seen: now,
            },
        );
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, user_id: &str, now: u64) -> Result<(), StoreError> {
        self.write(user_id, true, now);
        Ok(())
    }

    async fn set_offline(&self, user_id: &str, now: u64) -> Result<(), StoreError> {
        self.write(user_id, false, now);
        Ok(())
    }

    async fn get_many(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>, StoreError> {
        Ok(user_ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.clone()))
            .collect())
    }

    async fn sweep_stale(&self, cutoff: u64) -> Result<usize, StoreError> {
        let mut swept = 0;
        for mut record in self.records.iter_mut() {
            if record.is_online && record.last_seen < cutoff {
                record.is_online = false;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

/// A pending "mark offline" timer.
struct PendingExpiry {
    generation: u64,
    handle: AbortHandle,
}

/// Online/offline tracking with debounced heartbeat expiry.
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    timers: Arc<DashMap<String, PendingExpiry>>,
    generation: AtomicU64,
    offline_after: Duration,
    store_timeout: Duration,
}

impl PresenceTracker {
    /// Create a tracker with the reference offline threshold.
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self::with_threshold(store, DEFAULT_OFFLINE_THRESHOLD)
    }

    /// Create a tracker with a specific offline threshold.
    #[must_use]
    pub fn with_threshold(store: Arc<dyn PresenceStore>, offline_after: Duration) -> Self {
        Self {
            store,
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            offline_after,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Set how long a store call may take before it fails.
    #[must_use]
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Get the offline threshold.
    #[must_use]
    pub fn offline_threshold(&self) -> Duration {
        self.offline_after
    }

    /// Get the number of users with an armed expiry timer.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Mark a user online now and re-arm their expiry timer.
    ///
    /// The timer is armed even if the store write fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn touch(&self, user_id: &str) -> Result<(), StoreError> {
        self.arm_expiry(user_id);
        bounded(self.store_timeout, self.store.set_online(user_id, now_millis())).await
    }

    /// Mark a user offline now and cancel their expiry timer.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn mark_offline(&self, user_id: &str) -> Result<(), StoreError> {
        if let Some((_, pending)) = self.timers.remove(user_id) {
            pending.handle.abort();
        }
        bounded(self.store_timeout, self.store.set_offline(user_id, now_millis())).await
    }

    /// Read presence for a batch of users.
    ///
    /// Every requested user appears in the result; users never seen are
    /// reported offline with no last-seen time.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_many(
        &self,
        user_ids: &[String],
    ) -> Result<HashMap<String, PresenceStatus>, StoreError> {
        let records = bounded(self.store_timeout, self.store.get_many(user_ids)).await?;

        let mut statuses: HashMap<String, PresenceStatus> = user_ids
            .iter()
            .map(|id| (id.clone(), PresenceStatus::UNKNOWN))
            .collect();
        for record in &records {
            statuses.insert(record.user_id.clone(), PresenceStatus::from(record));
        }

        Ok(statuses)
    }

    /// Mark offline every online user not seen within `threshold`.
    ///
    /// Returns the number of users corrected.
    ///
    /// # Errors
    ///
    /// Returns an error if the store sweep fails.
    pub async fn sweep_stale(&self, threshold: Duration) -> Result<usize, StoreError> {
        let cutoff = now_millis().saturating_sub(threshold.as_millis() as u64);
        let swept = bounded(self.store_timeout, self.store.sweep_stale(cutoff)).await?;
        if swept > 0 {
            debug!(swept, "Presence: swept stale users");
        }
        Ok(swept)
    }

    fn arm_expiry(&self, user_id: &str) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // The shard stays locked until the new timer is recorded, so the timer
        // can never observe the map before its own entry is in place.
        let slot = self.timers.entry(user_id.to_string());

        let store = Arc::clone(&self.store);
        let timers = Arc::clone(&self.timers);
        let user = user_id.to_string();
        let offline_after = self.offline_after;
        let store_timeout = self.store_timeout;

        let task = tokio::spawn(async move {
            tokio::time::sleep(offline_after).await;

            if timers
                .remove_if(&user, |_, pending| pending.generation == generation)
                .is_none()
            {
                return;
            }

            match bounded(store_timeout, store.set_offline(&user, now_millis())).await {
                Ok(()) => debug!(user = %user, "Presence: heartbeat expired"),
                Err(e) => warn!(user = %user, error = %e, "Presence: failed to expire user"),
            }
        });

        let pending = PendingExpiry {
            generation,
            handle: task.abort_handle(),
        };
        match slot {
            Entry::Occupied(mut entry) => entry.insert(pending).handle.abort(),
            Entry::Vacant(entry) => {
                entry.insert(pending);
            }
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        for pending in self.timers.iter() {
            pending.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(300);

    fn tracker() -> (Arc<MemoryPresenceStore>, PresenceTracker) {
        let store = Arc::new(MemoryPresenceStore::new());
        let tracker = PresenceTracker::with_threshold(store.clone(), THRESHOLD);
        (store, tracker)
    }

    async fn is_online(tracker: &PresenceTracker, user_id: &str) -> bool {
        tracker.get_many(&[user_id.to_string()]).await.unwrap()[user_id].is_online
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_user_online() {
        let (_, tracker) = tracker();

        for _ in 0..5 {
            tracker.touch("u1").await.unwrap();
            tokio::time::sleep(THRESHOLD - Duration::from_secs(1)).await;
            settle().await;
            assert!(is_online(&tracker, "u1").await);
        }
        assert_eq!(tracker.pending_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_expires_after_threshold() {
        let (_, tracker) = tracker();

        tracker.touch("u1").await.unwrap();
        tokio::time::sleep(THRESHOLD + Duration::from_secs(1)).await;
        settle().await;

        assert!(!is_online(&tracker, "u1").await);
        assert_eq!(tracker.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_offline_cancels_timer() {
        let (_, tracker) = tracker();

        tracker.touch("u1").await.unwrap();
        tracker.mark_offline("u1").await.unwrap();
        assert!(!is_online(&tracker, "u1").await);
        assert_eq!(tracker.pending_timers(), 0);

        // A later touch is not undone by the cancelled timer
        tokio::time::sleep(Duration::from_secs(200)).await;
        tracker.touch("u1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(200)).await;
        settle().await;
        assert!(is_online(&tracker, "u1").await);
    }

    #[tokio::test]
    async fn test_get_many_reports_unknown_users() {
        let (_, tracker) = tracker();
        tracker.touch("u1").await.unwrap();

        let statuses = tracker
            .get_many(&["u1".to_string(), "ghost".to_string()])
            .await
            .unwrap();

        assert!(statuses["u1"].is_online);
        assert!(statuses["u1"].last_seen.is_some());
        assert_eq!(statuses["ghost"], PresenceStatus::UNKNOWN);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (store, tracker) = tracker();
        let now = now_millis();

        store.set_online("stale", now - 600_000).await.unwrap();
        store.set_online("fresh", now).await.unwrap();
        store.set_offline("gone", now - 600_000).await.unwrap();

        assert_eq!(tracker.sweep_stale(THRESHOLD).await.unwrap(), 1);
        let after_first = store.get_many(&["stale".to_string()]).await.unwrap();

        assert_eq!(tracker.sweep_stale(THRESHOLD).await.unwrap(), 0);
        let after_second = store.get_many(&["stale".to_string()]).await.unwrap();

        assert_eq!(after_first, after_second);
        assert!(!after_first[0].is_online);
        assert_eq!(after_first[0].last_seen, now - 600_000);
        assert!(is_online(&tracker, "fresh").await);
    }

    struct StalledStore;

    #[async_trait]
    impl PresenceStore for StalledStore {
        async fn set_online(&self, _: &str, _: u64) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn set_offline(&self, _: &str, _: u64) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn get_many(&self, _: &[String]) -> Result<Vec<PresenceRecord>, StoreError> {
            std::future::pending().await
        }

        async fn sweep_stale(&self, _: u64) -> Result<usize, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out() {
        let budget = Duration::from_millis(100);
        let tracker = PresenceTracker::with_threshold(Arc::new(StalledStore), THRESHOLD)
            .with_store_timeout(budget);

        assert!(matches!(tracker.touch("u1").await, Err(StoreError::Timeout(_))));
        assert!(matches!(tracker.mark_offline("u1").await, Err(StoreError::Timeout(_))));
        assert!(matches!(
            tracker.get_many(&["u1".to_string()]).await,
            Err(StoreError::Timeout(_))
        ));
        assert!(matches!(
            tracker.sweep_stale(THRESHOLD).await,
            Err(StoreError::Timeout(_))
        ));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = PresenceStatus {
            is_online: true,
            last_seen: Some(7),
        };
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"isOnline":true,"lastSeen":7}"#
        );
    }
}
