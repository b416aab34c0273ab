//! Redis-backed presence and rate-limit stores.
//!
//! Layout, relative to the configured key prefix:
//!
//! ```text
//! presence:{user}   hash    online = 0|1, last_seen = <millis>
//! presence:online   zset    member = user, score = last_seen (online users only)
//! rate:{scope}:{id} string  request count, expiring with its window
//! ```
//!
//! The sweep script derives record keys from the members of the online set
//! rather than receiving them as `KEYS`, so it needs every presence key on one
//! node: standalone or replicated Redis, not Redis Cluster.

use crate::presence::{PresenceRecord, PresenceStore};
use crate::ratelimit::{RateHit, RateStore};
use crate::store::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Flips every online user scored below the cutoff, atomically. Members whose
/// record already expired are only removed from the online set.
const SWEEP_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local swept = 0
for _, id in ipairs(ids) do
  local key = ARGV[2] .. id
  if redis.call('EXISTS', key) == 1 then
    redis.call('HSET', key, 'online', '0')
    swept = swept + 1
  end
  redis.call('ZREM', KEYS[1], id)
end
return swept
";

/// Counts a hit, starting the window on the first one.
const HIT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// Presence records in Redis.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    prefix: String,
    record_ttl: Duration,
    sweep: Script,
}

impl RedisPresenceStore {
    /// Create a store. Records expire `record_ttl` after their last write.
    #[must_use]
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, record_ttl: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            record_ttl,
            sweep: Script::new(SWEEP_SCRIPT),
        }
    }

    fn record_prefix(&self) -> String {
        format!("{}presence:", self.prefix)
    }

    fn record_key(&self, user_id: &str) -> String {
        format!("{}{}", self.record_prefix(), user_id)
    }

    fn online_key(&self) -> String {
        format!("{}presence:online", self.prefix)
    }

    async fn write(&self, user_id: &str, is_online: bool, now: u64) -> Result<(), StoreError> {
        let key = self.record_key(user_id);
        let online_flag = if is_online { "1" } else { "0" };
        let last_seen = now.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&key, &[("online", online_flag), ("last_seen", last_seen.as_str())])
            .ignore()
            .expire(&key, self.record_ttl.as_secs() as i64)
            .ignore();
        if is_online {
            pipe.zadd(self.online_key(), user_id, now).ignore();
        } else {
            pipe.zrem(self.online_key(), user_id).ignore();
        }

        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, user_id: &str, now: u64) -> Result<(), StoreError> {
        self.write(user_id, true, now).await
    }

    async fn set_offline(&self, user_id: &str, now: u64) -> Result<(), StoreError> {
        self.write(user_id, false, now).await
    }

    async fn get_many(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>, StoreError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in user_ids {
            pipe.hgetall(self.record_key(id));
        }

        let mut conn = self.conn.clone();
        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        Ok(parse_rows(&self.record_prefix(), user_ids, rows))
    }

    async fn sweep_stale(&self, cutoff: u64) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let swept: i64 = self
            .sweep
            .key(self.online_key())
            .arg(format!("({cutoff}"))
            .arg(self.record_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(usize::try_from(swept).unwrap_or_default())
    }
}

/// Parse fetched rows, skipping missing users and logging unreadable records.
fn parse_rows(
    record_prefix: &str,
    user_ids: &[String],
    rows: Vec<HashMap<String, String>>,
) -> Vec<PresenceRecord> {
    let mut records = Vec::with_capacity(rows.len());
    for (id, row) in user_ids.iter().zip(rows) {
        if row.is_empty() {
            continue;
        }
        match parse_record(&format!("{record_prefix}{id}"), id, &row) {
            Ok(record) => records.push(record),
            Err(e) => warn!(user = %id, error = %e, "Skipping unreadable presence record"),
        }
    }
    records
}

fn parse_record(
    key: &str,
    user_id: &str,
    row: &HashMap<String, String>,
) -> Result<PresenceRecord, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let is_online = match row.get("online").map(String::as_str) {
        Some("1") => true,
        Some("0") | None => false,
        Some(_) => return Err(corrupt("online flag is not 0 or 1")),
    };
    let last_seen = row
        .get("last_seen")
        .ok_or_else(|| corrupt("missing last_seen"))?
        .parse()
        .map_err(|_| corrupt("last_seen is not a timestamp"))?;

    Ok(PresenceRecord {
        user_id: user_id.to_string(),
        is_online,
        last_seen,
    })
}

/// Rate-limit counters in Redis.
#[derive(Clone)]
pub struct RedisRateStore {
    conn: ConnectionManager,
    prefix: String,
    hit: Script,
}

impl RedisRateStore {
    /// Create a store.
    #[must_use]
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            hit: Script::new(HIT_SCRIPT),
        }
    }
}

#[async_trait]
impl RateStore for RedisRateStore {
    async fn hit(&self, key: &str, window: Duration, _now: u64) -> Result<RateHit, StoreError> {
        let window_ms = window.as_millis().max(1) as u64;

        let mut conn = self.conn.clone();
        let (count, ttl): (u64, i64) = self
            .hit
            .key(format!("{}rate:{}", self.prefix, key))
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(RateHit {
            count,
            reset_in_ms: u64::try_from(ttl).unwrap_or(window_ms),
        })
    }
}
