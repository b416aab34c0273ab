//! Errors shared by the presence and rate-limit backing stores.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default budget for one store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Backing store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The distributed store rejected or failed a command.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer in time.
    #[error("Store timed out after {0:?}")]
    Timeout(Duration),

    /// A stored value could not be interpreted.
    #[error("Corrupt record for {key}: {reason}")]
    Corrupt {
        /// Store key of the record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Run a store call, failing with [`StoreError::Timeout`] once `budget` passes.
///
/// # Errors
///
/// Returns the call's own error, or a timeout.
pub async fn bounded<T, F>(budget: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(budget, call)
        .await
        .map_err(|_| StoreError::Timeout(budget))?
}
