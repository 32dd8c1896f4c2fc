//! Per-user request serialization.
//!
//! Inference workers are typically single-slot per model; a user firing
//! parallel streaming completions would deadlock themselves or starve the
//! cluster. Each user gets a lazily-created async mutex; holding its guard is
//! the license to have a request in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::AppError;

/// License to run one request for one user. Dropping it releases the user.
pub type UserPermit = OwnedMutexGuard<()>;

/// Maps user ids to their serialization mutexes.
#[derive(Debug, Clone, Default)]
pub struct UserSerializer {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl UserSerializer {
    /// Creates an empty serializer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for the user's slot.
    ///
    /// Waiters queue on the mutex in arrival order. On timeout the user still
    /// has their previous request in flight and gets told so.
    pub async fn acquire(&self, user_id: &str, timeout: Duration) -> Result<UserPermit, AppError> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(user_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(permit) => {
                debug!(user = %user_id, "Acquired per-user slot");
                Ok(permit)
            }
            Err(_) => {
                debug!(user = %user_id, "Timed out waiting for per-user slot");
                Err(AppError::UserBusy)
            }
        }
    }

    /// Drops map entries that are currently unheld.
    ///
    /// Entries are tiny, so this only matters for very long-lived processes
    /// with high user churn. Safe to call at any time: a user mid-request
    /// holds a clone of the `Arc`, so their entry is skipped.
    pub fn sweep_unheld(&self) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - locks.len()
    }
}
