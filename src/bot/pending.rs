//! Users whose next message is expected to be a standby credential.

use moka::sync::Cache;
use std::time::Duration;

/// Bounded, expiring set of user ids.
///
/// Entries expire `ttl` after insertion. Past `capacity` the cache evicts
/// entries on its own schedule.
#[derive(Debug, Clone)]
pub struct PendingInputs {
    inner: Cache<i64, ()>,
}

impl PendingInputs {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity.max(1) as u64)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn insert(&self, user_id: i64) {
        self.inner.insert(user_id, ());
    }

    /// Remove `user_id`, returning whether it was pending and unexpired.
    pub fn take(&self, user_id: i64) -> bool {
        self.inner.remove(&user_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.run_pending_tasks();
        self.inner.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
