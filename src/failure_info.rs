//! Process-local record of consecutive handler failures per message id.
//!
//! The storage is bounded: once `capacity` messages are tracked the least recently touched one
//! is evicted. Records are lost on restart.

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq)]
pub struct FailureInfo {
    pub count: u32,
    pub last_seen: DateTime<Utc>,
    pub last_error: String,
}

pub struct FailureInfoStorage {
    max_failures: u32,
    records: Mutex<LruCache<String, FailureInfo>>,
}

impl FailureInfoStorage {
    pub fn new(capacity: usize, max_failures: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            max_failures: max_failures.max(1),
            records: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records one more failure of `message_id` and returns the updated record.
    pub fn record_failure(&self, message_id: &str, error: &eyre::Report) -> FailureInfo {
        let mut records = self.records.lock();
        let now = Utc::now();

        if let Some(info) = records.get_mut(message_id) {
            info.count += 1;
            info.last_seen = now;
            info.last_error = format!("{error:#}");
            return info.clone();
        }

        let info = FailureInfo {
            count: 1,
            last_seen: now,
            last_error: format!("{error:#}"),
        };
        records.put(message_id.to_owned(), info.clone());
        info
    }

    pub fn get(&self, message_id: &str) -> Option<FailureInfo> {
        self.records.lock().get(message_id).cloned()
    }

    /// The failure record of `message_id` if it has reached the dead-letter threshold.
    pub fn exhausted(&self, message_id: &str) -> Option<FailureInfo> {
        self.get(message_id)
            .filter(|info| info.count >= self.max_failures)
    }

    pub fn is_exhausted(&self, info: &FailureInfo) -> bool {
        info.count >= self.max_failures
    }

    pub fn clear(&self, message_id: &str) {
        self.records.lock().pop(message_id);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_consecutive_failures() {
        let storage = FailureInfoStorage::new(10, 3);
        let err = eyre::eyre!("boom");

        assert_eq!(storage.record_failure("a", &err).count, 1);
        assert!(storage.exhausted("a").is_none());
        storage.record_failure("a", &err);
        let info = storage.record_failure("a", &err);

        assert_eq!(info.count, 3);
        assert_eq!(info.last_error, "boom");
        assert!(storage.exhausted("a").is_some());
    }

    #[test]
    fn clearing_starts_a_fresh_count() {
        let storage = FailureInfoStorage::new(10, 2);
        let err = eyre::eyre!("boom");

        storage.record_failure("a", &err);
        storage.record_failure("a", &err);
        storage.clear("a");

        assert!(storage.get("a").is_none());
        assert_eq!(storage.record_failure("a", &err).count, 1);
    }

    #[test]
    fn evicts_least_recently_used_beyond_capacity() {
        let storage = FailureInfoStorage::new(2, 5);
        let err = eyre::eyre!("boom");

        storage.record_failure("a", &err);
        storage.record_failure("b", &err);
        // touch "a" so "b" becomes the eviction candidate
        storage.get("a");
        storage.record_failure("c", &err);

        assert_eq!(storage.len(), 2);
        assert!(storage.get("a").is_some());
        assert!(storage.get("b").is_none());
        assert!(storage.get("c").is_some());
    }
}
