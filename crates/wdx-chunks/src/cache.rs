//! Bounded cache of accountants for in-flight uploads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;
use wdx_core::Clock;

use crate::accountant::ChunkAccountant;

struct CacheSlot {
    accountant: Arc<Mutex<ChunkAccountant>>,
    last_access: u64,
}

/// Maps in-flight upload IDs to their accountants.
///
/// Entries idle for longer than the configured timeout are purged on the
/// next lookup; all access is serialized.
pub struct ChunkCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
    idle_timeout: u64,
    clock: Arc<dyn Clock>,
}

impl ChunkCache {
    /// Creates a cache purging entries idle for longer than `idle_timeout`.
    pub fn new(idle_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_timeout: idle_timeout.as_secs(),
            clock,
        }
    }

    /// Registers the accountant of a new upload, replacing any previous
    /// entry under the same ID.
    pub fn insert(
        &self,
        upload_id: impl Into<String>,
        accountant: ChunkAccountant,
    ) -> Arc<Mutex<ChunkAccountant>> {
        let upload_id = upload_id.into();
        let shared = Arc::new(Mutex::new(accountant));
        let slot = CacheSlot {
            accountant: Arc::clone(&shared),
            last_access: self.clock.monotonic_secs(),
        };
        let mut slots = self.lock_slots();
        slots.insert(upload_id, slot);
        shared
    }

    /// Looks up an upload, refreshing its idle clock on a hit.
    ///
    /// Entries whose idle time exceeded the timeout are dropped first.
    pub fn lookup(&self, upload_id: &str) -> Option<Arc<Mutex<ChunkAccountant>>> {
        let now = self.clock.monotonic_secs();
        let mut slots = self.lock_slots();
        let timeout = self.idle_timeout;
        slots.retain(|id, slot| {
            let keep = now.saturating_sub(slot.last_access) <= timeout;
            if !keep {
                debug!(upload_id = %id, "dropped idle upload from chunk cache");
            }
            keep
        });
        let slot = slots.get_mut(upload_id)?;
        slot.last_access = now;
        Some(Arc::clone(&slot.accountant))
    }

    /// Removes an upload; true when it was present.
    pub fn remove(&self, upload_id: &str) -> bool {
        self.lock_slots().remove(upload_id).is_some()
    }

    /// Current number of tracked uploads.
    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    /// True when no upload is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Default)]
    struct ManualClock {
        now: AtomicU64,
    }

    impl ManualClock {
        fn advance(&self, seconds: u64) {
            self.now.fetch_add(seconds, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn monotonic(&self) -> Duration {
            Duration::from_secs(self.now.load(Ordering::SeqCst))
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration.as_secs());
        }
    }

    #[test]
    fn lookup_finds_inserted_upload() {
        let clock = Arc::new(ManualClock::default());
        let cache = ChunkCache::new(Duration::from_secs(60), clock);
        cache.insert("upload-1", ChunkAccountant::new(100));
        let accountant = cache.lookup("upload-1").unwrap();
        assert_eq!(accountant.lock().unwrap().capacity(), 100);
    }

    #[test]
    fn idle_upload_expires_on_next_lookup() {
        let clock = Arc::new(ManualClock::default());
        let cache = ChunkCache::new(Duration::from_secs(60), Arc::clone(&clock) as _);
        cache.insert("upload-1", ChunkAccountant::new(100));
        clock.advance(61);
        assert!(cache.lookup("upload-1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lookup_refreshes_the_idle_clock() {
        let clock = Arc::new(ManualClock::default());
        let cache = ChunkCache::new(Duration::from_secs(60), Arc::clone(&clock) as _);
        cache.insert("upload-1", ChunkAccountant::new(100));
        clock.advance(40);
        assert!(cache.lookup("upload-1").is_some());
        clock.advance(40);
        assert!(cache.lookup("upload-1").is_some());
    }

    #[test]
    fn expiry_only_touches_idle_entries() {
        let clock = Arc::new(ManualClock::default());
        let cache = ChunkCache::new(Duration::from_secs(60), Arc::clone(&clock) as _);
        cache.insert("old", ChunkAccountant::new(1));
        clock.advance(50);
        cache.insert("fresh", ChunkAccountant::new(2));
        clock.advance(20);
        assert!(cache.lookup("old").is_none());
        assert!(cache.lookup("fresh").is_some());
    }

    #[test]
    fn remove_reports_presence() {
        let clock = Arc::new(ManualClock::default());
        let cache = ChunkCache::new(Duration::from_secs(60), clock);
        cache.insert("upload-1", ChunkAccountant::new(100));
        assert!(cache.remove("upload-1"));
        assert!(!cache.remove("upload-1"));
    }
}
