use std::sync::RwLock;
use std::time::{Duration, Instant};

/// A single cached value with a time-to-live.
///
/// `get` returns the value while it is fresh. `put` replaces it and
/// restarts the clock; `invalidate` drops it. Cheap to read: callers are
/// expected to cache `Arc`s or other inexpensive clones.
pub struct TtlCache<T> {
    ttl: Duration,
    slot: RwLock<Option<(T, Instant)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Option<T> {
        let slot = self.slot.read().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref() {
            Some((value, refreshed)) if refreshed.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&self, value: T) {
        let mut slot = self.slot.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some((value, Instant::now()));
    }

    pub fn invalidate(&self) {
        let mut slot = self.slot.write().unwrap_or_else(|p| p.into_inner());
        *slot = None;
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
