//! Bounded in-memory dedup cache over message ids.
//!
//! Fast path in front of the store's authoritative `seen` table: LRU
//! eviction at capacity, entries older than the TTL treated as absent. An
//! expired entry forces a store lookup but not a re-broadcast, because the
//! store still has the message.

use std::collections::HashMap;

use rfmp_shared::types::MessageId;

pub const DEFAULT_CAPACITY: usize = 4096;
pub const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    ttl_secs: u64,
    entries: HashMap<MessageId, Entry>,
    tick: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_seen_at: u64,
    /// Monotone access counter for LRU ordering.
    used: u64,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_secs,
            entries: HashMap::new(),
            tick: 0,
        }
    }

    /// Record `id` as seen at `now`, evicting the least-recently-used entry
    /// at capacity.
    pub fn touch(&mut self, id: MessageId, now: u64) {
        self.tick += 1;
        let tick = self.tick;

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.last_seen_at = now;
            entry.used = tick;
            return;
        }

        if self.entries.len() >= self.capacity {
            if let Some((&lru, _)) = self.entries.iter().min_by_key(|(_, e)| e.used) {
                self.entries.remove(&lru);
            }
        }
        self.entries.insert(
            id,
            Entry {
                last_seen_at: now,
                used: tick,
            },
        );
    }

    /// Membership check; TTL-expired entries read as absent.
    pub fn contains(&mut self, id: &MessageId, now: u64) -> bool {
        self.tick += 1;
        let tick = self.tick;
        let ttl = self.ttl_secs;

        match self.entries.get_mut(id) {
            Some(entry) if now.saturating_sub(entry.last_seen_at) < ttl => {
                entry.used = tick;
                true
            }
            _ => false,
        }
    }

    /// Drop expired entries outright; run from housekeeping.
    pub fn sweep(&mut self, now: u64) -> usize {
        let ttl = self.ttl_secs;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_sub(e.last_seen_at) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> MessageId {
        MessageId([n; 6])
    }

    #[test]
    fn touch_then_contains() {
        let mut cache = SeenCache::new(16, 3600);
        cache.touch(id(1), 100);
        assert!(cache.contains(&id(1), 100));
        assert!(!cache.contains(&id(2), 100));
    }

    #[test]
    fn ttl_expiry_reads_as_absent() {
        let mut cache = SeenCache::new(16, 3600);
        cache.touch(id(1), 100);
        assert!(cache.contains(&id(1), 100 + 3599));
        assert!(!cache.contains(&id(1), 100 + 3600));
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let mut cache = SeenCache::new(3, 3600);
        cache.touch(id(1), 100);
        cache.touch(id(2), 101);
        cache.touch(id(3), 102);

        // Refresh 1 so 2 becomes least recently used.
        assert!(cache.contains(&id(1), 103));
        cache.touch(id(4), 104);

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&id(1), 105));
        assert!(!cache.contains(&id(2), 105));
        assert!(cache.contains(&id(3), 105));
        assert!(cache.contains(&id(4), 105));
    }

    #[test]
    fn sweep_removes_expired() {
        let mut cache = SeenCache::new(16, 100);
        cache.touch(id(1), 0);
        cache.touch(id(2), 90);
        assert_eq!(cache.sweep(120), 1);
        assert_eq!(cache.len(), 1);
    }
}
