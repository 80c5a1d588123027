//! Keyed TTL cache fronting the open-ticket listing.
//!
//! Each key is either absent or populated. A populated key goes back to
//! absent when its TTL runs out or when it is invalidated. Values are cloned
//! out whole under the map lock, so readers never see a partial write.
//!
//! Every key also carries a generation that [`SearchCache::invalidate`]
//! bumps. A reader that misses records the generation first and fills the
//! key with [`SearchCache::set_if_current`], so a listing read before a
//! concurrent invalidation is never cached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lifetime of a cached open-ticket listing.
pub const OPEN_TICKETS_TTL: Duration = Duration::from_secs(300);

/// Cache key for a user's open-ticket listing.
pub fn open_tickets_key(user_id: i64) -> String {
    format!("open_tickets_{user_id}")
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Slots<V> {
    entries: HashMap<String, Entry<V>>,
    generations: HashMap<String, u64>,
}

pub struct SearchCache<V> {
    slots: Mutex<Slots<V>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> SearchCache<V> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: HashMap::new(),
                generations: HashMap::new(),
            }),
            clock,
        }
    }

    // Every critical section is a single insert/remove/lookup, so a
    // poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, Slots<V>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached value, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut slots = self.lock();
        match slots.entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                slots.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.lock()
            .entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// Current generation of `key`. Read it before loading the value to cache.
    pub fn generation(&self, key: &str) -> u64 {
        self.lock().generations.get(key).copied().unwrap_or(0)
    }

    /// Store `value` only if `key` has not been invalidated since
    /// `generation` was read. Returns whether the value was stored.
    pub fn set_if_current(&self, key: &str, value: V, ttl: Duration, generation: u64) -> bool {
        let expires_at = self.clock.now() + ttl;
        let mut slots = self.lock();
        if slots.generations.get(key).copied().unwrap_or(0) != generation {
            return false;
        }
        slots
            .entries
            .insert(key.to_string(), Entry { value, expires_at });
        true
    }

    /// Drop `key` regardless of remaining TTL and bump its generation.
    /// Returns whether a value was present.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut slots = self.lock();
        *slots.generations.entry(key.to_string()).or_insert(0) += 1;
        slots.entries.remove(key).is_some()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut slots = self.lock();
        let before = slots.entries.len();
        slots.entries.retain(|_, e| now < e.expires_at);
        before - slots.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for SearchCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
