use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use metrics::counter;

/// The single tag under which the resolved set is cached. Mutations
/// invalidate by this tag.
pub const FLAGS_CACHE_TAG: &str = "flags";

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The fully merged store-over-defaults result. Environment overrides are
/// applied on top at read time and are never part of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSnapshot {
    pub values: HashMap<String, bool>,
    /// Keys whose value came from a stored override rather than the default,
    /// so cached resolves keep reporting the source they were computed with.
    pub overridden: HashSet<String>,
}

struct CacheEntry {
    snapshot: FlagSnapshot,
    computed_at: Instant,
    ttl: Duration,
    tags: HashSet<String>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.computed_at) >= self.ttl
    }
}

struct Slot {
    entry: Option<CacheEntry>,
    /// Bumped by every install and invalidation. A snapshot computed against
    /// an older generation must not be installed: an invalidation happened
    /// while it was being computed and it may predate the write that
    /// triggered it.
    generation: u64,
}

/// A guarded single-slot memo of the resolved flag set. Process-local:
/// independent server processes each keep their own TTL window, convergence
/// across them is bounded by the TTL.
pub struct FlagCache {
    slot: RwLock<Slot>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl FlagCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slot: RwLock::new(Slot {
                entry: None,
                generation: 0,
            }),
            ttl,
            clock,
        }
    }

    pub fn get(&self) -> Option<FlagSnapshot> {
        let now = self.clock.now();
        let slot = self.slot.read().expect("flag cache lock poisoned");
        match slot.entry.as_ref() {
            Some(entry) if !entry.is_expired(now) => {
                counter!("flags_cache_hits_total").increment(1);
                Some(entry.snapshot.clone())
            }
            _ => {
                counter!("flags_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// The current generation, to be captured before computing a snapshot
    /// and handed back to [`FlagCache::put_if_current`].
    pub fn generation(&self) -> u64 {
        self.slot.read().expect("flag cache lock poisoned").generation
    }

    pub fn put(&self, snapshot: FlagSnapshot) {
        let mut slot = self.slot.write().expect("flag cache lock poisoned");
        self.install(&mut slot, snapshot);
    }

    /// Installs the snapshot only if no install or invalidation happened
    /// since `generation` was captured. Returns whether it was installed.
    /// The losing reader still serves the snapshot it computed; it just
    /// cannot memoize it over a newer write.
    pub fn put_if_current(&self, snapshot: FlagSnapshot, generation: u64) -> bool {
        let mut slot = self.slot.write().expect("flag cache lock poisoned");
        if slot.generation != generation {
            counter!("flags_cache_stale_puts_total").increment(1);
            return false;
        }
        self.install(&mut slot, snapshot);
        true
    }

    fn install(&self, slot: &mut Slot, snapshot: FlagSnapshot) {
        slot.entry = Some(CacheEntry {
            snapshot,
            computed_at: self.clock.now(),
            ttl: self.ttl,
            tags: HashSet::from([FLAGS_CACHE_TAG.to_string()]),
        });
        slot.generation += 1;
    }

    /// Clears the slot regardless of remaining TTL when the tag matches, so
    /// the next read recomputes. This is what gives a mutating process
    /// read-after-write visibility. An empty slot still advances the
    /// generation: an in-flight computation may be about to fill it with a
    /// pre-write snapshot.
    pub fn invalidate(&self, tag: &str) {
        let mut slot = self.slot.write().expect("flag cache lock poisoned");
        match slot.entry.as_ref() {
            Some(entry) if !entry.tags.contains(tag) => {}
            _ => {
                slot.entry = None;
                slot.generation += 1;
                counter!("flags_cache_invalidations_total").increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn snapshot_with(key: &str, enabled: bool) -> FlagSnapshot {
        FlagSnapshot {
            values: HashMap::from([(key.to_string(), enabled)]),
            overridden: HashSet::new(),
        }
    }

    #[test]
    fn serves_the_snapshot_within_ttl() {
        let clock = ManualClock::new();
        let cache = FlagCache::with_clock(Duration::from_secs(30), clock.clone());

        assert_eq!(cache.get(), None);
        cache.put(snapshot_with("dark-mode", true));

        clock.advance(Duration::from_secs(29));
        assert_eq!(cache.get(), Some(snapshot_with("dark-mode", true)));
    }

    #[test]
    fn expires_after_ttl() {
        let clock = ManualClock::new();
        let cache = FlagCache::with_clock(Duration::from_secs(30), clock.clone());

        cache.put(snapshot_with("dark-mode", true));
        clock.advance(Duration::from_secs(30));
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn invalidate_clears_before_expiry() {
        let clock = ManualClock::new();
        let cache = FlagCache::with_clock(Duration::from_secs(30), clock.clone());

        cache.put(snapshot_with("dark-mode", true));
        clock.advance(Duration::from_secs(1));
        cache.invalidate(FLAGS_CACHE_TAG);
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn invalidate_ignores_other_tags() {
        let cache = FlagCache::new(Duration::from_secs(30));
        cache.put(snapshot_with("dark-mode", true));
        cache.invalidate("teams");
        assert!(cache.get().is_some());
    }

    #[test]
    fn put_replaces_the_previous_entry() {
        let cache = FlagCache::new(Duration::from_secs(30));
        cache.put(snapshot_with("dark-mode", true));
        cache.put(snapshot_with("dark-mode", false));
        assert_eq!(cache.get(), Some(snapshot_with("dark-mode", false)));
    }

    #[test]
    fn a_put_from_before_an_invalidation_is_dropped() {
        let cache = FlagCache::new(Duration::from_secs(30));

        let generation = cache.generation();
        // An invalidation lands while the snapshot is being computed, even
        // though the slot was already empty
        cache.invalidate(FLAGS_CACHE_TAG);

        assert!(!cache.put_if_current(snapshot_with("dark-mode", false), generation));
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn put_if_current_installs_when_nothing_intervened() {
        let cache = FlagCache::new(Duration::from_secs(30));

        let generation = cache.generation();
        assert!(cache.put_if_current(snapshot_with("dark-mode", true), generation));
        assert_eq!(cache.get(), Some(snapshot_with("dark-mode", true)));
    }

    #[test]
    fn the_first_concurrent_put_wins() {
        let cache = FlagCache::new(Duration::from_secs(30));

        let generation = cache.generation();
        assert!(cache.put_if_current(snapshot_with("dark-mode", true), generation));
        // A second reader that raced the first keeps the installed entry
        assert!(!cache.put_if_current(snapshot_with("dark-mode", false), generation));
        assert_eq!(cache.get(), Some(snapshot_with("dark-mode", true)));
    }
}
