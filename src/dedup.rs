// =============================================================================
// dedup.rs — THE ALERT DEDUPLICATION FORTRESS
// =============================================================================
//
// A hybrid Bloom Filter + LRU Cache engine that guarantees each detected
// docket change alerts exactly once. Overlapping checks happen in real
// life: a retry lands after a deferral, a snapshot gets re-fetched while
// an earlier result is still in the pipeline — and a partner who gets the
// same "JUDGMENT ENTERED" page twice starts asking pointed questions about
// the monitoring system.
//
// The layered design:
//
// 1. The Bloom filter answers first (O(k), basically O(1)). "Never seen
//    it" is authoritative — Bloom filters have no false negatives.
//
// 2. "Maybe seen it" goes to the LRU cache for a definitive answer,
//    because Bloom filters DO have false positives and we'd rather not
//    eat a real alert over one.
//
// 3. The Bloom filter rotates on an interval so it can't saturate. A
//    saturated Bloom filter says "yes" to everything, which is about as
//    useful as a chocolate teapot. Rotation forgets old fingerprints,
//    which is fine: a change re-observed a day later is the detector's
//    bug, not dedup's problem.
//
// 4. Thread-safe via parking_lot RwLock, because five check workers all
//    finish at once and data races are not on the feature roadmap.
// =============================================================================

use bloomfilter::Bloom;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::time::Instant;
use tracing::{debug, info};

/// The change-alert deduplication engine. One per process, shared by every
/// check worker through an Arc.
pub struct ChangeDedup {
    /// First line of defense. Rotated periodically, see `maybe_rotate`.
    bloom: RwLock<Bloom<String>>,

    /// Second line of defense: when Bloom says "maybe", the LRU says
    /// "definitely". Bounded so we don't eat all the RAM.
    lru_cache: RwLock<LruCache<String, ()>>,

    last_rotation: RwLock<Instant>,
    rotation_interval_secs: u64,

    // Parameters for building replacement Bloom filters on rotation.
    bloom_expected_items: u64,
    bloom_fp_rate: f64,

    pub stats: DedupStats,
}

/// Deduplication counters. Atomic, because if we can't measure the
/// duplicates we crushed, did we even crush them?
pub struct DedupStats {
    pub checks: portable_atomic::AtomicU64,
    pub unique: portable_atomic::AtomicU64,
    pub duplicates: portable_atomic::AtomicU64,
    pub rotations: portable_atomic::AtomicU64,
    /// Times the Bloom filter said "maybe" but the LRU overruled it —
    /// the false-positive rescue counter.
    pub bloom_maybe_hits: portable_atomic::AtomicU64,
}

impl DedupStats {
    fn new() -> Self {
        Self {
            checks: portable_atomic::AtomicU64::new(0),
            unique: portable_atomic::AtomicU64::new(0),
            duplicates: portable_atomic::AtomicU64::new(0),
            rotations: portable_atomic::AtomicU64::new(0),
            bloom_maybe_hits: portable_atomic::AtomicU64::new(0),
        }
    }
}

impl ChangeDedup {
    /// Build a fresh engine.
    ///
    /// * `expected_items` — fingerprints expected per rotation window
    /// * `fp_rate` — target Bloom false-positive rate (0.01 = 1%)
    /// * `lru_capacity` — definitive-answer cache size
    /// * `rotation_interval_secs` — seconds between Bloom rotations
    pub fn new(
        expected_items: u64,
        fp_rate: f64,
        lru_capacity: usize,
        rotation_interval_secs: u64,
    ) -> Self {
        info!(
            expected_items,
            fp_rate,
            lru_capacity,
            rotation_secs = rotation_interval_secs,
            "Alert dedup engine online — duplicate alerts will be ELIMINATED"
        );

        let bloom = Bloom::new_for_fp_rate(expected_items as usize, fp_rate);
        let lru_size =
            NonZeroUsize::new(lru_capacity).unwrap_or_else(|| NonZeroUsize::new(1000).expect("1000 > 0"));

        Self {
            bloom: RwLock::new(bloom),
            lru_cache: RwLock::new(LruCache::new(lru_size)),
            last_rotation: RwLock::new(Instant::now()),
            rotation_interval_secs,
            bloom_expected_items: expected_items,
            bloom_fp_rate: fp_rate,
            stats: DedupStats::new(),
        }
    }

    /// Check a change fingerprint and mark it seen.
    ///
    /// Returns `true` if the fingerprint is NEW — alert away.
    /// Returns `false` if it's a duplicate — stay silent.
    pub fn check_and_insert(&self, fingerprint: &str) -> bool {
        use portable_atomic::Ordering;

        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        self.maybe_rotate();

        let key = fingerprint.to_string();

        // Read lock only — workers can probe the filter concurrently.
        let bloom_says_maybe_seen = {
            let bloom = self.bloom.read();
            bloom.check(&key)
        };

        if bloom_says_maybe_seen {
            self.stats.bloom_maybe_hits.fetch_add(1, Ordering::Relaxed);

            let mut lru = self.lru_cache.write();
            if lru.get(&key).is_some() {
                // Confirmed duplicate. The partner's phone stays quiet.
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint, "Duplicate change suppressed — Bloom + LRU agreed");
                return false;
            }

            // Bloom said "maybe", LRU said "nope". False positive rescued;
            // the change is genuinely new.
            debug!(fingerprint, "Bloom false positive rescued by LRU");
        }

        {
            let mut bloom = self.bloom.write();
            bloom.set(&key);
        }
        {
            let mut lru = self.lru_cache.write();
            lru.put(key, ());
        }

        self.stats.unique.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Swap in a fresh Bloom filter when the rotation interval has passed.
    /// The LRU cache is NOT rotated — it self-evicts naturally.
    fn maybe_rotate(&self) {
        let should_rotate = {
            let last = self.last_rotation.read();
            last.elapsed().as_secs() >= self.rotation_interval_secs
        };

        if should_rotate {
            let mut bloom = self.bloom.write();
            let mut last = self.last_rotation.write();

            // Re-check under the write lock — another worker may have
            // rotated while we waited.
            if last.elapsed().as_secs() >= self.rotation_interval_secs {
                *bloom = Bloom::new_for_fp_rate(self.bloom_expected_items as usize, self.bloom_fp_rate);
                *last = Instant::now();
                self.stats
                    .rotations
                    .fetch_add(1, portable_atomic::Ordering::Relaxed);
                info!("Bloom filter rotated — old fingerprints forgotten");
            }
        }
    }

    /// Snapshot the counters for the metrics endpoint.
    pub fn snapshot(&self) -> DedupSnapshot {
        use portable_atomic::Ordering;
        DedupSnapshot {
            total_checks: self.stats.checks.load(Ordering::Relaxed),
            unique_items: self.stats.unique.load(Ordering::Relaxed),
            duplicates_caught: self.stats.duplicates.load(Ordering::Relaxed),
            bloom_rotations: self.stats.rotations.load(Ordering::Relaxed),
            bloom_false_positive_rescues: self.stats.bloom_maybe_hits.load(Ordering::Relaxed),
            lru_cache_size: self.lru_cache.read().len(),
        }
    }
}

/// A point-in-time view of dedup statistics. Serializable for metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DedupSnapshot {
    pub total_checks: u64,
    pub unique_items: u64,
    pub duplicates_caught: u64,
    pub bloom_rotations: u64,
    pub bloom_false_positive_rescues: u64,
    pub lru_cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fingerprints_are_accepted() {
        let engine = ChangeDedup::new(1000, 0.01, 100, 3600);
        assert!(engine.check_and_insert("monitor-1:MOTION_FILED:3:Motion to Dismiss"));
    }

    #[test]
    fn test_duplicate_fingerprints_are_rejected() {
        let engine = ChangeDedup::new(1000, 0.01, 100, 3600);
        assert!(engine.check_and_insert("monitor-1:ORDER_ENTERED:7:Order granting"));
        assert!(!engine.check_and_insert("monitor-1:ORDER_ENTERED:7:Order granting"));
        assert_eq!(engine.snapshot().duplicates_caught, 1);
    }

    #[test]
    fn test_distinct_fingerprints_are_accepted() {
        let engine = ChangeDedup::new(1000, 0.01, 100, 3600);
        assert!(engine.check_and_insert("monitor-1:MOTION_FILED:3:Motion to Dismiss"));
        assert!(engine.check_and_insert("monitor-2:MOTION_FILED:3:Motion to Dismiss"));
        assert_eq!(engine.snapshot().unique_items, 2);
    }
}
