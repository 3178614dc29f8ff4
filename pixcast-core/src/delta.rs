//! Xor-delta buckets.
//!
//! The client keeps a small, fixed number of previously decoded images
//! ("buckets"). When a new region has exactly the same shape, pixel
//! format, encoding and byte length as a bucket, its pixels are xor-ed
//! against that bucket before compression; mostly-unchanged content
//! then compresses to almost nothing.
//!
//! The cache lives on the encode side. The capture side invalidates it
//! (after a client decode error) by bumping a shared [`DeltaEpoch`];
//! the cache notices before its next lookup and drops every bucket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, trace};

use crate::config::DeltaSettings;
use crate::encoding::Encoding;
use crate::types::PixelFormat;

// ── DeltaEpoch ───────────────────────────────────────────────────

/// Invalidation counter shared between the capture and encode sides.
#[derive(Debug, Clone, Default)]
pub struct DeltaEpoch(Arc<AtomicU64>);

impl DeltaEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate every bucket of the window.
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ── DeltaBucket ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeltaBucket {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub encoding: Encoding,
    /// Identifier the client stored these pixels under.
    pub store: u64,
    pub data: Vec<u8>,
    pub hits: u32,
    pub last_used: Instant,
}

impl DeltaBucket {
    fn matches(&self, width: u32, height: u32, format: PixelFormat, encoding: Encoding, len: usize) -> bool {
        self.width == width
            && self.height == height
            && self.format == format
            && self.encoding == encoding
            && self.data.len() == len
    }
}

/// A lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaLookup {
    /// Nothing to xor against.
    Miss,
    /// Xor-ed against `store` held in slot `bucket`.
    Hit { bucket: usize, store: u64, hits: u32 },
    /// A bucket matched but was used too often; it has been cleared and
    /// its slot should be reused.
    Exhausted { bucket: usize },
}

/// Xor `data` in place against `reference` (same length).
pub fn xor_in_place(data: &mut [u8], reference: &[u8]) {
    for (d, r) in data.iter_mut().zip(reference) {
        *d ^= *r;
    }
}

// ── DeltaCache ───────────────────────────────────────────────────

/// Per-window delta buckets with LRU eviction.
#[derive(Debug)]
pub struct DeltaCache {
    slots: Vec<Option<DeltaBucket>>,
    settings: DeltaSettings,
    epoch: DeltaEpoch,
    seen_epoch: u64,
}

impl DeltaCache {
    /// `buckets` is the count the client negotiated, capped by config.
    pub fn new(buckets: usize, settings: &DeltaSettings, epoch: DeltaEpoch) -> Self {
        let count = if settings.enabled {
            buckets.min(settings.max_buckets)
        } else {
            0
        };
        let seen_epoch = epoch.current();
        Self {
            slots: (0..count).map(|_| None).collect(),
            settings: settings.clone(),
            epoch,
            seen_epoch,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.sync_epoch_view().count()
    }

    fn sync_epoch_view(&self) -> impl Iterator<Item = &DeltaBucket> + '_ {
        let stale = self.epoch.current() != self.seen_epoch;
        self.slots
            .iter()
            .filter_map(move |s| if stale { None } else { s.as_ref() })
    }

    /// Drop every bucket.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    fn check_epoch(&mut self) {
        let current = self.epoch.current();
        if current != self.seen_epoch {
            debug!(epoch = current, "delta buckets invalidated");
            self.seen_epoch = current;
            self.clear();
        }
    }

    /// Whether a region is worth delta-encoding at all.
    pub fn eligible(&self, pixels: u64, encoding: Encoding) -> bool {
        !self.slots.is_empty()
            && encoding.supports_delta()
            && self.settings.min_pixels < pixels
            && pixels < self.settings.max_pixels
    }

    /// Look for a matching bucket and xor `data` against it in place.
    pub fn apply(
        &mut self,
        data: &mut [u8],
        width: u32,
        height: u32,
        format: PixelFormat,
        encoding: Encoding,
        now: Instant,
    ) -> DeltaLookup {
        self.check_epoch();
        let max_hits = self.settings.max_hits;
        let found = self.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|b| b.matches(width, height, format, encoding, data.len()))
        });
        let Some(index) = found else {
            return DeltaLookup::Miss;
        };
        let Some(bucket) = self.slots[index].as_mut() else {
            return DeltaLookup::Miss;
        };
        if max_hits == 0 || bucket.hits >= max_hits {
            trace!(bucket = index, hits = bucket.hits, "delta bucket exhausted");
            self.slots[index] = None;
            return DeltaLookup::Exhausted { bucket: index };
        }
        xor_in_place(data, &bucket.data);
        bucket.hits += 1;
        bucket.last_used = now;
        DeltaLookup::Hit {
            bucket: index,
            store: bucket.store,
            hits: bucket.hits,
        }
    }

    /// Remember the decoded pixels (`original`, not the xor-ed ones).
    ///
    /// Returns the slot used, or `None` when the payoff was poor and the
    /// bucket was dropped instead.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        original: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        encoding: Encoding,
        store: u64,
        lookup: &DeltaLookup,
        compressed_len: usize,
        now: Instant,
    ) -> Option<usize> {
        self.check_epoch();
        if self.slots.is_empty() {
            return None;
        }
        let raw_len = width as usize * height as usize * 4;
        let (slot, hits) = match *lookup {
            DeltaLookup::Hit { bucket, hits, .. } => {
                let poor = raw_len * self.settings.poor_payoff_percent as usize / 100;
                if compressed_len >= poor {
                    debug!(bucket, compressed_len, raw_len, "delta not paying off, clearing bucket");
                    self.slots[bucket] = None;
                    return None;
                }
                (bucket, hits)
            }
            DeltaLookup::Exhausted { bucket } => (bucket, 0),
            DeltaLookup::Miss => (self.free_or_oldest(), 0),
        };
        self.slots[slot] = Some(DeltaBucket {
            width,
            height,
            format,
            encoding,
            store,
            data: original,
            hits,
            last_used: now,
        });
        Some(slot)
    }

    fn free_or_oldest(&self) -> usize {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            return free;
        }
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|b| (i, b.last_used)))
            .min_by_key(|(_, t)| *t)
            .map_or(0, |(i, _)| i)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_cache(buckets: usize) -> (DeltaCache, DeltaEpoch) {
        let epoch = DeltaEpoch::new();
        (DeltaCache::new(buckets, &DeltaSettings::default(), epoch.clone()), epoch)
    }

    fn pixels(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn store_plain(cache: &mut DeltaCache, data: Vec<u8>, store: u64, now: Instant) -> Option<usize> {
        cache.store(data, 40, 40, PixelFormat::Bgrx, Encoding::Rgb24, store, &DeltaLookup::Miss, 10, now)
    }

    #[test]
    fn eligibility_bounds() {
        let (cache, _) = make_cache(5);
        assert!(cache.eligible(2000, Encoding::Rgb24));
        assert!(!cache.eligible(1024, Encoding::Rgb24));
        assert!(!cache.eligible(32768, Encoding::Rgb24));
        assert!(!cache.eligible(2000, Encoding::Jpeg));
        let (none, _) = make_cache(0);
        assert!(!none.eligible(2000, Encoding::Rgb24));
    }

    #[test]
    fn xor_roundtrip_reproduces_candidate() {
        let (mut cache, _) = make_cache(5);
        let now = Instant::now();
        let stored = pixels(40 * 40 * 4, 1);
        store_plain(&mut cache, stored.clone(), 7, now);

        let candidate = pixels(40 * 40 * 4, 2);
        let mut xored = candidate.clone();
        let lookup = cache.apply(&mut xored, 40, 40, PixelFormat::Bgrx, Encoding::Rgb24, now);
        assert_eq!(
            lookup,
            DeltaLookup::Hit {
                bucket: 0,
                store: 7,
                hits: 1
            }
        );
        xor_in_place(&mut xored, &stored);
        assert_eq!(xored, candidate);
    }

    #[test]
    fn shape_mismatch_misses() {
        let (mut cache, _) = make_cache(5);
        let now = Instant::now();
        store_plain(&mut cache, pixels(40 * 40 * 4, 1), 1, now);
        let mut other = pixels(40 * 40 * 4, 1);
        let lookup = cache.apply(&mut other, 40, 40, PixelFormat::Bgrx, Encoding::Rgb32, now);
        assert_eq!(lookup, DeltaLookup::Miss);
    }

    #[test]
    fn hit_cap_clears_bucket() {
        let (mut cache, _) = make_cache(1);
        let now = Instant::now();
        store_plain(&mut cache, pixels(6400, 0), 1, now);
        for _ in 0..20 {
            let mut data = pixels(6400, 0);
            let l = cache.apply(&mut data, 40, 40, PixelFormat::Bgrx, Encoding::Rgb24, now);
            assert!(matches!(l, DeltaLookup::Hit { .. }));
        }
        let mut data = pixels(6400, 0);
        let l = cache.apply(&mut data, 40, 40, PixelFormat::Bgrx, Encoding::Rgb24, now);
        assert_eq!(l, DeltaLookup::Exhausted { bucket: 0 });
        assert_eq!(cache.occupied(), 0);
    }

    #[test]
    fn lru_eviction() {
        let (mut cache, _) = make_cache(2);
        let t0 = Instant::now();
        store_plain(&mut cache, pixels(6400, 0), 1, t0);
        store_plain(&mut cache, pixels(6400, 1), 2, t0 + Duration::from_millis(5));
        let slot = store_plain(&mut cache, pixels(6400, 2), 3, t0 + Duration::from_millis(10));
        assert_eq!(slot, Some(0));
    }

    #[test]
    fn poor_payoff_drops_bucket() {
        let (mut cache, _) = make_cache(2);
        let now = Instant::now();
        store_plain(&mut cache, pixels(6400, 0), 1, now);
        let mut data = pixels(6400, 9);
        let lookup = cache.apply(&mut data, 40, 40, PixelFormat::Bgrx, Encoding::Rgb24, now);
        let slot = cache.store(pixels(6400, 9), 40, 40, PixelFormat::Bgrx, Encoding::Rgb24, 2, &lookup, 6000, now);
        assert!(slot.is_none());
        assert_eq!(cache.occupied(), 0);
    }

    #[test]
    fn epoch_bump_invalidates() {
        let (mut cache, epoch) = make_cache(3);
        let now = Instant::now();
        store_plain(&mut cache, pixels(6400, 0), 1, now);
        assert_eq!(cache.occupied(), 1);
        epoch.bump();
        assert_eq!(cache.occupied(), 0);
        let mut data = pixels(6400, 0);
        let l = cache.apply(&mut data, 40, 40, PixelFormat::Bgrx, Encoding::Rgb24, now);
        assert_eq!(l, DeltaLookup::Miss);
    }
}
