//! Bounded LRU cache for decoded frames.
//!
//! Bounded both by entry count and by total bytes. Recency is a logical access
//! tick rather than wall time, so two accesses in the same instant still have
//! a strict order. The cache serializes all mutations behind a mutex and is
//! shared through `Arc`.

use parking_lot::Mutex;
use proedit_core::{DecodedImage, FrameRate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};
use uuid::Uuid;

/// Key for a cached frame: the owning media/clip and a frame number.
///
/// Positions are quantized to frame numbers, never to formatted floats: two
/// positions inside one frame interval name the same entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub owner: Uuid,
    pub frame: i64,
}

impl CacheKey {
    pub fn new(owner: Uuid, frame: i64) -> Self {
        Self { owner, frame }
    }

    /// Key for position `time` at `rate`: frame `round(time * fps)`.
    pub fn at(owner: Uuid, time: f64, rate: FrameRate) -> Self {
        Self::new(owner, rate.nearest_frame(time))
    }
}

/// Anything whose memory footprint the cache can account for.
pub trait CacheWeight {
    fn weight_bytes(&self) -> usize;
}

impl CacheWeight for DecodedImage {
    fn weight_bytes(&self) -> usize {
        self.size_bytes()
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub size_bytes: usize,
    pub max_frames: usize,
    pub max_size_bytes: usize,
    pub evictions: u64,
    pub rejections: u64,
}

struct CacheEntry<V> {
    value: V,
    size_bytes: usize,
    last_accessed: u64,
}

struct CacheInner<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    /// access tick -> key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
    current_size: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejections: u64,
}

impl<V> CacheInner<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_accessed);
        self.current_size -= entry.size_bytes;
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.current_size -= entry.size_bytes;
            self.evictions += 1;
            // entry dropped here, releasing its buffer
        }
        true
    }
}

/// Count- and byte-bounded LRU cache.
pub struct FrameCache<V = DecodedImage> {
    inner: Mutex<CacheInner<V>>,
    max_frames: usize,
    max_size_bytes: usize,
}

impl<V: CacheWeight + Clone> FrameCache<V> {
    pub fn new(max_frames: usize, max_size_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                current_size: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                rejections: 0,
            }),
            max_frames: max_frames.max(1),
            max_size_bytes,
        }
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let CacheInner {
            entries,
            recency,
            hits,
            misses,
            ..
        } = &mut *inner;
        match entries.get_mut(key) {
            Some(entry) => {
                recency.remove(&entry.last_accessed);
                entry.last_accessed = tick;
                recency.insert(tick, *key);
                *hits += 1;
                Some(entry.value.clone())
            }
            None => {
                *misses += 1;
                None
            }
        }
    }

    /// Presence check; does not touch recency or counters.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Insert or replace an entry. Returns `false` if admission control
    /// rejected it for being larger than the whole cache.
    pub fn set(&self, key: CacheKey, value: V) -> bool {
        let size_bytes = value.weight_bytes();
        let mut inner = self.inner.lock();

        if size_bytes > self.max_size_bytes {
            inner.rejections += 1;
            warn!(
                owner = %key.owner,
                frame = key.frame,
                size_bytes,
                max_size_bytes = self.max_size_bytes,
                "Frame larger than cache budget, not cached"
            );
            return false;
        }

        // Replacing an entry frees its slot before the bound check
        inner.remove(&key);

        while !inner.entries.is_empty()
            && (inner.entries.len() >= self.max_frames
                || inner.current_size + size_bytes > self.max_size_bytes)
        {
            if !inner.evict_oldest() {
                break;
            }
        }

        let tick = inner.next_tick();
        inner.recency.insert(tick, key);
        inner.current_size += size_bytes;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                size_bytes,
                last_accessed: tick,
            },
        );
        true
    }

    /// Remove one entry. Returns whether it existed.
    pub fn delete(&self, key: &CacheKey) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove every entry belonging to `owner`. Returns how many were removed.
    pub fn clear_for(&self, owner: Uuid) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|k| k.owner == owner)
            .copied()
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        if !keys.is_empty() {
            debug!(owner = %owner, removed = keys.len(), "Cleared cached frames");
        }
        keys.len()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.current_size = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().current_size
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
            entries: inner.entries.len(),
            size_bytes: inner.current_size,
            max_frames: self.max_frames,
            max_size_bytes: self.max_size_bytes,
            evictions: inner.evictions,
            rejections: inner.rejections,
        }
    }

    /// Zero the hit/miss/eviction counters.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
        inner.rejections = 0;
    }
}
