//! Byte-budgeted cache shared by every image and volume held in memory.
//!
//! Admission and allocation are split: [`Cache::admit`] reserves the bytes
//! *before* the caller allocates anything, and the returned [`Admission`] is
//! committed once the payload exists. Reserved bytes count against the budget
//! so concurrent admissions cannot jointly over-commit, but only committed
//! entries contribute to [`Cache::current_size`].
//!
//! The cache never evicts on its own. Callers that want room make it with
//! [`Cache::remove`], [`Cache::evict_lru`] or [`Cache::purge`].

use std::{collections::HashMap, fmt, sync::Arc};

use image::DynamicImage;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use web_time::{Instant, SystemTime};

use crate::{
    config::CacheOptions,
    enums::EntryKind,
    error::{CacheError, CacheResult},
    events::{CacheEvent, EventBus},
    volume::VolumeDescriptor,
};

/// A decoded 2D image held in the cache.
#[derive(Debug)]
pub struct CachedImage {
    id: String,
    image: DynamicImage,
}

impl CachedImage {
    pub fn new(id: impl Into<String>, image: DynamicImage) -> Self {
        Self {
            id: id.into(),
            image,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn size_bytes(&self) -> u64 {
        self.image.as_bytes().len() as u64
    }
}

#[derive(Clone)]
pub enum CachePayload {
    Image(Arc<CachedImage>),
    Volume(Arc<VolumeDescriptor>),
}

impl CachePayload {
    pub fn kind(&self) -> EntryKind {
        match self {
            CachePayload::Image(_) => EntryKind::Image,
            CachePayload::Volume(_) => EntryKind::Volume,
        }
    }

    fn size_bytes(&self) -> u64 {
        match self {
            CachePayload::Image(image) => image.size_bytes(),
            CachePayload::Volume(volume) => volume.size_bytes(),
        }
    }

    fn is_loaded(&self) -> bool {
        match self {
            CachePayload::Image(_) => true,
            CachePayload::Volume(volume) => volume.is_loaded(),
        }
    }

    fn is_busy(&self) -> bool {
        match self {
            CachePayload::Image(_) => false,
            CachePayload::Volume(volume) => volume.is_loading(),
        }
    }

    /// Releases everything the payload owns. Runs before the size counter
    /// is decremented.
    fn teardown(&self) {
        if let CachePayload::Volume(volume) = self {
            volume.release();
        }
    }
}

impl fmt::Debug for CachePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePayload::Image(image) => f.debug_tuple("Image").field(&image.id()).finish(),
            CachePayload::Volume(volume) => f.debug_tuple("Volume").field(&volume.id()).finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: String,
    pub size_bytes: u64,
    pub created_at: SystemTime,
    pub kind: EntryKind,
    pub payload: CachePayload,
}

impl CacheEntry {
    /// Images are loaded on insertion; volumes report their own state.
    pub fn loaded(&self) -> bool {
        self.payload.is_loaded()
    }
}

struct StoredEntry {
    entry: CacheEntry,
    last_access: Instant,
}

struct CacheState {
    max_size: u64,
    current_size: u64,
    reserved_size: u64,
    reserved: HashMap<String, u64>,
    entries: HashMap<String, StoredEntry>,
}

impl CacheState {
    fn committed_and_reserved(&self) -> u64 {
        self.current_size + self.reserved_size
    }

    fn available(&self) -> u64 {
        self.max_size.saturating_sub(self.committed_and_reserved())
    }

    /// Removes the entry, tears it down, then gives back its bytes.
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let stored = self.entries.remove(key)?;
        stored.entry.payload.teardown();
        self.current_size -= stored.entry.size_bytes;
        Some(stored.entry)
    }
}

/// Shared handle to the cache. Clones refer to the same budget.
#[derive(Clone)]
pub struct Cache {
    state: Arc<Mutex<CacheState>>,
    events: EventBus,
}

impl Cache {
    pub fn new(options: CacheOptions) -> Self {
        Self::with_events(options, EventBus::default())
    }

    pub fn with_events(options: CacheOptions, events: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                max_size: options.max_bytes,
                current_size: 0,
                reserved_size: 0,
                reserved: HashMap::new(),
                entries: HashMap::new(),
            })),
            events,
        }
    }

    /// Reserve `size_bytes` for `key`.
    ///
    /// Must succeed before a buffer of that size is allocated. Fails without
    /// mutating anything if the bytes do not fit the remaining budget.
    pub fn admit(&self, key: impl Into<String>, size_bytes: u64) -> CacheResult<Admission> {
        let key = key.into();
        let mut state = self.state.lock();

        if state.entries.contains_key(&key) || state.reserved.contains_key(&key) {
            return Err(CacheError::DuplicateKey(key));
        }

        let available = state.available();
        if size_bytes > available {
            warn!(%key, size_bytes, available, "cache admission rejected");
            return Err(CacheError::CacheSizeExceeded {
                requested: size_bytes,
                available,
                max_size: state.max_size,
            });
        }

        state.reserved.insert(key.clone(), size_bytes);
        state.reserved_size += size_bytes;
        debug!(%key, size_bytes, "cache admission granted");

        Ok(Admission {
            cache: self.clone(),
            key,
            size_bytes,
            settled: false,
        })
    }

    /// Admit and insert in one step.
    pub fn put(&self, key: impl Into<String>, payload: CachePayload) -> CacheResult<CacheEntry> {
        let size_bytes = payload.size_bytes();
        self.admit(key, size_bytes)?.commit(payload)
    }

    pub fn put_image(&self, image: CachedImage) -> CacheResult<CacheEntry> {
        let key = image.id().to_string();
        self.put(key, CachePayload::Image(Arc::new(image)))
    }

    /// Look up an entry and mark it as recently used.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let stored = state.entries.get_mut(key)?;
        stored.last_access = Instant::now();
        Some(stored.entry.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn get_volume(&self, volume_id: &str) -> Option<Arc<VolumeDescriptor>> {
        match self.get(volume_id)?.payload {
            CachePayload::Volume(volume) => Some(volume),
            CachePayload::Image(_) => None,
        }
    }

    pub fn get_image(&self, image_id: &str) -> Option<Arc<CachedImage>> {
        match self.get(image_id)?.payload {
            CachePayload::Image(image) => Some(image),
            CachePayload::Volume(_) => None,
        }
    }

    /// Remove an entry, tearing down its payload before the bytes are
    /// returned to the budget.
    pub fn remove(&self, key: &str) -> CacheResult<CacheEntry> {
        let entry = self
            .state
            .lock()
            .remove_entry(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;

        debug!(key, size_bytes = entry.size_bytes, "cache entry removed");
        self.events.publish(CacheEvent::EntryRemoved {
            key: entry.key.clone(),
            kind: entry.kind,
            size_bytes: entry.size_bytes,
        });
        Ok(entry)
    }

    /// Remove least recently used entries until `bytes_needed` more bytes fit.
    ///
    /// Volumes that are still loading are skipped. Returns the evicted keys;
    /// the request may remain unsatisfiable if everything left is busy.
    pub fn evict_lru(&self, bytes_needed: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut state = self.state.lock();

        let mut candidates: Vec<(Instant, String)> = state
            .entries
            .values()
            .filter(|stored| !stored.entry.payload.is_busy())
            .map(|stored| (stored.last_access, stored.entry.key.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in candidates {
            if state.available() >= bytes_needed {
                break;
            }
            if let Some(entry) = state.remove_entry(&key) {
                self.events.publish(CacheEvent::EntryRemoved {
                    key: entry.key,
                    kind: entry.kind,
                    size_bytes: entry.size_bytes,
                });
                evicted.push(key);
            }
        }
        drop(state);

        if !evicted.is_empty() {
            info!(count = evicted.len(), bytes_needed, "evicted cache entries");
        }
        evicted
    }

    /// Change the budget. Shrinking below the bytes in use is rejected;
    /// purge or evict first.
    pub fn set_max_size(&self, max_size: u64) -> CacheResult<()> {
        let mut state = self.state.lock();
        let in_use = state.committed_and_reserved();
        if max_size < in_use {
            return Err(CacheError::MaxSizeBelowUsage {
                requested: max_size,
                current: in_use,
            });
        }
        state.max_size = max_size;
        drop(state);

        info!(max_size, "cache budget changed");
        self.events.publish(CacheEvent::MaxSizeChanged { max_size });
        Ok(())
    }

    /// Remove and tear down every entry. Outstanding admissions are kept.
    pub fn purge(&self) {
        let mut state = self.state.lock();
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in &keys {
            state.remove_entry(key);
        }
        drop(state);

        info!(count = keys.len(), "cache purged");
        self.events.publish(CacheEvent::Purged);
    }

    pub fn max_size(&self) -> u64 {
        self.state.lock().max_size
    }

    /// Bytes held by committed entries.
    pub fn current_size(&self) -> u64 {
        self.state.lock().current_size
    }

    /// Bytes admitted but not yet committed.
    pub fn reserved_size(&self) -> u64 {
        self.state.lock().reserved_size
    }

    pub fn available(&self) -> u64 {
        self.state.lock().available()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn release_reservation(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(size_bytes) = state.reserved.remove(key) {
            state.reserved_size -= size_bytes;
            debug!(key, size_bytes, "cache admission returned");
        }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cache")
            .field("max_size", &state.max_size)
            .field("current_size", &state.current_size)
            .field("reserved_size", &state.reserved_size)
            .field("entries", &state.entries.len())
            .finish()
    }
}

/// Bytes reserved by a successful [`Cache::admit`].
///
/// Dropping the admission without committing it gives the bytes back.
#[must_use = "an admission reserves cache bytes until committed or dropped"]
pub struct Admission {
    cache: Cache,
    key: String,
    size_bytes: u64,
    settled: bool,
}

impl Admission {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Turn the reservation into a cache entry holding `payload`.
    pub fn commit(mut self, payload: CachePayload) -> CacheResult<CacheEntry> {
        let actual = payload.size_bytes();
        if actual != self.size_bytes {
            return Err(CacheError::AdmissionMismatch {
                key: self.key.clone(),
                admitted: self.size_bytes,
                actual,
            });
        }

        let entry = CacheEntry {
            key: self.key.clone(),
            size_bytes: self.size_bytes,
            created_at: SystemTime::now(),
            kind: payload.kind(),
            payload,
        };

        {
            let mut state = self.cache.state.lock();
            state.reserved.remove(&self.key);
            state.reserved_size -= self.size_bytes;
            state.current_size += self.size_bytes;
            state.entries.insert(
                self.key.clone(),
                StoredEntry {
                    entry: entry.clone(),
                    last_access: Instant::now(),
                },
            );
        }
        self.settled = true;

        debug!(key = %entry.key, size_bytes = entry.size_bytes, kind = ?entry.kind, "cache entry added");
        self.cache.events.publish(CacheEvent::EntryAdded {
            key: entry.key.clone(),
            kind: entry.kind,
            size_bytes: entry.size_bytes,
        });
        Ok(entry)
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.release_reservation(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};
    use rstest::rstest;

    use super::*;

    fn cache(max_bytes: u64) -> Cache {
        Cache::new(CacheOptions::default().with_max_bytes(max_bytes))
    }

    fn gray(id: &str, width: u32, height: u32) -> CachedImage {
        let image = GrayImage::from_pixel(width, height, Luma([7u8]));
        CachedImage::new(id, DynamicImage::ImageLuma8(image))
    }

    fn assert_accounting(cache: &Cache) {
        let state = cache.state.lock();
        let sum: u64 = state.entries.values().map(|s| s.entry.size_bytes).sum();
        assert_eq!(state.current_size, sum);
        assert!(state.current_size + state.reserved_size <= state.max_size);
    }

    #[test]
    fn admission_over_budget_does_not_mutate() {
        let cache = cache(100);
        let err = cache.admit("vol", 101).err().unwrap();
        assert!(matches!(
            err,
            CacheError::CacheSizeExceeded {
                requested: 101,
                available: 100,
                max_size: 100
            }
        ));
        assert_eq!(cache.current_size(), 0);
        assert_eq!(cache.reserved_size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn reservations_count_against_budget() {
        let cache = cache(100);
        let first = cache.admit("a", 60).unwrap();
        assert!(cache.admit("b", 60).is_err());
        drop(first);
        assert_eq!(cache.reserved_size(), 0);
        let _second = cache.admit("b", 60).unwrap();
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let cache = cache(1_000);
        cache.put_image(gray("img", 4, 4)).unwrap();
        assert!(matches!(
            cache.admit("img", 1),
            Err(CacheError::DuplicateKey(_))
        ));
        let _pending = cache.admit("pending", 1).unwrap();
        assert!(matches!(
            cache.admit("pending", 1),
            Err(CacheError::DuplicateKey(_))
        ));
    }

    #[test]
    fn commit_with_wrong_size_returns_reservation() {
        let cache = cache(1_000);
        let admission = cache.admit("img", 10).unwrap();
        let image = CachePayload::Image(Arc::new(gray("img", 4, 4)));
        assert!(matches!(
            admission.commit(image),
            Err(CacheError::AdmissionMismatch { actual: 16, .. })
        ));
        assert_eq!(cache.reserved_size(), 0);
        assert!(!cache.contains("img"));
    }

    #[rstest]
    #[case(&[("a", 4, 4), ("b", 2, 8), ("c", 10, 1)], &["b"])]
    #[case(&[("a", 4, 4)], &["a"])]
    #[case(&[("a", 1, 1), ("b", 1, 1), ("c", 1, 1)], &["a", "b", "c"])]
    fn size_tracks_entries(#[case] images: &[(&str, u32, u32)], #[case] removed: &[&str]) {
        let cache = cache(10_000);
        for (id, w, h) in images {
            cache.put_image(gray(id, *w, *h)).unwrap();
            assert_accounting(&cache);
        }
        for key in removed {
            cache.remove(key).unwrap();
            assert_accounting(&cache);
        }
        assert_eq!(cache.len(), images.len() - removed.len());
    }

    #[test]
    fn remove_missing_key_is_an_error() {
        let cache = cache(10);
        assert!(matches!(cache.remove("nope"), Err(CacheError::NotFound(_))));
    }

    #[test]
    fn shrinking_below_usage_is_rejected() {
        let cache = cache(1_000);
        cache.put_image(gray("img", 10, 10)).unwrap();
        assert!(matches!(
            cache.set_max_size(99),
            Err(CacheError::MaxSizeBelowUsage {
                requested: 99,
                current: 100
            })
        ));
        assert_eq!(cache.max_size(), 1_000);
        cache.set_max_size(100).unwrap();
        assert_eq!(cache.available(), 0);
    }

    #[test]
    fn purge_empties_the_cache() {
        let cache = cache(1_000);
        cache.put_image(gray("a", 2, 2)).unwrap();
        cache.put_image(gray("b", 3, 3)).unwrap();
        cache.purge();
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn evict_lru_removes_oldest_first() {
        let cache = cache(30);
        cache.put_image(gray("old", 10, 1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.put_image(gray("mid", 10, 1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.put_image(gray("new", 10, 1)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.get("old");

        let evicted = cache.evict_lru(10);
        assert_eq!(evicted, vec!["mid".to_string()]);
        assert!(cache.contains("old"));
        assert_accounting(&cache);
    }

    #[tokio::test]
    async fn mutations_are_published() {
        let cache = cache(1_000);
        let mut rx = cache.subscribe();
        cache.put_image(gray("img", 2, 2)).unwrap();
        cache.remove("img").unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            CacheEvent::EntryAdded {
                key: "img".into(),
                kind: EntryKind::Image,
                size_bytes: 4
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CacheEvent::EntryRemoved {
                key: "img".into(),
                kind: EntryKind::Image,
                size_bytes: 4
            }
        );
    }
}
