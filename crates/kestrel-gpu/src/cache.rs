//! Content-addressed caches of transient GPU objects.
//!
//! Render passes, framebuffers, pipelines and descriptor sets are created
//! implicitly while recording. Each kind has an [`ObjectCache`] mapping a
//! content hash to the objects whose keys hashed to it, and every cached
//! object is also listed in [`CachedResources`] so the frame orchestrator can
//! collect the ones that went unused.

use hashbrown::HashMap;

use crate::error::{GpuError, Result};
use crate::handle::{GpuObject, Handle, HandleTable, RawHandle};

/// Key describing a cached object's content.
pub trait CacheKey {
    /// Hash over every field that affects the created object.
    fn content_hash(&self) -> u64;

    /// Equality under the same rules as [`Self::content_hash`].
    fn content_eq(&self, other: &Self) -> bool;
}

struct Entry<K, T> {
    key: K,
    handle: Handle<T>,
}

/// Hash-bucketed cache for one object kind.
pub struct ObjectCache<K, T> {
    buckets: HashMap<u64, Vec<Entry<K, T>>>,
    len: usize,
}

impl<K, T> Default for ObjectCache<K, T> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            len: 0,
        }
    }
}

impl<K: CacheKey, T> ObjectCache<K, T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the object created from a key equal to `key`.
    pub fn find(&self, hash: u64, key: &K) -> Option<Handle<T>> {
        self.buckets
            .get(&hash)?
            .iter()
            .find(|entry| entry.key.content_eq(key))
            .map(|entry| entry.handle)
    }

    /// Insert a newly created object.
    pub fn insert(&mut self, hash: u64, key: K, handle: Handle<T>) -> Result<()> {
        let bucket = self.buckets.entry(hash).or_default();

        if bucket.iter().any(|entry| entry.key.content_eq(&key)) {
            return Err(GpuError::InvalidArgument(format!(
                "duplicate cache entry for hash {hash:#018x}"
            )));
        }

        bucket.push(Entry { key, handle });
        self.len += 1;
        Ok(())
    }

    /// Remove the entry for `handle`, returning its key.
    pub fn remove(&mut self, hash: u64, handle: Handle<T>) -> Option<K> {
        let bucket = self.buckets.get_mut(&hash)?;
        let position = bucket.iter().position(|entry| entry.handle == handle)?;
        let entry = bucket.swap_remove(position);

        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }

        self.len -= 1;
        Some(entry.key)
    }

    /// Remove `handle` from `table` and from this cache.
    pub fn evict(&mut self, table: &mut HandleTable<T>, handle: Handle<T>) -> Option<T>
    where
        T: GpuObject,
    {
        let object = table.remove(handle)?;
        self.remove(object.header().hash, handle);
        Some(object)
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mutable access to every stored key.
    ///
    /// Keys may be edited so that they no longer match lookups, but their
    /// bucket stays the same.
    pub fn keys_mut(&mut self) -> impl Iterator<Item = &mut K> {
        self.buckets
            .values_mut()
            .flat_map(|bucket| bucket.iter_mut().map(|entry| &mut entry.key))
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }
}

/// Whether an object last used at `last_used` is stale at `frame_count`.
///
/// Frame stamps are 32-bit and compared modulo 2^32.
pub fn is_stale(frame_count: u64, last_used: u32, threshold: u32) -> bool {
    (frame_count as u32).wrapping_sub(last_used) >= threshold
}

/// Every live cached object, in creation order.
#[derive(Debug, Default)]
pub struct CachedResources {
    entries: Vec<RawHandle>,
}

impl CachedResources {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly cached object.
    pub fn push(&mut self, handle: RawHandle) {
        self.entries.push(handle);
    }

    /// Number of tracked objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate tracked objects in creation order.
    pub fn iter(&self) -> impl Iterator<Item = RawHandle> + '_ {
        self.entries.iter().copied()
    }

    /// Unlink and return every object that went unused for `threshold`
    /// frames.
    ///
    /// `last_used` resolves an object's last-used stamp, returning `None`
    /// for objects that no longer exist; those are unlinked silently.
    pub fn collect_stale(
        &mut self,
        frame_count: u64,
        threshold: u32,
        mut last_used: impl FnMut(RawHandle) -> Option<u32>,
    ) -> Vec<RawHandle> {
        let mut stale = Vec::new();

        self.entries.retain(|&handle| match last_used(handle) {
            Some(stamp) if is_stale(frame_count, stamp, threshold) => {
                stale.push(handle);
                false
            }
            Some(_) => true,
            None => false,
        });

        stale
    }

    /// Unlink everything, newest first.
    pub fn drain(&mut self) -> Vec<RawHandle> {
        let mut drained = std::mem::take(&mut self.entries);
        drained.reverse();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{ObjectHeader, ObjectKind};
    use crate::release::ReleaseQueue;

    #[derive(Clone)]
    struct Key(u32, &'static str);

    impl CacheKey for Key {
        fn content_hash(&self) -> u64 {
            u64::from(self.0)
        }

        fn content_eq(&self, other: &Self) -> bool {
            self.0 == other.0 && self.1 == other.1
        }
    }

    struct Object(ObjectHeader);

    impl GpuObject for Object {
        const KIND: ObjectKind = ObjectKind::Pipeline;

        fn header(&self) -> &ObjectHeader {
            &self.0
        }

        fn header_mut(&mut self) -> &mut ObjectHeader {
            &mut self.0
        }
    }

    fn object(last_frame_used: u32) -> Object {
        Object(ObjectHeader {
            last_frame_used,
            ..ObjectHeader::default()
        })
    }

    #[test]
    fn colliding_hashes_are_told_apart_by_equality() {
        let mut table = HandleTable::new();
        let mut cache = ObjectCache::new();
        let a = table.insert(object(0));
        let b = table.insert(object(0));

        cache.insert(1, Key(1, "a"), a).unwrap();
        cache.insert(1, Key(1, "b"), b).unwrap();

        assert_eq!(cache.find(1, &Key(1, "a")), Some(a));
        assert_eq!(cache.find(1, &Key(1, "b")), Some(b));
        assert_eq!(cache.find(1, &Key(1, "c")), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut table = HandleTable::new();
        let mut cache = ObjectCache::new();
        let a = table.insert(object(0));
        let b = table.insert(object(0));

        cache.insert(5, Key(5, "x"), a).unwrap();
        assert!(matches!(
            cache.insert(5, Key(5, "x"), b),
            Err(GpuError::InvalidArgument(_))
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn removed_entries_are_no_longer_found() {
        let mut table = HandleTable::new();
        let mut cache = ObjectCache::new();
        let a = table.insert(object(0));

        cache.insert(9, Key(9, "x"), a).unwrap();
        assert!(cache.remove(9, a).is_some());
        assert!(cache.find(9, &Key(9, "x")).is_none());
        assert!(cache.is_empty());
        assert!(cache.remove(9, a).is_none());
    }

    #[test]
    fn edited_keys_stop_matching() {
        let mut table = HandleTable::new();
        let mut cache = ObjectCache::new();
        let a = table.insert(object(0));
        cache.insert(3, Key(3, "view"), a).unwrap();

        for key in cache.keys_mut() {
            key.1 = "cleared";
        }

        assert!(cache.find(3, &Key(3, "view")).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn staleness_wraps_modulo_32_bits() {
        assert!(!is_stale(10, 10, 60));
        assert!(!is_stale(69, 10, 60));
        assert!(is_stale(70, 10, 60));
        assert!(!is_stale(u64::from(u32::MAX) + 5, u32::MAX - 5, 60));
        assert!(is_stale(u64::from(u32::MAX) + 60, u32::MAX, 60));
    }

    #[test]
    fn collect_stale_keeps_recently_used_objects() {
        let mut table = HandleTable::new();
        let fresh = table.insert(object(100));
        let old = table.insert(object(20));
        let gone = table.insert(object(100));
        table.remove(gone);

        let mut list = CachedResources::new();
        for handle in [fresh.raw(), old.raw(), gone.raw()] {
            list.push(handle);
        }

        let stale = list.collect_stale(100, 60, |raw| {
            Handle::<Object>::from_raw(raw)
                .and_then(|h| table.get(h))
                .map(|o| o.0.last_frame_used)
        });

        assert_eq!(stale, vec![old.raw()]);
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![fresh.raw()]);
    }

    #[test]
    fn unused_objects_are_evicted_and_recreated_on_the_next_miss() {
        const THRESHOLD: u32 = 3;
        let mut table = HandleTable::new();
        let mut cache = ObjectCache::new();
        let mut list = CachedResources::new();
        let mut released = ReleaseQueue::new(2);

        let cached = |hash: u64| {
            Object(ObjectHeader {
                hash,
                ..ObjectHeader::default()
            })
        };
        let idle = table.insert(cached(4));
        let busy = table.insert(cached(8));
        cache.insert(4, Key(4, "idle"), idle).unwrap();
        cache.insert(8, Key(8, "busy"), busy).unwrap();
        list.push(idle.raw());
        list.push(busy.raw());

        let mut collect = |frame: u64, table: &mut HandleTable<Object>| {
            if let Some(object) = table.get_mut(busy) {
                object.0.last_frame_used = frame as u32;
            }
            let stale = list.collect_stale(frame, THRESHOLD, |raw| {
                Handle::<Object>::from_raw(raw)
                    .and_then(|h| table.get(h))
                    .map(|o| o.0.last_frame_used)
            });
            for raw in stale {
                let evicted = Handle::from_raw(raw).and_then(|h| cache.evict(table, h));
                if let Some(object) = evicted {
                    released.push(object, frame);
                }
            }
        };

        collect(2, &mut table);
        assert!(table.get(idle).is_some());
        collect(3, &mut table);
        assert!(table.get(idle).is_none());
        assert!(table.get(busy).is_some());

        assert_eq!(cache.find(4, &Key(4, "idle")), None);
        assert_eq!(cache.find(8, &Key(8, "busy")), Some(busy));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![busy.raw()]);

        // Destruction waits for the frames that may still use the object.
        assert_eq!(released.process(4, drop), 0);
        assert_eq!(released.process(5, drop), 1);

        let recreated = table.insert(cached(4));
        cache.insert(4, Key(4, "idle"), recreated).unwrap();
        assert_ne!(recreated, idle);
        assert_eq!(cache.find(4, &Key(4, "idle")), Some(recreated));
        assert!(table.get(idle).is_none());
    }
}
