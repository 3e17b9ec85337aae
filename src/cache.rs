//! Write-back in-memory cache over an entity keyed by `u64` id.
//!
//! Entries are held in a [`DashMap`] for lock-free concurrent access. Every
//! entry carries a dirty bit; [`ItemCache::flush`] writes dirty entries to the
//! backing [`Bucket`] through the [`Cacheable`] codec and clears the bit. There
//! is no eviction policy: the cache grows with the working set and callers
//! are responsible for bounding it (or accepting unbounded memory use), per
//! the collection's read/write volume.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::disk::Bucket;
use crate::error::{Error, Result};

/// Encodes and decodes a cached value to/from its on-disk byte representation.
pub trait Cacheable: Sized {
    /// Decodes a value previously written by [`Cacheable::to_bytes`].
    fn from_bytes(bytes: &[u8]) -> Result<Self>;

    /// Encodes this value for storage.
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Approximate heap size in bytes, used by [`ItemCache::size_in_memory`].
    fn size_in_memory(&self) -> usize;
}

struct Entry<V> {
    value: V,
    dirty: AtomicBool,
}

/// A write-back cache from `u64` id to `V`, backed by one [`Bucket`].
pub struct ItemCache<V> {
    entries: DashMap<u64, Entry<V>>,
    key_tag: u8,
}

impl<V: Cacheable + Clone> ItemCache<V> {
    /// Creates an empty cache. `key_tag` is the byte prefixing every id in
    /// the backing bucket's composite keys (see [`crate::conversion::node_key`]).
    pub fn new(key_tag: u8) -> Self {
        Self {
            entries: DashMap::new(),
            key_tag,
        }
    }

    fn get_opt(&self, bucket: &dyn Bucket, id: u64) -> Result<Option<V>> {
        if let Some(entry) = self.entries.get(&id) {
            return Ok(Some(entry.value.clone()));
        }
        let key = crate::conversion::node_key(id, self.key_tag);
        match bucket.get(&key)? {
            Some(bytes) => {
                let value = V::from_bytes(&bytes)?;
                self.entries.insert(
                    id,
                    Entry {
                        value: value.clone(),
                        dirty: AtomicBool::new(false),
                    },
                );
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Looks up `id`, falling back to `bucket` and populating the cache (as
    /// clean) on a cache miss. Fails with [`Error::NotFound`] if `id` is
    /// absent from both.
    pub fn get(&self, bucket: &dyn Bucket, id: u64) -> Result<V> {
        self.get_opt(bucket, id)?.ok_or(Error::NotFound)
    }

    /// Looks up many ids at once, preserving input order. All-or-nothing:
    /// fails with [`Error::NotFound`] if any id is absent from both the cache
    /// and `bucket`.
    pub fn get_many(&self, bucket: &dyn Bucket, ids: &[u64]) -> Result<Vec<(u64, V)>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            out.push((id, self.get(bucket, id)?));
        }
        Ok(out)
    }

    /// Inserts or overwrites `id`, marking it dirty. Not written through to
    /// `bucket` until [`ItemCache::flush`].
    pub fn put(&self, id: u64, value: V) {
        self.entries.insert(
            id,
            Entry {
                value,
                dirty: AtomicBool::new(true),
            },
        );
    }

    /// Removes `id` from the cache and deletes it from `bucket` immediately.
    pub fn delete(&self, bucket: &dyn Bucket, id: u64) -> Result<()> {
        self.entries.remove(&id);
        let key = crate::conversion::node_key(id, self.key_tag);
        bucket.delete(&key)
    }

    /// Iterates every cached entry in unspecified order, stopping at the
    /// first error `f` returns.
    pub fn for_each(&self, mut f: impl FnMut(u64, &V) -> Result<()>) -> Result<()> {
        for entry in self.entries.iter() {
            f(*entry.key(), &entry.value().value)?;
        }
        Ok(())
    }

    /// Writes every dirty entry to `bucket` and clears its dirty bit.
    pub fn flush(&self, bucket: &dyn Bucket) -> Result<()> {
        for entry in self.entries.iter() {
            if entry.value().dirty.load(Ordering::SeqCst) {
                let key = crate::conversion::node_key(*entry.key(), self.key_tag);
                let bytes = entry.value().value.to_bytes()?;
                bucket.put(&key, &bytes)?;
                entry.value().dirty.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Returns whether `id` is cached and carries unflushed writes, clearing
    /// its dirty bit as a side effect if it is clean to begin with this has
    /// no effect.
    pub fn check_and_clear_dirty(&self, id: u64) -> bool {
        match self.entries.get(&id) {
            Some(entry) => entry.dirty.swap(false, Ordering::SeqCst),
            None => false,
        }
    }

    /// Sum of [`Cacheable::size_in_memory`] across all cached entries, plus a
    /// fixed per-entry bookkeeping overhead.
    pub fn size_in_memory(&self) -> usize {
        const PER_ENTRY_OVERHEAD: usize = std::mem::size_of::<u64>() + std::mem::size_of::<bool>();
        self.entries
            .iter()
            .map(|e| PER_ENTRY_OVERHEAD + e.value().value.size_in_memory())
            .sum()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::memory::MemoryDiskStore;
    use crate::disk::DiskStore;

    #[derive(Clone, PartialEq, Debug)]
    struct Toy(u32);

    impl Cacheable for Toy {
        fn from_bytes(bytes: &[u8]) -> Result<Self> {
            Ok(Toy(u32::from_le_bytes(bytes.try_into().unwrap())))
        }

        fn to_bytes(&self) -> Result<Vec<u8>> {
            Ok(self.0.to_le_bytes().to_vec())
        }

        fn size_in_memory(&self) -> usize {
            std::mem::size_of::<u32>()
        }
    }

    #[test]
    fn put_then_get_returns_cached_value_without_touching_bucket() {
        let store = MemoryDiskStore::new();
        let cache: ItemCache<Toy> = ItemCache::new(b'v');
        store
            .read(|bm| {
                let b = bm.get("items")?;
                cache.put(1, Toy(42));
                assert_eq!(cache.get(&*b, 1).unwrap(), Toy(42));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn flush_writes_dirty_entries_and_clears_the_bit() {
        let store = MemoryDiskStore::new();
        let cache: ItemCache<Toy> = ItemCache::new(b'v');
        store
            .write(|bm| {
                let b = bm.get("items")?;
                cache.put(1, Toy(7));
                assert!(cache.check_and_clear_dirty(1));
                cache.put(1, Toy(7));
                cache.flush(&*b)?;
                assert!(!cache.check_and_clear_dirty(1));
                Ok(())
            })
            .unwrap();

        store
            .read(|bm| {
                let b = bm.get("items")?;
                let fresh_cache: ItemCache<Toy> = ItemCache::new(b'v');
                assert_eq!(fresh_cache.get(&*b, 1).unwrap(), Toy(7));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn get_falls_back_to_bucket_on_miss() {
        let store = MemoryDiskStore::new();
        store
            .write(|bm| {
                let b = bm.get("items")?;
                b.put(&crate::conversion::node_key(9, b'v'), &Toy(99).to_bytes().unwrap())?;
                Ok(())
            })
            .unwrap();

        store
            .read(|bm| {
                let b = bm.get("items")?;
                let cache: ItemCache<Toy> = ItemCache::new(b'v');
                assert_eq!(cache.get(&*b, 9).unwrap(), Toy(99));
                assert_eq!(cache.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_removes_from_cache_and_bucket() {
        let store = MemoryDiskStore::new();
        let cache: ItemCache<Toy> = ItemCache::new(b'v');
        store
            .write(|bm| {
                let b = bm.get("items")?;
                cache.put(1, Toy(1));
                cache.flush(&*b)?;
                cache.delete(&*b, 1)?;
                assert!(matches!(cache.get(&*b, 1), Err(Error::NotFound)));
                Ok(())
            })
            .unwrap();
    }
}
