//! In-memory map-of-maps `DiskStore`, guarded by a read-write lock.
//!
//! Mirrors the file-backed store's contract exactly, without durability:
//! `BackupToFile` fails explicitly and `SizeInBytes` always reports 0. Write
//! transactions stage mutations in an [`super::Overlay`] per bucket, exactly
//! as [`super::file::FileDiskStore`] does over `sled`, and apply them to the
//! shared map only after the transaction closure returns `Ok` — so a failing
//! closure leaves the store exactly as it found it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use super::{
    apply_overlay, for_each_ordered, prefix_scan_ordered, range_scan_ordered, Bucket,
    BucketManager, DiskStore, Overlay,
};
use crate::error::{Error, Result};

type BucketData = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// In-memory [`DiskStore`]. Useful for tests and for collections that do not
/// need durability.
pub struct MemoryDiskStore {
    buckets: Arc<RwLock<HashMap<String, BucketData>>>,
    tx_lock: Arc<RwLock<()>>,
    closed: std::sync::atomic::AtomicBool,
}

impl MemoryDiskStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            tx_lock: Arc::new(RwLock::new(())),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::Invariant("disk store is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryDiskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskStore for MemoryDiskStore {
    fn read<T>(&self, f: impl FnOnce(&dyn BucketManager) -> Result<T>) -> Result<T> {
        self.check_open()?;
        let _guard = self.tx_lock.read().expect("disk store lock poisoned");
        let bm = MemReadBucketManager {
            buckets: self.buckets.clone(),
        };
        f(&bm)
    }

    fn write<T>(&self, f: impl FnOnce(&dyn BucketManager) -> Result<T>) -> Result<T> {
        self.check_open()?;
        let _guard = self.tx_lock.write().expect("disk store lock poisoned");
        let bm = MemWriteBucketManager {
            buckets: self.buckets.clone(),
            registry: Mutex::new(HashMap::new()),
            pending_bucket_deletes: Mutex::new(HashSet::new()),
        };
        let result = f(&bm)?;
        bm.commit();
        Ok(result)
    }

    fn backup_to_file(&self, _path: &std::path::Path) -> Result<()> {
        Err(Error::Invariant("backup is not supported by the in-memory store".into()))
    }

    fn size_in_bytes(&self) -> Result<u64> {
        Ok(0)
    }

    fn close(&self) -> Result<()> {
        self.check_open()?;
        self.buckets.write().expect("disk store lock poisoned").clear();
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

struct MemReadBucketManager {
    buckets: Arc<RwLock<HashMap<String, BucketData>>>,
}

impl BucketManager for MemReadBucketManager {
    fn get(&self, name: &str) -> Result<Box<dyn Bucket>> {
        let mut buckets = self.buckets.write().expect("bucket registry lock poisoned");
        let data = buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .clone();
        Ok(Box::new(MemReadBucket { data }))
    }

    fn delete(&self, _name: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

struct MemReadBucket {
    data: BucketData,
}

impl Bucket for MemReadBucket {
    fn is_read_only(&self) -> bool {
        true
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().expect("bucket lock poisoned").get(key).cloned())
    }

    fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn delete(&self, _key: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let snapshot = self.data.read().expect("bucket lock poisoned").clone();
        for_each_ordered(&snapshot, f)
    }

    fn prefix_scan(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let snapshot = self.data.read().expect("bucket lock poisoned").clone();
        prefix_scan_ordered(&snapshot, prefix, f)
    }

    fn range_scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        inclusive: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let snapshot = self.data.read().expect("bucket lock poisoned").clone();
        range_scan_ordered(&snapshot, start, end, inclusive, f)
    }
}

/// A bucket's staged state within one write transaction: the shared map it is
/// backed by plus the overlay accumulated so far.
struct StagedMemBucket {
    data: BucketData,
    overlay: Arc<Mutex<Overlay>>,
}

struct MemWriteBucketManager {
    buckets: Arc<RwLock<HashMap<String, BucketData>>>,
    registry: Mutex<HashMap<String, StagedMemBucket>>,
    pending_bucket_deletes: Mutex<HashSet<String>>,
}

impl MemWriteBucketManager {
    /// Applies every bucket's overlay onto the shared map, then drops buckets
    /// named in `pending_bucket_deletes`. Called once after the transaction
    /// closure returns successfully.
    fn commit(&self) {
        let registry = self.registry.lock().expect("bucket registry lock poisoned");
        for staged in registry.values() {
            let overlay = staged.overlay.lock().expect("bucket overlay lock poisoned");
            if overlay.is_empty() {
                continue;
            }
            let mut data = staged.data.write().expect("bucket lock poisoned");
            apply_overlay(&mut data, &overlay);
        }
        drop(registry);

        let pending_deletes = self.pending_bucket_deletes.lock().expect("pending deletes lock poisoned");
        if !pending_deletes.is_empty() {
            let mut buckets = self.buckets.write().expect("bucket registry lock poisoned");
            for name in pending_deletes.iter() {
                buckets.remove(name);
            }
        }
    }
}

impl BucketManager for MemWriteBucketManager {
    fn get(&self, name: &str) -> Result<Box<dyn Bucket>> {
        let mut registry = self.registry.lock().expect("bucket registry lock poisoned");
        let staged = match registry.get(name) {
            Some(s) => s,
            None => {
                let data = self
                    .buckets
                    .write()
                    .expect("bucket registry lock poisoned")
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
                    .clone();
                registry.insert(
                    name.to_string(),
                    StagedMemBucket {
                        data,
                        overlay: Arc::new(Mutex::new(Overlay::new())),
                    },
                );
                registry.get(name).expect("just inserted")
            }
        };
        Ok(Box::new(MemWriteBucket {
            data: staged.data.clone(),
            overlay: staged.overlay.clone(),
        }))
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.registry.lock().expect("bucket registry lock poisoned").remove(name);
        self.pending_bucket_deletes
            .lock()
            .expect("pending deletes lock poisoned")
            .insert(name.to_string());
        Ok(())
    }
}

struct MemWriteBucket {
    data: BucketData,
    overlay: Arc<Mutex<Overlay>>,
}

impl MemWriteBucket {
    /// Materializes the shared map's committed contents with the in-flight
    /// overlay applied, for scans that must see uncommitted writes from this
    /// transaction (read-your-writes).
    fn materialize(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut base = self.data.read().expect("bucket lock poisoned").clone();
        let overlay = self.overlay.lock().expect("bucket overlay lock poisoned");
        apply_overlay(&mut base, &overlay);
        base
    }
}

impl Bucket for MemWriteBucket {
    fn is_read_only(&self) -> bool {
        false
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let overlay = self.overlay.lock().expect("bucket overlay lock poisoned");
        if let Some(staged) = overlay.get(key) {
            return Ok(staged.clone());
        }
        drop(overlay);
        Ok(self.data.read().expect("bucket lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.overlay
            .lock()
            .expect("bucket overlay lock poisoned")
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.overlay
            .lock()
            .expect("bucket overlay lock poisoned")
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        for_each_ordered(&self.materialize(), f)
    }

    fn prefix_scan(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        prefix_scan_ordered(&self.materialize(), prefix, f)
    }

    fn range_scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        inclusive: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        range_scan_ordered(&self.materialize(), start, end, inclusive, f)
    }
}
