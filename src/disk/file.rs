//! `sled`-backed [`super::DiskStore`].
//!
//! `sled` does not expose dynamic, multi-tree transactions, so write
//! transactions are staged in memory as an [`super::Overlay`] per bucket and
//! applied as one [`sled::Batch`] per touched tree only after the closure
//! returns `Ok`. A failing closure never reaches `sled`, which gives the
//! required atomic-abort semantics at the cost of cross-tree commit being
//! best-effort rather than crash-atomic; see `DESIGN.md`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use super::{
    apply_overlay, for_each_ordered, prefix_scan_ordered, range_scan_ordered, Bucket,
    BucketManager, DiskStore, EmptyReadOnlyBucket, Overlay,
};
use crate::error::{Error, Result};

/// `sled`-backed [`DiskStore`].
pub struct FileDiskStore {
    db: sled::Db,
    tx_lock: Arc<RwLock<()>>,
    closed: std::sync::atomic::AtomicBool,
}

impl FileDiskStore {
    /// Opens (creating if absent) the `sled` database rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            tx_lock: Arc::new(RwLock::new(())),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::Invariant("disk store is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl DiskStore for FileDiskStore {
    fn read<T>(&self, f: impl FnOnce(&dyn BucketManager) -> Result<T>) -> Result<T> {
        self.check_open()?;
        let _guard = self.tx_lock.read().expect("disk store lock poisoned");
        let bm = FileReadBucketManager { db: &self.db };
        f(&bm)
    }

    fn write<T>(&self, f: impl FnOnce(&dyn BucketManager) -> Result<T>) -> Result<T> {
        self.check_open()?;
        let _guard = self.tx_lock.write().expect("disk store lock poisoned");
        let bm = FileWriteBucketManager {
            db: &self.db,
            registry: Mutex::new(HashMap::new()),
            pending_bucket_deletes: Mutex::new(HashSet::new()),
        };
        let result = f(&bm)?;
        bm.commit()?;
        Ok(result)
    }

    fn backup_to_file(&self, path: &Path) -> Result<()> {
        self.check_open()?;
        let _guard = self.tx_lock.read().expect("disk store lock poisoned");
        let dst = sled::open(path)?;
        for name in self.db.tree_names() {
            let src_tree = self.db.open_tree(&name)?;
            let dst_tree = dst.open_tree(&name)?;
            for kv in src_tree.iter() {
                let (k, v) = kv?;
                dst_tree.insert(k, v.to_vec())?;
            }
        }
        dst.flush()?;
        drop(dst);
        set_backup_file_permissions(path)?;
        Ok(())
    }

    fn size_in_bytes(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.db.size_on_disk()?)
    }

    fn close(&self) -> Result<()> {
        self.check_open()?;
        self.db.flush()?;
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// Matches the original's `tx.CopyFile(path, 0644)`: a `sled` backup is a
/// directory of files rather than bbolt's single file, so the mode is
/// applied to every regular file underneath it instead of to `path` itself.
/// A no-op on non-Unix targets, where the permission bits do not exist.
#[cfg(unix)]
fn set_backup_file_permissions(path: &Path) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let entry_path = entry.path();
            if entry_path.is_dir() {
                set_backup_file_permissions(&entry_path)?;
            } else {
                fs::set_permissions(&entry_path, fs::Permissions::from_mode(0o644))?;
            }
        }
    } else {
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_backup_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

struct FileReadBucketManager<'a> {
    db: &'a sled::Db,
}

impl BucketManager for FileReadBucketManager<'_> {
    fn get(&self, name: &str) -> Result<Box<dyn Bucket>> {
        if !self.db.tree_names().iter().any(|n| n.as_ref() == name.as_bytes()) {
            return Ok(Box::new(EmptyReadOnlyBucket));
        }
        let tree = self.db.open_tree(name)?;
        Ok(Box::new(FileReadBucket { tree }))
    }

    fn delete(&self, _name: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

struct FileReadBucket {
    tree: sled::Tree,
}

impl Bucket for FileReadBucket {
    fn is_read_only(&self) -> bool {
        true
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn delete(&self, _key: &[u8]) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        for kv in self.tree.iter() {
            let (k, v) = kv?;
            f(&k, &v)?;
        }
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        for kv in self.tree.scan_prefix(prefix) {
            let (k, v) = kv?;
            f(&k, &v)?;
        }
        Ok(())
    }

    fn range_scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        inclusive: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        use std::ops::Bound;
        let lower = match start {
            Some(s) => Bound::Included(s.to_vec()),
            None => Bound::Unbounded,
        };
        let upper = match end {
            Some(e) if inclusive => Bound::Included(e.to_vec()),
            Some(e) => Bound::Excluded(e.to_vec()),
            None => Bound::Unbounded,
        };
        for kv in self.tree.range((lower, upper)) {
            let (k, v) = kv?;
            f(&k, &v)?;
        }
        Ok(())
    }
}

/// A bucket's staged state within one write transaction: the tree it is
/// backed by plus the overlay accumulated so far.
struct StagedBucket {
    tree: sled::Tree,
    overlay: Arc<Mutex<Overlay>>,
}

struct FileWriteBucketManager<'a> {
    db: &'a sled::Db,
    registry: Mutex<HashMap<String, StagedBucket>>,
    pending_bucket_deletes: Mutex<HashSet<String>>,
}

impl FileWriteBucketManager<'_> {
    /// Applies every bucket's overlay as one `sled::Batch`, then drops trees
    /// named in `pending_bucket_deletes`. Called once after the transaction
    /// closure returns successfully.
    fn commit(&self) -> Result<()> {
        let registry = self.registry.lock().expect("bucket registry lock poisoned");
        for staged in registry.values() {
            let overlay = staged.overlay.lock().expect("bucket overlay lock poisoned");
            if overlay.is_empty() {
                continue;
            }
            let mut batch = sled::Batch::default();
            for (k, v) in overlay.iter() {
                match v {
                    Some(value) => batch.insert(k.as_slice(), value.as_slice()),
                    None => batch.remove(k.as_slice()),
                }
            }
            staged.tree.apply_batch(batch)?;
        }
        drop(registry);

        let pending_deletes = self.pending_bucket_deletes.lock().expect("pending deletes lock poisoned");
        for name in pending_deletes.iter() {
            self.db.drop_tree(name.as_bytes())?;
        }
        self.db.flush()?;
        Ok(())
    }
}

impl BucketManager for FileWriteBucketManager<'_> {
    fn get(&self, name: &str) -> Result<Box<dyn Bucket>> {
        let mut registry = self.registry.lock().expect("bucket registry lock poisoned");
        let staged = match registry.get(name) {
            Some(s) => s,
            None => {
                let tree = self.db.open_tree(name)?;
                registry.insert(
                    name.to_string(),
                    StagedBucket {
                        tree,
                        overlay: Arc::new(Mutex::new(Overlay::new())),
                    },
                );
                registry.get(name).expect("just inserted")
            }
        };
        Ok(Box::new(FileWriteBucket {
            tree: staged.tree.clone(),
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

struct FileWriteBucket {
    tree: sled::Tree,
    overlay: Arc<Mutex<Overlay>>,
}

impl FileWriteBucket {
    /// Materializes the tree's committed contents with the in-flight overlay
    /// applied, for scans that must see uncommitted writes from this
    /// transaction (read-your-writes).
    fn materialize(&self) -> Result<std::collections::BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut base = std::collections::BTreeMap::new();
        for kv in self.tree.iter() {
            let (k, v) = kv?;
            base.insert(k.to_vec(), v.to_vec());
        }
        let overlay = self.overlay.lock().expect("bucket overlay lock poisoned");
        apply_overlay(&mut base, &overlay);
        Ok(base)
    }
}

impl Bucket for FileWriteBucket {
    fn is_read_only(&self) -> bool {
        false
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let overlay = self.overlay.lock().expect("bucket overlay lock poisoned");
        if let Some(staged) = overlay.get(key) {
            return Ok(staged.clone());
        }
        drop(overlay);
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
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
        for_each_ordered(&self.materialize()?, f)
    }

    fn prefix_scan(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        prefix_scan_ordered(&self.materialize()?, prefix, f)
    }

    fn range_scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        inclusive: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        range_scan_ordered(&self.materialize()?, start, end, inclusive, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDiskStore::open(dir.path()).unwrap();

        store
            .write(|bm| {
                let b = bm.get("points")?;
                b.put(b"k", b"v")?;
                Ok(())
            })
            .unwrap();

        store
            .read(|bm| {
                let b = bm.get("points")?;
                assert_eq!(b.get(b"k").unwrap(), Some(b"v".to_vec()));
                Ok(())
            })
            .unwrap();

        store
            .write(|bm| {
                let b = bm.get("points")?;
                b.delete(b"k")?;
                Ok(())
            })
            .unwrap();

        store
            .read(|bm| {
                let b = bm.get("points")?;
                assert_eq!(b.get(b"k").unwrap(), None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn write_transaction_aborts_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDiskStore::open(dir.path()).unwrap();

        let result: Result<()> = store.write(|bm| {
            let b = bm.get("points")?;
            b.put(b"k", b"v")?;
            Err(Error::Invariant("boom".into()))
        });
        assert!(result.is_err());

        store
            .read(|bm| {
                let b = bm.get("points")?;
                assert_eq!(b.get(b"k").unwrap(), None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn read_transaction_never_creates_a_missing_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDiskStore::open(dir.path()).unwrap();

        store
            .read(|bm| {
                let b = bm.get("never-written")?;
                assert!(b.is_read_only());
                assert_eq!(b.get(b"k").unwrap(), None);
                assert!(matches!(b.put(b"k", b"v"), Err(Error::ReadOnly)));
                Ok(())
            })
            .unwrap();

        assert!(!store
            .db
            .tree_names()
            .iter()
            .any(|n| n.as_ref() == b"never-written"));
    }

    #[test]
    fn write_transaction_sees_its_own_uncommitted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDiskStore::open(dir.path()).unwrap();

        store
            .write(|bm| {
                let b = bm.get("points")?;
                b.put(b"a", b"1")?;
                b.put(b"b", b"2")?;
                let mut seen = Vec::new();
                b.for_each(&mut |k, v| {
                    seen.push((k.to_vec(), v.to_vec()));
                    Ok(())
                })?;
                assert_eq!(
                    seen,
                    vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn bucket_delete_removes_the_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDiskStore::open(dir.path()).unwrap();

        store
            .write(|bm| {
                let b = bm.get("points")?;
                b.put(b"k", b"v")?;
                bm.delete("points")?;
                Ok(())
            })
            .unwrap();

        store
            .read(|bm| {
                let b = bm.get("points")?;
                assert_eq!(b.get(b"k").unwrap(), None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn backup_to_file_copies_all_trees() {
        let src_dir = tempfile::tempdir().unwrap();
        let store = FileDiskStore::open(src_dir.path()).unwrap();
        store
            .write(|bm| {
                let b = bm.get("points")?;
                b.put(b"k", b"v")?;
                Ok(())
            })
            .unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let backup_path = dst_dir.path().join("backup");
        store.backup_to_file(&backup_path).unwrap();

        let restored = FileDiskStore::open(&backup_path).unwrap();
        restored
            .read(|bm| {
                let b = bm.get("points")?;
                assert_eq!(b.get(b"k").unwrap(), Some(b"v".to_vec()));
                Ok(())
            })
            .unwrap();
    }
}
