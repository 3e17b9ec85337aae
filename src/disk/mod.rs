//! Transactional bucketed key-value abstraction: the persistence substrate.
//!
//! A [`Bucket`] is a named ordered byte-string map inhabiting a transaction.
//! A [`BucketManager`] vends buckets by name, scoped to one transaction. A
//! [`DiskStore`] opens read or write transactions against an underlying
//! storage engine and hands the callback a `BucketManager`.
//!
//! Two implementations share this contract: [`file::FileDiskStore`], backed
//! by `sled`, and [`memory::MemoryDiskStore`], an in-memory map-of-maps
//! guarded by a read-write lock.

pub mod file;
pub mod memory;

use crate::error::Result;
use std::collections::BTreeMap;

/// A named ordered map from byte-string key to byte-string value.
///
/// Buckets obtained by a thread are that thread's responsibility; concurrent
/// access to the *same* bucket instance from multiple threads is not
/// defined. Distinct buckets may be accessed concurrently.
pub trait Bucket: Send + Sync {
    /// Whether mutating this bucket will fail.
    fn is_read_only(&self) -> bool;

    /// Point lookup. Absence is distinguished from an empty value by `None`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite a key. Fails on a read-only bucket.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a key. A no-op success if the key is absent. Fails on a
    /// read-only bucket.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Iterates all entries in ascending key order, stopping at the first
    /// error `f` returns.
    fn for_each(&self, f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()>;

    /// Iterates entries whose key starts with `prefix`, in ascending key
    /// order, stopping at the first error `f` returns.
    fn prefix_scan(&self, prefix: &[u8], f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()>;

    /// Iterates entries within `[start, end)` or `[start, end]` (per
    /// `inclusive`), in ascending key order. `start`/`end` of `None` means
    /// unbounded on that side. Stopping at the first error `f` returns.
    fn range_scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        inclusive: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()>;
}

/// Vends [`Bucket`]s by name, scoped to a single transaction.
///
/// In write transactions, `get` auto-creates a missing bucket. In read
/// transactions, `get` returns an empty read-only bucket and never fails for
/// absence. `delete` is only valid in write transactions.
pub trait BucketManager: Send + Sync {
    /// Returns the named bucket, creating it if this manager belongs to a
    /// write transaction and it does not yet exist.
    fn get(&self, name: &str) -> Result<Box<dyn Bucket>>;

    /// Deletes an entire named bucket. Only valid in write transactions.
    fn delete(&self, name: &str) -> Result<()>;
}

/// Opens read or write transactions against an underlying storage engine.
///
/// `Read` and `Write` take a closure rather than returning a transaction
/// handle so the implementation can enforce the single-writer/multi-reader
/// contract for exactly the closure's duration.
pub trait DiskStore {
    /// Opens a read-only transaction. Multiple readers may run concurrently.
    fn read<T>(&self, f: impl FnOnce(&dyn BucketManager) -> Result<T>) -> Result<T>;

    /// Opens a read-write transaction. At most one writer runs at a time and
    /// writers exclude readers. If `f` returns an error, all mutations made
    /// through the supplied manager are discarded. On success, mutations are
    /// durably committed before this call returns.
    fn write<T>(&self, f: impl FnOnce(&dyn BucketManager) -> Result<T>) -> Result<T>;

    /// Writes a consistent snapshot of the store to `path` (mode 0644),
    /// under a read transaction.
    fn backup_to_file(&self, path: &std::path::Path) -> Result<()>;

    /// Current on-disk size in bytes. The in-memory variant reports 0.
    fn size_in_bytes(&self) -> Result<u64>;

    /// Releases all resources. Further calls to this store fail.
    fn close(&self) -> Result<()>;
}

/// Tombstone-aware overlay: `None` marks a staged delete, `Some` a staged
/// put. Shared by the write-side bucket implementations that need
/// read-your-writes without touching the underlying engine until commit.
pub(crate) type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Applies `overlay` on top of a materialized snapshot of committed data,
/// producing the final ordered view a bucket should scan over.
pub(crate) fn apply_overlay(base: &mut BTreeMap<Vec<u8>, Vec<u8>>, overlay: &Overlay) {
    for (k, v) in overlay {
        match v {
            Some(value) => {
                base.insert(k.clone(), value.clone());
            }
            None => {
                base.remove(k);
            }
        }
    }
}

/// Shared `for_each` over an already-ordered materialized map.
pub(crate) fn for_each_ordered(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
) -> Result<()> {
    for (k, v) in map {
        f(k, v)?;
    }
    Ok(())
}

/// Shared `prefix_scan` over an already-ordered materialized map.
pub(crate) fn prefix_scan_ordered(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
    f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
) -> Result<()> {
    for (k, v) in map.range(prefix.to_vec()..) {
        if !k.starts_with(prefix) {
            break;
        }
        f(k, v)?;
    }
    Ok(())
}

/// Shared `range_scan` over an already-ordered materialized map, implementing
/// the exact inclusivity semantics from the spec.
pub(crate) fn range_scan_ordered(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
    inclusive: bool,
    f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
) -> Result<()> {
    for (k, v) in map {
        let k_slice = k.as_slice();
        if let Some(s) = start {
            if k_slice < s || (!inclusive && k_slice == s) {
                continue;
            }
        }
        if let Some(e) = end {
            if inclusive {
                if k_slice > e {
                    break;
                }
            } else if k_slice >= e {
                break;
            }
        }
        f(k, v)?;
    }
    Ok(())
}

/// An always-empty, read-only bucket: what a read-transaction `get` returns
/// for a bucket name that was never written.
pub(crate) struct EmptyReadOnlyBucket;

impl Bucket for EmptyReadOnlyBucket {
    fn is_read_only(&self) -> bool {
        true
    }

    fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(crate::error::Error::ReadOnly)
    }

    fn delete(&self, _key: &[u8]) -> Result<()> {
        Err(crate::error::Error::ReadOnly)
    }

    fn for_each(&self, _f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        Ok(())
    }

    fn prefix_scan(&self, _prefix: &[u8], _f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        Ok(())
    }

    fn range_scan(
        &self,
        _start: Option<&[u8]>,
        _end: Option<&[u8]>,
        _inclusive: bool,
        _f: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }
}
