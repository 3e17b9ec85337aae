//! Persistent, cached `PointId -> vector` mapping plus distance-closure
//! factories for the HNSW graph.

use tracing::warn;

use crate::cache::{Cacheable, ItemCache};
use crate::conversion::{bytes_to_float32, float32_to_bytes};
use crate::disk::Bucket;
use crate::distance::{DistanceKind, FloatDistFn};
use crate::error::{Error, Result};

/// A stored point: its id and its raw vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// The point's id.
    pub id: u64,
    /// The point's raw, unquantized vector.
    pub vector: Vec<f32>,
}

impl Cacheable for Point {
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::Serialization("point payload shorter than id prefix".into()));
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&bytes[..8]);
        let id = u64::from_be_bytes(id_bytes);
        let vector = bytes_to_float32(&bytes[8..])?;
        Ok(Point { id, vector })
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.vector.len() * 4);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&float32_to_bytes(&self.vector));
        Ok(out)
    }

    fn size_in_memory(&self) -> usize {
        std::mem::size_of::<u64>() + self.vector.len() * std::mem::size_of::<f32>()
    }
}

/// A closure from a point's id to its distance from some anchor.
pub type PointIdDistFn<'a> = Box<dyn Fn(u64) -> f32 + 'a>;

/// Persistent, cached mapping `PointId -> vector` plus distance-closure
/// factories handed to the HNSW graph.
pub trait VectorStore {
    /// Stores `vector` under `id`, returning the stored [`Point`]. Write-back:
    /// not persisted to `bucket` until [`VectorStore::flush`].
    fn set(&self, bucket: &dyn Bucket, id: u64, vector: Vec<f32>) -> Result<Point>;

    /// Looks up `id`. Fails with [`Error::NotFound`] if absent.
    fn get(&self, bucket: &dyn Bucket, id: u64) -> Result<Point>;

    /// Looks up many ids, preserving order. All-or-nothing: fails with
    /// [`Error::NotFound`] if any id is absent.
    fn get_many(&self, bucket: &dyn Bucket, ids: &[u64]) -> Result<Vec<Point>>;

    /// Whether `id` resolves to a stored vector.
    fn exists(&self, bucket: &dyn Bucket, id: u64) -> Result<bool>;

    /// Removes `id`.
    fn delete(&self, bucket: &dyn Bucket, id: u64) -> Result<()>;

    /// Iterates every stored point in unspecified order.
    fn for_each(&self, f: &mut dyn FnMut(&Point) -> Result<()>) -> Result<()>;

    /// Writes every pending cache entry to `bucket`.
    fn flush(&self, bucket: &dyn Bucket) -> Result<()>;

    /// Returns a closure from a stored point's id to `distFn(x, point.vec)`.
    /// Unresolvable points yield `f32::MAX` and log a warning.
    fn distance_from_float<'a>(&'a self, bucket: &'a dyn Bucket, x: Vec<f32>) -> PointIdDistFn<'a>;

    /// Same as [`VectorStore::distance_from_float`], anchored on a stored point.
    fn distance_from_point<'a>(&'a self, bucket: &'a dyn Bucket, p: u64) -> PointIdDistFn<'a>;

    /// Approximate resident memory of the cache, in bytes.
    fn size_in_memory(&self) -> usize;
}

/// Stores raw, unquantized vectors. Mirrors the original's plain store: the
/// sole shipped [`VectorStore`] implementor. A quantized variant can replace
/// it behind the same trait without HNSW ever seeing a vector directly.
pub struct PlainVectorStore {
    cache: ItemCache<Point>,
    dist_kind: DistanceKind,
}

impl PlainVectorStore {
    /// Creates a store using `dist_kind`'s kernel for distance closures.
    pub fn new(dist_kind: DistanceKind) -> Self {
        Self {
            cache: ItemCache::new(b'v'),
            dist_kind,
        }
    }

    fn kernel(&self) -> FloatDistFn {
        self.dist_kind.kernel()
    }
}

impl VectorStore for PlainVectorStore {
    fn set(&self, _bucket: &dyn Bucket, id: u64, vector: Vec<f32>) -> Result<Point> {
        let point = Point { id, vector };
        self.cache.put(id, point.clone());
        Ok(point)
    }

    fn get(&self, bucket: &dyn Bucket, id: u64) -> Result<Point> {
        self.cache.get(bucket, id)
    }

    fn get_many(&self, bucket: &dyn Bucket, ids: &[u64]) -> Result<Vec<Point>> {
        Ok(self
            .cache
            .get_many(bucket, ids)?
            .into_iter()
            .map(|(_, p)| p)
            .collect())
    }

    fn exists(&self, bucket: &dyn Bucket, id: u64) -> Result<bool> {
        match self.cache.get(bucket, id) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn delete(&self, bucket: &dyn Bucket, id: u64) -> Result<()> {
        self.cache.delete(bucket, id)
    }

    fn for_each(&self, f: &mut dyn FnMut(&Point) -> Result<()>) -> Result<()> {
        self.cache.for_each(|_, p| f(p))
    }

    fn flush(&self, bucket: &dyn Bucket) -> Result<()> {
        self.cache.flush(bucket)
    }

    fn distance_from_float<'a>(&'a self, bucket: &'a dyn Bucket, x: Vec<f32>) -> PointIdDistFn<'a> {
        let kernel = self.kernel();
        Box::new(move |id| match self.cache.get(bucket, id) {
            Ok(point) => kernel(&x, &point.vector),
            Err(Error::NotFound) => {
                warn!(point_id = id, "vector store: point not found, returning +inf distance");
                f32::MAX
            }
            Err(err) => {
                warn!(point_id = id, error = %err, "vector store: lookup failed, returning +inf distance");
                f32::MAX
            }
        })
    }

    fn distance_from_point<'a>(&'a self, bucket: &'a dyn Bucket, p: u64) -> PointIdDistFn<'a> {
        let kernel = self.kernel();
        Box::new(move |id| {
            let anchor = match self.cache.get(bucket, p) {
                Ok(point) => point,
                Err(Error::NotFound) => {
                    warn!(point_id = p, "vector store: anchor point not found, returning +inf distance");
                    return f32::MAX;
                }
                Err(err) => {
                    warn!(point_id = p, error = %err, "vector store: anchor lookup failed, returning +inf distance");
                    return f32::MAX;
                }
            };
            match self.cache.get(bucket, id) {
                Ok(point) => kernel(&anchor.vector, &point.vector),
                Err(Error::NotFound) => {
                    warn!(point_id = id, "vector store: point not found, returning +inf distance");
                    f32::MAX
                }
                Err(err) => {
                    warn!(point_id = id, error = %err, "vector store: lookup failed, returning +inf distance");
                    f32::MAX
                }
            }
        })
    }

    fn size_in_memory(&self) -> usize {
        self.cache.size_in_memory()
    }
}
