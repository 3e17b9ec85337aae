//! Convenience entry point: insert raw vectors and query by vector without
//! hand-wiring a [`VectorStore`].

use super::{HnswGraph, HnswParams};
use crate::disk::Bucket;
use crate::distance::DistanceKind;
use crate::error::Result;
use crate::vector_store::{PlainVectorStore, VectorStore};

/// Any value that exposes an id and an embedding; the default (and only
/// shipped) implementor is [`MetaVector`].
pub trait Embeddable {
    fn id(&self) -> u64;
    fn embedding(&self) -> &[f32];
}

/// A point identified by a `u64` id and a raw embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaVector {
    /// The point's id.
    pub id: u64,
    /// The point's raw embedding.
    pub embedding: Vec<f32>,
}

impl MetaVector {
    pub fn new(id: u64, embedding: Vec<f32>) -> Self {
        Self { id, embedding }
    }
}

impl Embeddable for MetaVector {
    fn id(&self) -> u64 {
        self.id
    }

    fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

/// Stores each of `vectors` into `store` and inserts it into `graph`, driving
/// both through `store`'s own distance closures. Lets a caller reproduce the
/// graph-by-vector workflow without building pairwise distance closures by
/// hand.
pub fn insert_vectors<E: Embeddable>(
    graph: &HnswGraph,
    store: &PlainVectorStore,
    bucket: &dyn Bucket,
    vectors: &[E],
) -> Result<()> {
    for v in vectors {
        store.set(bucket, v.id(), v.embedding().to_vec())?;
    }
    for v in vectors {
        let dist = |a: u64, b: u64| {
            let dist_fn = store.distance_from_point(bucket, a);
            dist_fn(b)
        };
        graph.insert(bucket, v.id(), &dist)?;
    }
    Ok(())
}

/// Returns the `k` nearest stored vectors to `query`, by id and distance.
pub fn meta_search(
    graph: &HnswGraph,
    store: &PlainVectorStore,
    bucket: &dyn Bucket,
    query: &[f32],
    k: usize,
) -> Result<Vec<(u64, f32)>> {
    let dist_from_query = store.distance_from_float(bucket, query.to_vec());
    graph.search(bucket, &*dist_from_query, k)
}

/// Builds a [`PlainVectorStore`] and [`HnswGraph`] together, matching the
/// original's `NewMetaGraph` convenience constructor.
pub fn new_meta_graph(bucket: &dyn Bucket, dist_kind: DistanceKind, params: HnswParams) -> Result<(HnswGraph, PlainVectorStore)> {
    let graph = HnswGraph::open(bucket, params)?;
    let store = PlainVectorStore::new(dist_kind);
    Ok((graph, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::memory::MemoryDiskStore;
    use crate::disk::DiskStore;

    #[test]
    fn add_then_meta_search_reproduces_toy_scenario() {
        let store_disk = MemoryDiskStore::new();
        store_disk
            .write(|bm| {
                let b = bm.get("vectors")?;
                let (graph, store) = new_meta_graph(&*b, DistanceKind::SquaredEuclidean, HnswParams::with_m(4, 32, 8))?;

                let vectors = vec![
                    MetaVector::new(1, vec![1.0, 0.0, -5.0]),
                    MetaVector::new(2, vec![2.0, 3.0, -5.0]),
                    MetaVector::new(3, vec![-4.0, 2.0, -5.0]),
                    MetaVector::new(4, vec![3.0, 9.0, -5.0]),
                    MetaVector::new(5, vec![1.0, 1.0, -5.0]),
                ];
                insert_vectors(&graph, &store, &*b, &vectors)?;

                let results = meta_search(&graph, &store, &*b, &[1.0, 0.0, -4.0], 3)?;
                assert_eq!(results.len(), 3);
                let ids: Vec<u64> = results.iter().map(|&(id, _)| id).collect();
                assert!(ids.contains(&1));
                Ok(())
            })
            .unwrap();
    }
}
