use std::collections::HashSet;
use std::sync::atomic::AtomicBool;

use metamorphose::disk::file::FileDiskStore;
use metamorphose::disk::memory::MemoryDiskStore;
use metamorphose::disk::DiskStore;
use metamorphose::distance::DistanceKind;
use metamorphose::hnsw::point::{insert_vectors, meta_search, MetaVector};
use metamorphose::hnsw::{HnswGraph, HnswParams};
use metamorphose::inverted::string::{IndexInvertedString, IndexStringParameters};
use metamorphose::inverted::{IndexChange, Operator};
use metamorphose::vector_store::PlainVectorStore;

#[test]
fn hnsw_toy_scenario_finds_the_three_nearest() {
    let store = MemoryDiskStore::new();
    store
        .write(|bm| {
            let b = bm.get("vectors").unwrap();
            let graph = HnswGraph::open(&*b, HnswParams::with_m(4, 64, 16)).unwrap();
            let vs = PlainVectorStore::new(DistanceKind::SquaredEuclidean);

            let vectors = vec![
                MetaVector::new(1, vec![1.0, 0.0, -5.0]), // a
                MetaVector::new(2, vec![2.0, 3.0, -5.0]), // b
                MetaVector::new(3, vec![-4.0, 2.0, -5.0]), // c
                MetaVector::new(4, vec![3.0, 9.0, -5.0]), // d
                MetaVector::new(5, vec![1.0, 1.0, -5.0]), // e
            ];
            insert_vectors(&graph, &vs, &*b, &vectors).unwrap();

            let results = meta_search(&graph, &vs, &*b, &[1.0, 0.0, -4.0], 3).unwrap();
            let ids: HashSet<u64> = results.iter().map(|&(id, _)| id).collect();
            assert_eq!(ids, HashSet::from([1, 5, 2]), "expected {{a, e, b}}, got {ids:?}");
            Ok(())
        })
        .unwrap();
}

#[test]
fn inverted_string_case_insensitive_scenario() {
    let store = MemoryDiskStore::new();
    store
        .write(|bm| {
            let b = bm.get("name").unwrap();
            let index = IndexInvertedString::new(IndexStringParameters { case_sensitive: false });

            index.apply_changes(
                &*b,
                vec![
                    IndexChange {
                        id: 1,
                        previous_data: None,
                        current_data: Some("Alpha".to_string()),
                    },
                    IndexChange {
                        id: 2,
                        previous_data: None,
                        current_data: Some("alpha".to_string()),
                    },
                    IndexChange {
                        id: 3,
                        previous_data: None,
                        current_data: Some("Beta".to_string()),
                    },
                ],
                &AtomicBool::new(false),
            );

            let eq_alpha = index.search(&*b, Operator::Eq("ALPHA".to_string()), None).unwrap();
            assert_eq!(eq_alpha.iter().collect::<Vec<_>>(), vec![1, 2]);

            let mut universe = roaring::RoaringTreemap::new();
            universe.insert(1);
            universe.insert(2);
            universe.insert(3);
            let ne_alpha = index.search(&*b, Operator::Ne("alpha".to_string()), Some(&universe)).unwrap();
            assert_eq!(ne_alpha.iter().collect::<Vec<_>>(), vec![3]);
            Ok(())
        })
        .unwrap();
}

#[test]
fn write_transaction_abort_is_invisible_to_new_readers() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileDiskStore::open(dir.path()).unwrap();

    let result: metamorphose::Result<()> = store.write(|bm| {
        let b = bm.get("points").unwrap();
        b.put(b"k", b"v").unwrap();
        Err(metamorphose::Error::Invariant("simulated failure".into()))
    });
    assert!(result.is_err());

    store
        .read(|bm| {
            let b = bm.get("points").unwrap();
            assert_eq!(b.get(b"k").unwrap(), None);
            Ok(())
        })
        .unwrap();
}

#[test]
fn hnsw_edges_stay_symmetric_after_inserts_and_deletes() {
    use rand::Rng;

    let store = MemoryDiskStore::new();
    store
        .write(|bm| {
            let b = bm.get("vectors").unwrap();
            let graph = HnswGraph::open(&*b, HnswParams::with_m(4, 32, 8)).unwrap();
            let vs = PlainVectorStore::new(DistanceKind::SquaredEuclidean);

            let mut rng = rand::thread_rng();
            let vectors: Vec<MetaVector> = (0..40)
                .map(|id| MetaVector::new(id, (0..8).map(|_| rng.gen_range(-10.0..10.0)).collect()))
                .collect();
            insert_vectors(&graph, &vs, &*b, &vectors).unwrap();

            assert_symmetric(&*b);

            graph.delete(&*b, 3).unwrap();
            graph.delete(&*b, 17).unwrap();
            assert_symmetric(&*b);
            Ok(())
        })
        .unwrap();
}

fn assert_symmetric(bucket: &dyn metamorphose::disk::Bucket) {
    let mut all_ids = Vec::new();
    bucket
        .prefix_scan(&[b'n'], &mut |key, _| {
            let (id, ok) = metamorphose::conversion::node_id_from_key(key, b'n');
            if ok {
                all_ids.push(id);
            }
            Ok(())
        })
        .unwrap();

    for &id in &all_ids {
        let key = metamorphose::conversion::node_key(id, b'n');
        let bytes = bucket.get(&key).unwrap().unwrap();
        let record: NodeRecordShape = bincode::deserialize(&bytes).unwrap();
        for (layer, neighbors) in record.neighbors.iter().enumerate() {
            for &neighbor in neighbors {
                let neighbor_key = metamorphose::conversion::node_key(neighbor, b'n');
                let neighbor_bytes = bucket.get(&neighbor_key).unwrap().unwrap();
                let neighbor_record: NodeRecordShape = bincode::deserialize(&neighbor_bytes).unwrap();
                assert!(
                    neighbor_record.neighbors[layer].contains(&id),
                    "edge {id}->{neighbor} at layer {layer} is not symmetric"
                );
            }
        }
    }
}

/// Mirrors the private on-disk node record shape closely enough to decode it
/// for this test's own verification purposes.
#[derive(serde::Deserialize)]
struct NodeRecordShape {
    #[allow(dead_code)]
    top_layer: usize,
    neighbors: Vec<Vec<u64>>,
}

#[test]
fn hnsw_recall_against_brute_force_is_at_least_90_percent() {
    use rand::Rng;

    const N: usize = 1000;
    const DIM: usize = 32;
    const K: usize = 10;

    let store = MemoryDiskStore::new();
    store
        .write(|bm| {
            let b = bm.get("vectors").unwrap();
            let graph = HnswGraph::open(&*b, HnswParams::with_m(16, 200, 50)).unwrap();
            let vs = PlainVectorStore::new(DistanceKind::SquaredEuclidean);

            let mut rng = rand::thread_rng();
            let vectors: Vec<Vec<f32>> = (0..N)
                .map(|_| (0..DIM).map(|_| rng.gen_range(-1.0..1.0)).collect())
                .collect();
            let metavecs: Vec<MetaVector> = vectors
                .iter()
                .enumerate()
                .map(|(i, v)| MetaVector::new(i as u64, v.clone()))
                .collect();
            insert_vectors(&graph, &vs, &*b, &metavecs).unwrap();

            let query = vectors[0].clone();
            let approx = meta_search(&graph, &vs, &*b, &query, K).unwrap();
            let approx_ids: HashSet<u64> = approx.iter().map(|&(id, _)| id).collect();

            let mut brute: Vec<(u64, f32)> = vectors
                .iter()
                .enumerate()
                .map(|(id, v)| (id as u64, metamorphose::distance::squared_euclidean(&query, v)))
                .collect();
            brute.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            let exact_ids: HashSet<u64> = brute.iter().take(K).map(|&(id, _)| id).collect();

            let overlap = approx_ids.intersection(&exact_ids).count();
            let recall = overlap as f64 / K as f64;
            assert!(recall >= 0.9, "recall {recall} below 0.9 threshold");
            Ok(())
        })
        .unwrap();
}
