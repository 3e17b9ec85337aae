//! Layered proximity graph for approximate nearest-neighbour search.
//!
//! The graph is keyed purely by [`PointId`](u64) and driven by externally
//! supplied distance closures — it never reads a vector directly, which
//! keeps it independent of metric and quantisation (see
//! [`crate::vector_store`]). [`point`] layers a convenience entry point on
//! top for the common case of inserting raw vectors.

pub mod point;

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::conversion::node_key;
use crate::disk::Bucket;
use crate::error::{Error, Result};

const NODE_TAG: u8 = b'n';
const META_KEY: &[u8] = b"hnsw:meta";

/// Tuning parameters for the graph. `m0` and `ml` are derivable from `m`
/// (`m0 = 2*m`, `ml = 1/ln(m)`) but left overridable for callers who need a
/// non-standard graph shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Neighbors per node at layers above 0.
    pub m: usize,
    /// Neighbors per node at layer 0, conventionally `2*m`.
    pub m0: usize,
    /// Candidate queue size used while inserting.
    pub ef_construction: usize,
    /// Candidate queue size used while searching.
    pub ef_search: usize,
    /// Level-assignment scale, conventionally `1/ln(m)`.
    pub ml: f64,
}

impl HnswParams {
    /// Derives `m0` and `ml` from `m` per the standard formulas.
    pub fn with_m(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            m,
            m0: 2 * m,
            ef_construction,
            ef_search,
            ml: 1.0 / (m as f64).ln(),
        }
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::with_m(16, 200, 50)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    top_layer: usize,
    /// `neighbors[layer]` holds this node's neighbor ids at that layer, for
    /// `layer` in `0..=top_layer`.
    neighbors: Vec<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct GraphMeta {
    entry_point: Option<u64>,
    params: Option<HnswParams>,
}

/// A PointId-keyed HNSW graph, persisted one record per node plus a
/// singleton meta record holding the entry point and parameters.
pub struct HnswGraph {
    params: HnswParams,
}

impl HnswGraph {
    /// Opens the graph against `bucket`, persisting `params` as the active
    /// configuration if no graph has been built yet (an existing meta
    /// record's params win, so re-opening a graph is idempotent).
    pub fn open(bucket: &dyn Bucket, params: HnswParams) -> Result<Self> {
        let mut meta = Self::load_meta(bucket)?;
        let params = match meta.params {
            Some(existing) => existing,
            None => {
                meta.params = Some(params);
                Self::save_meta(bucket, &meta)?;
                params
            }
        };
        Ok(Self { params })
    }

    fn load_meta(bucket: &dyn Bucket) -> Result<GraphMeta> {
        match bucket.get(META_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::Serialization(format!("corrupt hnsw meta record: {e}"))),
            None => Ok(GraphMeta::default()),
        }
    }

    fn save_meta(bucket: &dyn Bucket, meta: &GraphMeta) -> Result<()> {
        let bytes = bincode::serialize(meta)
            .map_err(|e| Error::Serialization(format!("failed to serialize hnsw meta record: {e}")))?;
        bucket.put(META_KEY, &bytes)
    }

    fn load_node(bucket: &dyn Bucket, id: u64) -> Result<Option<NodeRecord>> {
        match bucket.get(&node_key(id, NODE_TAG))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes)
                    .map_err(|e| Error::Serialization(format!("corrupt hnsw node record: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    fn save_node(bucket: &dyn Bucket, id: u64, record: &NodeRecord) -> Result<()> {
        let bytes = bincode::serialize(record)
            .map_err(|e| Error::Serialization(format!("failed to serialize hnsw node record: {e}")))?;
        bucket.put(&node_key(id, NODE_TAG), &bytes)
    }

    fn delete_node(bucket: &dyn Bucket, id: u64) -> Result<()> {
        bucket.delete(&node_key(id, NODE_TAG))
    }

    /// Returns this graph's effective parameters.
    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Current entry point, if any point has been inserted.
    pub fn entry_point(&self, bucket: &dyn Bucket) -> Result<Option<u64>> {
        Ok(Self::load_meta(bucket)?.entry_point)
    }

    fn random_level(&self) -> usize {
        let u: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..1.0);
        (-u.ln() * self.params.ml).floor() as usize
    }

    /// Inserts `id` into the graph. `dist` computes the distance between any
    /// two already-stored points (assumed symmetric, as every shipped
    /// kernel is); callers typically derive it from
    /// [`crate::vector_store::VectorStore::distance_from_point`] and `id`'s
    /// vector must already be stored before this call.
    pub fn insert(&self, bucket: &dyn Bucket, id: u64, dist: &dyn Fn(u64, u64) -> f32) -> Result<()> {
        let mut meta = Self::load_meta(bucket)?;
        let level = self.random_level();

        let entry_point = match meta.entry_point {
            None => {
                Self::save_node(
                    bucket,
                    id,
                    &NodeRecord {
                        top_layer: level,
                        neighbors: vec![Vec::new(); level + 1],
                    },
                )?;
                meta.entry_point = Some(id);
                Self::save_meta(bucket, &meta)?;
                return Ok(());
            }
            Some(ep) => ep,
        };

        let ep_node = Self::load_node(bucket, entry_point)?
            .ok_or_else(|| Error::Invariant("entry point node record missing".into()))?;

        let mut current = entry_point;
        let mut current_dist = dist(id, current);
        for layer in (level + 1..=ep_node.top_layer).rev() {
            let frontier = self.search_layer(bucket, &|a| dist(id, a), &[(current, current_dist)], 1, layer)?;
            if let Some(&(best, best_dist)) = frontier.first() {
                current = best;
                current_dist = best_dist;
            }
        }

        let mut node_neighbors: Vec<Vec<u64>> = vec![Vec::new(); level + 1];
        let mut entry_candidates = vec![(current, current_dist)];

        for layer in (0..=level.min(ep_node.top_layer)).rev() {
            let candidates = self.search_layer(
                bucket,
                &|a| dist(id, a),
                &entry_candidates,
                self.params.ef_construction,
                layer,
            )?;
            let cap = if layer == 0 { self.params.m0 } else { self.params.m };
            let selected = self.select_heuristic(bucket, id, &candidates, cap, dist)?;

            // A neighbor's own re-prune (triggered by pushing `id` past `cap`)
            // can drop `id` again; only keep edges both sides still agree on.
            let mut reciprocated: Vec<u64> = Vec::new();
            for &(neighbor, _) in &selected {
                let mut neighbor_node = Self::load_node(bucket, neighbor)?
                    .ok_or_else(|| Error::Invariant("neighbor node record missing".into()))?;
                if layer > neighbor_node.top_layer {
                    continue;
                }
                if !neighbor_node.neighbors[layer].contains(&id) {
                    neighbor_node.neighbors[layer].push(id);
                    if neighbor_node.neighbors[layer].len() > cap {
                        let repruned = self.reprune(bucket, neighbor, layer, cap, dist)?;
                        neighbor_node.neighbors[layer] = repruned;
                    }
                    Self::save_node(bucket, neighbor, &neighbor_node)?;
                }
                if neighbor_node.neighbors[layer].contains(&id) {
                    reciprocated.push(neighbor);
                }
            }

            node_neighbors[layer] = reciprocated;
            entry_candidates = candidates;
        }

        Self::save_node(
            bucket,
            id,
            &NodeRecord {
                top_layer: level,
                neighbors: node_neighbors,
            },
        )?;

        if level > ep_node.top_layer {
            meta.entry_point = Some(id);
            Self::save_meta(bucket, &meta)?;
        }

        Ok(())
    }

    /// Re-runs heuristic selection over `node`'s current layer-`layer`
    /// neighbors, capping the result at `cap`.
    fn reprune(
        &self,
        bucket: &dyn Bucket,
        node: u64,
        layer: usize,
        cap: usize,
        dist: &dyn Fn(u64, u64) -> f32,
    ) -> Result<Vec<u64>> {
        let record = Self::load_node(bucket, node)?
            .ok_or_else(|| Error::Invariant("node record missing during re-prune".into()))?;
        let candidates: Vec<(u64, f32)> = record.neighbors[layer]
            .iter()
            .map(|&n| (n, dist(node, n)))
            .collect();
        let selected = self.select_heuristic(bucket, node, &candidates, cap, dist)?;
        Ok(selected.into_iter().map(|(n, _)| n).collect())
    }

    /// Retains a candidate only if it is closer to `anchor` than to any
    /// already-selected neighbor, enforcing graph diversity; falls back to
    /// filling remaining slots by distance if the heuristic leaves fewer
    /// than `cap` candidates.
    fn select_heuristic(
        &self,
        _bucket: &dyn Bucket,
        anchor: u64,
        candidates: &[(u64, f32)],
        cap: usize,
        dist: &dyn Fn(u64, u64) -> f32,
    ) -> Result<Vec<(u64, f32)>> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected: Vec<(u64, f32)> = Vec::new();
        let mut leftover: Vec<(u64, f32)> = Vec::new();
        for &(candidate, d_to_anchor) in &sorted {
            if candidate == anchor {
                continue;
            }
            let diverse = selected
                .iter()
                .all(|&(chosen, _)| d_to_anchor < dist(candidate, chosen));
            if diverse {
                selected.push((candidate, d_to_anchor));
                if selected.len() == cap {
                    return Ok(selected);
                }
            } else {
                leftover.push((candidate, d_to_anchor));
            }
        }
        for item in leftover {
            if selected.len() == cap {
                break;
            }
            if !selected.iter().any(|&(id, _)| id == item.0) {
                selected.push(item);
            }
        }
        Ok(selected)
    }

    /// Best-first search at a single layer, returning up to `ef` nearest
    /// neighbors to the (implicit) query, ordered ascending by distance.
    fn search_layer(
        &self,
        bucket: &dyn Bucket,
        dist_from_query: &dyn Fn(u64) -> f32,
        entry_points: &[(u64, f32)],
        ef: usize,
        layer: usize,
    ) -> Result<Vec<(u64, f32)>> {
        let mut visited: HashSet<u64> = entry_points.iter().map(|&(id, _)| id).collect();
        let mut candidates: Vec<(u64, f32)> = entry_points.to_vec();
        let mut results: Vec<(u64, f32)> = entry_points.to_vec();

        loop {
            candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let Some((c_id, c_dist)) = candidates.first().copied() else {
                break;
            };
            candidates.remove(0);

            results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let worst = results.last().map(|&(_, d)| d).unwrap_or(f32::MAX);
            if results.len() >= ef && c_dist > worst {
                break;
            }

            let node = match Self::load_node(bucket, c_id)? {
                Some(n) => n,
                None => continue,
            };
            if layer > node.top_layer {
                continue;
            }
            for &neighbor in &node.neighbors[layer] {
                if visited.insert(neighbor) {
                    let d = dist_from_query(neighbor);
                    results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                    let worst = results.last().map(|&(_, dd)| dd).unwrap_or(f32::MAX);
                    if results.len() < ef || d < worst {
                        candidates.push((neighbor, d));
                        results.push((neighbor, d));
                        if results.len() > ef {
                            results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                            results.pop();
                        }
                    }
                }
            }
        }

        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(ef);
        Ok(results)
    }

    /// Returns the `k` nearest points to a query anchored by `dist_from_query`
    /// (typically [`crate::vector_store::VectorStore::distance_from_float`]).
    pub fn search(&self, bucket: &dyn Bucket, dist_from_query: &dyn Fn(u64) -> f32, k: usize) -> Result<Vec<(u64, f32)>> {
        let meta = Self::load_meta(bucket)?;
        let Some(entry_point) = meta.entry_point else {
            return Ok(Vec::new());
        };
        let ep_node = Self::load_node(bucket, entry_point)?
            .ok_or_else(|| Error::Invariant("entry point node record missing".into()))?;

        let mut current = entry_point;
        let mut current_dist = dist_from_query(current);
        for layer in (1..=ep_node.top_layer).rev() {
            let frontier = self.search_layer(bucket, dist_from_query, &[(current, current_dist)], 1, layer)?;
            if let Some(&(best, best_dist)) = frontier.first() {
                current = best;
                current_dist = best_dist;
            }
        }

        let ef = self.params.ef_search.max(k);
        let frontier = self.search_layer(bucket, dist_from_query, &[(current, current_dist)], ef, 0)?;
        Ok(frontier.into_iter().take(k).collect())
    }

    /// Removes `id` and all its edges. If `id` was the entry point, the
    /// highest-layer surviving node becomes the new entry point.
    pub fn delete(&self, bucket: &dyn Bucket, id: u64) -> Result<()> {
        let Some(node) = Self::load_node(bucket, id)? else {
            return Ok(());
        };

        for (layer, neighbors) in node.neighbors.iter().enumerate() {
            for &neighbor in neighbors {
                if let Some(mut neighbor_node) = Self::load_node(bucket, neighbor)? {
                    if layer <= neighbor_node.top_layer {
                        neighbor_node.neighbors[layer].retain(|&n| n != id);
                        Self::save_node(bucket, neighbor, &neighbor_node)?;
                    }
                }
            }
        }
        Self::delete_node(bucket, id)?;

        let mut meta = Self::load_meta(bucket)?;
        if meta.entry_point == Some(id) {
            meta.entry_point = self.find_new_entry_point(bucket)?;
            Self::save_meta(bucket, &meta)?;
        }
        Ok(())
    }

    fn find_new_entry_point(&self, bucket: &dyn Bucket) -> Result<Option<u64>> {
        let mut best: Option<(u64, usize)> = None;
        bucket.prefix_scan(&[NODE_TAG], &mut |key, value| {
            let (id, ok) = crate::conversion::node_id_from_key(key, NODE_TAG);
            if !ok {
                return Ok(());
            }
            let record: NodeRecord = bincode::deserialize(value)
                .map_err(|e| Error::Serialization(format!("corrupt hnsw node record: {e}")))?;
            if best.map(|(_, top)| record.top_layer > top).unwrap_or(true) {
                best = Some((id, record.top_layer));
            }
            Ok(())
        })?;
        Ok(best.map(|(id, _)| id))
    }
}
