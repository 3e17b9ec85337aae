//! Pure distance kernels on the search hot path.
//!
//! All kernels return `f32`. `Hamming` and `Jaccard` operate over bit-packed
//! `u64` vectors; the others operate over `f32` vectors of equal length.

/// A distance function over two equal-length `f32` vectors.
pub type FloatDistFn = fn(&[f32], &[f32]) -> f32;

/// Selects one of the kernels below by name, so a [`crate::vector_store::VectorStore`]
/// can be configured with a loggable, serializable value instead of an opaque
/// function pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DistanceKind {
    /// Negative dot product ordering (larger dot product = closer).
    Dot,
    /// Squared Euclidean distance.
    SquaredEuclidean,
    /// 1 - cosine similarity.
    Cosine,
    /// Great-circle distance in metres; vectors must have length 2 (lat, lon) in degrees.
    Haversine,
}

impl DistanceKind {
    /// Returns the concrete kernel function for this variant.
    pub fn kernel(self) -> FloatDistFn {
        match self {
            DistanceKind::Dot => dot,
            DistanceKind::SquaredEuclidean => squared_euclidean,
            DistanceKind::Cosine => cosine,
            DistanceKind::Haversine => haversine,
        }
    }
}

/// Dot product: `Σ xᵢ·yᵢ`.
pub fn dot(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    x.iter().zip(y).map(|(a, b)| a * b).sum()
}

/// Squared Euclidean distance: `Σ (xᵢ−yᵢ)²`. Not square-rooted: preserves
/// ordering and avoids a costly operation on the hot path.
pub fn squared_euclidean(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    x.iter().zip(y).map(|(a, b)| (a - b) * (a - b)).sum()
}

/// Cosine distance: `1 − dot(x,y)/(‖x‖·‖y‖)`.
///
/// Callers that can afford to pre-normalize vectors should prefer [`dot`]
/// directly and skip the per-call norm computation.
pub fn cosine(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    let d = dot(x, y);
    let norm_x = dot(x, x).sqrt();
    let norm_y = dot(y, y).sqrt();
    if norm_x == 0.0 || norm_y == 0.0 {
        return 1.0;
    }
    1.0 - d / (norm_x * norm_y)
}

/// Haversine great-circle distance in metres. `x` and `y` are `[lat, lon]` in
/// degrees. Uses the standard formula with earth radius 6_371_000 m.
pub fn haversine(x: &[f32], y: &[f32]) -> f32 {
    debug_assert_eq!(x.len(), 2);
    debug_assert_eq!(y.len(), 2);
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let lat1 = (x[0] as f64).to_radians();
    let lat2 = (y[0] as f64).to_radians();
    let dlat = lat2 - lat1;
    let dlon = (y[1] as f64 - x[1] as f64).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    (EARTH_RADIUS_M * c) as f32
}

/// Hamming distance over bit-packed `u64` vectors: `Σ popcount(xᵢ XOR yᵢ)`.
pub fn hamming(x: &[u64], y: &[u64]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    x.iter()
        .zip(y)
        .map(|(a, b)| (a ^ b).count_ones())
        .sum::<u32>() as f32
}

/// Jaccard distance over bit-packed `u64` vectors:
/// `1 − popcount(x AND y) / popcount(x OR y)`. Returns 0 when both bitmaps
/// are empty (tie-break convention).
pub fn jaccard(x: &[u64], y: &[u64]) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    let mut inter = 0u32;
    let mut union = 0u32;
    for (a, b) in x.iter().zip(y) {
        inter += (a & b).count_ones();
        union += (a | b).count_ones();
    }
    if union == 0 {
        return 0.0;
    }
    1.0 - (inter as f32 / union as f32)
}
