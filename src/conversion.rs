//! Fixed-endian codecs for ids, float32 vectors, and composite keys.
//!
//! Vectors are packed little-endian on disk; ids are packed big-endian so
//! that lexicographic key ordering matches numeric id ordering, which the
//! cache and the inverted index's range scans rely on.

use crate::error::{Error, Result};

/// Packs a slice of `f32` into a tightly-packed little-endian byte buffer.
pub fn float32_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Inverse of [`float32_to_bytes`]. Fails if `b.len()` is not a multiple of 4.
pub fn bytes_to_float32(b: &[u8]) -> Result<Vec<f32>> {
    if b.len() % 4 != 0 {
        return Err(Error::Serialization(format!(
            "vector payload length {} is not a multiple of 4",
            b.len()
        )));
    }
    Ok(b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Builds a 9-byte composite key: `[tag][big-endian u64 id]`.
///
/// Big-endian is required so that lexicographic ordering of keys equals
/// numeric ordering of ids.
pub fn node_key(id: u64, tag: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(tag);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Inverse of [`node_key`]: extracts the id from a key built with the given
/// tag. Returns `(id, true)` on a well-formed match, `(0, false)` otherwise.
pub fn node_id_from_key(key: &[u8], tag: u8) -> (u64, bool) {
    if key.len() != 9 || key[0] != tag {
        return (0, false);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[1..9]);
    (u64::from_be_bytes(buf), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float32_round_trip() {
        let v = vec![1.0f32, -2.5, 0.0, f32::MAX, f32::MIN_POSITIVE];
        let bytes = float32_to_bytes(&v);
        assert_eq!(bytes.len(), v.len() * 4);
        let back = bytes_to_float32(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn bytes_to_float32_rejects_misaligned_length() {
        assert!(bytes_to_float32(&[0, 1, 2]).is_err());
    }

    #[test]
    fn node_key_round_trips_for_many_ids() {
        for id in [0u64, 1, 42, u64::MAX, u64::MAX - 1, 1 << 40] {
            let key = node_key(id, b'v');
            assert_eq!(key.len(), 9);
            assert_eq!(node_id_from_key(&key, b'v'), (id, true));
        }
    }

    #[test]
    fn node_key_ordering_matches_numeric_ordering() {
        let mut ids = vec![5u64, 300, 1, u64::MAX, 0, 65536];
        let mut keys: Vec<Vec<u8>> = ids.iter().map(|&id| node_key(id, b'v')).collect();
        ids.sort_unstable();
        keys.sort();
        let ids_from_sorted_keys: Vec<u64> = keys
            .iter()
            .map(|k| node_id_from_key(k, b'v').0)
            .collect();
        assert_eq!(ids, ids_from_sorted_keys);
    }

    #[test]
    fn node_id_from_key_rejects_wrong_tag_or_length() {
        let key = node_key(7, b'v');
        assert_eq!(node_id_from_key(&key, b'n'), (0, false));
        assert_eq!(node_id_from_key(&key[..8], b'v'), (0, false));
    }
}
