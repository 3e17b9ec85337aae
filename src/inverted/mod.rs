//! Secondary index: attribute value -> roaring bitmap of point ids.
//!
//! Each indexed attribute owns one [`Bucket`](crate::disk::Bucket) whose keys
//! are order-preserving encodings of the attribute's values and whose values
//! are serialized [`RoaringTreemap`]s of point ids. Scalar and array-valued
//! attributes share the same storage shape; [`string`] layers case-folding
//! on top for `String`-valued attributes.

pub mod string;

use std::sync::atomic::{AtomicBool, Ordering};

use roaring::RoaringTreemap;

use crate::disk::Bucket;
use crate::error::{Error, Result};

/// One insert, delete, or update for a point's value under one attribute.
///
/// `previous_data: None` means insert, `current_data: None` means delete,
/// both `Some` means update. Both `None` is a no-op.
pub struct IndexChange<V> {
    /// The point this change concerns.
    pub id: u64,
    /// The value before the change, or `None` for an insert.
    pub previous_data: Option<V>,
    /// The value after the change, or `None` for a delete.
    pub current_data: Option<V>,
}

/// Same as [`IndexChange`] but for array-valued attributes.
pub struct IndexArrayChange<V> {
    /// The point this change concerns.
    pub id: u64,
    /// The values before the change, or empty for an insert.
    pub previous_data: Vec<V>,
    /// The values after the change, or empty for a delete.
    pub current_data: Vec<V>,
}

/// Search operators over a scalar-valued attribute.
pub enum Operator<V> {
    /// Equal to a value.
    Eq(V),
    /// Not equal to a value, relative to a caller-supplied universe of ids.
    Ne(V),
    /// Strictly less than a value.
    Lt(V),
    /// Less than or equal to a value.
    Le(V),
    /// Strictly greater than a value.
    Gt(V),
    /// Greater than or equal to a value.
    Ge(V),
    /// Inclusively between two values.
    Between(V, V),
    /// Equal to one of a set of values.
    In(Vec<V>),
}

/// Search operators over an array-valued attribute.
pub enum ArrayOperator<V> {
    /// The point's array contains every given value.
    ContainsAll(Vec<V>),
    /// The point's array contains at least one given value.
    ContainsAny(Vec<V>),
    /// The point's array contains none of the given values.
    ContainsNone(Vec<V>),
}

/// Encodes a value into an order-preserving byte string: sorting encodings
/// lexicographically must sort values numerically (or alphabetically, for
/// `String`). This lets range operators compose directly against a bucket's
/// `range_scan`/`prefix_scan` without a secondary sort step.
pub trait OrderedKeyCodec {
    fn encode(&self) -> Vec<u8>;
}

impl OrderedKeyCodec for u64 {
    fn encode(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
}

impl OrderedKeyCodec for i64 {
    fn encode(&self) -> Vec<u8> {
        // Flip the sign bit so two's-complement ordering becomes unsigned
        // big-endian ordering.
        ((*self as u64) ^ (1u64 << 63)).to_be_bytes().to_vec()
    }
}

impl OrderedKeyCodec for f32 {
    fn encode(&self) -> Vec<u8> {
        order_preserving_f32(*self).to_vec()
    }
}

impl OrderedKeyCodec for f64 {
    fn encode(&self) -> Vec<u8> {
        order_preserving_f64(*self).to_vec()
    }
}

impl OrderedKeyCodec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

/// Maps an IEEE-754 bit pattern to one whose big-endian byte ordering matches
/// the numeric ordering of the underlying float: for non-negative floats,
/// flip the sign bit; for negative floats, flip every bit.
fn order_preserving_f32(v: f32) -> [u8; 4] {
    let bits = v.to_bits();
    let mapped = if bits & (1 << 31) != 0 { !bits } else { bits | (1 << 31) };
    mapped.to_be_bytes()
}

fn order_preserving_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let mapped = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
    mapped.to_be_bytes()
}

fn read_bitmap(bucket: &dyn Bucket, key: &[u8]) -> Result<RoaringTreemap> {
    match bucket.get(key)? {
        Some(bytes) => RoaringTreemap::deserialize_from(&bytes[..])
            .map_err(|e| Error::Serialization(format!("corrupt posting list: {e}"))),
        None => Ok(RoaringTreemap::new()),
    }
}

fn write_bitmap(bucket: &dyn Bucket, key: &[u8], bitmap: &RoaringTreemap) -> Result<()> {
    if bitmap.is_empty() {
        bucket.delete(key)
    } else {
        let mut buf = Vec::new();
        bitmap
            .serialize_into(&mut buf)
            .map_err(|e| Error::Serialization(format!("failed to serialize posting list: {e}")))?;
        bucket.put(key, &buf)
    }
}

/// Inverted index over a single scalar-valued attribute.
pub struct IndexInverted<V> {
    _marker: std::marker::PhantomData<V>,
}

impl<V: OrderedKeyCodec + Clone + PartialEq> IndexInverted<V> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }

    fn apply_one(&self, bucket: &dyn Bucket, change: IndexChange<V>) -> Result<()> {
        match (change.previous_data, change.current_data) {
            (None, Some(current)) => {
                let key = current.encode();
                let mut bitmap = read_bitmap(bucket, &key)?;
                bitmap.insert(change.id);
                write_bitmap(bucket, &key, &bitmap)
            }
            (Some(previous), None) => {
                let key = previous.encode();
                let mut bitmap = read_bitmap(bucket, &key)?;
                bitmap.remove(change.id);
                write_bitmap(bucket, &key, &bitmap)
            }
            (Some(previous), Some(current)) => {
                if previous == current {
                    return Ok(());
                }
                let prev_key = previous.encode();
                let mut prev_bitmap = read_bitmap(bucket, &prev_key)?;
                prev_bitmap.remove(change.id);
                write_bitmap(bucket, &prev_key, &prev_bitmap)?;

                let cur_key = current.encode();
                let mut cur_bitmap = read_bitmap(bucket, &cur_key)?;
                cur_bitmap.insert(change.id);
                write_bitmap(bucket, &cur_key, &cur_bitmap)
            }
            (None, None) => Ok(()),
        }
    }

    /// Applies `changes` against `bucket` in order, checking `cancel`
    /// between items. Once `cancel` fires, remaining items are recorded as
    /// [`Error::Cancelled`] without further bucket access. Returns one
    /// result per input change, in input order.
    pub fn apply_changes(
        &self,
        bucket: &dyn Bucket,
        changes: impl IntoIterator<Item = IndexChange<V>>,
        cancel: &AtomicBool,
    ) -> Vec<Result<()>> {
        let mut out = Vec::new();
        for change in changes {
            if cancel.load(Ordering::SeqCst) {
                out.push(Err(Error::Cancelled));
                continue;
            }
            out.push(self.apply_one(bucket, change));
        }
        out
    }

    /// Evaluates `op` against `bucket`, returning the union (or complement,
    /// for `Ne`) of matching posting lists.
    pub fn search(&self, bucket: &dyn Bucket, op: Operator<V>, universe: Option<&RoaringTreemap>) -> Result<RoaringTreemap> {
        match op {
            Operator::Eq(v) => read_bitmap(bucket, &v.encode()),
            Operator::Ne(v) => {
                let matching = read_bitmap(bucket, &v.encode())?;
                let mut complement = universe.cloned().unwrap_or_default();
                complement -= matching;
                Ok(complement)
            }
            Operator::Lt(v) => self.range_union(bucket, None, Some(v.encode()), false),
            Operator::Le(v) => self.range_union(bucket, None, Some(v.encode()), true),
            Operator::Gt(v) => self.range_union_from_exclusive(bucket, v.encode()),
            Operator::Ge(v) => self.range_union(bucket, Some(v.encode()), None, true),
            Operator::Between(start, end) => self.range_union(bucket, Some(start.encode()), Some(end.encode()), true),
            Operator::In(values) => {
                let mut result = RoaringTreemap::new();
                for v in values {
                    result |= read_bitmap(bucket, &v.encode())?;
                }
                Ok(result)
            }
        }
    }

    fn range_union(
        &self,
        bucket: &dyn Bucket,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        inclusive: bool,
    ) -> Result<RoaringTreemap> {
        let mut result = RoaringTreemap::new();
        bucket.range_scan(start.as_deref(), end.as_deref(), inclusive, &mut |_key, value| {
            let bitmap = RoaringTreemap::deserialize_from(value)
                .map_err(|e| Error::Serialization(format!("corrupt posting list: {e}")))?;
            result |= bitmap;
            Ok(())
        })?;
        Ok(result)
    }

    /// `Gt` has no natural upper-unbounded `range_scan` with an exclusive
    /// lower bound in the shared helper, so walk the whole tail and skip the
    /// boundary key explicitly.
    fn range_union_from_exclusive(&self, bucket: &dyn Bucket, start: Vec<u8>) -> Result<RoaringTreemap> {
        let mut result = RoaringTreemap::new();
        bucket.range_scan(Some(&start), None, false, &mut |key, value| {
            if key == start.as_slice() {
                return Ok(());
            }
            let bitmap = RoaringTreemap::deserialize_from(value)
                .map_err(|e| Error::Serialization(format!("corrupt posting list: {e}")))?;
            result |= bitmap;
            Ok(())
        })?;
        Ok(result)
    }
}

impl<V: OrderedKeyCodec + Clone + PartialEq> Default for IndexInverted<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Inverted index over an array-valued attribute.
pub struct IndexInvertedArray<V> {
    _marker: std::marker::PhantomData<V>,
}

impl<V: OrderedKeyCodec + Clone + PartialEq> IndexInvertedArray<V> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }

    fn apply_one(&self, bucket: &dyn Bucket, change: IndexArrayChange<V>) -> Result<()> {
        for removed in &change.previous_data {
            if change.current_data.iter().any(|v| v == removed) {
                continue;
            }
            let key = removed.encode();
            let mut bitmap = read_bitmap(bucket, &key)?;
            bitmap.remove(change.id);
            write_bitmap(bucket, &key, &bitmap)?;
        }
        for added in &change.current_data {
            if change.previous_data.iter().any(|v| v == added) {
                continue;
            }
            let key = added.encode();
            let mut bitmap = read_bitmap(bucket, &key)?;
            bitmap.insert(change.id);
            write_bitmap(bucket, &key, &bitmap)?;
        }
        Ok(())
    }

    /// Same contract as [`IndexInverted::apply_changes`].
    pub fn apply_changes(
        &self,
        bucket: &dyn Bucket,
        changes: impl IntoIterator<Item = IndexArrayChange<V>>,
        cancel: &AtomicBool,
    ) -> Vec<Result<()>> {
        let mut out = Vec::new();
        for change in changes {
            if cancel.load(Ordering::SeqCst) {
                out.push(Err(Error::Cancelled));
                continue;
            }
            out.push(self.apply_one(bucket, change));
        }
        out
    }

    /// Evaluates `op` against `bucket`. `ContainsNone` is an ANDNOT relative
    /// to `universe`, exactly like [`Operator::Ne`] on the scalar index.
    pub fn search(&self, bucket: &dyn Bucket, op: ArrayOperator<V>, universe: Option<&RoaringTreemap>) -> Result<RoaringTreemap> {
        match op {
            ArrayOperator::ContainsAny(values) => {
                let mut result = RoaringTreemap::new();
                for v in values {
                    result |= read_bitmap(bucket, &v.encode())?;
                }
                Ok(result)
            }
            ArrayOperator::ContainsAll(values) => {
                let mut iter = values.into_iter();
                let mut result = match iter.next() {
                    Some(first) => read_bitmap(bucket, &first.encode())?,
                    None => return Ok(RoaringTreemap::new()),
                };
                for v in iter {
                    result &= read_bitmap(bucket, &v.encode())?;
                }
                Ok(result)
            }
            ArrayOperator::ContainsNone(values) => {
                let mut excluded = RoaringTreemap::new();
                for v in values {
                    excluded |= read_bitmap(bucket, &v.encode())?;
                }
                let mut complement = universe.cloned().unwrap_or_default();
                complement -= excluded;
                Ok(complement)
            }
        }
    }
}

impl<V: OrderedKeyCodec + Clone + PartialEq> Default for IndexInvertedArray<V> {
    fn default() -> Self {
        Self::new()
    }
}
