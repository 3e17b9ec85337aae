//! Case-folding wrapper around [`super::IndexInverted`] / [`super::IndexInvertedArray`]
//! for `String`-valued attributes.

use std::sync::atomic::AtomicBool;

use roaring::RoaringTreemap;

use super::{ArrayOperator, IndexArrayChange, IndexChange, IndexInverted, IndexInvertedArray, Operator};
use crate::disk::Bucket;
use crate::error::Result;

/// Configuration for a `String`-valued scalar attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStringParameters {
    /// When `false`, values are lower-cased before encoding and before
    /// querying, so search is case-insensitive.
    pub case_sensitive: bool,
}

/// Configuration for a `String`-valued array attribute.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStringArrayParameters {
    /// When `false`, each array element is lower-cased before encoding and
    /// before querying, so search is case-insensitive.
    pub case_sensitive: bool,
}

fn fold(params: &IndexStringParameters, s: String) -> String {
    if params.case_sensitive {
        s
    } else {
        s.to_lowercase()
    }
}

/// Case-folding scalar string index.
pub struct IndexInvertedString {
    inner: IndexInverted<String>,
    params: IndexStringParameters,
}

impl IndexInvertedString {
    pub fn new(params: IndexStringParameters) -> Self {
        Self {
            inner: IndexInverted::new(),
            params,
        }
    }

    /// Folds case (if configured) before delegating to the inner index.
    pub fn apply_changes(
        &self,
        bucket: &dyn Bucket,
        changes: impl IntoIterator<Item = IndexChange<String>>,
        cancel: &AtomicBool,
    ) -> Vec<Result<()>> {
        let folded = changes.into_iter().map(|change| IndexChange {
            id: change.id,
            previous_data: change.previous_data.map(|v| fold(&self.params, v)),
            current_data: change.current_data.map(|v| fold(&self.params, v)),
        });
        self.inner.apply_changes(bucket, folded, cancel)
    }

    /// Folds the query value's case (if configured) before searching.
    pub fn search(&self, bucket: &dyn Bucket, op: Operator<String>, universe: Option<&RoaringTreemap>) -> Result<RoaringTreemap> {
        let folded = fold_operator(&self.params, op);
        self.inner.search(bucket, folded, universe)
    }
}

fn fold_operator(params: &IndexStringParameters, op: Operator<String>) -> Operator<String> {
    match op {
        Operator::Eq(v) => Operator::Eq(fold(params, v)),
        Operator::Ne(v) => Operator::Ne(fold(params, v)),
        Operator::Lt(v) => Operator::Lt(fold(params, v)),
        Operator::Le(v) => Operator::Le(fold(params, v)),
        Operator::Gt(v) => Operator::Gt(fold(params, v)),
        Operator::Ge(v) => Operator::Ge(fold(params, v)),
        Operator::Between(s, e) => Operator::Between(fold(params, s), fold(params, e)),
        Operator::In(values) => Operator::In(values.into_iter().map(|v| fold(params, v)).collect()),
    }
}

/// Case-folding array-valued string index.
pub struct IndexInvertedArrayString {
    inner: IndexInvertedArray<String>,
    params: IndexStringArrayParameters,
}

impl IndexInvertedArrayString {
    pub fn new(params: IndexStringArrayParameters) -> Self {
        Self {
            inner: IndexInvertedArray::new(),
            params,
        }
    }

    pub fn apply_changes(
        &self,
        bucket: &dyn Bucket,
        changes: impl IntoIterator<Item = IndexArrayChange<String>>,
        cancel: &AtomicBool,
    ) -> Vec<Result<()>> {
        let fold_one = |v: String| if self.params.case_sensitive { v } else { v.to_lowercase() };
        let folded = changes.into_iter().map(|change| IndexArrayChange {
            id: change.id,
            previous_data: change.previous_data.into_iter().map(fold_one).collect(),
            current_data: change.current_data.into_iter().map(fold_one).collect(),
        });
        self.inner.apply_changes(bucket, folded, cancel)
    }

    pub fn search(&self, bucket: &dyn Bucket, op: ArrayOperator<String>, universe: Option<&RoaringTreemap>) -> Result<RoaringTreemap> {
        let fold_one = |v: String| if self.params.case_sensitive { v } else { v.to_lowercase() };
        let folded = match op {
            ArrayOperator::ContainsAll(values) => ArrayOperator::ContainsAll(values.into_iter().map(fold_one).collect()),
            ArrayOperator::ContainsAny(values) => ArrayOperator::ContainsAny(values.into_iter().map(fold_one).collect()),
            ArrayOperator::ContainsNone(values) => ArrayOperator::ContainsNone(values.into_iter().map(fold_one).collect()),
        };
        self.inner.search(bucket, folded, universe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::memory::MemoryDiskStore;
    use crate::disk::DiskStore;

    #[test]
    fn case_insensitive_search_matches_differently_cased_insert() {
        let store = MemoryDiskStore::new();
        let index = IndexInvertedString::new(IndexStringParameters { case_sensitive: false });
        store
            .write(|bm| {
                let b = bm.get("name")?;
                index.apply_changes(
                    &*b,
                    vec![IndexChange {
                        id: 1,
                        previous_data: None,
                        current_data: Some("Alice".to_string()),
                    }],
                    &AtomicBool::new(false),
                );
                let hits = index.search(&*b, Operator::Eq("alice".to_string()), None).unwrap();
                assert!(hits.contains(1));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn case_sensitive_search_distinguishes_case() {
        let store = MemoryDiskStore::new();
        let index = IndexInvertedString::new(IndexStringParameters { case_sensitive: true });
        store
            .write(|bm| {
                let b = bm.get("name")?;
                index.apply_changes(
                    &*b,
                    vec![IndexChange {
                        id: 1,
                        previous_data: None,
                        current_data: Some("Alice".to_string()),
                    }],
                    &AtomicBool::new(false),
                );
                let hits = index.search(&*b, Operator::Eq("alice".to_string()), None).unwrap();
                assert!(!hits.contains(1));
                let hits = index.search(&*b, Operator::Eq("Alice".to_string()), None).unwrap();
                assert!(hits.contains(1));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn array_variant_folds_each_element() {
        let store = MemoryDiskStore::new();
        let index = IndexInvertedArrayString::new(IndexStringArrayParameters { case_sensitive: false });
        store
            .write(|bm| {
                let b = bm.get("tags")?;
                index.apply_changes(
                    &*b,
                    vec![IndexArrayChange {
                        id: 1,
                        previous_data: vec![],
                        current_data: vec!["Rust".to_string(), "DB".to_string()],
                    }],
                    &AtomicBool::new(false),
                );
                let hits = index
                    .search(&*b, ArrayOperator::ContainsAny(vec!["rust".to_string()]), None)
                    .unwrap();
                assert!(hits.contains(1));
                Ok(())
            })
            .unwrap();
    }
}
