#![deny(missing_docs)]
//! An embeddable vector search and secondary-index engine.
//!
//! A collection combines a transactional bucketed key-value store
//! ([`disk`]) with three layers built on top of it: a [`vector_store`] for
//! raw or quantized embeddings, an [`inverted`] secondary index over
//! arbitrary scalar and array attributes, and an [`hnsw`] graph for
//! approximate nearest-neighbour search. [`cache`] amortizes disk access for
//! both the vector store and the HNSW graph's node records, and
//! [`distance`] supplies the pure kernels both the vector store and HNSW
//! search run through.

pub mod cache;
pub mod conversion;
pub mod disk;
pub mod distance;
mod error;
pub mod hnsw;
pub mod inverted;
pub mod vector_store;

pub use error::{Error, Result};
