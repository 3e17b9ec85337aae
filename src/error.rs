use thiserror::Error;

/// Error type for the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Key absent where required (cache miss that also misses disk).
    #[error("key not found")]
    NotFound,
    /// Mutation attempted on a read-only bucket or bucket manager.
    #[error("bucket is read-only")]
    ReadOnly,
    /// A named bucket is missing in a context that requires it to exist.
    #[error("bucket {0:?} is missing in this transaction")]
    BucketMissing(String),
    /// A stored payload could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// IO error
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Underlying storage engine failure; fatal to the enclosing transaction.
    #[error("storage engine error: {0}")]
    Store(#[from] sled::Error),
    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    /// A bug signal: an internal invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Custom result type for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
