//! Operational error type shared by the storage, cache and tree layers.
//!
//! Only recoverable conditions surface here. Structural invariant breaches
//! (corrupt tier tags, a rebalance without siblings) panic instead, they
//! indicate a programming or on-media corruption error.

use thiserror::Error;

/// Operational outcome of a store or storage call.
#[derive(Debug, Error)]
pub enum Error {
    /// Insert of a key that is already present. The store is unchanged.
    #[error("key already exists")]
    KeyAlreadyExists,
    /// Lookup, update or delete of an absent key. The store is unchanged.
    #[error("key does not exist")]
    KeyDoesNotExist,
    /// The tier's block allocator could not satisfy the request. The failed
    /// operation has no partial effect.
    #[error("storage region exhausted")]
    OutOfStorage,
    /// I/O failure while touching a file- or pmem-backed tier.
    #[error("tier i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
