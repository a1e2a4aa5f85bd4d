use std::io;

use thiserror::Error;

/// Failure modes surfaced by the cache.
///
/// Every operation returns a discriminated result; no panics cross the
/// cache boundary. Transient races between a reader and a concurrently
/// invalidating writer are retried inside
/// [`CacheManager::open`](super::CacheManager::open) and never show up
/// here.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A configuration or parameter constraint was violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No entry exists under the requested key.
    #[error("entry not found")]
    NotFound,

    /// A write would grow the entry past the configured per-entry maximum.
    ///
    /// The rejected bytes are not written; everything written before stays
    /// in place.
    #[error("entry exceeds the maximum size of {limit} bytes")]
    EntryTooLarge {
        /// The configured per-entry ceiling in bytes.
        limit: u64,
    },

    /// File create/open/read/write/stat failure underneath the cache.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used throughout the caching module.
pub type CacheResult<T = ()> = Result<T, CacheError>;
