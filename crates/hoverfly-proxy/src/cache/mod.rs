//! Captured-traffic cache.
//!
//! The proxy core only depends on the [`Cache`] contract: per-key atomic
//! `get`/`put` addressed by request fingerprint, safe under concurrent use.
//! The storage engine behind it is pluggable; [`InMemoryCache`] is the
//! default, with optional JSON file persistence.

mod inmemory;

pub use inmemory::InMemoryCache;

use crate::fingerprint::Fingerprint;
use crate::models::CapturedPair;

/// Cache failures
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(String),
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value store of captured pairs addressed by fingerprint
pub trait Cache: Send + Sync {
    /// Store a pair under its fingerprint, replacing any previous entry.
    fn put(&self, fingerprint: Fingerprint, pair: CapturedPair) -> Result<(), CacheError>;

    /// Look up a pair. `Ok(None)` means "not captured".
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CapturedPair>, CacheError>;

    /// All stored pairs (for export)
    fn records(&self) -> Result<Vec<CapturedPair>, CacheError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) -> Result<(), CacheError>;
}
