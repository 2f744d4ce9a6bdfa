//! In-memory cache with JSON file persistence.

use super::{Cache, CacheError};
use crate::fingerprint::Fingerprint;
use crate::models::CapturedPair;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Cache backed by a `HashMap` behind a read/write lock
#[derive(Default)]
pub struct InMemoryCache {
    pairs: RwLock<HashMap<Fingerprint, CapturedPair>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save all captured pairs to a file (JSON array).
    pub fn save_to_file(&self, path: &Path) -> Result<usize, CacheError> {
        let records = self.records()?;
        let json = serde_json::to_string_pretty(&records)?;
        fs::write(path, json)?;
        info!("Saved {} captured pairs to {:?}", records.len(), path);
        Ok(records.len())
    }

    /// Load captured pairs from a file, keeping existing entries.
    ///
    /// A missing file is not an error; it yields zero loaded pairs.
    pub fn load_from_file(&self, path: &Path) -> Result<usize, CacheError> {
        if !path.exists() {
            debug!("Cache file {:?} does not exist, starting fresh", path);
            return Ok(0);
        }

        let json = fs::read_to_string(path)?;
        let records: Vec<CapturedPair> = serde_json::from_str(&json)?;

        let count = records.len();
        let mut pairs = self.pairs.write();
        for pair in records {
            pairs.insert(pair.fingerprint, pair);
        }

        info!("Loaded {} captured pairs from {:?}", count, path);
        Ok(count)
    }
}

impl Cache for InMemoryCache {
    fn put(&self, fingerprint: Fingerprint, pair: CapturedPair) -> Result<(), CacheError> {
        self.pairs.write().insert(fingerprint, pair);
        Ok(())
    }

    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CapturedPair>, CacheError> {
        Ok(self.pairs.read().get(fingerprint).cloned())
    }

    fn records(&self) -> Result<Vec<CapturedPair>, CacheError> {
        let mut records: Vec<_> = self.pairs.read().values().cloned().collect();
        records.sort_by_key(|pair| pair.captured_at);
        Ok(records)
    }

    fn len(&self) -> usize {
        self.pairs.read().len()
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.pairs.write().clear();
        Ok(())
    }
}
