//! Creative cache
//!
//! Read-mostly lookup of creative attributes by (campaign, creative). Reads
//! never block each other; the loader writes before or between read bursts.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use rtb_common::CreativeRecord;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum CreativeError {
    #[error("Failed to read creatives file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse creatives file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Read contract used by the dispatch core
pub trait CreativeCache: Send + Sync {
    fn lookup(&self, campaign_id: u64, creative_id: u64) -> Option<Arc<CreativeRecord>>;
}

#[derive(Debug, Default)]
pub struct InMemoryCreativeCache {
    creatives: DashMap<(u64, u64), Arc<CreativeRecord>>,
}

impl InMemoryCreativeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = CreativeRecord>) -> Self {
        let cache = Self::new();
        for record in records {
            cache.insert(record);
        }
        cache
    }

    /// Insert or replace a creative.
    pub fn insert(&self, record: CreativeRecord) {
        self.creatives
            .insert((record.campaign_id, record.creative_id), Arc::new(record));
    }

    pub fn remove(&self, campaign_id: u64, creative_id: u64) -> Option<Arc<CreativeRecord>> {
        self.creatives
            .remove(&(campaign_id, creative_id))
            .map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.creatives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creatives.is_empty()
    }

    /// Load a JSON array of creative records, returning how many were loaded.
    pub fn load_json_file(&self, path: impl AsRef<Path>) -> Result<usize, CreativeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let records: Vec<CreativeRecord> = serde_json::from_str(&content)?;
        let count = records.len();

        for record in records {
            self.insert(record);
        }

        info!(path = %path.display(), count = count, "Loaded creatives");
        Ok(count)
    }
}

impl CreativeCache for InMemoryCreativeCache {
    fn lookup(&self, campaign_id: u64, creative_id: u64) -> Option<Arc<CreativeRecord>> {
        self.creatives
            .get(&(campaign_id, creative_id))
            .map(|record| Arc::clone(record.value()))
    }
}
