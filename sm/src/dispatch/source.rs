//! Upstream status source used to backfill keys a new subscriber needs

use async_trait::async_trait;
use tracing::debug;

use crate::value::{StatusBatch, StatusKey};

/// Point-in-time fetch of status values from upstream
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetch current values for `keys`; keys upstream does not know may be omitted
    async fn fetch(&self, keys: Vec<StatusKey>) -> eyre::Result<StatusBatch>;
}

/// Source backed by a fixed set of values, e.g. a snapshot file
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    values: StatusBatch,
}

impl StaticSource {
    pub fn new(values: StatusBatch) -> Self {
        Self { values }
    }

    /// Load a JSON object of `key: value` pairs
    pub fn from_json(json: &str) -> eyre::Result<Self> {
        let values: StatusBatch = serde_json::from_str(json)?;
        Ok(Self::new(values))
    }
}

#[async_trait]
impl StatusSource for StaticSource {
    async fn fetch(&self, keys: Vec<StatusKey>) -> eyre::Result<StatusBatch> {
        debug!(keys = keys.len(), "StaticSource::fetch: called");
        Ok(keys
            .into_iter()
            .filter_map(|k| self.values.get(&k).cloned().map(|v| (k, v)))
            .collect())
    }
}
