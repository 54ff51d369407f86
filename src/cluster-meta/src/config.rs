use crate::{get_doc, set_doc_cas, MetaStore};
use cbfs_lib::CbfsResult;
use serde::{Deserialize, Serialize};

pub const CONFIG_KEY: &str = "/@config";

/// Heartbeats older than this many intervals mark a node stale.
pub const NODE_STALENESS_INTERVALS: u64 = 3;

/// Cluster-wide settings, stored as one document in the metadata service
/// and cached per node. Every field has a default so partially-written
/// config documents still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// How many revisions of a user path are kept, current included.
    pub default_version_count: u32,
    /// Replica count the cluster works toward for every blob.
    pub min_replicas: u32,
    /// Odds that a read miss leaves a local cached copy behind.
    pub cache_admission_percent: u8,
    pub view_timeout_ms: u64,
    pub heartbeat_freq_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            default_version_count: 1,
            min_replicas: 3,
            cache_admission_percent: 100,
            view_timeout_ms: 10_000,
            heartbeat_freq_secs: 5,
        }
    }
}

impl ClusterConfig {
    pub fn node_staleness_secs(&self) -> u64 {
        self.heartbeat_freq_secs.max(1) * NODE_STALENESS_INTERVALS
    }
}

/// Read the cluster config, falling back to defaults when nobody has
/// written one yet.
pub async fn load_config(store: &dyn MetaStore) -> CbfsResult<ClusterConfig> {
    Ok(get_doc(store, CONFIG_KEY).await?.unwrap_or_default())
}

pub async fn store_config(store: &dyn MetaStore, config: &ClusterConfig) -> CbfsResult<()> {
    set_doc_cas(store, CONFIG_KEY, config, None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemMetaStore;

    #[tokio::test]
    async fn test_missing_config_yields_defaults() {
        let store = MemMetaStore::new();
        let config = load_config(store.as_ref()).await.unwrap();
        assert_eq!(config.default_version_count, 1);
        assert_eq!(config.cache_admission_percent, 100);
    }

    #[tokio::test]
    async fn test_round_trip_and_partial_docs() {
        let store = MemMetaStore::new();
        let mut config = ClusterConfig::default();
        config.min_replicas = 2;
        store_config(store.as_ref(), &config).await.unwrap();
        let loaded = load_config(store.as_ref()).await.unwrap();
        assert_eq!(loaded.min_replicas, 2);

        // A document missing fields still loads with defaults filled in.
        store
            .set_cas(CONFIG_KEY, serde_json::json!({"min_replicas": 5}), None)
            .await
            .unwrap();
        let partial = load_config(store.as_ref()).await.unwrap();
        assert_eq!(partial.min_replicas, 5);
        assert_eq!(partial.heartbeat_freq_secs, 5);
    }
}
