use cbfs_lib::{unix_timestamp, BlobId, CbfsResult};
use cluster_meta::{all_nodes, get_ownership, MetaStoreRef, NodeRecord};
use rand::seq::SliceRandom;

/// Cluster membership as seen through heartbeat records, filtered for
/// this node's purposes: never itself, never stale peers, and always in
/// a fresh random order so load spreads without coordination.
pub struct PeerDirectory {
    meta: MetaStoreRef,
    self_name: String,
    staleness_secs: u64,
}

impl PeerDirectory {
    pub fn new(meta: MetaStoreRef, self_name: String, staleness_secs: u64) -> Self {
        Self {
            meta,
            self_name,
            staleness_secs,
        }
    }

    pub async fn all_nodes(&self) -> CbfsResult<Vec<NodeRecord>> {
        all_nodes(self.meta.as_ref()).await
    }

    /// Live peers, shuffled.
    pub async fn remote_nodes(&self) -> CbfsResult<Vec<NodeRecord>> {
        let now = unix_timestamp();
        let mut nodes: Vec<NodeRecord> = self
            .all_nodes()
            .await?
            .into_iter()
            .filter(|n| n.name != self.self_name && n.is_live(now, self.staleness_secs))
            .collect();
        nodes.shuffle(&mut rand::thread_rng());
        Ok(nodes)
    }

    /// Live peers claiming to hold `id`, shuffled. The ownership record
    /// is only a claim; callers must be ready for any entry to miss.
    pub async fn owners_of(&self, id: &BlobId) -> CbfsResult<Vec<NodeRecord>> {
        let ownership = match get_ownership(self.meta.as_ref(), id).await? {
            Some(ownership) => ownership,
            None => return Ok(Vec::new()),
        };
        let now = unix_timestamp();
        let mut owners: Vec<NodeRecord> = self
            .all_nodes()
            .await?
            .into_iter()
            .filter(|n| {
                n.name != self.self_name
                    && ownership.nodes.contains_key(&n.name)
                    && n.is_live(now, self.staleness_secs)
            })
            .collect();
        owners.shuffle(&mut rand::thread_rng());
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbfs_lib::BlobHasher;
    use cluster_meta::{publish_node_record, record_ownership, MemMetaStore};

    fn record(name: &str, time: u64) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            addr: format!("10.0.0.{}", name.len()),
            bind_port: 8484,
            time,
            used: 0,
            free: 0,
            storage_size: 0,
            hash_algorithm: "sha256".to_string(),
        }
    }

    #[tokio::test]
    async fn test_remote_nodes_filters_self_and_stale() {
        let store = MemMetaStore::new();
        let now = unix_timestamp();
        publish_node_record(store.as_ref(), &record("me", now)).await.unwrap();
        publish_node_record(store.as_ref(), &record("live", now)).await.unwrap();
        publish_node_record(store.as_ref(), &record("stale", now - 3600))
            .await
            .unwrap();

        let directory = PeerDirectory::new(store.clone(), "me".to_string(), 15);
        let remotes = directory.remote_nodes().await.unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].name, "live");
    }

    #[tokio::test]
    async fn test_owners_of_intersects_live_set() {
        let store = MemMetaStore::new();
        let now = unix_timestamp();
        let id = BlobHasher::calc_from_bytes(b"owned blob");

        publish_node_record(store.as_ref(), &record("me", now)).await.unwrap();
        publish_node_record(store.as_ref(), &record("peer", now)).await.unwrap();
        publish_node_record(store.as_ref(), &record("ghost", now - 3600))
            .await
            .unwrap();

        for node in ["me", "peer", "ghost", "unregistered"] {
            record_ownership(store.as_ref(), &id, 10, node).await.unwrap();
        }

        let directory = PeerDirectory::new(store.clone(), "me".to_string(), 15);
        let owners = directory.owners_of(&id).await.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "peer");
    }

    #[tokio::test]
    async fn test_owners_of_unknown_blob_is_empty() {
        let store = MemMetaStore::new();
        let directory = PeerDirectory::new(store.clone(), "me".to_string(), 15);
        let id = BlobHasher::calc_from_bytes(b"nobody has this");
        assert!(directory.owners_of(&id).await.unwrap().is_empty());
    }
}
