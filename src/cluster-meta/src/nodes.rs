use crate::{get_doc, set_doc_cas, MetaStore};
use cbfs_lib::CbfsResult;
use serde::{Deserialize, Serialize};

pub const NODE_KEY_PREFIX: &str = "/@node/";

pub fn node_key(name: &str) -> String {
    format!("{}{}", NODE_KEY_PREFIX, name)
}

/// Heartbeat-published liveness and capacity of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub addr: String,
    pub bind_port: u16,
    pub time: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub storage_size: u64,
    #[serde(default)]
    pub hash_algorithm: String,
}

impl NodeRecord {
    /// Dialable host:port of this node's HTTP surface.
    pub fn address(&self) -> String {
        if self.addr.contains(':') {
            self.addr.clone()
        } else {
            format!("{}:{}", self.addr, self.bind_port)
        }
    }

    pub fn is_live(&self, now: u64, staleness_secs: u64) -> bool {
        now.saturating_sub(self.time) < staleness_secs
    }
}

/// Publish (or refresh) a node record. Heartbeats overwrite whatever is
/// there; no CAS is needed because each node owns its own key.
pub async fn publish_node_record(store: &dyn MetaStore, record: &NodeRecord) -> CbfsResult<()> {
    set_doc_cas(store, &node_key(&record.name), record, None).await?;
    Ok(())
}

pub async fn all_nodes(store: &dyn MetaStore) -> CbfsResult<Vec<NodeRecord>> {
    let mut nodes = Vec::new();
    for key in store.keys_with_prefix(NODE_KEY_PREFIX).await? {
        if let Some(record) = get_doc::<NodeRecord>(store, &key).await? {
            nodes.push(record);
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemMetaStore;

    fn record(name: &str, time: u64) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            addr: "127.0.0.1".to_string(),
            bind_port: 8484,
            time,
            used: 0,
            free: 1 << 30,
            storage_size: 1 << 31,
            hash_algorithm: "sha256".to_string(),
        }
    }

    #[test]
    fn test_address_join() {
        let mut rec = record("a", 0);
        assert_eq!(rec.address(), "127.0.0.1:8484");
        rec.addr = "10.0.0.5:9000".to_string();
        assert_eq!(rec.address(), "10.0.0.5:9000");
    }

    #[test]
    fn test_liveness_threshold() {
        let rec = record("a", 100);
        assert!(rec.is_live(100, 15));
        assert!(rec.is_live(114, 15));
        assert!(!rec.is_live(115, 15));
    }

    #[tokio::test]
    async fn test_publish_and_list() {
        let store = MemMetaStore::new();
        publish_node_record(store.as_ref(), &record("a", 1)).await.unwrap();
        publish_node_record(store.as_ref(), &record("b", 2)).await.unwrap();
        // Re-publish refreshes in place.
        publish_node_record(store.as_ref(), &record("a", 9)).await.unwrap();

        let mut nodes = all_nodes(store.as_ref()).await.unwrap();
        nodes.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].time, 9);
    }
}
