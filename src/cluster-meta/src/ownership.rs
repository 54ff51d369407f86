use crate::{gets_doc, set_doc_cas, MetaStore};
use cbfs_lib::{unix_timestamp, BlobId, CbfsError, CbfsResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// CAS loops give up after this many conflicts.
const CAS_MAX_ATTEMPTS: u32 = 16;

pub fn blob_key(id: &BlobId) -> String {
    format!("/{}", id)
}

/// Shared record of which nodes claim to hold a blob. Eventually
/// consistent: a listed node may have lost its copy; read misses
/// reconcile by removing themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobOwnership {
    #[serde(rename = "type", default = "ownership_doc_type")]
    pub doc_type: String,
    pub length: u64,
    #[serde(default)]
    pub nodes: HashMap<String, u64>,
}

fn ownership_doc_type() -> String {
    "blob".to_string()
}

impl BlobOwnership {
    pub fn new(length: u64) -> Self {
        Self {
            doc_type: ownership_doc_type(),
            length,
            nodes: HashMap::new(),
        }
    }

    /// The claimant with the freshest timestamp.
    pub fn most_recent(&self) -> Option<(&str, u64)> {
        self.nodes
            .iter()
            .max_by_key(|(_, time)| **time)
            .map(|(node, time)| (node.as_str(), *time))
    }
}

async fn cas_backoff(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..20u64);
    tokio::time::sleep(Duration::from_millis(5 * attempt as u64 + jitter)).await;
}

pub async fn get_ownership(
    store: &dyn MetaStore,
    id: &BlobId,
) -> CbfsResult<Option<BlobOwnership>> {
    crate::get_doc(store, &blob_key(id)).await
}

/// CAS upsert: add `node` with the current timestamp and refresh the
/// blob length. Conflicting writers converge to the union of claimants.
pub async fn record_ownership(
    store: &dyn MetaStore,
    id: &BlobId,
    length: u64,
    node: &str,
) -> CbfsResult<()> {
    let key = blob_key(id);
    for attempt in 0..CAS_MAX_ATTEMPTS {
        let (mut ownership, cas) = match gets_doc::<BlobOwnership>(store, &key).await? {
            Some((ownership, cas)) => (ownership, Some(cas)),
            None => (BlobOwnership::new(length), Some(0)),
        };
        ownership.length = length;
        ownership.nodes.insert(node.to_string(), unix_timestamp());
        if set_doc_cas(store, &key, &ownership, cas).await? {
            return Ok(());
        }
        cas_backoff(attempt).await;
    }
    Err(CbfsError::MetadataError(format!(
        "record ownership of {}: cas contention",
        id
    )))
}

/// CAS removal of one claimant; the record disappears with its last node.
pub async fn forget_ownership(store: &dyn MetaStore, id: &BlobId, node: &str) -> CbfsResult<()> {
    let key = blob_key(id);
    for attempt in 0..CAS_MAX_ATTEMPTS {
        let (mut ownership, cas) = match gets_doc::<BlobOwnership>(store, &key).await? {
            Some(found) => found,
            None => return Ok(()),
        };
        if ownership.nodes.remove(node).is_none() {
            return Ok(());
        }
        let swapped = if ownership.nodes.is_empty() {
            store.delete_cas(&key, cas).await?
        } else {
            set_doc_cas(store, &key, &ownership, Some(cas)).await?
        };
        if swapped {
            return Ok(());
        }
        cas_backoff(attempt).await;
    }
    Err(CbfsError::MetadataError(format!(
        "forget ownership of {}: cas contention",
        id
    )))
}

/// Refresh this node's timestamp on an existing record. Used by the read
/// path as a fire-and-forget access marker; a missing record is not an
/// error there.
pub async fn touch_access(store: &dyn MetaStore, id: &BlobId, node: &str) -> CbfsResult<()> {
    let key = blob_key(id);
    for attempt in 0..CAS_MAX_ATTEMPTS {
        let (mut ownership, cas) = match gets_doc::<BlobOwnership>(store, &key).await? {
            Some(found) => found,
            None => return Ok(()),
        };
        ownership.nodes.insert(node.to_string(), unix_timestamp());
        if set_doc_cas(store, &key, &ownership, Some(cas)).await? {
            return Ok(());
        }
        cas_backoff(attempt).await;
    }
    Err(CbfsError::MetadataError(format!(
        "touch access of {}: cas contention",
        id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemMetaStore;
    use cbfs_lib::BlobHasher;

    #[tokio::test]
    async fn test_record_and_forget() {
        let store = MemMetaStore::new();
        let id = BlobHasher::calc_from_bytes(b"owned");

        record_ownership(store.as_ref(), &id, 5, "node-a")
            .await
            .unwrap();
        record_ownership(store.as_ref(), &id, 5, "node-b")
            .await
            .unwrap();

        let ownership = get_ownership(store.as_ref(), &id).await.unwrap().unwrap();
        assert_eq!(ownership.length, 5);
        assert!(ownership.nodes.contains_key("node-a"));
        assert!(ownership.nodes.contains_key("node-b"));

        forget_ownership(store.as_ref(), &id, "node-a").await.unwrap();
        let ownership = get_ownership(store.as_ref(), &id).await.unwrap().unwrap();
        assert!(!ownership.nodes.contains_key("node-a"));

        // Last claimant gone: the record itself goes too.
        forget_ownership(store.as_ref(), &id, "node-b").await.unwrap();
        assert!(get_ownership(store.as_ref(), &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forget_unknown_node_is_noop() {
        let store = MemMetaStore::new();
        let id = BlobHasher::calc_from_bytes(b"owned");
        record_ownership(store.as_ref(), &id, 5, "node-a")
            .await
            .unwrap();
        forget_ownership(store.as_ref(), &id, "node-z").await.unwrap();
        assert!(get_ownership(store.as_ref(), &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_most_recent() {
        let mut ownership = BlobOwnership::new(1);
        ownership.nodes.insert("old".to_string(), 100);
        ownership.nodes.insert("new".to_string(), 200);
        let (node, time) = ownership.most_recent().unwrap();
        assert_eq!(node, "new");
        assert_eq!(time, 200);
    }

    #[tokio::test]
    async fn test_concurrent_records_converge_to_union() {
        let store = MemMetaStore::new();
        let id = BlobHasher::calc_from_bytes(b"contended");

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                record_ownership(store.as_ref(), &id, 9, &format!("node-{}", i)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let ownership = get_ownership(store.as_ref(), &id).await.unwrap().unwrap();
        assert_eq!(ownership.nodes.len(), 8);
    }

    #[tokio::test]
    async fn test_touch_refreshes_timestamp_monotonically() {
        let store = MemMetaStore::new();
        let id = BlobHasher::calc_from_bytes(b"touched");
        record_ownership(store.as_ref(), &id, 3, "node-a")
            .await
            .unwrap();
        let before = get_ownership(store.as_ref(), &id).await.unwrap().unwrap();
        touch_access(store.as_ref(), &id, "node-a").await.unwrap();
        let after = get_ownership(store.as_ref(), &id).await.unwrap().unwrap();
        assert!(after.nodes["node-a"] >= before.nodes["node-a"]);
    }
}
