use crate::{gets_doc, set_doc_cas, MetaStore};
use cbfs_lib::{CbfsError, CbfsResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const CAS_MAX_ATTEMPTS: u32 = 16;

pub type StoredHeaders = HashMap<String, Vec<String>>;

/// One retained prior revision of a user path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrevRev {
    pub oid: String,
    #[serde(default)]
    pub headers: StoredHeaders,
    pub modified: u64,
    pub revno: u32,
}

/// Shared metadata of one user path: the current blob plus a bounded
/// history. Invariants: `revno` strictly exceeds every previous revno,
/// and `previous` stays ascending with at most `keep_revs - 1` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(default)]
    pub headers: StoredHeaders,
    pub oid: String,
    pub length: u64,
    pub modified: u64,
    #[serde(default)]
    pub revno: u32,
    #[serde(default)]
    pub previous: Vec<PrevRev>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<Value>,
}

impl FileMeta {
    /// Oldest revision still reachable through this record.
    pub fn oldest_revno(&self) -> u32 {
        self.previous.first().map(|p| p.revno).unwrap_or(self.revno)
    }

    /// Look a purgeable revision up by number; current revno is not part
    /// of the history scan.
    pub fn find_previous(&self, revno: u32) -> Option<&PrevRev> {
        self.previous.iter().find(|p| p.revno == revno)
    }
}

async fn cas_backoff(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..20u64);
    tokio::time::sleep(Duration::from_millis(5 * attempt as u64 + jitter)).await;
}

pub async fn get_file_meta(store: &dyn MetaStore, path: &str) -> CbfsResult<Option<FileMeta>> {
    crate::get_doc(store, path).await
}

/// CAS read-modify-write of a path's metadata for a fresh upload. The
/// incoming record carries the new blob's identity and headers; revision
/// bookkeeping (revno, previous trimming to `keep_revs - 1`, userdata
/// carry-over) happens here. Concurrent writers to one path linearize on
/// the swap; the loser re-reads and retries.
pub async fn store_file_meta(
    store: &dyn MetaStore,
    path: &str,
    mut incoming: FileMeta,
    keep_revs: u32,
) -> CbfsResult<FileMeta> {
    let keep_revs = keep_revs.max(1);
    let caller_userdata = incoming.userdata.clone();
    for attempt in 0..CAS_MAX_ATTEMPTS {
        let existing = gets_doc::<FileMeta>(store, path).await?;
        let cas = match &existing {
            Some((_, cas)) => Some(*cas),
            None => Some(0),
        };

        match existing {
            Some((current, _)) => {
                let mut previous = current.previous.clone();
                previous.push(PrevRev {
                    oid: current.oid.clone(),
                    headers: current.headers.clone(),
                    modified: current.modified,
                    revno: current.revno,
                });
                previous.sort_by_key(|p| p.revno);
                while previous.len() as u32 > keep_revs - 1 {
                    previous.remove(0);
                }
                incoming.previous = previous;
                incoming.revno = current.revno + 1;
                incoming.userdata = caller_userdata.clone().or(current.userdata);
            }
            None => {
                incoming.previous = Vec::new();
                incoming.revno = 1;
                incoming.userdata = caller_userdata.clone();
            }
        }

        if set_doc_cas(store, path, &incoming, cas).await? {
            return Ok(incoming);
        }
        cas_backoff(attempt).await;
    }
    Err(CbfsError::MetadataError(format!(
        "store file meta for {}: cas contention",
        path
    )))
}

pub async fn delete_file_meta(store: &dyn MetaStore, path: &str) -> CbfsResult<bool> {
    store.delete(path).await
}

/// Replace a path's opaque userdata under CAS, leaving everything else
/// in the record alone.
pub async fn set_userdata(store: &dyn MetaStore, path: &str, userdata: Value) -> CbfsResult<()> {
    for attempt in 0..CAS_MAX_ATTEMPTS {
        let (mut meta, cas) = gets_doc::<FileMeta>(store, path)
            .await?
            .ok_or_else(|| CbfsError::NotFound(format!("no file at {}", path)))?;
        meta.userdata = Some(userdata.clone());
        if set_doc_cas(store, path, &meta, Some(cas)).await? {
            return Ok(());
        }
        cas_backoff(attempt).await;
    }
    Err(CbfsError::MetadataError(format!(
        "set userdata for {}: cas contention",
        path
    )))
}

/// All user-path records below `dir` (or everything for an empty dir),
/// as (path relative to `dir`, metadata) pairs. User docs are the keys
/// with no leading slash, which keeps them clear of blob and internal
/// keys.
pub async fn list_file_metas(
    store: &dyn MetaStore,
    dir: &str,
) -> CbfsResult<Vec<(String, FileMeta)>> {
    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    };
    let mut found = Vec::new();
    for key in store.keys_with_prefix(&prefix).await? {
        if key.starts_with('/') {
            continue;
        }
        let relative = key[prefix.len()..].to_string();
        if relative.is_empty() {
            continue;
        }
        if let Some(meta) = get_file_meta(store, &key).await? {
            found.push((relative, meta));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemMetaStore;
    use serde_json::json;

    fn meta_for(oid: &str, modified: u64) -> FileMeta {
        let mut headers = StoredHeaders::new();
        headers.insert("content-type".to_string(), vec!["text/plain".to_string()]);
        FileMeta {
            headers,
            oid: oid.to_string(),
            length: 4,
            modified,
            revno: 0,
            previous: Vec::new(),
            userdata: None,
        }
    }

    #[tokio::test]
    async fn test_first_put_starts_at_rev_one() {
        let store = MemMetaStore::new();
        let stored = store_file_meta(store.as_ref(), "a/b", meta_for("oid1", 10), 3)
            .await
            .unwrap();
        assert_eq!(stored.revno, 1);
        assert!(stored.previous.is_empty());
    }

    #[tokio::test]
    async fn test_history_trims_to_keep_revs() {
        let store = MemMetaStore::new();
        for (i, oid) in ["b1", "b2", "b3", "b4"].iter().enumerate() {
            store_file_meta(store.as_ref(), "p", meta_for(oid, i as u64), 3)
                .await
                .unwrap();
        }
        let meta = get_file_meta(store.as_ref(), "p").await.unwrap().unwrap();
        assert_eq!(meta.revno, 4);
        assert_eq!(meta.oid, "b4");
        let prev_revnos: Vec<u32> = meta.previous.iter().map(|p| p.revno).collect();
        assert_eq!(prev_revnos, vec![2, 3]);
        assert_eq!(meta.find_previous(2).unwrap().oid, "b2");
        assert!(meta.find_previous(1).is_none());
        assert_eq!(meta.oldest_revno(), 2);
        assert!(meta.previous.iter().all(|p| p.revno < meta.revno));
    }

    #[tokio::test]
    async fn test_keep_revs_one_discards_history() {
        let store = MemMetaStore::new();
        store_file_meta(store.as_ref(), "p", meta_for("b1", 1), 1)
            .await
            .unwrap();
        store_file_meta(store.as_ref(), "p", meta_for("b2", 2), 1)
            .await
            .unwrap();
        let meta = get_file_meta(store.as_ref(), "p").await.unwrap().unwrap();
        assert_eq!(meta.revno, 2);
        assert!(meta.previous.is_empty());
    }

    #[tokio::test]
    async fn test_userdata_survives_new_revisions() {
        let store = MemMetaStore::new();
        store_file_meta(store.as_ref(), "p", meta_for("b1", 1), 3)
            .await
            .unwrap();
        set_userdata(store.as_ref(), "p", json!({"tag": "kept"}))
            .await
            .unwrap();
        store_file_meta(store.as_ref(), "p", meta_for("b2", 2), 3)
            .await
            .unwrap();
        let meta = get_file_meta(store.as_ref(), "p").await.unwrap().unwrap();
        assert_eq!(meta.userdata, Some(json!({"tag": "kept"})));
    }

    #[tokio::test]
    async fn test_set_userdata_requires_existing_file() {
        let store = MemMetaStore::new();
        let err = set_userdata(store.as_ref(), "ghost", json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_file_metas_scopes_to_dir() {
        let store = MemMetaStore::new();
        store_file_meta(store.as_ref(), "docs/a.txt", meta_for("o1", 1), 1)
            .await
            .unwrap();
        store_file_meta(store.as_ref(), "docs/sub/b.txt", meta_for("o2", 1), 1)
            .await
            .unwrap();
        store_file_meta(store.as_ref(), "other/c.txt", meta_for("o3", 1), 1)
            .await
            .unwrap();

        let mut listed = list_file_metas(store.as_ref(), "docs").await.unwrap();
        listed.sort_by(|a, b| a.0.cmp(&b.0));
        let names: Vec<&str> = listed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub/b.txt"]);
    }
}
