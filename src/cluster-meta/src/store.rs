use async_trait::async_trait;
use cbfs_lib::{CbfsError, CbfsResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Contract of the shared metadata service: a document store with
/// compare-and-swap writes and key-prefix views. Ownership records, file
/// metadata, node heartbeats and cluster config all live behind this
/// trait; the service itself runs elsewhere.
///
/// CAS discipline for `set_cas`:
/// - `cas = None` — unconditional set.
/// - `cas = Some(0)` — create only; fails if the key exists.
/// - `cas = Some(n)` — swap only if the stored cas token is still `n`.
///
/// A `false` return is a CAS conflict, not an error; callers loop.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &str) -> CbfsResult<Option<Value>>;

    /// Fetch a document together with its current cas token.
    async fn gets(&self, key: &str) -> CbfsResult<Option<(Value, u64)>>;

    async fn set_cas(&self, key: &str, value: Value, cas: Option<u64>) -> CbfsResult<bool>;

    async fn delete(&self, key: &str) -> CbfsResult<bool>;

    /// Delete only if the stored cas token still matches.
    async fn delete_cas(&self, key: &str, cas: u64) -> CbfsResult<bool>;

    /// View-style scan: every key starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> CbfsResult<Vec<String>>;
}

pub type MetaStoreRef = Arc<dyn MetaStore>;

pub async fn get_doc<T: DeserializeOwned>(
    store: &dyn MetaStore,
    key: &str,
) -> CbfsResult<Option<T>> {
    match store.get(key).await? {
        Some(value) => {
            let doc = serde_json::from_value(value).map_err(|e| {
                warn!("metadata doc {} failed to decode: {}", key, e);
                CbfsError::MetadataError(format!("decode {}: {}", key, e))
            })?;
            Ok(Some(doc))
        }
        None => Ok(None),
    }
}

pub async fn gets_doc<T: DeserializeOwned>(
    store: &dyn MetaStore,
    key: &str,
) -> CbfsResult<Option<(T, u64)>> {
    match store.gets(key).await? {
        Some((value, cas)) => {
            let doc = serde_json::from_value(value).map_err(|e| {
                warn!("metadata doc {} failed to decode: {}", key, e);
                CbfsError::MetadataError(format!("decode {}: {}", key, e))
            })?;
            Ok(Some((doc, cas)))
        }
        None => Ok(None),
    }
}

pub async fn set_doc_cas<T: Serialize>(
    store: &dyn MetaStore,
    key: &str,
    doc: &T,
    cas: Option<u64>,
) -> CbfsResult<bool> {
    let value = serde_json::to_value(doc)
        .map_err(|e| CbfsError::MetadataError(format!("encode {}: {}", key, e)))?;
    store.set_cas(key, value, cas).await
}

/// In-process metadata store. Backs the test harness and single-process
/// deployments; in a cluster every node shares one instance (or a real
/// document service implementing the same trait).
pub struct MemMetaStore {
    docs: RwLock<HashMap<String, (Value, u64)>>,
    next_cas: AtomicU64,
}

impl MemMetaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            docs: RwLock::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
        })
    }

    fn bump(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn get(&self, key: &str) -> CbfsResult<Option<Value>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(key).map(|(value, _)| value.clone()))
    }

    async fn gets(&self, key: &str) -> CbfsResult<Option<(Value, u64)>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(key).cloned())
    }

    async fn set_cas(&self, key: &str, value: Value, cas: Option<u64>) -> CbfsResult<bool> {
        let token = self.bump();
        let mut docs = self.docs.write().unwrap();
        match cas {
            None => {
                docs.insert(key.to_string(), (value, token));
                Ok(true)
            }
            Some(0) => {
                if docs.contains_key(key) {
                    return Ok(false);
                }
                docs.insert(key.to_string(), (value, token));
                Ok(true)
            }
            Some(expected) => match docs.get(key) {
                Some((_, current)) if *current == expected => {
                    docs.insert(key.to_string(), (value, token));
                    Ok(true)
                }
                _ => Ok(false),
            },
        }
    }

    async fn delete(&self, key: &str) -> CbfsResult<bool> {
        let mut docs = self.docs.write().unwrap();
        Ok(docs.remove(key).is_some())
    }

    async fn delete_cas(&self, key: &str, cas: u64) -> CbfsResult<bool> {
        let mut docs = self.docs.write().unwrap();
        match docs.get(key) {
            Some((_, current)) if *current == cas => {
                docs.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> CbfsResult<Vec<String>> {
        let docs = self.docs.read().unwrap();
        Ok(docs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
