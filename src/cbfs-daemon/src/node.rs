use crate::fetch::{fetch_worker, FetchRequest};
use crate::peers::PeerDirectory;
use cbfs_lib::{unix_timestamp, CbfsClient, CbfsResult, LocalBlobStore, HASH_ALGORITHM};
use cluster_meta::{
    load_config, publish_node_record, ClusterConfig, MetaStoreRef, NodeRecord,
};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

const FETCH_QUEUE_DEPTH: usize = 256;

pub struct NodeOptions {
    pub node_name: String,
    pub root: PathBuf,
    /// host:port peers use to reach this node's HTTP surface.
    pub advertise_addr: String,
    pub bind_port: u16,
}

/// Everything a request handler needs: the local blob store, the shared
/// metadata handle, the peer client, the cached cluster config and the
/// fetch queue. Cheap to clone; handed to axum as router state.
#[derive(Clone)]
pub struct NodeState {
    pub node_name: String,
    pub advertise_addr: String,
    pub bind_port: u16,
    pub store: Arc<LocalBlobStore>,
    pub meta: MetaStoreRef,
    pub client: Arc<CbfsClient>,
    config: Arc<RwLock<ClusterConfig>>,
    fetch_tx: mpsc::Sender<FetchRequest>,
}

impl NodeState {
    /// Build the node: prepare the blob root (sweeping stale tmp files),
    /// load the cluster config, publish the first heartbeat and start
    /// the background tasks.
    pub async fn bootstrap(options: NodeOptions, meta: MetaStoreRef) -> CbfsResult<NodeState> {
        let store = LocalBlobStore::new(&options.root).await?;
        store.cleanup_tmp().await?;

        let config = load_config(meta.as_ref()).await?;
        let (fetch_tx, fetch_rx) = mpsc::channel(FETCH_QUEUE_DEPTH);

        let state = NodeState {
            node_name: options.node_name,
            advertise_addr: options.advertise_addr,
            bind_port: options.bind_port,
            store: Arc::new(store),
            meta,
            client: Arc::new(CbfsClient::new()),
            config: Arc::new(RwLock::new(config)),
            fetch_tx,
        };

        state.publish_heartbeat().await?;
        info!(
            "node {} up at {} (root {})",
            state.node_name,
            state.advertise_addr,
            state.store.root().display()
        );

        tokio::spawn(fetch_worker(state.clone(), fetch_rx));
        tokio::spawn(background_loop(state.clone()));
        Ok(state)
    }

    pub async fn config(&self) -> ClusterConfig {
        self.config.read().await.clone()
    }

    /// Re-read the shared config document into the local snapshot.
    pub async fn refresh_config(&self) -> CbfsResult<ClusterConfig> {
        let fresh = load_config(self.meta.as_ref()).await?;
        *self.config.write().await = fresh.clone();
        Ok(fresh)
    }

    pub async fn peers(&self) -> PeerDirectory {
        let staleness = self.config().await.node_staleness_secs();
        PeerDirectory::new(self.meta.clone(), self.node_name.clone(), staleness)
    }

    pub fn enqueue_fetch(&self, request: FetchRequest) -> bool {
        self.fetch_tx.try_send(request).is_ok()
    }

    /// Publish this node's liveness and capacity record.
    pub async fn publish_heartbeat(&self) -> CbfsResult<()> {
        let total = self.store.total_space().unwrap_or(0);
        let free = self.store.available_space().unwrap_or(0);
        let record = NodeRecord {
            name: self.node_name.clone(),
            addr: self.advertise_addr.clone(),
            bind_port: self.bind_port,
            time: unix_timestamp(),
            used: total.saturating_sub(free),
            free,
            storage_size: total,
            hash_algorithm: HASH_ALGORITHM.to_string(),
        };
        publish_node_record(self.meta.as_ref(), &record).await
    }
}

/// Periodic housekeeping: heartbeat refresh and config re-read. Failures
/// are logged and retried next tick.
async fn background_loop(state: NodeState) {
    loop {
        let freq = state.config().await.heartbeat_freq_secs.max(1);
        tokio::time::sleep(Duration::from_secs(freq)).await;
        if let Err(e) = state.publish_heartbeat().await {
            warn!("heartbeat publish failed: {}", e);
        }
        if let Err(e) = state.refresh_config().await {
            warn!("config refresh failed: {}", e);
        }
    }
}
