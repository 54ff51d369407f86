use crate::node::NodeState;
use bytes::Bytes;
use cbfs_lib::{BlobId, BlobReader, CbfsError, CbfsResult, HashRecord};
use cluster_meta::{forget_ownership, get_ownership, record_ownership};
use futures_util::stream;
use log::{debug, info, warn};
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// A peer's request that this node acquire a blob (rebalancing).
pub struct FetchRequest {
    pub oid: BlobId,
    pub prev_node: Option<String>,
}

/// Serve a blob this node does not hold by streaming it from one of its
/// owners, optionally keeping a local copy on the way through.
///
/// `admit_override` forces the cache decision (the fetch queue admits
/// unconditionally); otherwise admission is probabilistic per the
/// cluster config and gated on free space. `prefer` puts one owner at
/// the front of the try-order (the `X-Prevnode` hint).
pub async fn open_remote_blob(
    state: &NodeState,
    oid: &BlobId,
    admit_override: Option<bool>,
    prefer: Option<&str>,
) -> CbfsResult<(BlobReader, u64)> {
    let ownership = match get_ownership(state.meta.as_ref(), oid).await? {
        Some(ownership) => ownership,
        None => {
            // Nobody claims this blob; drop whatever stale claim we had.
            let _ = forget_ownership(state.meta.as_ref(), oid, &state.node_name).await;
            return Err(CbfsError::NotFound(format!(
                "no ownership record for {}",
                oid
            )));
        }
    };

    let mut owners = state.peers().await.owners_of(oid).await?;
    if let Some(prefer) = prefer {
        if let Some(pos) = owners.iter().position(|n| n.name == prefer) {
            let hinted = owners.remove(pos);
            owners.insert(0, hinted);
        }
    }

    for owner in owners {
        debug!("trying to get {} from {}", oid, owner.name);
        let (peer_reader, content_length) =
            match state.client.open_blob_reader(&owner.address(), oid).await {
                Ok(opened) => opened,
                Err(e) => {
                    warn!("reading {} from {} failed: {}", oid, owner.name, e);
                    continue;
                }
            };
        let length = content_length.unwrap_or(ownership.length);

        let admit = match admit_override {
            Some(forced) => forced,
            None => {
                let percent = state.config().await.cache_admission_percent;
                percent >= 100
                    || (rand::thread_rng().gen_range(0..100u8) < percent
                        && state.store.available_space().unwrap_or(0) >= ownership.length)
            }
        };
        // The cache copy rides the same stream, verified against the
        // digest it will be named by.
        let record = if admit {
            match HashRecord::new(state.store.root(), Some(oid.clone())).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("cache admission for {} failed to open: {}", oid, e);
                    None
                }
            }
        } else {
            None
        };

        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(2);
        tokio::spawn(pump_remote(
            peer_reader,
            record,
            tx,
            state.clone(),
            oid.clone(),
        ));
        let body_stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let reader: BlobReader = Box::pin(StreamReader::new(body_stream));
        return Ok((reader, length));
    }

    Err(CbfsError::Unavailable(format!(
        "cannot locate blob {} on any peer",
        oid
    )))
}

/// Drive the peer stream: every chunk goes to the consumer, and into the
/// cache writer while one is alive. Cache trouble silently drops the
/// cache side; consumer hangup abandons both.
async fn pump_remote(
    mut peer_reader: BlobReader,
    mut record: Option<HashRecord>,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
    state: NodeState,
    oid: BlobId,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match peer_reader.read(&mut buf).await {
            Err(e) => {
                if let Some(mut record) = record.take() {
                    record.discard().await;
                }
                let _ = tx.send(Err(e)).await;
                return;
            }
            Ok(0) => break,
            Ok(n) => {
                let mut cache_gone = false;
                if let Some(active) = record.as_mut() {
                    // write_chunk already removed its tmp file on failure.
                    if active.write_chunk(&buf[..n]).await.is_err() {
                        warn!("cache write for {} failed mid-stream, serving on", oid);
                        cache_gone = true;
                    }
                }
                if cache_gone {
                    record = None;
                }
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    // Client went away; the cache copy is incomplete.
                    if let Some(mut record) = record.take() {
                        record.discard().await;
                    }
                    return;
                }
            }
        }
    }

    if let Some(record) = record {
        let (_, length) = record.digest();
        match record.finish().await {
            Ok(cached) => {
                info!("cached {} ({} bytes) from remote read", cached, length);
                let meta = state.meta.clone();
                let node = state.node_name.clone();
                tokio::spawn(async move {
                    if let Err(e) = record_ownership(meta.as_ref(), &cached, length, &node).await {
                        warn!("recording cached copy of {} failed: {}", cached, e);
                    }
                });
            }
            Err(e) => {
                warn!("cache finish for {} failed: {}", oid, e);
            }
        }
    }
}

/// Drain the fetch queue: each accepted request becomes a read-miss
/// fetch that admits unconditionally. Out-of-space requests are dropped
/// with a log line; nobody is waiting on the other end.
pub async fn fetch_worker(state: NodeState, mut rx: mpsc::Receiver<FetchRequest>) {
    while let Some(request) = rx.recv().await {
        let oid = request.oid;
        if state.store.contains(&oid).await {
            continue;
        }
        let ownership = match get_ownership(state.meta.as_ref(), &oid).await {
            Ok(Some(ownership)) => ownership,
            Ok(None) => {
                warn!("fetch of {} dropped: no ownership record", oid);
                continue;
            }
            Err(e) => {
                warn!("fetch of {} dropped: {}", oid, e);
                continue;
            }
        };
        if state.store.available_space().unwrap_or(0) < ownership.length {
            warn!("fetch of {} dropped: not enough free space", oid);
            continue;
        }

        match open_remote_blob(&state, &oid, Some(true), request.prev_node.as_deref()).await {
            Ok((mut reader, _length)) => {
                // Drain; the pump persists the cache copy as a side effect.
                let mut sink = tokio::io::sink();
                if let Err(e) = tokio::io::copy(&mut reader, &mut sink).await {
                    warn!("background fetch of {} failed mid-stream: {}", oid, e);
                }
            }
            Err(e) => {
                warn!("background fetch of {} failed: {}", oid, e);
            }
        }
    }
}
