use crate::node::NodeState;
use bytes::Bytes;
use cbfs_lib::{BlobId, CbfsError, CbfsResult, HashRecord};
use cluster_meta::{get_ownership, record_ownership};
use futures_util::stream;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::ReaderStream;

/// What the replica leg reported back after the body finished.
pub enum ReplicaOutcome {
    Stored { node: String, hash: BlobId },
    Failed { node: String, error: CbfsError },
    NoPeers,
}

pub struct IngestResult {
    pub oid: BlobId,
    pub length: u64,
    pub replicated_to: Option<String>,
}

/// The central write primitive: drain a client body once, feeding every
/// chunk to the local digest writer and (when a live peer exists and
/// `replicate` is set) to a streaming POST against that peer. The chunk
/// channel is capacity-bounded, so neither leg races ahead of the other
/// by more than a couple of buffers.
///
/// Outcome rules: a digest mismatch or a diverging peer hash rolls the
/// local write back; a failed replica leg keeps the local blob and its
/// ownership record but still fails the caller, which must not commit
/// path metadata on top of it.
pub async fn store_blob_stream<R: AsyncRead + Unpin>(
    state: &NodeState,
    body: &mut R,
    expected: Option<BlobId>,
    replicate: bool,
) -> CbfsResult<IngestResult> {
    let mut record = HashRecord::new(state.store.root(), expected.clone()).await?;

    let mut side_tx = None;
    let mut result_rx = None;
    if replicate {
        let peers = state.peers().await.remote_nodes().await?;
        if let Some(peer) = peers.into_iter().next() {
            let (tx, rx) = mpsc::channel::<Bytes>(2);
            let (res_tx, res_rx) = oneshot::channel();
            let client = state.client.clone();
            let addr = peer.address();
            let node = peer.name.clone();
            tokio::spawn(async move {
                info!("piping secondary storage to {}", addr);
                let body_stream = stream::unfold(rx, |mut rx| async move {
                    rx.recv()
                        .await
                        .map(|chunk| (Ok::<Bytes, std::io::Error>(chunk), rx))
                });
                let outcome = match client
                    .store_blob(&addr, reqwest::Body::wrap_stream(body_stream))
                    .await
                {
                    Ok(hash) => ReplicaOutcome::Stored { node, hash },
                    Err(error) => ReplicaOutcome::Failed { node, error },
                };
                let _ = res_tx.send(outcome);
            });
            side_tx = Some(tx);
            result_rx = Some(res_rx);
        } else {
            debug!("no live peers, storing without a replica");
        }
    }

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match body.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("client body read failed: {}", e);
                record.discard().await;
                return Err(CbfsError::IoError(e.to_string()));
            }
        };
        if n == 0 {
            break;
        }
        record.write_chunk(&buf[..n]).await?;
        let mut side_gone = false;
        if let Some(tx) = &side_tx {
            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                warn!("replica leg hung up early, continuing local-only");
                side_gone = true;
            }
        }
        if side_gone {
            side_tx = None;
        }
    }
    // Closing the sender EOFs the peer POST body.
    drop(side_tx);

    let (digest, length) = record.digest();
    if let Some(expected) = &expected {
        if *expected != digest {
            let msg = format!("asserted {} but body hashed to {}", expected, digest);
            record.discard().await;
            return Err(CbfsError::DigestMismatch(msg));
        }
    }

    let outcome = match result_rx {
        Some(rx) => rx.await.unwrap_or(ReplicaOutcome::Failed {
            node: "unknown".to_string(),
            error: CbfsError::Internal("replica task vanished".to_string()),
        }),
        None => ReplicaOutcome::NoPeers,
    };

    if let ReplicaOutcome::Stored { node, hash } = &outcome {
        if *hash != digest {
            let msg = format!("{} hashed the stream to {}, local got {}", node, hash, digest);
            warn!("replica divergence: {}", msg);
            record.discard().await;
            return Err(CbfsError::ReplicaDivergence(msg));
        }
    }

    let oid = record.finish().await?;

    // The blob is on disk from here on; a failed ownership write leaves
    // it for sweep reconciliation rather than deleting a good copy.
    record_ownership(state.meta.as_ref(), &oid, length, &state.node_name)
        .await
        .map_err(|e| {
            warn!("ownership record for {} failed: {}", oid, e);
            CbfsError::MetadataError(format!("record ownership of {}: {}", oid, e))
        })?;

    match outcome {
        ReplicaOutcome::Failed { node, error } => {
            warn!("secondary store to {} failed: {}", node, error);
            Err(CbfsError::SecondaryStoreFailed(format!(
                "replica to {} failed: {}",
                node, error
            )))
        }
        ReplicaOutcome::Stored { node, .. } => Ok(IngestResult {
            oid,
            length,
            replicated_to: Some(node),
        }),
        ReplicaOutcome::NoPeers => Ok(IngestResult {
            oid,
            length,
            replicated_to: None,
        }),
    }
}

/// Background top-up toward the configured replica floor. Failures are
/// logged, never surfaced; the next write or sweep tries again.
pub fn spawn_replica_top_up(state: NodeState, oid: BlobId, want: u32) {
    tokio::spawn(async move {
        if let Err(e) = increase_replica_count(&state, &oid, want).await {
            warn!("replica top-up for {} failed: {}", oid, e);
        }
    });
}

pub async fn increase_replica_count(state: &NodeState, oid: &BlobId, want: u32) -> CbfsResult<()> {
    let ownership = get_ownership(state.meta.as_ref(), oid)
        .await?
        .ok_or_else(|| CbfsError::NotFound(format!("no ownership record for {}", oid)))?;

    let candidates: Vec<_> = state
        .peers()
        .await
        .remote_nodes()
        .await?
        .into_iter()
        .filter(|n| !ownership.nodes.contains_key(&n.name))
        .take(want as usize)
        .collect();

    for peer in candidates {
        let (reader, _length) = state.store.open(oid, 0).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        match state.client.store_blob(&peer.address(), body).await {
            Ok(hash) if hash == *oid => {
                info!("replicated {} to {}", oid, peer.name);
            }
            Ok(hash) => {
                warn!("{} hashed {} to {}, expected {}", peer.name, oid, hash, oid);
            }
            Err(e) => {
                warn!("replicating {} to {} failed: {}", oid, peer.name, e);
            }
        }
    }
    Ok(())
}
