use crate::{BlobId, BlobReader, CbfsError, CbfsResult, BLOB_PREFIX, HASH_HEADER};
use futures_util::StreamExt;
use reqwest::{Body, Client, StatusCode};
use std::time::Duration;
use tokio_util::io::StreamReader;

/// HTTP client for peer-to-peer blob traffic. Replication uploads ride a
/// long timeout to accommodate large blobs; read-side fetches use a short
/// transport timeout so owner iteration fails over quickly.
pub struct CbfsClient {
    replicate_timeout: Duration,
    connect_timeout: Duration,
}

impl CbfsClient {
    pub fn new() -> Self {
        Self {
            replicate_timeout: Duration::from_secs(60 * 60),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn blob_base_url(addr: &str) -> String {
        format!("http://{}{}", addr, BLOB_PREFIX)
    }

    pub fn blob_url(addr: &str, id: &BlobId) -> String {
        format!("http://{}{}{}", addr, BLOB_PREFIX, id)
    }

    fn build_store_client(&self) -> CbfsResult<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.replicate_timeout)
            .build()
            .map_err(|e| CbfsError::Internal(format!("failed to create client: {}", e)))
    }

    fn build_read_client(&self) -> CbfsResult<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| CbfsError::Internal(format!("failed to create client: {}", e)))
    }

    /// POST a blob body to a peer's raw-blob endpoint and return the
    /// digest the peer computed. The peer answers 201 + `X-CBFS-Hash` on
    /// success; anything else is a remote failure.
    pub async fn store_blob(&self, addr: &str, body: Body) -> CbfsResult<BlobId> {
        let url = Self::blob_base_url(addr);
        let client = self.build_store_client()?;
        let res = client
            .post(&url)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| CbfsError::RemoteError(format!("POST {} failed: {}", url, e)))?;

        if res.status() != StatusCode::CREATED {
            return Err(CbfsError::RemoteError(format!(
                "POST {} answered {}",
                url,
                res.status()
            )));
        }

        let hash = res
            .headers()
            .get(HASH_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                CbfsError::RemoteError(format!("POST {} answered without {}", url, HASH_HEADER))
            })?;
        BlobId::from_hex(hash)
    }

    /// GET a blob from a peer, returning a streaming reader and the
    /// content length when the peer advertised one.
    pub async fn open_blob_reader(
        &self,
        addr: &str,
        id: &BlobId,
    ) -> CbfsResult<(BlobReader, Option<u64>)> {
        let url = Self::blob_url(addr, id);
        let client = self.build_read_client()?;
        let res = client
            .get(&url)
            .send()
            .await
            .map_err(|e| CbfsError::RemoteError(format!("GET {} failed: {}", url, e)))?;

        let status = res.status();
        if status != StatusCode::OK {
            return Err(CbfsError::from_http_status(status, url));
        }

        let length = res.content_length();
        let stream = res.bytes_stream().map(|chunk| {
            chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        });
        let reader: BlobReader = Box::pin(StreamReader::new(stream));
        Ok((reader, length))
    }
}

impl Default for CbfsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlobHasher;

    #[test]
    fn test_blob_urls() {
        let id = BlobHasher::calc_from_bytes(b"x");
        assert_eq!(
            CbfsClient::blob_base_url("10.0.0.1:8484"),
            "http://10.0.0.1:8484/.cbfs/blob/"
        );
        assert_eq!(
            CbfsClient::blob_url("10.0.0.1:8484", &id),
            format!("http://10.0.0.1:8484/.cbfs/blob/{}", id)
        );
    }
}
