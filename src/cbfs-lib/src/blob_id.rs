use crate::{CbfsError, CbfsResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HASH_ALGORITHM: &str = "sha256";
pub const HASH_BYTES_LEN: usize = 32;
pub const HASH_HEX_LEN: usize = HASH_BYTES_LEN * 2;

/// Content digest of a blob, the only identifier of its bytes.
/// Rendered as lowercase hex everywhere it crosses a wire or a filename.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlobId {
    bytes: [u8; HASH_BYTES_LEN],
}

impl BlobId {
    pub fn from_bytes(bytes: [u8; HASH_BYTES_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_hex(s: &str) -> CbfsResult<Self> {
        if s.len() != HASH_HEX_LEN {
            return Err(CbfsError::BadRequest(format!(
                "digest must be {} hex chars, got {}",
                HASH_HEX_LEN,
                s.len()
            )));
        }
        let decoded = hex::decode(s)
            .map_err(|e| CbfsError::BadRequest(format!("invalid digest {}: {}", s, e)))?;
        let mut bytes = [0u8; HASH_BYTES_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; HASH_BYTES_LEN] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// First two hex chars, the shard directory under the blob root.
    pub fn shard_dir(&self) -> String {
        self.to_hex()[..2].to_string()
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.to_hex())
    }
}

impl Serialize for BlobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlobId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental digest of a byte stream.
#[derive(Clone)]
pub struct BlobHasher {
    inner: Sha256,
    length: u64,
}

impl BlobHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            length: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.length += data.len() as u64;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn finish(self) -> (BlobId, u64) {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; HASH_BYTES_LEN];
        bytes.copy_from_slice(&digest);
        (BlobId::from_bytes(bytes), self.length)
    }

    pub fn calc_from_bytes(data: &[u8]) -> BlobId {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finish().0
    }

    pub async fn calc_from_reader<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> CbfsResult<(BlobId, u64)> {
        let mut hasher = Self::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }
}

impl Default for BlobHasher {
    fn default() -> Self {
        Self::new()
    }
}
