use crate::{BlobHasher, BlobId, CbfsError, CbfsResult};
use fs2::FileExt;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Streaming digest writer: bytes go to a `tmp`-prefixed file under the
/// blob root while a running hash accumulates, then `finish` renames the
/// temp file to its canonical `<root>/<dd>/<digest>` path. The canonical
/// file only becomes visible to readers through that atomic rename.
pub struct HashRecord {
    root: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
    hasher: BlobHasher,
    expected: Option<BlobId>,
    finished: bool,
}

impl HashRecord {
    pub async fn new(root: &Path, expected: Option<BlobId>) -> CbfsResult<Self> {
        fs::create_dir_all(root).await.map_err(|e| {
            warn!("HashRecord: create blob root failed! {}", e);
            CbfsError::IoError(e.to_string())
        })?;

        // Unique per task, so concurrent uploads never share a temp file.
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        let tmp_path = root.join(format!("tmp{}", hex::encode(suffix)));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .await
            .map_err(|e| {
                warn!("HashRecord: create tmp file failed! {}", e);
                CbfsError::IoError(e.to_string())
            })?;

        let std_file = file.into_std().await;
        std_file.try_lock_exclusive().map_err(|e| {
            warn!("HashRecord: lock tmp file failed! {}", e);
            let _ = std::fs::remove_file(&tmp_path);
            CbfsError::IoError(e.to_string())
        })?;
        let file = File::from_std(std_file);

        Ok(Self {
            root: root.to_path_buf(),
            tmp_path,
            file: Some(file),
            hasher: BlobHasher::new(),
            expected,
            finished: false,
        })
    }

    pub fn expected(&self) -> Option<&BlobId> {
        self.expected.as_ref()
    }

    /// Append one chunk to the temp file and the running hash.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> CbfsResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CbfsError::Internal("write after close".to_string()))?;
        if let Err(e) = file.write_all(chunk).await {
            warn!("HashRecord: write tmp file failed! {}", e);
            self.discard().await;
            return Err(CbfsError::IoError(e.to_string()));
        }
        self.hasher.update(chunk);
        Ok(())
    }

    /// Drain `reader` to EOF through the temp file, returning the digest
    /// and byte length seen so far.
    pub async fn process<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> CbfsResult<(BlobId, u64)> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("HashRecord: read body failed! {}", e);
                    self.discard().await;
                    return Err(CbfsError::IoError(e.to_string()));
                }
            };
            if n == 0 {
                break;
            }
            self.write_chunk(&buf[..n]).await?;
        }
        Ok(self.digest())
    }

    /// Digest and length of everything written so far.
    pub fn digest(&self) -> (BlobId, u64) {
        self.hasher.clone().finish()
    }

    /// Verify against the expected digest (when given) and atomically
    /// rename the temp file to its canonical path. An already-existing
    /// canonical file means another writer got there first with the same
    /// bytes; the temp file is simply dropped.
    pub async fn finish(mut self) -> CbfsResult<BlobId> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| CbfsError::Internal("finish after close".to_string()))?;
        if let Err(e) = file.flush().await {
            warn!("HashRecord: flush tmp file failed! {}", e);
            self.discard().await;
            return Err(CbfsError::IoError(e.to_string()));
        }
        drop(file);

        let (digest, _length) = self.digest();
        if let Some(expected) = &self.expected {
            if *expected != digest {
                let msg = format!("expected {} but body hashed to {}", expected, digest);
                warn!("HashRecord: {}", msg);
                self.discard().await;
                return Err(CbfsError::DigestMismatch(msg));
            }
        }

        let shard = self.root.join(digest.shard_dir());
        fs::create_dir_all(&shard).await.map_err(|e| {
            warn!("HashRecord: create shard dir failed! {}", e);
            CbfsError::IoError(e.to_string())
        })?;

        let canonical = shard.join(digest.to_hex());
        if fs::try_exists(&canonical).await.unwrap_or(false) {
            debug!("HashRecord: {} already stored, dropping tmp", digest);
            self.discard().await;
            return Ok(digest);
        }

        fs::rename(&self.tmp_path, &canonical).await.map_err(|e| {
            warn!("HashRecord: rename to canonical failed! {}", e);
            CbfsError::IoError(e.to_string())
        })?;
        self.finished = true;
        Ok(digest)
    }

    /// Drop the temp file. Idempotent.
    pub async fn discard(&mut self) {
        self.file = None;
        if !self.finished {
            let _ = fs::remove_file(&self.tmp_path).await;
            self.finished = true;
        }
    }
}

impl Drop for HashRecord {
    fn drop(&mut self) {
        // Abandoned mid-write (client hangup, task abort): the temp file
        // must not outlive the record.
        self.file = None;
        if !self.finished {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlobHasher;
    use tempfile::TempDir;

    async fn list_tmp_files(root: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(root).await.unwrap();
        while let Some(entry) = dir.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("tmp") {
                names.push(name);
            }
        }
        names
    }

    #[tokio::test]
    async fn test_process_and_finish() {
        let temp_dir = TempDir::new().unwrap();
        let mut record = HashRecord::new(temp_dir.path(), None).await.unwrap();
        let data = b"hello world".to_vec();
        let mut cursor = std::io::Cursor::new(data.clone());
        let (digest, length) = record.process(&mut cursor).await.unwrap();
        assert_eq!(length, data.len() as u64);
        assert_eq!(digest, BlobHasher::calc_from_bytes(&data));

        let finished = record.finish().await.unwrap();
        assert_eq!(finished, digest);

        let canonical = temp_dir
            .path()
            .join(digest.shard_dir())
            .join(digest.to_hex());
        let stored = fs::read(&canonical).await.unwrap();
        assert_eq!(stored, data);
        assert!(list_tmp_files(temp_dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_expected_digest_mismatch_removes_tmp() {
        let temp_dir = TempDir::new().unwrap();
        let wrong = BlobHasher::calc_from_bytes(b"something else");
        let mut record = HashRecord::new(temp_dir.path(), Some(wrong)).await.unwrap();
        let mut cursor = std::io::Cursor::new(b"actual body".to_vec());
        record.process(&mut cursor).await.unwrap();

        let err = record.finish().await.unwrap_err();
        assert!(matches!(err, CbfsError::DigestMismatch(_)));
        assert!(list_tmp_files(temp_dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_content_dedups() {
        let temp_dir = TempDir::new().unwrap();
        let data = b"dedup me".to_vec();

        let mut first = HashRecord::new(temp_dir.path(), None).await.unwrap();
        let mut cursor = std::io::Cursor::new(data.clone());
        first.process(&mut cursor).await.unwrap();
        let digest = first.finish().await.unwrap();

        let mut second = HashRecord::new(temp_dir.path(), None).await.unwrap();
        let mut cursor = std::io::Cursor::new(data.clone());
        second.process(&mut cursor).await.unwrap();
        let digest2 = second.finish().await.unwrap();

        assert_eq!(digest, digest2);
        assert!(list_tmp_files(temp_dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_drop_cleans_tmp() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut record = HashRecord::new(temp_dir.path(), None).await.unwrap();
            record.write_chunk(b"partial").await.unwrap();
            assert_eq!(list_tmp_files(temp_dir.path()).await.len(), 1);
        }
        assert!(list_tmp_files(temp_dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_byte_blob() {
        let temp_dir = TempDir::new().unwrap();
        let mut record = HashRecord::new(temp_dir.path(), None).await.unwrap();
        let mut cursor = std::io::Cursor::new(Vec::new());
        let (digest, length) = record.process(&mut cursor).await.unwrap();
        assert_eq!(length, 0);
        assert_eq!(digest, BlobHasher::calc_from_bytes(b""));
        record.finish().await.unwrap();
    }
}
