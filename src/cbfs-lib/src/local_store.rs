use crate::{BlobId, CbfsError, CbfsResult, HASH_HEX_LEN};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncSeekExt};

pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Local half of the blob store: canonical files live at
/// `<root>/<dd>/<digest>` where `dd` is the first two hex chars of the
/// digest, bounding per-directory entry counts. Everything else about a
/// blob lives in the shared metadata service.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(root: &Path) -> CbfsResult<Self> {
        fs::create_dir_all(root).await.map_err(|e| {
            warn!("LocalBlobStore: create root {} failed! {}", root.display(), e);
            CbfsError::IoError(e.to_string())
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.root.join(id.shard_dir()).join(id.to_hex())
    }

    pub async fn contains(&self, id: &BlobId) -> bool {
        fs::try_exists(self.blob_path(id)).await.unwrap_or(false)
    }

    pub async fn length(&self, id: &BlobId) -> CbfsResult<u64> {
        let path = self.blob_path(id);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CbfsError::NotFound(
                format!("blob {} not on local disk", id),
            )),
            Err(e) => Err(CbfsError::IoError(e.to_string())),
        }
    }

    /// Open a canonical blob at `offset`, returning the reader and the
    /// blob's full length.
    pub async fn open(&self, id: &BlobId, offset: u64) -> CbfsResult<(BlobReader, u64)> {
        let path = self.blob_path(id);
        let mut file = OpenOptions::new().read(true).open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CbfsError::NotFound(format!("blob {} not on local disk", id))
            } else {
                warn!("LocalBlobStore: open {} failed! {}", path.display(), e);
                CbfsError::IoError(e.to_string())
            }
        })?;
        let length = file
            .metadata()
            .await
            .map_err(|e| CbfsError::IoError(e.to_string()))?
            .len();
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
                warn!("LocalBlobStore: seek {} failed! {}", path.display(), e);
                CbfsError::IoError(e.to_string())
            })?;
        }
        Ok((Box::pin(file), length))
    }

    pub async fn delete(&self, id: &BlobId) -> CbfsResult<()> {
        let path = self.blob_path(id);
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CbfsError::NotFound(format!("blob {} not on local disk", id))
            } else {
                warn!("LocalBlobStore: delete {} failed! {}", path.display(), e);
                CbfsError::IoError(e.to_string())
            }
        })
    }

    /// Free bytes on the filesystem holding the blob root. A lower bound:
    /// other writers share the volume.
    pub fn available_space(&self) -> CbfsResult<u64> {
        fs2::available_space(&self.root).map_err(|e| CbfsError::IoError(e.to_string()))
    }

    pub fn total_space(&self) -> CbfsResult<u64> {
        fs2::total_space(&self.root).map_err(|e| CbfsError::IoError(e.to_string()))
    }

    /// Digests of every canonical file under the root. A file counts iff
    /// its name is exactly the digest width of hex and not a temp file.
    pub async fn walk(&self) -> CbfsResult<Vec<BlobId>> {
        let mut found = Vec::new();
        let mut top = fs::read_dir(&self.root).await.map_err(|e| {
            warn!("LocalBlobStore: read root failed! {}", e);
            CbfsError::IoError(e.to_string())
        })?;
        while let Some(entry) = top
            .next_entry()
            .await
            .map_err(|e| CbfsError::IoError(e.to_string()))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| CbfsError::IoError(e.to_string()))?;
            if !file_type.is_dir() {
                continue;
            }
            let mut shard = fs::read_dir(entry.path())
                .await
                .map_err(|e| CbfsError::IoError(e.to_string()))?;
            while let Some(blob_entry) = shard
                .next_entry()
                .await
                .map_err(|e| CbfsError::IoError(e.to_string()))?
            {
                let name = blob_entry.file_name().to_string_lossy().to_string();
                if name.len() != HASH_HEX_LEN || name.starts_with("tmp") {
                    continue;
                }
                if let Ok(id) = BlobId::from_hex(&name) {
                    found.push(id);
                }
            }
        }
        Ok(found)
    }

    /// Remove leftover `tmp`-prefixed files from interrupted writes.
    /// Called once at startup, before the node serves traffic.
    pub async fn cleanup_tmp(&self) -> CbfsResult<u64> {
        let mut removed = 0u64;
        let mut top = fs::read_dir(&self.root)
            .await
            .map_err(|e| CbfsError::IoError(e.to_string()))?;
        while let Some(entry) = top
            .next_entry()
            .await
            .map_err(|e| CbfsError::IoError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| CbfsError::IoError(e.to_string()))?;
            if file_type.is_file() && name.starts_with("tmp") {
                if fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("LocalBlobStore: removed {} stale tmp files", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlobHasher, HashRecord};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn put_blob(store: &LocalBlobStore, data: &[u8]) -> BlobId {
        let mut record = HashRecord::new(store.root(), None).await.unwrap();
        let mut cursor = std::io::Cursor::new(data.to_vec());
        record.process(&mut cursor).await.unwrap();
        record.finish().await.unwrap()
    }

    #[tokio::test]
    async fn test_open_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path()).await.unwrap();
        let data = b"store me".to_vec();
        let id = put_blob(&store, &data).await;

        assert!(store.contains(&id).await);
        let (mut reader, length) = store.open(&id, 0).await.unwrap();
        assert_eq!(length, data.len() as u64);
        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, data);

        store.delete(&id).await.unwrap();
        assert!(!store.contains(&id).await);
        let err = store.delete(&id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_open_at_offset() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path()).await.unwrap();
        let id = put_blob(&store, b"0123456789").await;

        let (mut reader, length) = store.open(&id, 4).await.unwrap();
        assert_eq!(length, 10);
        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"456789");
    }

    #[tokio::test]
    async fn test_walk_skips_tmp_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path()).await.unwrap();
        let a = put_blob(&store, b"first").await;
        let b = put_blob(&store, b"second").await;
        tokio::fs::write(temp_dir.path().join("tmpdeadbeef"), b"junk")
            .await
            .unwrap();

        let mut walked = store.walk().await.unwrap();
        walked.sort_by_key(|id| id.to_hex());
        let mut expected = vec![a, b];
        expected.sort_by_key(|id| id.to_hex());
        assert_eq!(walked, expected);
    }

    #[tokio::test]
    async fn test_cleanup_tmp() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path()).await.unwrap();
        let id = put_blob(&store, b"keep").await;
        tokio::fs::write(temp_dir.path().join("tmp01020304"), b"junk")
            .await
            .unwrap();

        let removed = store.cleanup_tmp().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.contains(&id).await);
    }

    #[tokio::test]
    async fn test_canonical_file_hashes_to_its_name() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path()).await.unwrap();
        let id = put_blob(&store, b"invariant").await;
        let stored = tokio::fs::read(store.blob_path(&id)).await.unwrap();
        assert_eq!(BlobHasher::calc_from_bytes(&stored), id);
    }
}
