mod blob_id;
mod hash_writer;
mod local_store;
mod client;

pub use blob_id::*;
pub use hash_writer::*;
pub use local_store::*;
pub use client::*;

use reqwest::StatusCode;
use thiserror::Error;

#[macro_use]
extern crate log;

/// HTTP wire constants shared by the daemon and the peer client.
pub const BLOB_PREFIX: &str = "/.cbfs/blob/";
pub const NODE_PREFIX: &str = "/.cbfs/nodes/";
pub const META_PREFIX: &str = "/.cbfs/meta/";
pub const FETCH_PREFIX: &str = "/.cbfs/fetch/";
pub const LIST_PREFIX: &str = "/.cbfs/list/";
pub const CONFIG_PREFIX: &str = "/.cbfs/config/";
pub const RESERVED_PREFIX: &str = "/.cbfs/";

pub const HASH_HEADER: &str = "X-CBFS-Hash";
pub const KEEP_REVS_HEADER: &str = "X-CBFS-KeepRevs";
pub const REVNO_HEADER: &str = "X-CBFS-Revno";
pub const OLDEST_REV_HEADER: &str = "X-CBFS-OldestRev";
pub const PREVNODE_HEADER: &str = "X-Prevnode";

#[derive(Error, Debug)]
pub enum CbfsError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("revision purged: {0}")]
    Gone(String),
    #[error("digest mismatch: {0}")]
    DigestMismatch(String),
    #[error("replica divergence: {0}")]
    ReplicaDivergence(String),
    #[error("secondary store failed: {0}")]
    SecondaryStoreFailed(String),
    #[error("metadata error: {0}")]
    MetadataError(String),
    #[error("no cooperating peer: {0}")]
    Unavailable(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
}

impl CbfsError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => CbfsError::NotFound(info),
            StatusCode::BAD_REQUEST => CbfsError::BadRequest(info),
            StatusCode::GONE => CbfsError::Gone(info),
            _ => CbfsError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CbfsError::NotFound(_))
    }
}

pub type CbfsResult<T> = std::result::Result<T, CbfsError>;

impl From<std::io::Error> for CbfsError {
    fn from(err: std::io::Error) -> Self {
        CbfsError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CbfsError {
    fn from(err: serde_json::Error) -> Self {
        CbfsError::DecodeError(err.to_string())
    }
}

/// Seconds since the unix epoch.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
