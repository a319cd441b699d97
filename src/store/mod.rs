//! Durable result storage.
//!
//! A [`BlobStore`] keeps derivatives keyed by [`CacheKey`] together with the
//! HTTP headers they should be served with. Lookups hand back those headers
//! verbatim; interpreting them (and rejecting bad ones) is the caller's job.

pub mod disk;
pub mod sled_store;
#[cfg(feature = "s3")]
pub mod s3;

pub use disk::DiskStore;
pub use sled_store::SledStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

use crate::cache_key::CacheKey;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::header::{CONTENT_LENGTH, ETAG};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Storage class hint understood by S3-compatible stores.
pub const STORAGE_CLASS: HeaderName = HeaderName::from_static("x-amz-storage-class");
pub const REDUCED_REDUNDANCY: &str = "REDUCED_REDUNDANCY";

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Object returned by [`BlobStore::get`].
pub struct StoredObject {
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject").field("headers", &self.headers).finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed object metadata: {0}")]
    Metadata(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Streams the object body along with its stored headers.
    async fn get(&self, key: &CacheKey) -> Result<StoredObject, StoreError>;

    /// Existence and metadata check that never transfers the body.
    async fn head_metadata(&self, key: &CacheKey) -> Result<HeaderMap, StoreError>;

    /// Stores `data` under `key`. `headers` carries `Content-Type` and an
    /// optional [`STORAGE_CLASS`] hint; the store adds `Content-Length` and
    /// an MD5 `ETag` itself.
    async fn put(&self, key: &CacheKey, data: Bytes, headers: HeaderMap) -> Result<(), StoreError>;
}

/// Header set persisted next to an object by the local backends.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ObjectMeta {
    pub headers: BTreeMap<String, String>,
    pub created_at: u64,
}

impl ObjectMeta {
    pub fn for_put(data: &[u8], headers: &HeaderMap) -> Self {
        let mut stored: BTreeMap<String, String> = headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        stored.insert(CONTENT_LENGTH.as_str().into(), data.len().to_string());
        stored.insert(ETAG.as_str().into(), quoted_md5(data));

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self { headers: stored, created_at }
    }

    pub fn header_map(&self) -> Result<HeaderMap, StoreError> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StoreError::Metadata(format!("{name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| StoreError::Metadata(format!("{name}: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

/// Quoted hex MD5, the same shape S3 reports for single-part uploads.
pub fn quoted_md5(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}
