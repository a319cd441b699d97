use crate::cache_key::CacheKey;
use crate::store::{BlobStore, ObjectMeta, StoreError, StoredObject};
use bytes::Bytes;
use futures::StreamExt;
use http::HeaderMap;
use sled::Db;
use std::path::Path;

/// Embedded sled store for single-node deployments.
///
/// Bodies live under `data:<key>` and their [`ObjectMeta`] under
/// `meta:<key>`. Both are written in one batch so readers never observe a
/// body without matching metadata.
pub struct SledStore {
    db: Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(backend)?;
        Ok(Self { db })
    }

    /// A store that lives only as long as this handle; used by tests.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open().map_err(backend)?;
        Ok(Self { db })
    }

    fn metadata_key(key: &CacheKey) -> String {
        format!("meta:{}", key)
    }

    fn data_key(key: &CacheKey) -> String {
        format!("data:{}", key)
    }

    fn read_meta(&self, key: &CacheKey) -> Result<ObjectMeta, StoreError> {
        let raw = self
            .db
            .get(Self::metadata_key(key).as_bytes())
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Metadata(e.to_string()))
    }
}

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait::async_trait]
impl BlobStore for SledStore {
    fn name(&self) -> &'static str {
        "sled"
    }

    async fn get(&self, key: &CacheKey) -> Result<StoredObject, StoreError> {
        let meta = self.read_meta(key)?;
        let data = self
            .db
            .get(Self::data_key(key).as_bytes())
            .map_err(backend)?
            .ok_or(StoreError::NotFound)?;
        let body = Bytes::copy_from_slice(&data);
        Ok(StoredObject {
            headers: meta.header_map()?,
            body: futures::stream::once(async move { Ok(body) }).boxed(),
        })
    }

    async fn head_metadata(&self, key: &CacheKey) -> Result<HeaderMap, StoreError> {
        self.read_meta(key)?.header_map()
    }

    async fn put(&self, key: &CacheKey, data: Bytes, headers: HeaderMap) -> Result<(), StoreError> {
        let meta = ObjectMeta::for_put(&data, &headers);
        let meta_json = serde_json::to_vec(&meta).map_err(|e| StoreError::Metadata(e.to_string()))?;

        let mut batch = sled::Batch::default();
        batch.insert(Self::data_key(key).as_bytes(), data.as_ref());
        batch.insert(Self::metadata_key(key).as_bytes(), meta_json);
        self.db.apply_batch(batch).map_err(backend)?;
        self.db.flush_async().await.map_err(backend)?;
        Ok(())
    }
}
