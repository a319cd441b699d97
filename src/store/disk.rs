use crate::cache_key::CacheKey;
use crate::store::{BlobStore, ObjectMeta, StoreError, StoredObject};
use bytes::Bytes;
use futures::StreamExt;
use http::HeaderMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio_util::io::ReaderStream;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem store.
///
/// Each object is two files named after the key hash, sharded by the first
/// two hex characters: `<dir>/ab/<hash>` holds the body and
/// `<dir>/ab/<hash>.json` the [`ObjectMeta`]. Both are written to a temp
/// file and renamed into place, body first, so a visible sidecar always has
/// its body next to it.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn shard_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(&key.hash()[..2])
    }

    fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.shard_for(key).join(key.hash())
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.shard_for(key).join(format!("{}.json", key.hash()))
    }

    async fn read_meta(&self, key: &CacheKey) -> Result<ObjectMeta, StoreError> {
        let raw = fs::read(self.meta_path(key)).await.map_err(not_found)?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Metadata(e.to_string()))
    }
}

fn not_found(e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound { StoreError::NotFound } else { StoreError::Io(e) }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("{}.{}.tmp", std::process::id(), n));
    fs::write(&tmp, contents).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait::async_trait]
impl BlobStore for DiskStore {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, key: &CacheKey) -> Result<StoredObject, StoreError> {
        let meta = self.read_meta(key).await?;
        let file = fs::File::open(self.data_path(key)).await.map_err(not_found)?;
        Ok(StoredObject {
            headers: meta.header_map()?,
            body: ReaderStream::new(file).boxed(),
        })
    }

    async fn head_metadata(&self, key: &CacheKey) -> Result<HeaderMap, StoreError> {
        self.read_meta(key).await?.header_map()
    }

    async fn put(&self, key: &CacheKey, data: Bytes, headers: HeaderMap) -> Result<(), StoreError> {
        fs::create_dir_all(self.shard_for(key)).await?;
        let meta = ObjectMeta::for_put(&data, &headers);
        let meta_json = serde_json::to_vec(&meta).map_err(|e| StoreError::Metadata(e.to_string()))?;

        write_atomic(&self.data_path(key), &data).await?;
        write_atomic(&self.meta_path(key), &meta_json).await?;
        Ok(())
    }
}
