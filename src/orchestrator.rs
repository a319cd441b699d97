//! Cache-aside orchestration for resize requests.
//!
//! Each request moves through lookup, then either streams a stored
//! derivative (hit) or fetches, transforms and answers from memory (miss).
//! A successful miss hands its derivative to the write-back queue; the
//! response never waits for that write.
//!
//! Identical concurrent misses are not coalesced. Each one fetches,
//! transforms and schedules its own write; the store keeps the last one,
//! and all of them are byte-identical for a deterministic transformer.

use crate::fetch::{Fetched, SourceClient};
use crate::metrics::Metrics;
use crate::request::ResizeRequest;
use crate::signature::Verifier;
use crate::store::{BlobStore, ByteStream, StoreError, REDUCED_REDUNDANCY, STORAGE_CLASS};
use crate::transform::{CropMode, Transformer};
use crate::writeback::{WriteBack, WriteJob};
use crate::ThumbError;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use http::{HeaderMap, HeaderValue};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Content type assumed for stored objects that do not record one.
const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// A derivative, either freshly generated or found in the store.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    /// Encoded bytes; only present when generated by this request.
    pub data: Option<Bytes>,
    pub content_type: String,
    pub content_length: u64,
    /// Hex digest, unquoted. Empty when a stored object carries none.
    pub etag: String,
    pub path: String,
}

/// What the response writer is asked to send.
pub enum Outcome {
    /// Cache hit. `body` is `None` for HEAD lookups.
    Stored { thumb: Thumbnail, body: Option<ByteStream> },
    /// Cache miss answered by a fresh transform.
    Generated(Thumbnail),
    /// The source answered something other than 200.
    Upstream(reqwest::Response),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Stored { thumb, .. } => f.debug_tuple("Stored").field(thumb).finish(),
            Outcome::Generated(thumb) => f.debug_tuple("Generated").field(thumb).finish(),
            Outcome::Upstream(resp) => f.debug_tuple("Upstream").field(&resp.status()).finish(),
        }
    }
}

pub struct ResultCache {
    verifier: Verifier,
    source: SourceClient,
    transformer: Arc<dyn Transformer>,
    store: Option<Arc<dyn BlobStore>>,
    write_back: Option<WriteBack>,
    crop: CropMode,
    reduced_redundancy: bool,
    metrics: Arc<Metrics>,
}

pub struct ResultCacheBuilder {
    verifier: Verifier,
    source: SourceClient,
    transformer: Arc<dyn Transformer>,
    store: Option<Arc<dyn BlobStore>>,
    write_back_queue: usize,
    write_back_concurrency: usize,
    crop: CropMode,
    reduced_redundancy: bool,
    metrics: Arc<Metrics>,
}

impl ResultCacheBuilder {
    pub fn store(mut self, store: Option<Arc<dyn BlobStore>>) -> Self {
        self.store = store;
        self
    }

    pub fn write_back(mut self, queue: usize, concurrency: usize) -> Self {
        self.write_back_queue = queue;
        self.write_back_concurrency = concurrency;
        self
    }

    pub fn crop(mut self, crop: CropMode) -> Self {
        self.crop = crop;
        self
    }

    pub fn reduced_redundancy(mut self, on: bool) -> Self {
        self.reduced_redundancy = on;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Spawns the write-back worker when a store is configured, so this must
    /// run inside a Tokio runtime.
    pub fn build(self) -> ResultCache {
        let write_back = self.store.as_ref().map(|store| {
            WriteBack::spawn(
                store.clone(),
                self.write_back_queue,
                self.write_back_concurrency,
                self.metrics.clone(),
            )
        });
        ResultCache {
            verifier: self.verifier,
            source: self.source,
            transformer: self.transformer,
            store: self.store,
            write_back,
            crop: self.crop,
            reduced_redundancy: self.reduced_redundancy,
            metrics: self.metrics,
        }
    }
}

impl ResultCache {
    pub fn builder(verifier: Verifier, source: SourceClient, transformer: Arc<dyn Transformer>) -> ResultCacheBuilder {
        ResultCacheBuilder {
            verifier,
            source,
            transformer,
            store: None,
            write_back_queue: 256,
            write_back_concurrency: 8,
            crop: CropMode::default(),
            reduced_redundancy: false,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn store_name(&self) -> Option<&'static str> {
        self.store.as_ref().map(|s| s.name())
    }

    /// Waits for every write-back queued so far. No-op without a store.
    pub async fn flush_writes(&self) {
        if let Some(wb) = &self.write_back {
            wb.flush().await;
        }
    }

    pub async fn handle(&self, req: &ResizeRequest) -> Result<Outcome, ThumbError> {
        if let Some(hit) = self.lookup(req).await? {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Cache hit for {}", req.key);
            return Ok(hit);
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Cache miss for {}, fetching {}", req.key, req.source_url);
        self.generate(req).await
    }

    /// `Ok(None)` is a miss. Store failures of any kind count as a miss; only
    /// an entry whose length cannot be trusted is an error.
    async fn lookup(&self, req: &ResizeRequest) -> Result<Option<Outcome>, ThumbError> {
        let Some(store) = &self.store else { return Ok(None) };

        let found = if req.method.is_head() {
            store.head_metadata(&req.key).await.map(|headers| (headers, None))
        } else {
            store.get(&req.key).await.map(|obj| (obj.headers, Some(obj.body)))
        };

        let (headers, body) = match found {
            Ok(found) => found,
            Err(StoreError::NotFound) => return Ok(None),
            Err(e) => {
                tracing::warn!("Lookup of {} in {} failed, regenerating: {}", req.key, store.name(), e);
                return Ok(None);
            }
        };

        let thumb = stored_thumbnail(&headers, &req.key.to_string())?;
        Ok(Some(Outcome::Stored { thumb, body }))
    }

    async fn generate(&self, req: &ResizeRequest) -> Result<Outcome, ThumbError> {
        let raw = match self.source.fetch(&req.source_url).await? {
            Fetched::Image { body, .. } => body,
            Fetched::Passthrough(resp) => {
                self.metrics.upstream_passthroughs.fetch_add(1, Ordering::Relaxed);
                return Ok(Outcome::Upstream(resp));
            }
        };

        self.metrics.transforms.fetch_add(1, Ordering::Relaxed);
        let transformer = self.transformer.clone();
        let (size, crop) = (req.size, self.crop);
        let out = tokio::task::spawn_blocking(move || transformer.transform(&raw, size, crop))
            .await
            .map_err(|e| ThumbError::Internal(e.to_string()))??;

        let data = Bytes::from(out.data);
        let thumb = Thumbnail {
            etag: format!("{:x}", md5::compute(&data)),
            content_length: data.len() as u64,
            content_type: out.content_type,
            path: req.key.to_string(),
            data: Some(data.clone()),
        };

        if let Some(wb) = &self.write_back {
            wb.submit(WriteJob { key: req.key.clone(), data, headers: self.put_headers(&thumb.content_type) });
        }
        Ok(Outcome::Generated(thumb))
    }

    fn put_headers(&self, content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(ct) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, ct);
        }
        if self.reduced_redundancy {
            headers.insert(STORAGE_CLASS, HeaderValue::from_static(REDUCED_REDUNDANCY));
        }
        headers
    }
}

/// Translates stored object headers into a [`Thumbnail`].
///
/// A missing or non-numeric `Content-Length` is
/// [`ThumbError::CorruptCacheMetadata`]: the entry is reported, not silently
/// regenerated.
pub fn stored_thumbnail(headers: &HeaderMap, path: &str) -> Result<Thumbnail, ThumbError> {
    let header = |name: http::HeaderName| headers.get(name).and_then(|v: &HeaderValue| v.to_str().ok());

    let content_length = header(CONTENT_LENGTH)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            ThumbError::CorruptCacheMetadata(format!("bad Content-Length {:?} for {}", header(CONTENT_LENGTH), path))
        })?;

    Ok(Thumbnail {
        data: None,
        content_type: header(CONTENT_TYPE).unwrap_or(DEFAULT_CONTENT_TYPE).to_string(),
        content_length,
        etag: header(ETAG).map(|e| e.trim_matches('"').to_string()).unwrap_or_default(),
        path: path.to_string(),
    })
}
