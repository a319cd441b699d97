use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use http::HeaderMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thumbproxy::cache_key::CacheKey;
use thumbproxy::config::Config;
use thumbproxy::signature::signed_path;
use thumbproxy::size::Size;
use thumbproxy::store::{BlobStore, DiskStore, SledStore, StoreError, StoredObject};
use thumbproxy::transform::{CropMode, JpegTransformer, TransformError, Transformed, Transformer};
use thumbproxy::{router, AppState};
use tokio::sync::Semaphore;
use tower::util::ServiceExt; // for `oneshot`

const SECRET: &str = "secret";

/// Transformer double that counts how often generation actually runs.
struct CountingTransformer {
    inner: JpegTransformer,
    calls: AtomicUsize,
}

impl CountingTransformer {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transformer for CountingTransformer {
    fn transform(&self, raw: &[u8], size: Size, crop: CropMode) -> Result<Transformed, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.transform(raw, size, crop)
    }
}

fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(w, h, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }));
    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png).unwrap();
    png
}

/// Local origin standing in for the source image host.
async fn spawn_origin() -> SocketAddr {
    let png = Bytes::from(png_bytes(200, 150));
    let sloppy = png.clone();
    let app = Router::new()
        .route(
            "/cat.png",
            get(move || {
                let png = png.clone();
                async move { ([(header::CONTENT_TYPE, "image/png")], png) }
            }),
        )
        .route(
            "/missing.png",
            get(|| async { (StatusCode::NOT_FOUND, [("x-upstream", "origin")], "no such cat").into_response() }),
        )
        .route(
            "/page.html",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html><body>hi</body></html>") }),
        )
        .route(
            "/sloppy.png",
            get(move || {
                let png = sloppy.clone();
                async move { ([(header::CONTENT_TYPE, "image/png; foo")], png) }
            }),
        )
        .route(
            "/lies.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], "definitely not a png") }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Helper to create test config
fn test_config() -> Config {
    Config {
        secret: SECRET.to_string(),
        max_age: 60,
        ..Config::default()
    }
}

struct Harness {
    app: Router,
    state: Arc<AppState>,
    transformer: Arc<CountingTransformer>,
    origin: SocketAddr,
}

impl Harness {
    async fn new(store: Option<Arc<dyn BlobStore>>) -> Self {
        Self::with_config(test_config(), store).await
    }

    async fn with_config(config: Config, store: Option<Arc<dyn BlobStore>>) -> Self {
        let origin = spawn_origin().await;
        let transformer = Arc::new(CountingTransformer {
            inner: JpegTransformer::default().with_max_dimension(config.max_dimension),
            calls: AtomicUsize::new(0),
        });
        let state = Arc::new(AppState::new(&config, store, transformer.clone()).unwrap());
        Self { app: router(state.clone()), state, transformer, origin }
    }

    fn source(&self, file: &str) -> String {
        format!("http://{}/{}", self.origin, file)
    }

    fn path(&self, size: &str, file: &str) -> String {
        signed_path(SECRET.as_bytes(), &format!("{}/{}", size, self.source(file))).unwrap()
    }

    async fn send(&self, method: &str, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        let resp = self
            .app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        self.send("GET", uri).await
    }

    async fn head(&self, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        self.send("HEAD", uri).await
    }
}

fn sled() -> Option<Arc<dyn BlobStore>> {
    Some(Arc::new(SledStore::temporary().unwrap()))
}

fn percent_encode_all(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b':' => "%3A".to_string(),
            b'/' => "%2F".to_string(),
            b'?' => "%3F".to_string(),
            b => (b as char).to_string(),
        })
        .collect()
}

fn assert_cache_headers(headers: &HeaderMap) {
    assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
    assert_eq!(headers[header::CACHE_CONTROL], "max-age=60,public");
    assert!(headers[header::EXPIRES].to_str().unwrap().ends_with(" GMT"));
    let etag = headers[header::ETAG].to_str().unwrap();
    assert!(etag.starts_with('"') && etag.ends_with('"') && etag.len() == 34, "etag {etag}");
}

#[tokio::test]
async fn cold_get_generates_and_warm_get_is_served_from_store() {
    let h = Harness::new(sled()).await;
    let path = h.path("100x100", "cat.png");

    let (status, cold, body) = h.get(&path).await;
    assert_eq!(status, StatusCode::OK);
    assert_cache_headers(&cold);
    assert_eq!(cold[header::CONTENT_LENGTH], body.len().to_string());
    let img = image::load_from_memory(&body).unwrap();
    assert_eq!((img.width(), img.height()), (100, 100));
    assert_eq!(h.transformer.calls(), 1);

    h.state.cache.flush_writes().await;

    let (status, warm, warm_body) = h.get(&path).await;
    assert_eq!(status, StatusCode::OK);
    assert_cache_headers(&warm);
    assert_eq!(warm[header::ETAG], cold[header::ETAG]);
    assert_eq!(warm[header::CONTENT_LENGTH], cold[header::CONTENT_LENGTH]);
    assert_eq!(warm_body, body);
    assert_eq!(h.transformer.calls(), 1, "warm request must not transform again");

    let m = h.state.metrics();
    assert_eq!(m.cache_misses.load(Ordering::Relaxed), 1);
    assert_eq!(m.cache_hits.load(Ordering::Relaxed), 1);
    assert_eq!(m.store_writes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn percent_encoded_source_shares_the_signed_path_and_key() {
    let h = Harness::new(sled()).await;
    let source = h.source("cat.png");
    let message = format!("100x100/{}", source);
    let sig = thumbproxy::signature::sign(SECRET.as_bytes(), &message).unwrap();
    let encoded = format!("/{}/100x100/{}", sig, percent_encode_all(&source));

    let (status, cold, _) = h.get(&encoded).await;
    assert_eq!(status, StatusCode::OK);
    h.state.cache.flush_writes().await;

    // the unencoded spelling resolves to the same stored derivative
    let (status, warm, _) = h.get(&h.path("100x100", "cat.png")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(warm[header::ETAG], cold[header::ETAG]);
    assert_eq!(h.transformer.calls(), 1);
}

#[tokio::test]
async fn head_returns_get_headers_without_body_on_miss_and_hit() {
    let h = Harness::new(sled()).await;
    let path = h.path("64x48", "cat.png");

    let (status, miss, body) = h.head(&path).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_cache_headers(&miss);
    assert_eq!(h.transformer.calls(), 1);

    h.state.cache.flush_writes().await;

    let (status, hit, body) = h.head(&path).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(hit[header::ETAG], miss[header::ETAG]);
    assert_eq!(hit[header::CONTENT_LENGTH], miss[header::CONTENT_LENGTH]);

    let (status, get, body) = h.get(&path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(get[header::ETAG], miss[header::ETAG]);
    assert_eq!(get[header::CONTENT_LENGTH], miss[header::CONTENT_LENGTH]);
    assert_eq!(get[header::CONTENT_LENGTH], body.len().to_string());
    assert_eq!(h.transformer.calls(), 1);
}

#[tokio::test]
async fn head_without_store_still_reports_length() {
    let h = Harness::new(None).await;
    let path = h.path("20x20", "cat.png");

    let (_, head, head_body) = h.head(&path).await;
    let (_, get, get_body) = h.get(&path).await;
    assert!(head_body.is_empty());
    assert_eq!(head[header::CONTENT_LENGTH], get_body.len().to_string());
    assert_eq!(head[header::ETAG], get[header::ETAG]);
}

#[tokio::test]
async fn generation_is_deterministic_without_a_store() {
    let h = Harness::new(None).await;
    let path = h.path("50x0", "cat.png");

    let (_, first, a) = h.get(&path).await;
    let (_, second, b) = h.get(&path).await;
    assert_eq!(a, b);
    assert_eq!(first[header::ETAG], second[header::ETAG]);
    assert_eq!(h.transformer.calls(), 2);

    // 50x0 keeps the 4:3 source aspect
    let img = image::load_from_memory(&a).unwrap();
    assert_eq!((img.width(), img.height()), (50, 38));
}

#[tokio::test]
async fn upstream_errors_are_passed_through() {
    let h = Harness::new(sled()).await;

    let (status, headers, body) = h.get(&h.path("10x10", "missing.png")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers["x-upstream"], "origin");
    assert_eq!(&body[..], b"no such cat");
    assert!(!headers.contains_key(header::CACHE_CONTROL));
    assert_eq!(h.transformer.calls(), 0);

    let (status, headers, body) = h.head(&h.path("10x10", "missing.png")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers["x-upstream"], "origin");
    assert!(body.is_empty());

    h.state.cache.flush_writes().await;
    assert_eq!(h.state.metrics().store_writes.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn non_image_content_type_is_rejected_before_decode() {
    let h = Harness::new(None).await;
    let (status, _, body) = h.get(&h.path("10x10", "page.html")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(String::from_utf8_lossy(&body).contains("text/html"));
    assert_eq!(h.transformer.calls(), 0);
}

#[tokio::test]
async fn undecodable_source_is_a_client_error() {
    let h = Harness::new(None).await;
    let (status, _, _) = h.get(&h.path("10x10", "lies.png")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.transformer.calls(), 1);
}

#[tokio::test]
async fn unreachable_source_is_a_server_error() {
    let h = Harness::new(None).await;
    // port 9 (discard) on loopback is closed in test environments
    let path = signed_path(SECRET.as_bytes(), "10x10/http://127.0.0.1:9/cat.png").unwrap();
    let (status, _, _) = h.get(&path).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn oversized_source_is_rejected() {
    let config = Config { max_source_size: 64, ..test_config() };
    let h = Harness::with_config(config, None).await;
    let (status, _, _) = h.get(&h.path("10x10", "cat.png")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.transformer.calls(), 0);
}

#[tokio::test]
async fn bad_signatures_are_unauthorized() {
    let h = Harness::new(None).await;
    let good = h.path("10x10", "cat.png");

    let tampered = good.replacen("10x10", "10x11", 1);
    let (status, _, body) = h.get(&tampered).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(&body[..], b"invalid signature");

    let (status, _, _) = h.get(&format!("/unsafe/10x10/{}", h.source("cat.png"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.transformer.calls(), 0);
}

#[tokio::test]
async fn unsafe_mode_accepts_the_sentinel() {
    let config = Config { secret: String::new(), unsafe_mode: true, ..test_config() };
    let h = Harness::with_config(config, None).await;
    let (status, headers, _) = h.get(&format!("/unsafe/10x10/{}", h.source("cat.png"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
}

#[tokio::test]
async fn malformed_size_and_source_are_bad_requests() {
    let h = Harness::new(None).await;

    let bad_size = signed_path(SECRET.as_bytes(), &format!("100/{}", h.source("cat.png"))).unwrap();
    let (status, _, _) = h.get(&bad_size).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let bad_source = signed_path(SECRET.as_bytes(), "10x10/ftp://example.com/cat.png").unwrap();
    let (status, _, body) = h.get(&bad_source).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(&body[..], b"invalid source URL");
}

#[tokio::test]
async fn other_methods_are_not_routed() {
    let h = Harness::new(None).await;
    let (status, _, _) = h.send("POST", &h.path("10x10", "cat.png")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

/// Store double whose objects all carry a broken Content-Length.
struct CorruptStore;

#[async_trait::async_trait]
impl BlobStore for CorruptStore {
    fn name(&self) -> &'static str {
        "corrupt"
    }

    async fn get(&self, _: &CacheKey) -> Result<StoredObject, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, "twelve".parse().unwrap());
        let body = futures::stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"junk")) });
        Ok(StoredObject { headers, body: Box::pin(body) })
    }

    async fn head_metadata(&self, _: &CacheKey) -> Result<HeaderMap, StoreError> {
        Err(StoreError::Backend("connection reset".into()))
    }

    async fn put(&self, _: &CacheKey, _: Bytes, _: HeaderMap) -> Result<(), StoreError> {
        Err(StoreError::Backend("read-only".into()))
    }
}

#[tokio::test]
async fn corrupt_stored_length_is_a_server_error_not_a_regeneration() {
    let h = Harness::new(Some(Arc::new(CorruptStore))).await;
    let (status, _, _) = h.get(&h.path("10x10", "cat.png")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(h.transformer.calls(), 0);
}

#[tokio::test]
async fn unreachable_store_degrades_to_generation() {
    let h = Harness::new(Some(Arc::new(CorruptStore))).await;
    // HEAD lookups fail with a transport error and fall back to a fresh derivative
    let (status, headers, _) = h.head(&h.path("10x10", "cat.png")).await;
    assert_eq!(status, StatusCode::OK);
    assert_cache_headers(&headers);
    assert_eq!(h.transformer.calls(), 1);

    h.state.cache.flush_writes().await;
    assert_eq!(h.state.metrics().store_write_failures.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn disk_store_serves_repeat_requests() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(Some(Arc::new(DiskStore::new(dir.path())))).await;
    let path = h.path("30x30", "cat.png");

    let (_, cold, cold_body) = h.get(&path).await;
    h.state.cache.flush_writes().await;
    let (_, warm, warm_body) = h.get(&path).await;

    assert_eq!(warm[header::ETAG], cold[header::ETAG]);
    assert_eq!(warm_body, cold_body);
    assert_eq!(h.transformer.calls(), 1);
}

#[tokio::test]
async fn reduced_redundancy_hint_reaches_the_store() {
    let store = Arc::new(SledStore::temporary().unwrap());
    let config = Config { reduced_redundancy: true, ..test_config() };
    let h = Harness::with_config(config, Some(store.clone())).await;

    let (status, _, _) = h.get(&h.path("10x10", "cat.png")).await;
    assert_eq!(status, StatusCode::OK);
    h.state.cache.flush_writes().await;

    let source = reqwest::Url::parse(&h.source("cat.png")).unwrap();
    let key = CacheKey::for_resize(Size { width: 10, height: 10 }, &source);
    let meta = store.head_metadata(&key).await.unwrap();
    assert_eq!(meta[thumbproxy::store::STORAGE_CLASS], "REDUCED_REDUNDANCY");
    assert_eq!(meta[header::CONTENT_TYPE], "image/jpeg");
}

#[tokio::test]
async fn health_and_metrics_endpoints() {
    let h = Harness::new(sled()).await;
    let _ = h.get(&h.path("10x10", "cat.png")).await;

    let (status, _, body) = h.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["storage"], "sled");

    let (status, _, body) = h.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("thumbproxy_cache_misses_total 1\n"));
    assert!(text.contains("thumbproxy_transforms_total 1\n"));
}

#[tokio::test]
async fn query_dot_segments_cannot_redirect_the_store_key() {
    let h = Harness::new(sled()).await;
    let cat = h.source("cat.png");

    // a validly signed request whose query looks like a path to another entry
    let source = format!("{}?/../../../../99x99/{}", cat, cat);
    let message = format!("10x10/{}", source);
    let sig = thumbproxy::signature::sign(SECRET.as_bytes(), &message).unwrap();
    let (status, _, _) = h.get(&format!("/{}/10x10/{}", sig, percent_encode_all(&source))).await;
    assert_eq!(status, StatusCode::OK);
    h.state.cache.flush_writes().await;

    let (status, _, body) = h.get(&h.path("99x99", "cat.png")).await;
    assert_eq!(status, StatusCode::OK);
    let img = image::load_from_memory(&body).unwrap();
    assert_eq!((img.width(), img.height()), (99, 99));
    assert_eq!(h.transformer.calls(), 2);
}

#[tokio::test]
async fn sloppy_image_content_type_is_accepted() {
    let h = Harness::new(None).await;
    let (status, headers, _) = h.get(&h.path("10x10", "sloppy.png")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
}

#[tokio::test]
async fn oversized_output_is_a_bad_request() {
    let h = Harness::new(None).await;
    let (status, _, _) = h.get(&h.path("65535x65535", "cat.png")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(h.transformer.calls(), 0);

    let config = Config { max_dimension: 100, ..test_config() };
    let h = Harness::with_config(config, None).await;
    // 0x90 derives a 120px width from the 4:3 source
    let (status, _, _) = h.get(&h.path("0x90", "cat.png")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = h.get(&h.path("100x75", "cat.png")).await;
    assert_eq!(status, StatusCode::OK);
}

/// Sled-backed store whose writes wait until the test opens the gate.
struct GatedStore {
    inner: SledStore,
    gate: Semaphore,
    puts_started: AtomicUsize,
}

impl GatedStore {
    fn new() -> Self {
        Self { inner: SledStore::temporary().unwrap(), gate: Semaphore::new(0), puts_started: AtomicUsize::new(0) }
    }

    fn open(&self) {
        self.gate.add_permits(1024);
    }

    fn puts_started(&self) -> usize {
        self.puts_started.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BlobStore for GatedStore {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn get(&self, key: &CacheKey) -> Result<StoredObject, StoreError> {
        self.inner.get(key).await
    }

    async fn head_metadata(&self, key: &CacheKey) -> Result<HeaderMap, StoreError> {
        self.inner.head_metadata(key).await
    }

    async fn put(&self, key: &CacheKey, data: Bytes, headers: HeaderMap) -> Result<(), StoreError> {
        self.puts_started.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.map_err(|e| StoreError::Backend(e.to_string()))?;
        self.inner.put(key, data, headers).await
    }
}

#[tokio::test]
async fn response_does_not_wait_for_the_store_write() {
    let store = Arc::new(GatedStore::new());
    let h = Harness::new(Some(store.clone())).await;
    let path = h.path("40x40", "cat.png");

    let (status, _, body) = tokio::time::timeout(Duration::from_secs(10), h.get(&path))
        .await
        .expect("GET blocked on the store write");
    assert_eq!(status, StatusCode::OK);
    assert!(!body.is_empty());

    tokio::time::timeout(Duration::from_secs(10), async {
        while store.puts_started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("write-back never started");
    assert_eq!(h.state.metrics().store_writes.load(Ordering::Relaxed), 0);

    store.open();
    h.state.cache.flush_writes().await;
    assert_eq!(h.state.metrics().store_writes.load(Ordering::Relaxed), 1);

    let (status, _, warm) = h.get(&path).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(warm, body);
    assert_eq!(h.transformer.calls(), 1);
}

#[tokio::test]
async fn concurrent_identical_misses_each_generate_and_write() {
    let store = Arc::new(GatedStore::new());
    let h = Harness::new(Some(store.clone())).await;
    let path = h.path("25x25", "cat.png");

    let ((a, _, body_a), (b, _, body_b)) = tokio::join!(h.get(&path), h.get(&path));
    assert_eq!((a, b), (StatusCode::OK, StatusCode::OK));
    assert_eq!(body_a, body_b);
    assert_eq!(h.transformer.calls(), 2);

    store.open();
    h.state.cache.flush_writes().await;
    let m = h.state.metrics();
    assert_eq!(m.cache_misses.load(Ordering::Relaxed), 2);
    assert_eq!(m.store_writes.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn full_write_back_queue_drops_jobs_without_failing_requests() {
    let store = Arc::new(GatedStore::new());
    let config = Config { write_back_queue: 1, write_back_concurrency: 1, ..test_config() };
    let h = Harness::with_config(config, Some(store.clone())).await;

    for size in ["11x11", "12x12", "13x13", "14x14", "15x15"] {
        let (status, _, _) = h.get(&h.path(size, "cat.png")).await;
        assert_eq!(status, StatusCode::OK, "{size}");
    }

    let m = h.state.metrics();
    let dropped = m.write_backs_dropped.load(Ordering::Relaxed);
    assert!(dropped >= 1, "expected dropped write-backs, got {dropped}");

    store.open();
    h.state.cache.flush_writes().await;
    assert_eq!(m.store_writes.load(Ordering::Relaxed) + dropped, 5);
}
