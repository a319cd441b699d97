use std::net::SocketAddr;
use std::sync::Arc;
use thumbproxy::config::{Config, StorageConfig};
use thumbproxy::store::{BlobStore, DiskStore, SledStore};
use thumbproxy::transform::JpegTransformer;
use thumbproxy::{router, AppState};

/// Thumbproxy server entry point.
///
/// Initializes tracing, loads configuration from the environment, opens the
/// result store if one is configured, and serves signed resize requests
/// until interrupted. Pending store writes are drained before exit.
///
/// # Configuration
/// See `Config::from_env`. The essentials:
/// - `SECURITY_KEY`: HMAC secret for URL signing (required unless `UNSAFE`)
/// - `RESULT_STORAGE`: `s3://bucket`, `sled:<path>` or `disk:<path>`
/// - `MAX_AGE`: seconds advertised in cache headers
/// - `RUST_LOG`: logging verbosity (default: "thumbproxy=debug,tower_http=debug")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "thumbproxy=debug,tower_http=debug".into()),
        )
        .init();

    let cfg = Config::from_env()?;
    tracing::info!("Starting thumbproxy with {:?}", cfg);
    if cfg.unsafe_mode {
        tracing::warn!("UNSAFE mode enabled: the literal signature \"unsafe\" is accepted");
    }

    let store = open_store(cfg.storage.as_ref()).await?;
    if store.is_none() {
        tracing::info!("No result storage configured, every request is generated");
    }

    let transformer = JpegTransformer::default().with_max_dimension(cfg.max_dimension);
    let state = Arc::new(AppState::new(&cfg, store, Arc::new(transformer))?);
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    tracing::info!("Server listening on {}", cfg.listen_addr);

    // Peer addresses feed the per-IP rate limiter
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Draining pending store writes");
    state.cache.flush_writes().await;
    Ok(())
}

async fn open_store(storage: Option<&StorageConfig>) -> Result<Option<Arc<dyn BlobStore>>, Box<dyn std::error::Error>> {
    let store: Arc<dyn BlobStore> = match storage {
        None => return Ok(None),
        Some(StorageConfig::Disk { path }) => {
            tracing::info!("Result storage: directory {}", path.display());
            Arc::new(DiskStore::new(path.clone()))
        }
        Some(StorageConfig::Sled { path }) => {
            tracing::info!("Result storage: sled database {}", path.display());
            Arc::new(SledStore::open(path)?)
        }
        #[cfg(feature = "s3")]
        Some(StorageConfig::S3 { bucket }) => {
            tracing::info!("Result storage: s3 bucket {}", bucket);
            Arc::new(thumbproxy::store::S3Store::from_env(bucket.clone()).await)
        }
        #[cfg(not(feature = "s3"))]
        Some(StorageConfig::S3 { bucket }) => {
            return Err(format!("s3 bucket {bucket:?} configured but built without the `s3` feature").into());
        }
    };
    Ok(Some(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
