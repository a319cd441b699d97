use axum::{
    extract::{Path, State},
    http::{Method as HttpMethod, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::trace::TraceLayer;

pub mod cache_key;
pub mod config;
pub mod fetch;
pub mod metrics;
pub mod orchestrator;
pub mod request;
pub mod response;
pub mod signature;
pub mod size;
pub mod store;
pub mod transform;
pub mod writeback;

use crate::config::{Config, RateLimit};
use crate::fetch::SourceClient;
use crate::metrics::Metrics;
use crate::orchestrator::ResultCache;
use crate::request::{Method, ResizeRequest};
use crate::response::CachePolicy;
use crate::signature::Verifier;
use crate::store::BlobStore;
use crate::transform::{TransformError, Transformer};

#[derive(Error, Debug)]
pub enum ThumbError {
    #[error("invalid source URL")]
    InvalidSourceUrl,
    #[error("invalid signature")]
    SignatureMismatch,
    #[error("invalid size requested: {0:?}")]
    InvalidSize(String),
    #[error("invalid content type {0:?}")]
    UnsupportedContentType(String),
    #[error("invalid source image: {0}")]
    UndecodableImage(String),
    #[error("{0}")]
    TransformFailure(String),
    #[error("corrupt stored result: {0}")]
    CorruptCacheMetadata(String),
    #[error("source image exceeds {0} bytes")]
    SourceTooLarge(usize),
    #[error("fetching source: {0}")]
    Fetch(String),
    #[error("internal server error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ThumbError>;

impl ThumbError {
    pub fn status(&self) -> StatusCode {
        match self {
            ThumbError::InvalidSourceUrl
            | ThumbError::InvalidSize(_)
            | ThumbError::UndecodableImage(_)
            | ThumbError::SourceTooLarge(_) => StatusCode::BAD_REQUEST,
            ThumbError::SignatureMismatch => StatusCode::UNAUTHORIZED,
            ThumbError::UnsupportedContentType(_)
            | ThumbError::TransformFailure(_)
            | ThumbError::CorruptCacheMetadata(_)
            | ThumbError::Fetch(_)
            | ThumbError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<TransformError> for ThumbError {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::Undecodable(msg) => ThumbError::UndecodableImage(msg),
            failed @ TransformError::Failed(_) => ThumbError::TransformFailure(failed.to_string()),
            too_large @ TransformError::TooLarge { .. } => ThumbError::InvalidSize(too_large.to_string()),
        }
    }
}

impl IntoResponse for ThumbError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Shared, immutable per-process state behind every route.
pub struct AppState {
    pub cache: ResultCache,
    pub policy: CachePolicy,
    pub rate_limit: Option<RateLimit>,
    /// Largest requested width or height accepted before any work is done.
    pub max_dimension: u32,
}

impl AppState {
    /// Wires the orchestrator from configuration. `store` is the already
    /// opened result store, if any. Must be called inside a Tokio runtime.
    pub fn new(
        config: &Config,
        store: Option<Arc<dyn BlobStore>>,
        transformer: Arc<dyn Transformer>,
    ) -> Result<Self> {
        let source = SourceClient::new(config.connect_timeout, config.fetch_timeout, config.max_source_size)?;
        let verifier = Verifier::new(config.secret.as_bytes(), config.unsafe_mode);
        let cache = ResultCache::builder(verifier, source, transformer)
            .store(store)
            .write_back(config.write_back_queue, config.write_back_concurrency)
            .crop(config.crop)
            .reduced_redundancy(config.reduced_redundancy)
            .metrics(Arc::new(Metrics::default()))
            .build();

        Ok(Self {
            cache,
            policy: CachePolicy { max_age: config.max_age },
            rate_limit: config.rate_limit,
            max_dimension: config.max_dimension,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        self.cache.metrics()
    }
}

async fn resize_handler(
    State(state): State<Arc<AppState>>,
    method: HttpMethod,
    Path((signature, size, source)): Path<(String, String, String)>,
) -> Response {
    let method = if method == HttpMethod::HEAD { Method::Head } else { Method::Get };

    let parsed = ResizeRequest::parse(method, &signature, &size, &source, state.cache.verifier(), state.max_dimension);
    let outcome = match parsed {
        Ok(req) => state.cache.handle(&req).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(outcome) => response::render(outcome, method, &state.policy),
        Err(e) => {
            state.metrics().errors.fetch_add(1, Ordering::Relaxed);
            if e.status().is_server_error() {
                tracing::error!("Failed /{}/{}: {}", size, source, e);
            } else {
                tracing::warn!("Rejected /{}/{}: {}", size, source, e);
            }
            e.into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use serde_json::json;

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "thumbproxy",
        "storage": state.cache.store_name(),
    }))
}

/// Metrics endpoint (Prometheus-compatible plain text)
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics().render(),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    // Observability endpoints - NO rate limiting
    let observability_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone());

    // HEAD is registered explicitly; the handler passes the method on so the
    // orchestrator can pick the metadata-only lookup
    let mut resize_routes = Router::new()
        .route("/:signature/:size/*source", get(resize_handler).head(resize_handler))
        .with_state(state.clone());

    match state.rate_limit {
        Some(RateLimit { per_second, burst }) => {
            let governor_conf = GovernorConfigBuilder::default()
                .per_second(per_second)
                .burst_size(burst)
                .finish();
            if let Some(conf) = governor_conf {
                tracing::info!("Router configured with rate limiting: {}/sec, burst {}", per_second, burst);
                resize_routes = resize_routes.layer(GovernorLayer {
                    config: Box::leak(Box::new(conf)),
                });
            }
        }
        None => tracing::info!("Rate limiting disabled"),
    }

    Router::new()
        .merge(observability_routes)
        .merge(resize_routes)
        .layer(TraceLayer::new_for_http())
}
