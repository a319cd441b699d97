use crate::transform::{CropMode, DEFAULT_MAX_DIMENSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8888";
pub const DEFAULT_MAX_SOURCE_SIZE: usize = 32 * 1024 * 1024;

/// Where derivatives are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// `s3://<bucket>`
    S3 { bucket: String },
    /// `sled:<path>`
    Sled { path: PathBuf },
    /// `disk:<path>`
    Disk { path: PathBuf },
}

impl FromStr for StorageConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidStorage(s.to_string());
        if let Some(bucket) = s.strip_prefix("s3://") {
            let bucket = bucket.trim_end_matches('/');
            if bucket.is_empty() || bucket.contains('/') { return Err(invalid()); }
            return Ok(StorageConfig::S3 { bucket: bucket.to_string() });
        }
        match s.split_once(':') {
            Some(("sled", path)) if !path.is_empty() => Ok(StorageConfig::Sled { path: path.into() }),
            Some(("disk", path)) if !path.is_empty() => Ok(StorageConfig::Disk { path: path.into() }),
            _ => Err(invalid()),
        }
    }
}

/// Per-client-IP limit on the resize route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub per_second: u64,
    pub burst: u32,
}

#[derive(Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub secret: String,
    /// Accept the literal `unsafe` signature. Development only.
    pub unsafe_mode: bool,
    /// `None` disables result storage entirely.
    pub storage: Option<StorageConfig>,
    /// Seconds advertised in `Cache-Control` and used to compute `Expires`.
    pub max_age: u64,
    pub reduced_redundancy: bool,
    pub crop: CropMode,
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_source_size: usize, // bytes
    /// Largest width or height a derivative may have, requested or derived.
    pub max_dimension: u32,
    pub write_back_queue: usize,
    pub write_back_concurrency: usize,
    pub rate_limit: Option<RateLimit>,
}

// Hand-written so the secret never ends up in logs
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("unsafe_mode", &self.unsafe_mode)
            .field("storage", &self.storage)
            .field("max_age", &self.max_age)
            .field("reduced_redundancy", &self.reduced_redundancy)
            .field("crop", &self.crop)
            .field("connect_timeout", &self.connect_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("max_source_size", &self.max_source_size)
            .field("max_dimension", &self.max_dimension)
            .field("write_back_queue", &self.write_back_queue)
            .field("write_back_concurrency", &self.write_back_concurrency)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8888)),
            secret: String::new(),
            unsafe_mode: false,
            storage: None,
            max_age: 0,
            reduced_redundancy: false,
            crop: CropMode::Center,
            connect_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
            max_source_size: DEFAULT_MAX_SOURCE_SIZE,
            max_dimension: DEFAULT_MAX_DIMENSION,
            write_back_queue: 256,
            write_back_concurrency: 8,
            rate_limit: None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SECURITY_KEY is required unless UNSAFE is enabled")] MissingSecret,
    #[error("invalid value for {name}: {value:?}")] Invalid { name: &'static str, value: String },
    #[error("invalid RESULT_STORAGE {0:?}, expected s3://<bucket>, sled:<path> or disk:<path>")] InvalidStorage(String),
    #[error("{0} must be > 0")] Zero(&'static str),
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any variable source, then validates it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut cfg = Config::default();

        if let Some(addr) = get("LISTEN_ADDR") {
            cfg.listen_addr = parse_var("LISTEN_ADDR", &addr)?;
        } else if let Some(port) = get("PORT") {
            let port: u16 = parse_var("PORT", &port)?;
            cfg.listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
        }

        cfg.secret = lookup("SECURITY_KEY").unwrap_or_default();
        cfg.unsafe_mode = get("UNSAFE").is_some_and(|v| is_truthy(&v));
        cfg.reduced_redundancy = get("USE_RRS").is_some_and(|v| is_truthy(&v));

        cfg.storage = match (get("RESULT_STORAGE"), get("RESULT_STORAGE_BUCKET")) {
            (Some(spec), _) => Some(spec.parse()?),
            (None, Some(bucket)) => Some(StorageConfig::S3 { bucket }),
            (None, None) => None,
        };

        if let Some(v) = get("MAX_AGE") { cfg.max_age = parse_var("MAX_AGE", &v)?; }
        if let Some(v) = get("CROP_MODE") { cfg.crop = parse_var("CROP_MODE", &v)?; }
        if let Some(v) = get("FETCH_CONNECT_TIMEOUT_SECS") {
            cfg.connect_timeout = Duration::from_secs(parse_var("FETCH_CONNECT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("FETCH_TIMEOUT_SECS") {
            cfg.fetch_timeout = Duration::from_secs(parse_var("FETCH_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("MAX_SOURCE_BYTES") { cfg.max_source_size = parse_var("MAX_SOURCE_BYTES", &v)?; }
        if let Some(v) = get("MAX_OUTPUT_DIMENSION") {
            cfg.max_dimension = parse_var("MAX_OUTPUT_DIMENSION", &v)?;
        }
        if let Some(v) = get("WRITE_BACK_QUEUE") { cfg.write_back_queue = parse_var("WRITE_BACK_QUEUE", &v)?; }
        if let Some(v) = get("WRITE_BACK_CONCURRENCY") {
            cfg.write_back_concurrency = parse_var("WRITE_BACK_CONCURRENCY", &v)?;
        }

        if let Some(v) = get("RATE_LIMIT_PER_SECOND") {
            let per_second = parse_var("RATE_LIMIT_PER_SECOND", &v)?;
            let burst = match get("RATE_LIMIT_BURST") {
                Some(b) => parse_var("RATE_LIMIT_BURST", &b)?,
                None => 30,
            };
            cfg.rate_limit = Some(RateLimit { per_second, burst });
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.trim().is_empty() && !self.unsafe_mode { return Err(ConfigError::MissingSecret); }
        if self.max_source_size == 0 { return Err(ConfigError::Zero("MAX_SOURCE_BYTES")); }
        if self.max_dimension == 0 { return Err(ConfigError::Zero("MAX_OUTPUT_DIMENSION")); }
        if self.write_back_queue == 0 { return Err(ConfigError::Zero("WRITE_BACK_QUEUE")); }
        if self.write_back_concurrency == 0 { return Err(ConfigError::Zero("WRITE_BACK_CONCURRENCY")); }
        if let Some(rl) = self.rate_limit {
            if rl.per_second == 0 { return Err(ConfigError::Zero("RATE_LIMIT_PER_SECOND")); }
            if rl.burst == 0 { return Err(ConfigError::Zero("RATE_LIMIT_BURST")); }
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid { name, value: value.to_string() })
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true")
}
