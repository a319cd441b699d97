use crate::cache_key::CacheKey;
use crate::signature::Verifier;
use crate::size::Size;
use crate::ThumbError;
use reqwest::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    pub fn is_head(self) -> bool {
        self == Method::Head
    }
}

/// A verified, parsed resize request. Read-only once built.
#[derive(Debug, Clone)]
pub struct ResizeRequest {
    pub signature: String,
    pub size_token: String,
    pub size: Size,
    pub source_url: Url,
    /// `<WxH>/<source>`, the exact bytes covered by the signature.
    pub message: String,
    /// Result store key, built from `size` and `source_url`.
    pub key: CacheKey,
    pub method: Method,
}

impl ResizeRequest {
    /// Builds a request from the percent-decoded path segments
    /// `/<signature>/<size>/<source>`.
    ///
    /// Checks run in order: signature, size, source URL. Nothing about the
    /// request is inspected further until the signature has been accepted.
    /// Either dimension above `max_dimension` is an invalid size.
    pub fn parse(
        method: Method,
        signature: &str,
        size_token: &str,
        source: &str,
        verifier: &Verifier,
        max_dimension: u32,
    ) -> Result<Self, ThumbError> {
        let source = source.trim_start_matches('/');
        let message = format!("{}/{}", size_token, source);
        verifier
            .verify(signature, &message)
            .map_err(|_| ThumbError::SignatureMismatch)?;

        let size = Size::parse(size_token).map_err(|e| ThumbError::InvalidSize(e.0))?;
        if size.width > max_dimension || size.height > max_dimension {
            return Err(ThumbError::InvalidSize(format!("{} exceeds {}px", size_token, max_dimension)));
        }
        let source_url = parse_source_url(source)?;
        let key = CacheKey::for_resize(size, &source_url);

        Ok(Self {
            signature: signature.to_string(),
            size_token: size_token.to_string(),
            size,
            source_url,
            key,
            message,
            method,
        })
    }
}

fn parse_source_url(source: &str) -> Result<Url, ThumbError> {
    let url = Url::parse(source).map_err(|_| ThumbError::InvalidSourceUrl)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ThumbError::InvalidSourceUrl),
    }
}
