use crate::ThumbError;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use mime::Mime;
use reqwest::{Client, Response, StatusCode, Url};
use std::time::Duration;

/// Outcome of a source fetch.
#[derive(Debug)]
pub enum Fetched {
    /// 200 with an image content type; the body is fully buffered.
    Image { body: Bytes, content_type: String },
    /// Anything other than 200. Handed back untouched so the caller can
    /// relay status, headers and body.
    Passthrough(Response),
}

/// HTTP client for source images.
///
/// Makes exactly one attempt per fetch. Timeouts bound both connection setup
/// and the whole exchange.
#[derive(Debug, Clone)]
pub struct SourceClient {
    client: Client,
    max_size: usize,
}

impl SourceClient {
    pub fn new(connect_timeout: Duration, timeout: Duration, max_size: usize) -> Result<Self, ThumbError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .user_agent(concat!("thumbproxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ThumbError::Internal(e.to_string()))?;
        Ok(Self { client, max_size })
    }

    /// Fetches `url`, rejecting non-image payloads before buffering them.
    ///
    /// # Errors
    /// - [`ThumbError::Fetch`] when the request or body transfer fails
    /// - [`ThumbError::UnsupportedContentType`] when a 200 response does not
    ///   declare an `image/*` type
    /// - [`ThumbError::SourceTooLarge`] when the body exceeds the size cap,
    ///   whether declared up front or discovered while streaming
    pub async fn fetch(&self, url: &Url) -> Result<Fetched, ThumbError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ThumbError::Fetch(e.to_string()))?;

        if resp.status() != StatusCode::OK {
            tracing::debug!("Source {} answered {}, passing through", url, resp.status());
            return Ok(Fetched::Passthrough(resp));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_image(&content_type) {
            return Err(ThumbError::UnsupportedContentType(content_type));
        }

        if let Some(len) = resp.content_length() {
            if len > self.max_size as u64 {
                return Err(ThumbError::SourceTooLarge(self.max_size));
            }
        }

        // Content-Length may be absent or wrong, so enforce the cap while streaming
        let mut buf = BytesMut::with_capacity(8192);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream
            .next()
            .await
            .transpose()
            .map_err(|e| ThumbError::Fetch(e.to_string()))?
        {
            if buf.len() + chunk.len() > self.max_size {
                return Err(ThumbError::SourceTooLarge(self.max_size));
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(Fetched::Image { body: buf.freeze(), content_type })
    }
}

/// Sloppy parameters after a valid `image/` type are tolerated.
fn is_image(content_type: &str) -> bool {
    match content_type.parse::<Mime>() {
        Ok(m) => m.type_() == mime::IMAGE,
        Err(_) => content_type
            .trim_start()
            .get(..6)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("image/")),
    }
}

#[cfg(test)]
mod tests {
    use super::is_image;

    #[test]
    fn only_image_media_types_pass() {
        assert!(is_image("image/png"));
        assert!(is_image("image/jpeg; charset=binary"));
        assert!(!is_image("text/html"));
        assert!(!is_image("application/octet-stream"));
        assert!(!is_image(""));
    }

    #[test]
    fn malformed_image_types_fall_back_to_prefix() {
        assert!(is_image("image/png; foo"));
        assert!(is_image("image/jpeg; q="));
        assert!(!is_image("text/html; foo"));
        assert!(!is_image("imag"));
    }
}
