use crate::orchestrator::{Outcome, Thumbnail};
use crate::request::Method;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, EXPIRES};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use futures::TryStreamExt;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};

/// Caching directives attached to every derivative we serve.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub max_age: u64,
}

impl CachePolicy {
    pub fn cache_control_value(&self) -> String {
        format!("max-age={},public", self.max_age)
    }

    pub fn expires_value(&self, now: OffsetDateTime) -> String {
        let max_age = i64::try_from(self.max_age).unwrap_or(i64::MAX);
        let expires = now.checked_add(Duration::seconds(max_age)).unwrap_or(now);
        http_date(expires)
    }
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: OffsetDateTime) -> String {
    let fmt = format_description!("[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT");
    t.to_offset(UtcOffset::UTC).format(fmt).unwrap_or_default()
}

/// Turns an [`Outcome`] into the HTTP response. HEAD responses carry the
/// same headers as GET and no body.
pub fn render(outcome: Outcome, method: Method, policy: &CachePolicy) -> Response {
    match outcome {
        Outcome::Generated(thumb) => {
            let headers = thumbnail_headers(&thumb, policy);
            let body = match thumb.data {
                Some(data) if !method.is_head() => Body::from(data),
                _ => Body::empty(),
            };
            with_headers(body, headers)
        }
        Outcome::Stored { thumb, body } => {
            let headers = thumbnail_headers(&thumb, policy);
            let body = match body {
                Some(stream) if !method.is_head() => {
                    let path = thumb.path;
                    Body::from_stream(stream.inspect_err(move |e| {
                        tracing::warn!("Streaming stored result {} failed: {}", path, e);
                    }))
                }
                _ => Body::empty(),
            };
            with_headers(body, headers)
        }
        Outcome::Upstream(resp) => upstream(resp, method),
    }
}

fn thumbnail_headers(thumb: &Thumbnail, policy: &CachePolicy) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&thumb.content_type).unwrap_or(HeaderValue::from_static("image/jpeg")),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(thumb.content_length));
    if !thumb.etag.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&format!("\"{}\"", thumb.etag)) {
            headers.insert(ETAG, v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&policy.cache_control_value()) {
        headers.insert(CACHE_CONTROL, v);
    }
    if let Ok(v) = HeaderValue::from_str(&policy.expires_value(OffsetDateTime::now_utc())) {
        headers.insert(EXPIRES, v);
    }
    headers
}

fn with_headers(body: Body, headers: HeaderMap) -> Response {
    let mut resp = Response::new(body);
    *resp.headers_mut() = headers;
    resp
}

/// Relays a non-200 source response: same status, same end-to-end headers,
/// and the body for GET.
fn upstream(resp: reqwest::Response, method: Method) -> Response {
    let status = resp.status();
    let mut headers = HeaderMap::with_capacity(resp.headers().len());
    for (name, value) in resp.headers() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = if method.is_head() { Body::empty() } else { Body::from_stream(resp.bytes_stream()) };
    let mut out = with_headers(body, headers);
    *out.status_mut() = status;
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailer"
            | "transfer-encoding" | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_imf_fixdate() {
        assert_eq!(http_date(datetime!(1994-11-06 08:49:37 UTC)), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(http_date(datetime!(2024-02-29 23:00:00 -2)), "Fri, 01 Mar 2024 01:00:00 GMT");
    }

    #[test]
    fn expires_adds_max_age() {
        let policy = CachePolicy { max_age: 3600 };
        assert_eq!(policy.cache_control_value(), "max-age=3600,public");
        assert_eq!(policy.expires_value(datetime!(2020-01-01 00:00:00 UTC)), "Wed, 01 Jan 2020 01:00:00 GMT");
    }

    #[test]
    fn head_generated_has_headers_but_no_body() {
        let thumb = Thumbnail {
            data: Some(bytes::Bytes::from_static(b"abc")),
            content_type: "image/jpeg".into(),
            content_length: 3,
            etag: "900150983cd24fb0d6963f7d28e17f72".into(),
            path: "k".into(),
        };
        let resp = render(Outcome::Generated(thumb), Method::Head, &CachePolicy { max_age: 0 });
        assert_eq!(resp.headers()[CONTENT_LENGTH], "3");
        assert_eq!(resp.headers()[ETAG], "\"900150983cd24fb0d6963f7d28e17f72\"");
        assert_eq!(resp.headers()[CACHE_CONTROL], "max-age=0,public");
        assert!(resp.headers().contains_key(EXPIRES));
        use axum::body::HttpBody;
        assert_eq!(resp.body().size_hint().exact(), Some(0));
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("x-upstream")));
    }
}
