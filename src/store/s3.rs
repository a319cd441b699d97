use crate::cache_key::CacheKey;
use crate::store::{BlobStore, StoreError, StoredObject, REDUCED_REDUNDANCY, STORAGE_CLASS};
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use http::{HeaderMap, HeaderValue};
use tokio_util::io::ReaderStream;

/// Result store on an S3 bucket.
///
/// Credentials and region come from the standard AWS environment. The
/// metadata lookup is a signed `HeadObject`, so HEAD requests never pull the
/// object body.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let conf = aws_config::load_from_env().await;
        Self { client: Client::new(&conf), bucket: bucket.into() }
    }

    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }
}

fn object_headers(content_type: Option<&str>, content_length: Option<i64>, e_tag: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let pairs = [
        (CONTENT_TYPE, content_type.map(str::to_string)),
        (CONTENT_LENGTH, content_length.map(|n| n.to_string())),
        (ETAG, e_tag.map(str::to_string)),
    ];
    for (name, value) in pairs {
        if let Some(v) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
            headers.insert(name, v);
        }
    }
    headers
}

#[async_trait::async_trait]
impl BlobStore for S3Store {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn get(&self, key: &CacheKey) -> Result<StoredObject, StoreError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_no_such_key() { StoreError::NotFound } else { StoreError::Backend(err.to_string()) }
            })?;

        let headers = object_headers(out.content_type(), out.content_length(), out.e_tag());
        let body = ReaderStream::new(out.body.into_async_read()).boxed();
        Ok(StoredObject { headers, body })
    }

    async fn head_metadata(&self, key: &CacheKey) -> Result<HeaderMap, StoreError> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| {
                let err = e.into_service_error();
                if err.is_not_found() { StoreError::NotFound } else { StoreError::Backend(err.to_string()) }
            })?;

        Ok(object_headers(out.content_type(), out.content_length(), out.e_tag()))
    }

    async fn put(&self, key: &CacheKey, data: Bytes, headers: HeaderMap) -> Result<(), StoreError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(S3Body::from(data));

        if let Some(ct) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            req = req.content_type(ct);
        }
        if headers.get(STORAGE_CLASS).is_some_and(|v| *v == REDUCED_REDUNDANCY) {
            req = req.storage_class(StorageClass::ReducedRedundancy);
        }

        req.send().await.map_err(|e| StoreError::Backend(e.into_service_error().to_string()))?;
        Ok(())
    }
}
