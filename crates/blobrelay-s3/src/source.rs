//! Read-only S3 source.

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use blobrelay_core::store::SourceStore;
use blobrelay_core::types::{ObjectDescriptor, ObjectVersion};
use blobrelay_core::{StoreError, StoreErrorKind};
use bytes::Bytes;

use crate::error::{kind_of, store_error};

/// Reads objects from any bucket the client can see. The bucket comes with
/// each request.
#[derive(Debug, Clone)]
pub struct S3Source {
    client: aws_sdk_s3::Client,
}

impl S3Source {
    /// Wrap an SDK client.
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceStore for S3Source {
    async fn describe(&self, container: &str, key: &str) -> Result<ObjectDescriptor, StoreError> {
        head_object(&self.client, container, key)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("s3://{container}/{key}")))
    }

    async fn read_chunk(
        &self,
        container: &str,
        key: &str,
        version: Option<&ObjectVersion>,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, StoreError> {
        let etag = version.map(ObjectVersion::as_str);
        get_range(&self.client, container, key, etag, offset, len).await
    }
}

/// `HeadObject`, returning `None` on 404.
pub(crate) async fn head_object(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
) -> Result<Option<ObjectDescriptor>, StoreError> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(output) => descriptor_from_head(key, output.content_length(), output.e_tag()).map(Some),
        Err(e) if kind_of(&e) == StoreErrorKind::NotFound => Ok(None),
        Err(e) => Err(store_error(&e, &format!("head s3://{bucket}/{key}"))),
    }
}

fn descriptor_from_head(
    key: &str,
    content_length: Option<i64>,
    etag: Option<&str>,
) -> Result<ObjectDescriptor, StoreError> {
    let length = content_length.ok_or_else(|| {
        StoreError::other(format!("HeadObject returned no Content-Length for {key}"))
    })?;
    let size = u64::try_from(length).map_err(|_| {
        StoreError::other(format!("HeadObject returned Content-Length {length} for {key}"))
    })?;
    let mut descriptor = ObjectDescriptor::new(key, size);
    if let Some(etag) = etag {
        descriptor = descriptor.with_version(ObjectVersion::new(etag));
    }
    Ok(descriptor)
}

/// Ranged `GetObject` of at most `len` bytes. A range past the end yields an
/// empty buffer.
///
/// With `if_match` set, a changed `ETag` fails the read with
/// [`StoreErrorKind::PreconditionFailed`], which is never retried.
pub(crate) async fn get_range(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    if_match: Option<&str>,
    offset: u64,
    len: usize,
) -> Result<Bytes, StoreError> {
    if len == 0 {
        return Ok(Bytes::new());
    }
    let last = offset + len as u64 - 1;
    let output = match client
        .get_object()
        .bucket(bucket)
        .key(key)
        .range(format!("bytes={offset}-{last}"))
        .set_if_match(if_match.map(str::to_owned))
        .send()
        .await
    {
        Ok(output) => output,
        Err(e) if e.code() == Some("InvalidRange") => return Ok(Bytes::new()),
        Err(e) if kind_of(&e) == StoreErrorKind::PreconditionFailed => {
            return Err(StoreError::precondition_failed(format!(
                "s3://{bucket}/{key} changed during transfer, ETag is no longer {}",
                if_match.unwrap_or_default()
            )));
        }
        Err(e) => return Err(store_error(&e, &format!("get s3://{bucket}/{key}"))),
    };

    let body = output.body.collect().await.map_err(|e| {
        StoreError::transient(format!("read s3://{bucket}/{key} at {offset}")).with_source(e)
    })?;
    Ok(body.into_bytes())
}
