//! S3 destination: multipart staging and conditional-put promotion.
//!
//! S3 has no rename, so promotion is emulated: the completed temporary
//! object is streamed into a `PutObject` on the final key guarded by
//! `If-None-Match: *` or `If-Match: <etag>`, and the temp is deleted after.

use async_trait::async_trait;
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use blobrelay_core::store::{
    DestinationStore, PromoteCapability, PromoteStatus, TempObjectInfo, UploadHandle,
};
use blobrelay_core::types::{ObjectDescriptor, Precondition, is_temp_key};
use blobrelay_core::{StoreError, StoreErrorKind};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{kind_of, store_error};
use crate::source::{get_range, head_object};

/// Smallest part S3 accepts for any part but the last.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Highest part number S3 accepts.
const MAX_PARTS: u32 = 10_000;

/// A single destination bucket.
#[derive(Debug, Clone)]
pub struct S3Destination {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Destination {
    /// Wrap an SDK client bound to `bucket`.
    #[must_use]
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// The destination bucket.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }

    /// Every part uploaded so far, in part-number order.
    async fn uploaded_parts(&self, upload: &UploadHandle) -> Result<Vec<CompletedPart>, StoreError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(&upload.temp_key)
                .upload_id(&upload.upload_id);
            if let Some(m) = marker.take() {
                req = req.part_number_marker(m);
            }
            let output = req
                .send()
                .await
                .map_err(|e| store_error(&e, &format!("list parts of {}", self.location(&upload.temp_key))))?;

            parts.extend(output.parts().iter().map(|p| {
                CompletedPart::builder()
                    .set_part_number(p.part_number())
                    .set_e_tag(p.e_tag().map(ToOwned::to_owned))
                    .build()
            }));

            if output.is_truncated() == Some(true) {
                marker = output.next_part_number_marker().map(ToOwned::to_owned);
                if marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        parts.sort_by_key(CompletedPart::part_number);
        Ok(parts)
    }

    async fn abort(&self, key: &str, upload_id: &str) -> Result<(), StoreError> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if kind_of(&e) == StoreErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(&e, &format!("abort upload of {}", self.location(key)))),
        }
    }

    async fn list_temp_keys(&self, found: &mut Vec<TempObjectInfo>) -> Result<(), StoreError> {
        let mut token: Option<String> = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(t) = token.take() {
                req = req.continuation_token(t);
            }
            let output = req
                .send()
                .await
                .map_err(|e| store_error(&e, &format!("list s3://{}", self.bucket)))?;

            found.extend(output.contents().iter().filter_map(|obj| {
                let key = obj.key()?;
                is_temp_key(key).then(|| TempObjectInfo {
                    key: key.to_owned(),
                    last_modified: to_chrono(obj.last_modified()),
                    upload_id: None,
                })
            }));

            if output.is_truncated() == Some(true) {
                token = output.next_continuation_token().map(ToOwned::to_owned);
                if token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    async fn list_temp_uploads(&self, found: &mut Vec<TempObjectInfo>) -> Result<(), StoreError> {
        let mut key_marker: Option<String> = None;
        let mut upload_marker: Option<String> = None;
        loop {
            let output = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_marker.take())
                .send()
                .await
                .map_err(|e| store_error(&e, &format!("list uploads in s3://{}", self.bucket)))?;

            found.extend(output.uploads().iter().filter_map(|upload| {
                let key = upload.key()?;
                let upload_id = upload.upload_id()?;
                is_temp_key(key).then(|| TempObjectInfo {
                    key: key.to_owned(),
                    last_modified: to_chrono(upload.initiated()),
                    upload_id: Some(upload_id.to_owned()),
                })
            }));

            if output.is_truncated() != Some(true) {
                break;
            }
            key_marker = output.next_key_marker().map(ToOwned::to_owned);
            upload_marker = output.next_upload_id_marker().map(ToOwned::to_owned);
            if key_marker.is_none() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for S3Destination {
    async fn lookup(&self, key: &str) -> Result<Option<ObjectDescriptor>, StoreError> {
        head_object(&self.client, &self.bucket, key).await
    }

    async fn read_chunk(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        get_range(&self.client, &self.bucket, key, None, offset, len).await
    }

    async fn begin_upload(&self, temp_key: &str) -> Result<UploadHandle, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(temp_key)
            .send()
            .await
            .map_err(|e| store_error(&e, &format!("start upload of {}", self.location(temp_key))))?;
        let upload_id = output
            .upload_id()
            .ok_or_else(|| StoreError::other("CreateMultipartUpload returned no upload id"))?;
        debug!(temp_key, upload_id, "multipart upload started");
        Ok(UploadHandle {
            temp_key: temp_key.to_owned(),
            upload_id: upload_id.to_owned(),
        })
    }

    async fn upload_chunk(
        &self,
        upload: &UploadHandle,
        index: u32,
        _offset: u64,
        data: Bytes,
    ) -> Result<(), StoreError> {
        if index >= MAX_PARTS {
            return Err(StoreError::invalid_input(format!(
                "chunk {index} exceeds the {MAX_PARTS} part limit; raise CHUNK_SIZE_BYTES"
            )));
        }
        // Part numbers are one-based. Re-sending a part number replaces it.
        let part_number = i32::try_from(index + 1)
            .map_err(|_| StoreError::invalid_input(format!("part number {index} out of range")))?;
        self.client
            .upload_part()
            .bucket(&self.bucket)
            .key(&upload.temp_key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                store_error(
                    &e,
                    &format!("upload part {part_number} of {}", self.location(&upload.temp_key)),
                )
            })?;
        Ok(())
    }

    async fn complete_upload(&self, upload: &UploadHandle) -> Result<(), StoreError> {
        let parts = self.uploaded_parts(upload).await?;

        if parts.is_empty() {
            // S3 rejects a multipart upload with no parts.
            self.abort(&upload.temp_key, &upload.upload_id).await?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&upload.temp_key)
                .body(ByteStream::from_static(b""))
                .send()
                .await
                .map_err(|e| store_error(&e, &format!("put {}", self.location(&upload.temp_key))))?;
            return Ok(());
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.temp_key)
            .upload_id(&upload.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                store_error(&e, &format!("complete upload of {}", self.location(&upload.temp_key)))
            })?;
        Ok(())
    }

    fn promote_capability(&self) -> PromoteCapability {
        PromoteCapability::CopyThenDelete
    }

    async fn copy_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        let temp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(temp_key)
            .send()
            .await
            .map_err(|e| store_error(&e, &format!("get {}", self.location(temp_key))))?;

        let mut put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(final_key)
            .set_content_length(temp.content_length())
            .body(temp.body);
        put = match precondition {
            Precondition::DoesNotExist => put.if_none_match("*"),
            Precondition::MatchesVersion(version) => put.if_match(version.as_str()),
        };

        match put.send().await {
            Ok(_) => Ok(PromoteStatus::Promoted),
            Err(e) if kind_of(&e) == StoreErrorKind::PreconditionFailed => {
                debug!(final_key, %precondition, "conditional put lost");
                Ok(PromoteStatus::PreconditionFailed)
            }
            Err(e) => Err(store_error(&e, &format!("put {}", self.location(final_key)))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error(&e, &format!("delete {}", self.location(key))))?;
        Ok(())
    }

    async fn list_temp_objects(&self) -> Result<Vec<TempObjectInfo>, StoreError> {
        let mut found = Vec::new();
        self.list_temp_keys(&mut found).await?;
        self.list_temp_uploads(&mut found).await?;
        Ok(found)
    }

    async fn discard_temp(&self, info: &TempObjectInfo) -> Result<(), StoreError> {
        match &info.upload_id {
            Some(upload_id) => self.abort(&info.key, upload_id).await,
            None => self.delete(&info.key).await,
        }
    }
}

/// Convert an SDK timestamp. Missing or out-of-range values map to the epoch
/// so the object is treated as old.
fn to_chrono(ts: Option<&SmithyDateTime>) -> DateTime<Utc> {
    ts.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}
