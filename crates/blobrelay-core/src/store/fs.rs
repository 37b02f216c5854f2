//! Local filesystem store.
//!
//! As a source, `container/key` resolves to `root/container/key`. As a
//! destination, keys resolve directly under `root`. Temporary objects are
//! ordinary files next to their final path, so a promote is a same-directory
//! link or rename.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{
    DestinationStore, PromoteCapability, PromoteStatus, SourceStore, TempObjectInfo, UploadHandle,
};
use crate::types::{ObjectDescriptor, ObjectVersion, Precondition, TEMP_INFIX, is_temp_key};

/// Directory-tree store.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        debug!(root = %root.display(), "creating FsStore");
        Self { root }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn destination_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(relative_path(key)?))
    }

    fn source_path(&self, container: &str, key: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join(relative_path(container)?)
            .join(relative_path(key)?))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Make `staged` visible at `final_path` if `precondition` holds.
    ///
    /// `DoesNotExist` uses a hard link, which the kernel refuses if the target
    /// exists. `MatchesVersion` compares the token and renames; the window
    /// between check and rename is only safe against writers going through
    /// this store.
    async fn install(
        staged: &Path,
        final_path: &Path,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        Self::ensure_parent(final_path).await?;
        match precondition {
            Precondition::DoesNotExist => match fs::hard_link(staged, final_path).await {
                Ok(()) => {
                    if let Err(e) = fs::remove_file(staged).await {
                        warn!(
                            staged = %staged.display(),
                            error = %e,
                            "promoted but could not remove staged file, leaving it for the orphan sweep"
                        );
                    }
                    Ok(PromoteStatus::Promoted)
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Ok(PromoteStatus::PreconditionFailed)
                }
                Err(e) => Err(e.into()),
            },
            Precondition::MatchesVersion(expected) => {
                let current = match fs::metadata(final_path).await {
                    Ok(meta) => version_of(&meta),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(PromoteStatus::PreconditionFailed);
                    }
                    Err(e) => return Err(e.into()),
                };
                if &current != expected {
                    return Ok(PromoteStatus::PreconditionFailed);
                }
                fs::rename(staged, final_path).await?;
                Ok(PromoteStatus::Promoted)
            }
        }
    }

    fn relative_key(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

/// Turn a `/`-separated key into a relative path, refusing anything that
/// could escape the root.
fn relative_path(key: &str) -> Result<PathBuf, StoreError> {
    if key.is_empty() || key.starts_with('/') {
        return Err(StoreError::invalid_input(format!("unusable path key {key:?}")));
    }
    let path = PathBuf::from(key);
    for component in path.components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(StoreError::invalid_input(format!("unusable path key {key:?}")));
        }
    }
    if key.split('/').any(str::is_empty) {
        return Err(StoreError::invalid_input(format!("empty path segment in {key:?}")));
    }
    Ok(path)
}

fn version_of(meta: &std::fs::Metadata) -> ObjectVersion {
    let nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    ObjectVersion::new(format!("{}-{nanos}", meta.len()))
}

async fn describe_path(path: &Path, key: &str) -> Result<Option<ObjectDescriptor>, StoreError> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {
            Ok(Some(ObjectDescriptor::new(key, meta.len()).with_version(version_of(&meta))))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_range(
    path: &Path,
    version: Option<&ObjectVersion>,
    offset: u64,
    len: usize,
) -> Result<Bytes, StoreError> {
    let mut file = File::open(path).await?;
    if let Some(expected) = version {
        // Checked on the open handle: a replaced file is a different inode.
        let current = version_of(&file.metadata().await?);
        if &current != expected {
            return Err(StoreError::precondition_failed(format!(
                "{} changed: expected version {expected}, found {current}",
                path.display()
            )));
        }
    }
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

#[async_trait]
impl SourceStore for FsStore {
    async fn describe(&self, container: &str, key: &str) -> Result<ObjectDescriptor, StoreError> {
        let path = self.source_path(container, key)?;
        describe_path(&path, key)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("{container}/{key}")))
    }

    async fn read_chunk(
        &self,
        container: &str,
        key: &str,
        version: Option<&ObjectVersion>,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, StoreError> {
        read_range(&self.source_path(container, key)?, version, offset, len).await
    }
}

#[async_trait]
impl DestinationStore for FsStore {
    async fn lookup(&self, key: &str) -> Result<Option<ObjectDescriptor>, StoreError> {
        describe_path(&self.destination_path(key)?, key).await
    }

    async fn read_chunk(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        read_range(&self.destination_path(key)?, None, offset, len).await
    }

    async fn begin_upload(&self, temp_key: &str) -> Result<UploadHandle, StoreError> {
        let path = self.destination_path(temp_key)?;
        Self::ensure_parent(&path).await?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        trace!(path = %path.display(), "created temporary file");
        Ok(UploadHandle {
            temp_key: temp_key.to_owned(),
            upload_id: path.display().to_string(),
        })
    }

    async fn upload_chunk(
        &self,
        upload: &UploadHandle,
        index: u32,
        offset: u64,
        data: Bytes,
    ) -> Result<(), StoreError> {
        let path = self.destination_path(&upload.temp_key)?;
        let mut file = OpenOptions::new().write(true).open(&path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        trace!(path = %path.display(), index, offset, len = data.len(), "wrote chunk");
        Ok(())
    }

    async fn complete_upload(&self, upload: &UploadHandle) -> Result<(), StoreError> {
        let path = self.destination_path(&upload.temp_key)?;
        let file = OpenOptions::new().write(true).open(&path).await?;
        file.sync_all().await?;
        Ok(())
    }

    fn promote_capability(&self) -> PromoteCapability {
        PromoteCapability::Native
    }

    async fn promote_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        let temp = self.destination_path(temp_key)?;
        let final_path = self.destination_path(final_key)?;
        if fs::metadata(&temp).await.is_err() {
            return Err(StoreError::not_found(format!("temporary object {temp_key}")));
        }
        Self::install(&temp, &final_path, precondition).await
    }

    async fn copy_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        let temp = self.destination_path(temp_key)?;
        let final_path = self.destination_path(final_key)?;
        let staged = self.destination_path(&format!(
            "{final_key}{TEMP_INFIX}copy-{}",
            Uuid::new_v4().simple()
        ))?;

        fs::copy(&temp, &staged).await?;
        let status = Self::install(&staged, &final_path, precondition).await;
        if !matches!(status, Ok(PromoteStatus::Promoted)) {
            let _ = fs::remove_file(&staged).await;
        }
        status
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.destination_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_temp_objects(&self) -> Result<Vec<TempObjectInfo>, StoreError> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.relative_key(&path) else {
                    continue;
                };
                if !is_temp_key(&key) {
                    continue;
                }
                let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
                found.push(TempObjectInfo {
                    key,
                    last_modified: DateTime::<Utc>::from(modified),
                    upload_id: None,
                });
            }
        }
        Ok(found)
    }
}
