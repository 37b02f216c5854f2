//! In-memory blob store.
//!
//! [`MemoryStore`] implements both [`SourceStore`] and [`DestinationStore`].
//! Objects are kept as [`Bytes`] in a [`DashMap`] keyed by
//! `(container, key)`. As a destination it writes into a single configured
//! container.
//!
//! Conditional promotes go through the `DashMap` entry API, which holds the
//! shard lock for the final key while the precondition is checked and the
//! new object is inserted. Concurrent promotes of the same key therefore
//! serialize and exactly one of them observes "does not exist".
//!
//! The store also tracks the largest single chunk it was asked to read or
//! write, which lets tests assert the bounded-memory property of the
//! transfer path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::checksums;
use crate::error::StoreError;
use crate::store::{
    DestinationStore, PromoteCapability, PromoteStatus, SourceStore, TempObjectInfo, UploadHandle,
};
use crate::types::{ObjectDescriptor, ObjectVersion, Precondition, is_temp_key};

/// Composite key identifying a stored object: `(container, key)`.
type StorageKey = (String, String);

/// Container used when none is given.
pub const DEFAULT_CONTAINER: &str = "default";

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    sha256: Bytes,
    generation: u64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn descriptor(&self, key: &str) -> ObjectDescriptor {
        ObjectDescriptor::new(key, self.data.len() as u64)
            .with_checksum(self.sha256.clone())
            .with_version(ObjectVersion::new(self.generation.to_string()))
    }
}

#[derive(Debug)]
struct PendingUpload {
    temp_key: String,
    chunks: BTreeMap<u32, (u64, Bytes)>,
    started: DateTime<Utc>,
}

/// `DashMap`-backed store usable as both source and destination.
///
/// # Examples
///
/// ```
/// use blobrelay_core::store::{MemoryStore, SourceStore};
///
/// # tokio_test::block_on(async {
/// let store = MemoryStore::new("src");
/// store.put_object("src", "hello.txt", "hello world");
///
/// let desc = store.describe("src", "hello.txt").await.unwrap();
/// assert_eq!(desc.size_bytes, 11);
///
/// let chunk = store.read_chunk("src", "hello.txt", None, 6, 5).await.unwrap();
/// assert_eq!(chunk.as_ref(), b"world");
/// # });
/// ```
pub struct MemoryStore {
    objects: DashMap<StorageKey, StoredObject>,
    uploads: DashMap<String, PendingUpload>,
    container: String,
    capability: PromoteCapability,
    next_generation: AtomicU64,
    largest_read: AtomicUsize,
    largest_write: AtomicUsize,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("container", &self.container)
            .field("objects_count", &self.objects.len())
            .field("uploads_count", &self.uploads.len())
            .field("capability", &self.capability)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONTAINER)
    }
}

impl MemoryStore {
    /// Create an empty store whose destination role writes into `container`.
    #[must_use]
    pub fn new(container: impl Into<String>) -> Self {
        let container = container.into();
        debug!(container = %container, "creating MemoryStore");
        Self {
            objects: DashMap::new(),
            uploads: DashMap::new(),
            container,
            capability: PromoteCapability::Native,
            next_generation: AtomicU64::new(1),
            largest_read: AtomicUsize::new(0),
            largest_write: AtomicUsize::new(0),
        }
    }

    /// Select which promote capability the destination role advertises.
    #[must_use]
    pub fn with_capability(mut self, capability: PromoteCapability) -> Self {
        self.capability = capability;
        self
    }

    /// The container the destination role writes into.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Insert or replace an object directly.
    pub fn put_object(&self, container: &str, key: &str, data: impl Into<Bytes>) {
        let stored = self.new_object(data.into());
        trace!(container, key, size = stored.data.len(), "stored object");
        self.objects
            .insert((container.to_owned(), key.to_owned()), stored);
    }

    /// Fetch an object's full content.
    #[must_use]
    pub fn get_object(&self, container: &str, key: &str) -> Option<Bytes> {
        self.objects
            .get(&(container.to_owned(), key.to_owned()))
            .map(|o| o.data.clone())
    }

    /// Remove an object directly.
    pub fn remove_object(&self, container: &str, key: &str) {
        self.objects.remove(&(container.to_owned(), key.to_owned()));
    }

    /// Keys present in `container`, sorted.
    #[must_use]
    pub fn keys(&self, container: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == container)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of incomplete uploads.
    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Largest single chunk requested from any read.
    #[must_use]
    pub fn largest_read(&self) -> usize {
        self.largest_read.load(Ordering::Relaxed)
    }

    /// Largest single chunk received by any upload.
    #[must_use]
    pub fn largest_write(&self) -> usize {
        self.largest_write.load(Ordering::Relaxed)
    }

    fn new_object(&self, data: Bytes) -> StoredObject {
        let sha256 = Bytes::from(checksums::sha256(&data));
        StoredObject {
            data,
            sha256,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            last_modified: Utc::now(),
        }
    }

    fn storage_key(&self, key: &str) -> StorageKey {
        (self.container.clone(), key.to_owned())
    }

    fn read_range(
        &self,
        container: &str,
        key: &str,
        version: Option<&ObjectVersion>,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, StoreError> {
        self.largest_read.fetch_max(len, Ordering::Relaxed);

        let entry = self
            .objects
            .get(&(container.to_owned(), key.to_owned()))
            .ok_or_else(|| StoreError::not_found(format!("{container}/{key}")))?;
        if let Some(expected) = version {
            let current = entry.value().generation.to_string();
            if expected.as_str() != current {
                return Err(StoreError::precondition_failed(format!(
                    "{container}/{key} changed: expected generation {expected}, found {current}"
                )));
            }
        }
        let data = &entry.value().data;

        let start = usize::try_from(offset)
            .map_err(|_| StoreError::invalid_input(format!("offset {offset} out of range")))?;
        if start > data.len() {
            return Err(StoreError::invalid_input(format!(
                "offset {offset} beyond end of {container}/{key} ({} bytes)",
                data.len()
            )));
        }
        let end = start.saturating_add(len).min(data.len());
        Ok(data.slice(start..end))
    }

    /// Apply `precondition` against the final key and insert `object` if it holds.
    fn insert_if(&self, final_key: &str, object: StoredObject, precondition: &Precondition) -> PromoteStatus {
        match self.objects.entry(self.storage_key(final_key)) {
            Entry::Occupied(mut occupied) => match precondition {
                Precondition::MatchesVersion(v)
                    if v.as_str() == occupied.get().generation.to_string() =>
                {
                    occupied.insert(object);
                    PromoteStatus::Promoted
                }
                _ => PromoteStatus::PreconditionFailed,
            },
            Entry::Vacant(vacant) => match precondition {
                Precondition::DoesNotExist => {
                    vacant.insert(object);
                    PromoteStatus::Promoted
                }
                Precondition::MatchesVersion(_) => PromoteStatus::PreconditionFailed,
            },
        }
    }

    fn restamp(&self, temp_key: &str) -> Result<StoredObject, StoreError> {
        let temp = self
            .objects
            .get(&self.storage_key(temp_key))
            .ok_or_else(|| StoreError::not_found(format!("temporary object {temp_key}")))?;
        let mut object = temp.value().clone();
        drop(temp);

        object.generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        object.last_modified = Utc::now();
        Ok(object)
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn describe(&self, container: &str, key: &str) -> Result<ObjectDescriptor, StoreError> {
        self.objects
            .get(&(container.to_owned(), key.to_owned()))
            .map(|o| o.descriptor(key))
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
        self.read_range(container, key, version, offset, len)
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn lookup(&self, key: &str) -> Result<Option<ObjectDescriptor>, StoreError> {
        Ok(self
            .objects
            .get(&self.storage_key(key))
            .map(|o| o.descriptor(key)))
    }

    async fn read_chunk(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        self.read_range(&self.container, key, None, offset, len)
    }

    async fn begin_upload(&self, temp_key: &str) -> Result<UploadHandle, StoreError> {
        let upload_id = Uuid::new_v4().simple().to_string();
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                temp_key: temp_key.to_owned(),
                chunks: BTreeMap::new(),
                started: Utc::now(),
            },
        );
        Ok(UploadHandle {
            temp_key: temp_key.to_owned(),
            upload_id,
        })
    }

    async fn upload_chunk(
        &self,
        upload: &UploadHandle,
        index: u32,
        offset: u64,
        data: Bytes,
    ) -> Result<(), StoreError> {
        self.largest_write.fetch_max(data.len(), Ordering::Relaxed);

        let mut pending = self
            .uploads
            .get_mut(&upload.upload_id)
            .ok_or_else(|| StoreError::not_found(format!("upload {}", upload.upload_id)))?;
        pending.chunks.insert(index, (offset, data));
        Ok(())
    }

    async fn complete_upload(&self, upload: &UploadHandle) -> Result<(), StoreError> {
        let (_, pending) = self
            .uploads
            .remove(&upload.upload_id)
            .ok_or_else(|| StoreError::not_found(format!("upload {}", upload.upload_id)))?;

        let total: usize = pending.chunks.values().map(|(_, d)| d.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for (index, (offset, data)) in &pending.chunks {
            if *offset != buf.len() as u64 {
                return Err(StoreError::invalid_input(format!(
                    "chunk {index} of {} starts at {offset}, expected {}",
                    pending.temp_key,
                    buf.len()
                )));
            }
            buf.extend_from_slice(data);
        }

        let stored = self.new_object(buf.freeze());
        self.objects.insert(self.storage_key(&pending.temp_key), stored);
        Ok(())
    }

    fn promote_capability(&self) -> PromoteCapability {
        self.capability
    }

    async fn promote_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        if self.capability != PromoteCapability::Native {
            return Err(StoreError::unsupported("native promote disabled"));
        }
        let object = self.restamp(temp_key)?;
        let status = self.insert_if(final_key, object, precondition);
        if status == PromoteStatus::Promoted {
            self.objects.remove(&self.storage_key(temp_key));
        }
        Ok(status)
    }

    async fn copy_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        let object = self.restamp(temp_key)?;
        Ok(self.insert_if(final_key, object, precondition))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects.remove(&self.storage_key(key));
        Ok(())
    }

    async fn list_temp_objects(&self) -> Result<Vec<TempObjectInfo>, StoreError> {
        let mut found: Vec<TempObjectInfo> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == self.container && is_temp_key(&e.key().1))
            .map(|e| TempObjectInfo {
                key: e.key().1.clone(),
                last_modified: e.value().last_modified,
                upload_id: None,
            })
            .collect();

        found.extend(self.uploads.iter().map(|e| TempObjectInfo {
            key: e.value().temp_key.clone(),
            last_modified: e.value().started,
            upload_id: Some(e.key().clone()),
        }));
        Ok(found)
    }

    async fn discard_temp(&self, info: &TempObjectInfo) -> Result<(), StoreError> {
        match &info.upload_id {
            Some(id) => {
                self.uploads.remove(id);
            }
            None => {
                self.objects.remove(&self.storage_key(&info.key));
            }
        }
        Ok(())
    }
}
