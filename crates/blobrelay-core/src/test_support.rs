//! Fault-injecting store wrapper for engine tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;
use crate::store::{
    DestinationStore, MemoryStore, PromoteCapability, PromoteStatus, SourceStore, TempObjectInfo,
    UploadHandle,
};
use crate::types::{ObjectDescriptor, ObjectVersion, Precondition};

/// Wraps a [`MemoryStore`] and fails selected calls.
#[derive(Debug)]
pub(crate) struct FaultyStore {
    pub inner: MemoryStore,
    read_faults: AtomicU32,
    write_faults: AtomicU32,
    delete_faults: AtomicU32,
    deny_reads: bool,
    fail_reads_from: Option<u64>,
    read_delay: Duration,
    replacement: Mutex<Option<Bytes>>,
    reads: AtomicU32,
    writes: AtomicU32,
    bytes_read: AtomicU64,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            read_faults: AtomicU32::new(0),
            write_faults: AtomicU32::new(0),
            delete_faults: AtomicU32::new(0),
            deny_reads: false,
            fail_reads_from: None,
            read_delay: Duration::ZERO,
            replacement: Mutex::new(None),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            bytes_read: AtomicU64::new(0),
        }
    }

    /// The next `n` chunk reads fail transiently.
    pub fn with_read_faults(self, n: u32) -> Self {
        self.read_faults.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` chunk uploads fail transiently.
    pub fn with_write_faults(self, n: u32) -> Self {
        self.write_faults.store(n, Ordering::SeqCst);
        self
    }

    /// The next `n` deletes fail transiently.
    pub fn with_delete_faults(self, n: u32) -> Self {
        self.delete_faults.store(n, Ordering::SeqCst);
        self
    }

    /// Every describe and read is denied.
    pub fn with_denied_reads(mut self) -> Self {
        self.deny_reads = true;
        self
    }

    /// Reads at or past `offset` fail permanently, as if the object vanished.
    pub fn with_reads_failing_from(mut self, offset: u64) -> Self {
        self.fail_reads_from = Some(offset);
        self
    }

    /// Each chunk read takes `delay`.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// After the first successful chunk read, the object is overwritten with `data`.
    pub fn with_overwrite_after_first_read(self, data: impl Into<Bytes>) -> Self {
        *self.replacement.lock().unwrap() = Some(data.into());
        self
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::SeqCst)
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SourceStore for FaultyStore {
    async fn describe(&self, container: &str, key: &str) -> Result<ObjectDescriptor, StoreError> {
        if self.deny_reads {
            return Err(StoreError::permission_denied("access denied"));
        }
        self.inner.describe(container, key).await
    }

    async fn read_chunk(
        &self,
        container: &str,
        key: &str,
        version: Option<&ObjectVersion>,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        if self.deny_reads {
            return Err(StoreError::permission_denied("access denied"));
        }
        if self.fail_reads_from.is_some_and(|from| offset >= from) {
            return Err(StoreError::not_found(format!("{container}/{key}")));
        }
        if Self::take_fault(&self.read_faults) {
            return Err(StoreError::transient("injected read timeout"));
        }
        let chunk =
            SourceStore::read_chunk(&self.inner, container, key, version, offset, len).await?;
        self.bytes_read.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        let replacement = self.replacement.lock().unwrap().take();
        if let Some(data) = replacement {
            self.inner.put_object(container, key, data);
        }
        Ok(chunk)
    }
}

#[async_trait]
impl DestinationStore for FaultyStore {
    async fn lookup(&self, key: &str) -> Result<Option<ObjectDescriptor>, StoreError> {
        self.inner.lookup(key).await
    }

    async fn read_chunk(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        DestinationStore::read_chunk(&self.inner, key, offset, len).await
    }

    async fn begin_upload(&self, temp_key: &str) -> Result<UploadHandle, StoreError> {
        self.inner.begin_upload(temp_key).await
    }

    async fn upload_chunk(
        &self,
        upload: &UploadHandle,
        index: u32,
        offset: u64,
        data: Bytes,
    ) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&self.write_faults) {
            return Err(StoreError::transient("injected 503 SlowDown"));
        }
        self.inner.upload_chunk(upload, index, offset, data).await
    }

    async fn complete_upload(&self, upload: &UploadHandle) -> Result<(), StoreError> {
        self.inner.complete_upload(upload).await
    }

    fn promote_capability(&self) -> PromoteCapability {
        self.inner.promote_capability()
    }

    async fn promote_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        self.inner.promote_if(temp_key, final_key, precondition).await
    }

    async fn copy_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        self.inner.copy_if(temp_key, final_key, precondition).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if Self::take_fault(&self.delete_faults) {
            return Err(StoreError::transient("injected delete failure"));
        }
        self.inner.delete(key).await
    }

    async fn list_temp_objects(&self) -> Result<Vec<TempObjectInfo>, StoreError> {
        self.inner.list_temp_objects().await
    }

    async fn discard_temp(&self, info: &TempObjectInfo) -> Result<(), StoreError> {
        self.inner.discard_temp(info).await
    }
}
