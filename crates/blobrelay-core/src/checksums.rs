//! SHA-256 fingerprints for the checksum-aware idempotency mode.
//!
//! # Streaming Hashing
//!
//! Objects are never buffered whole. [`digest_chunks`] pulls one chunk at a
//! time through a caller-supplied reader and feeds a [`StreamingHasher`], so
//! peak memory is a single chunk regardless of object size.

use std::future::Future;

use bytes::Bytes;
use digest::Digest;
use sha2::Sha256;

use crate::error::StoreError;

/// Compute the SHA-256 digest of `data`.
///
/// # Examples
///
/// ```
/// use blobrelay_core::checksums::sha256;
///
/// let digest = sha256(b"");
/// assert_eq!(
///     hex::encode(digest),
///     "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
/// );
/// ```
#[must_use]
pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Incremental SHA-256 over a sequence of chunks.
#[derive(Debug, Default)]
pub struct StreamingHasher {
    sha256: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    /// Create a new hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.sha256, data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    #[must_use]
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finalize and return the raw digest.
    #[must_use]
    pub fn finish(self) -> Bytes {
        Bytes::from(Digest::finalize(self.sha256).to_vec())
    }
}

/// Hash an object of `size` bytes by reading it in `chunk_size` pieces.
///
/// `read(offset, len)` must return the bytes at `offset`. A short read
/// before `size` bytes were seen is reported as a transient error, since the
/// object most likely changed underneath the reader.
///
/// # Errors
///
/// Propagates any error returned by `read`.
pub async fn digest_chunks<F, Fut>(size: u64, chunk_size: usize, mut read: F) -> Result<Bytes, StoreError>
where
    F: FnMut(u64, usize) -> Fut,
    Fut: Future<Output = Result<Bytes, StoreError>>,
{
    let mut hasher = StreamingHasher::new();
    let chunk_size = chunk_size.max(1);

    while hasher.bytes_hashed() < size {
        let offset = hasher.bytes_hashed();
        let remaining = size - offset;
        let len = usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size));
        let chunk = read(offset, len).await?;
        if chunk.is_empty() {
            return Err(StoreError::transient(format!(
                "object ended at {offset} bytes, expected {size}"
            )));
        }
        hasher.update(&chunk);
    }

    Ok(hasher.finish())
}
