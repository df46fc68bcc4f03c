use std::fmt;
use std::io::SeekFrom;

use snapvault_store::{BlobStore, Crc32c, StoreError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::retry::{Failure, RetryError, RetryObserver, RetryPolicy};
use crate::{DEFAULT_BUFFER_SIZE, UploadError};

// ---------------------------------------------------------------------------
// Chunk planning
// ---------------------------------------------------------------------------

/// A byte range `[offset, offset + len)` of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub offset: u64,
    pub len: u64,
}

impl ChunkRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Iterator over the chunk ranges of a source. See [`chunk_ranges`].
#[derive(Debug, Clone)]
pub struct ChunkRanges {
    next: u64,
    total: u64,
    chunk_size: u64,
}

impl Iterator for ChunkRanges {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        if self.chunk_size == 0 || self.next >= self.total {
            return None;
        }
        let len = (self.total - self.next).min(self.chunk_size);
        let range = ChunkRange {
            offset: self.next,
            len,
        };
        self.next += len;
        Some(range)
    }
}

/// Splits `[0, total)` into consecutive ranges of at most `chunk_size` bytes.
///
/// Yields nothing for an empty source or a zero chunk size.
pub fn chunk_ranges(total: u64, chunk_size: u64) -> ChunkRanges {
    ChunkRanges {
        next: 0,
        total,
        chunk_size,
    }
}

// ---------------------------------------------------------------------------
// ChunkUploader
// ---------------------------------------------------------------------------

/// Outcome of a successfully written chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReceipt {
    pub object: String,
    pub offset: u64,
    /// Bytes written. Less than requested only at end of stream.
    pub len: u64,
    pub attempts: u32,
    pub crc32c: Option<Crc32c>,
}

#[derive(Debug)]
enum ChunkFault {
    Read(std::io::Error),
    Store(StoreError),
}

impl fmt::Display for ChunkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkFault::Read(e) => write!(f, "read error: {e}"),
            ChunkFault::Store(e) => write!(f, "{e}"),
        }
    }
}

fn read_failure(e: std::io::Error) -> Failure<ChunkFault> {
    Failure::fatal(ChunkFault::Read(e))
}

fn store_failure(e: StoreError) -> Failure<ChunkFault> {
    if e.is_transient() {
        Failure::transient(ChunkFault::Store(e))
    } else {
        Failure::fatal(ChunkFault::Store(e))
    }
}

/// Writes byte ranges of a source to temporary objects.
///
/// Each chunk is retried as a whole: every attempt re-seeks the source to
/// the chunk's offset and rewrites the same object from scratch, so an
/// interrupted attempt leaves nothing behind once a later one succeeds.
pub struct ChunkUploader<'a> {
    store: &'a dyn BlobStore,
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    observer: Option<&'a RetryObserver>,
    buf: Vec<u8>,
}

impl<'a> ChunkUploader<'a> {
    /// Creates an uploader. If `buffer_size` is 0, [`DEFAULT_BUFFER_SIZE`] is used.
    pub fn new(
        store: &'a dyn BlobStore,
        policy: &'a RetryPolicy,
        cancel: &'a CancellationToken,
        buffer_size: usize,
    ) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        Self {
            store,
            policy,
            cancel,
            observer: None,
            buf: vec![0u8; buffer_size],
        }
    }

    /// Registers a callback notified before each retry wait.
    pub fn observe(mut self, observer: &'a RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Copies up to `max_len` bytes starting at `offset` into `object`.
    pub async fn upload<R>(
        &mut self,
        source: &mut R,
        object: &str,
        offset: u64,
        max_len: u64,
    ) -> Result<ChunkReceipt, UploadError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + ?Sized,
    {
        let mut backoff = self.policy.backoff(self.cancel);
        if let Some(observer) = self.observer {
            backoff = backoff.observe(observer);
        }

        let cancel = self.cancel;
        loop {
            let attempt = backoff.begin();
            // Abandoning the attempt drops its writer, which aborts the object.
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(object = %object, offset, attempt, "chunk upload cancelled");
                    return Err(UploadError::Cancelled);
                }
                outcome = self.attempt(source, object, offset, max_len) => outcome,
            };
            match outcome {
                Ok((len, crc32c)) => {
                    debug!(object = %object, offset, len, attempt, "chunk written");
                    return Ok(ChunkReceipt {
                        object: object.to_string(),
                        offset,
                        len,
                        attempts: attempt,
                        crc32c,
                    });
                }
                Err(failure) => {
                    if let Err(e) = backoff.failed(failure).await {
                        return Err(promote(e, object, offset));
                    }
                }
            }
        }
    }

    async fn attempt<R>(
        &mut self,
        source: &mut R,
        object: &str,
        offset: u64,
        max_len: u64,
    ) -> Result<(u64, Option<Crc32c>), Failure<ChunkFault>>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + ?Sized,
    {
        // Discard whatever a previous attempt consumed.
        source
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(read_failure)?;

        let mut writer = self.store.open_writer(object).await.map_err(store_failure)?;
        let mut written: u64 = 0;
        while written < max_len {
            let want = (max_len - written).min(self.buf.len() as u64) as usize;
            let n = source
                .read(&mut self.buf[..want])
                .await
                .map_err(read_failure)?;
            if n == 0 {
                break;
            }
            writer
                .write(&self.buf[..n])
                .await
                .map_err(store_failure)?;
            written += n as u64;
        }

        let attrs = writer.close().await.map_err(store_failure)?;
        Ok((written, attrs.crc32c))
    }
}

fn promote(err: RetryError<ChunkFault>, object: &str, offset: u64) -> UploadError {
    let attempts = err.attempts();
    if err.is_cancelled() {
        return UploadError::Cancelled;
    }
    match err.into_error() {
        ChunkFault::Read(e) => UploadError::read(offset, e),
        ChunkFault::Store(source) => UploadError::Transfer {
            object: object.to_string(),
            offset,
            attempts,
            source,
        },
    }
}
