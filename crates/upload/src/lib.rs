//! Chunked, resumable upload of a single large file into a blob store.
//!
//! The source is hashed once (CRC32C), then streamed in bounded chunks to
//! temporary objects. Chunks are periodically composed server-side into the
//! destination object, staying under the store's fan-in limit. When every
//! byte is written the store-reported checksum of the destination must match
//! the local one. Temporary objects are deleted on every exit path.
//!
//! # Pipeline
//!
//! 1. **Hashing**: [`checksum_source`] over the whole source
//! 2. **Transmitting**: [`ChunkUploader`] per chunk, [`ComposeCoordinator`]
//!    at batch boundaries, each retried by [`RetryPolicy`]
//! 3. **Finalizing**: digest comparison
//! 4. **Cleanup**: [`cleanup_temp_objects`]

mod checksum;
mod chunk;
mod cleanup;
mod compose;
mod config;
mod error;
mod naming;
mod progress;
mod retry;
mod session;

pub use checksum::checksum_source;
pub use chunk::{ChunkRange, ChunkRanges, ChunkReceipt, ChunkUploader, chunk_ranges};
pub use cleanup::{CleanupError, CleanupReport, TempRegistry, cleanup_temp_objects};
pub use compose::{ComposeCoordinator, ComposeOutcome};
pub use config::UploadConfig;
pub use error::UploadError;
pub use naming::{
    DEFAULT_EXTENSION, PART_SEPARATOR, chunk_object_name, destination_name, is_chunk_object,
};
pub use progress::SpeedCalculator;
pub use retry::{Backoff, Failure, RetryError, RetryNotice, RetryObserver, RetryPolicy, Retried};
pub use session::{SessionState, UploadEvent, UploadReport, UploadSession};

/// Default chunk size: 128 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 128 * 1024 * 1024;

/// Default copy buffer size: 256 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;
