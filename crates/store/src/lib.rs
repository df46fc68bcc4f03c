//! Blob store abstraction consumed by the chunked uploader.
//!
//! A [`BlobStore`] exposes the small capability surface the upload engine
//! needs from a remote object store: streaming writes that finalize on
//! close, server-side compose, idempotent delete and prefix listing.
//!
//! Backends shipped here:
//! - [`MemoryStore`]: in-process map with fault injection, used by tests.
//! - [`DirStore`]: objects stored as files under a root directory.
//!
//! The Google Cloud Storage backend lives in `snapvault-gcs`.

mod digest;
mod dir;
mod memory;
mod name;

use std::future::Future;
use std::pin::Pin;

pub use digest::{Crc32c, Crc32cHasher};
pub use dir::DirStore;
pub use memory::{MemoryStore, StoreCall};
pub use name::validate_object_name;

/// Maximum number of sources a single compose may combine.
///
/// Matches the Cloud Storage limit.
pub const DEFAULT_COMPOSE_LIMIT: usize = 32;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors produced by blob store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("compose of {count} objects exceeds limit of {limit}")]
    ComposeLimit { count: usize, limit: usize },

    #[error("invalid object name: {0}")]
    InvalidName(String),
}

impl StoreError {
    /// Returns `true` if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Unavailable(_))
    }
}

/// Metadata of a stored object as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub name: String,
    pub size: u64,
    /// Store-computed checksum. Listings may omit it.
    pub crc32c: Option<Crc32c>,
}

/// Streaming writer for a single object.
///
/// The object becomes visible only when [`ObjectWriter::close`] succeeds.
/// Dropping a writer without closing it abandons the upload.
pub trait ObjectWriter: Send {
    /// Appends `data` to the object being written.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Finalizes the object and returns its attributes.
    fn close(self: Box<Self>) -> StoreFuture<'static, ObjectAttrs>;
}

/// Capability surface of a remote object store.
pub trait BlobStore: Send + Sync {
    /// Opens a writer that creates (or replaces) `name` on close.
    fn open_writer<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Box<dyn ObjectWriter>>;

    /// Concatenates `sources`, in order, into `destination`.
    ///
    /// `destination` may itself appear in `sources`. Passing more than
    /// [`BlobStore::compose_limit`] sources is a caller error.
    fn compose<'a>(
        &'a self,
        destination: &'a str,
        sources: &'a [String],
    ) -> StoreFuture<'a, ObjectAttrs>;

    /// Deletes `name`. Deleting a missing object succeeds.
    fn delete<'a>(&'a self, name: &'a str) -> StoreFuture<'a, ()>;

    /// Lists objects whose name starts with `prefix`, sorted by name.
    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectAttrs>>;

    /// Maximum sources accepted by a single compose.
    fn compose_limit(&self) -> usize {
        DEFAULT_COMPOSE_LIMIT
    }

    /// Human-readable location, e.g. `gs://bucket` or a directory path.
    fn location(&self) -> String;
}
