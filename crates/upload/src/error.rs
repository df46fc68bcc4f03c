//! Upload error types.

use snapvault_store::{Crc32c, StoreError};

/// Errors that end an upload session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The local source could not be read, sought, or ended early.
    #[error("failed to read source at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    /// A chunk could not be written, either because the store rejected it
    /// or because transient failures outlasted the retry bound.
    #[error("failed to upload {object} (offset {offset}) after {attempts} attempt(s): {source}")]
    Transfer {
        object: String,
        offset: u64,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("failed to compose {inputs} object(s) into {destination} after {attempts} attempt(s): {source}")]
    Compose {
        destination: String,
        inputs: usize,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The destination exists but its content does not match the source.
    #[error(
        "checksum mismatch for {destination}: store reported {}, computed {local}",
        .remote.map_or_else(|| "nothing".to_string(), |c| c.to_string())
    )]
    Integrity {
        destination: String,
        local: Crc32c,
        remote: Option<Crc32c>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl UploadError {
    pub(crate) fn read(offset: u64, source: std::io::Error) -> Self {
        UploadError::Read { offset, source }
    }

    /// Returns `true` if the destination object was left in place with
    /// unverified content.
    pub fn is_integrity(&self) -> bool {
        matches!(self, UploadError::Integrity { .. })
    }
}
