//! Google Cloud Storage backend for the snapvault uploader.

mod client;
mod types;

use snapvault_store::StoreError;

pub use client::{DEFAULT_REQUEST_TIMEOUT, GcsStore};

/// Errors from the Cloud Storage client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid access token")]
    InvalidToken,

    #[error("bucket name is empty")]
    InvalidBucket,
}

impl Error {
    /// Returns `true` for failures a retry may fix: transport errors,
    /// timeouts, throttling and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => !e.is_builder() && !e.is_decode(),
            Error::Api { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

impl From<Error> for StoreError {
    fn from(e: Error) -> Self {
        if e.is_transient() {
            return StoreError::Unavailable(e.to_string());
        }
        match e {
            Error::Api { status: 404, body } => StoreError::NotFound(body),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> Error {
        Error::Api {
            status,
            body: "details".into(),
        }
    }

    #[test]
    fn status_classification() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(api(status).is_transient(), "{status} should be transient");
        }
        for status in [400, 401, 403, 404, 409, 412] {
            assert!(!api(status).is_transient(), "{status} should be fatal");
        }
        assert!(!Error::InvalidToken.is_transient());
        assert!(!Error::InvalidResponse("x".into()).is_transient());
    }

    #[test]
    fn store_error_mapping() {
        assert!(matches!(StoreError::from(api(503)), StoreError::Unavailable(_)));
        assert!(matches!(StoreError::from(api(404)), StoreError::NotFound(_)));
        match StoreError::from(api(400)) {
            StoreError::Rejected(msg) => assert_eq!(msg, "API error 400: details"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
