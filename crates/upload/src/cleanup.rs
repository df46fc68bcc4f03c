use std::collections::BTreeSet;

use snapvault_store::{BlobStore, StoreError};
use tracing::{debug, info, warn};

/// Names of every temporary object a session may have created.
///
/// Entries are only ever added; the registry is consumed by
/// [`cleanup_temp_objects`] at the end of the session.
#[derive(Debug, Default, Clone)]
pub struct TempRegistry {
    names: BTreeSet<String>,
}

impl TempRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `name`. Returns `false` if it was already registered.
    pub fn register(&mut self, name: impl Into<String>) -> bool {
        self.names.insert(name.into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// A temporary object that could not be deleted.
#[derive(Debug, thiserror::Error)]
#[error("failed to delete temporary object {object}: {source}")]
pub struct CleanupError {
    pub object: String,
    #[source]
    pub source: StoreError,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub failed: Vec<CleanupError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes every registered temporary object, best effort.
///
/// Failures are logged and collected but never abort the pass. The
/// destination is never deleted, even if it was registered by mistake.
/// Not cancellable: it also runs after a cancelled session.
pub async fn cleanup_temp_objects(
    store: &dyn BlobStore,
    registry: &TempRegistry,
    destination: &str,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    for name in registry.iter().filter(|n| *n != destination) {
        match store.delete(name).await {
            Ok(()) => {
                debug!(object = %name, "temporary object deleted");
                report.deleted.push(name.to_string());
            }
            Err(e) => {
                warn!(object = %name, error = %e, "failed to delete temporary object");
                report.failed.push(CleanupError {
                    object: name.to_string(),
                    source: e,
                });
            }
        }
    }

    if !report.deleted.is_empty() || !report.failed.is_empty() {
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "cleanup finished"
        );
    }
    report
}
