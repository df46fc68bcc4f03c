use snapvault_store::{BlobStore, ObjectAttrs, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::UploadError;
use crate::retry::{Failure, RetryObserver, RetryPolicy};

/// Result of one compose round.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeOutcome {
    /// Attributes of the destination as reported by the store.
    pub attrs: ObjectAttrs,
    /// Number of objects folded into the destination.
    pub inputs: usize,
    pub attempts: u32,
}

/// Folds batches of objects into the destination with server-side compose.
pub struct ComposeCoordinator<'a> {
    store: &'a dyn BlobStore,
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    observer: Option<&'a RetryObserver>,
    limit: usize,
}

impl<'a> ComposeCoordinator<'a> {
    /// Creates a coordinator whose fan-in is the smaller of `limit` and the
    /// store's own compose limit.
    pub fn new(
        store: &'a dyn BlobStore,
        policy: &'a RetryPolicy,
        cancel: &'a CancellationToken,
        limit: usize,
    ) -> Self {
        Self {
            store,
            policy,
            cancel,
            observer: None,
            limit: limit.min(store.compose_limit()),
        }
    }

    pub fn observe(mut self, observer: &'a RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Effective fan-in limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Concatenates `inputs`, in order, into `destination`.
    ///
    /// When the destination already exists it must be the first input.
    /// Input lists that are empty or exceed the fan-in limit are refused
    /// without contacting the store.
    pub async fn compose(
        &self,
        destination: &str,
        inputs: &[String],
    ) -> Result<ComposeOutcome, UploadError> {
        let refused = |source| UploadError::Compose {
            destination: destination.to_string(),
            inputs: inputs.len(),
            attempts: 0,
            source,
        };
        if inputs.is_empty() {
            return Err(refused(StoreError::Rejected(
                "compose requires at least one input".into(),
            )));
        }
        if inputs.len() > self.limit {
            return Err(refused(StoreError::ComposeLimit {
                count: inputs.len(),
                limit: self.limit,
            }));
        }

        debug!(destination = %destination, inputs = inputs.len(), "composing");
        let store = self.store;
        let result = self
            .policy
            .run(self.cancel, self.observer, move |_| {
                let call = store.compose(destination, inputs);
                async move {
                    call.await.map_err(|e| {
                        if e.is_transient() {
                            Failure::transient(e)
                        } else {
                            Failure::fatal(e)
                        }
                    })
                }
            })
            .await;

        match result {
            Ok(retried) => {
                info!(
                    destination = %destination,
                    inputs = inputs.len(),
                    size = retried.value.size,
                    attempts = retried.attempts,
                    "compose complete"
                );
                Ok(ComposeOutcome {
                    attrs: retried.value,
                    inputs: inputs.len(),
                    attempts: retried.attempts,
                })
            }
            Err(e) if e.is_cancelled() => Err(UploadError::Cancelled),
            Err(e) => Err(UploadError::Compose {
                destination: destination.to_string(),
                inputs: inputs.len(),
                attempts: e.attempts(),
                source: e.into_error(),
            }),
        }
    }
}
