//! Upload session orchestration.
//!
//! Sequences hashing, chunk transmission, compose rounds and the final
//! digest comparison for one destination, and guarantees that temporary
//! objects are cleaned up on every exit path.

use std::fmt;
use std::io::{ErrorKind, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use snapvault_store::{BlobStore, Crc32c};
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checksum::checksum_source;
use crate::chunk::{ChunkUploader, chunk_ranges};
use crate::cleanup::{CleanupReport, TempRegistry, cleanup_temp_objects};
use crate::compose::ComposeCoordinator;
use crate::naming::chunk_object_name;
use crate::retry::RetryNotice;
use crate::{UploadConfig, UploadError};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Hashing,
    Transmitting,
    Finalizing,
    Verified,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Verified | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Hashing => "hashing",
            SessionState::Transmitting => "transmitting",
            SessionState::Finalizing => "finalizing",
            SessionState::Verified => "verified",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Notifications emitted while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StateChanged(SessionState),
    Hashed {
        bytes: u64,
        digest: Crc32c,
    },
    ChunkUploaded {
        object: String,
        offset: u64,
        len: u64,
        attempts: u32,
    },
    Progress {
        bytes_written: u64,
        total: u64,
    },
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        error: String,
    },
    Composed {
        round: usize,
        inputs: usize,
        size: u64,
    },
    CleanupFailed {
        object: String,
        error: String,
    },
}

/// Summary of a verified upload.
#[derive(Debug)]
pub struct UploadReport {
    pub destination: String,
    /// Where the destination lives, e.g. `gs://bucket`.
    pub location: String,
    pub bytes: u64,
    pub chunks: usize,
    pub compose_rounds: usize,
    pub digest: Crc32c,
    pub cleanup: CleanupReport,
    pub elapsed: Duration,
}

/// Mutable run state, owned by [`UploadSession::run`].
#[derive(Debug, Default)]
struct RunState {
    bytes_written: u64,
    /// Destination (once it exists) followed by chunks awaiting compose.
    pending: Vec<String>,
    registry: TempRegistry,
    last_digest: Option<Crc32c>,
    chunks: usize,
    compose_rounds: usize,
}

/// Uploads one source into one destination object.
///
/// Progress is reported on an event channel obtained with
/// [`take_events`](Self::take_events). Events are dropped rather than
/// blocking the upload when the receiver falls behind.
pub struct UploadSession {
    store: Arc<dyn BlobStore>,
    destination: String,
    config: UploadConfig,
    state: SessionState,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

impl UploadSession {
    pub fn new(store: Arc<dyn BlobStore>, destination: impl Into<String>, config: UploadConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            destination: destination.into(),
            config,
            state: SessionState::Idle,
            cancel: CancellationToken::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Uses an externally owned cancellation token, e.g. one shared by
    /// several sessions.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    /// Returns a cancellation token for this session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(destination = %self.destination, from = %self.state, to = %state, "state change");
        self.state = state;
        self.emit(UploadEvent::StateChanged(state));
    }

    /// Uploads the file at `path`.
    pub async fn run_file(&mut self, path: &Path) -> Result<UploadReport, UploadError> {
        let opened = async {
            let file = tokio::fs::File::open(path).await?;
            let len = file.metadata().await?.len();
            Ok::<_, std::io::Error>((file, len))
        }
        .await;
        match opened {
            Ok((mut file, len)) => self.run(&mut file, len).await,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot open source");
                self.set_state(SessionState::Failed);
                Err(UploadError::read(0, e))
            }
        }
    }

    /// Uploads the first `len` bytes of `source`.
    ///
    /// On success the destination holds exactly those bytes and its
    /// store-reported CRC32C matches the local one. Temporary objects are
    /// deleted whatever the outcome; the destination never is.
    pub async fn run<R>(&mut self, source: &mut R, len: u64) -> Result<UploadReport, UploadError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + ?Sized,
    {
        let started = Instant::now();
        info!(
            destination = %self.destination,
            location = %self.store.location(),
            bytes = len,
            "upload started"
        );

        let mut run = RunState::default();
        let outcome = self.execute(source, len, &mut run).await;

        let store = Arc::clone(&self.store);
        let cleanup = cleanup_temp_objects(store.as_ref(), &run.registry, &self.destination).await;
        for failure in &cleanup.failed {
            self.emit(UploadEvent::CleanupFailed {
                object: failure.object.clone(),
                error: failure.source.to_string(),
            });
        }

        match outcome {
            Ok(digest) => {
                self.set_state(SessionState::Verified);
                let elapsed = started.elapsed();
                info!(
                    destination = %self.destination,
                    bytes = len,
                    chunks = run.chunks,
                    compose_rounds = run.compose_rounds,
                    crc32c = %digest,
                    elapsed_secs = elapsed.as_secs(),
                    "upload verified"
                );
                Ok(UploadReport {
                    destination: self.destination.clone(),
                    location: store.location(),
                    bytes: len,
                    chunks: run.chunks,
                    compose_rounds: run.compose_rounds,
                    digest,
                    cleanup,
                    elapsed,
                })
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                error!(
                    destination = %self.destination,
                    bytes_written = run.bytes_written,
                    error = %e,
                    "upload failed"
                );
                Err(e)
            }
        }
    }

    async fn execute<R>(
        &mut self,
        source: &mut R,
        len: u64,
        run: &mut RunState,
    ) -> Result<Crc32c, UploadError>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + ?Sized,
    {
        self.config.validate()?;
        let fan_in = self.config.compose_limit.min(self.store.compose_limit());
        if fan_in < 2 {
            return Err(UploadError::Config(format!(
                "{} composes at most {fan_in} object(s); at least 2 are required",
                self.store.location()
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        self.set_state(SessionState::Hashing);
        source
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| UploadError::read(0, e))?;
        let local = checksum_source(source, len, self.config.buffer_size, &self.cancel).await?;
        info!(destination = %self.destination, bytes = len, crc32c = %local, "source hashed");
        self.emit(UploadEvent::Hashed {
            bytes: len,
            digest: local,
        });
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        self.set_state(SessionState::Transmitting);

        let store = Arc::clone(&self.store);
        let cancel = self.cancel.clone();
        let destination = self.destination.clone();
        let policy = self.config.retry_policy();
        let events = self.events_tx.clone();
        let observer = move |notice: &RetryNotice| {
            let _ = events.try_send(UploadEvent::Retrying {
                attempt: notice.attempt,
                max_attempts: notice.max_attempts,
                delay: notice.delay,
                error: notice.error.clone(),
            });
        };

        let mut uploader =
            ChunkUploader::new(store.as_ref(), &policy, &cancel, self.config.buffer_size)
                .observe(&observer);
        let composer =
            ComposeCoordinator::new(store.as_ref(), &policy, &cancel, self.config.compose_limit)
                .observe(&observer);

        if len == 0 {
            // Nothing to compose: write the empty destination directly.
            let receipt = uploader.upload(source, &destination, 0, 0).await?;
            run.last_digest = receipt.crc32c;
        }

        for range in chunk_ranges(len, self.config.chunk_size) {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let object = chunk_object_name(&destination, range.offset);
            // Registered before the first attempt so a partially written
            // object is still cleaned up.
            run.registry.register(object.clone());

            let receipt = uploader
                .upload(source, &object, range.offset, range.len)
                .await?;
            if receipt.len != range.len {
                return Err(UploadError::read(
                    range.offset + receipt.len,
                    std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("source shrank to {} bytes", range.offset + receipt.len),
                    ),
                ));
            }

            run.bytes_written += receipt.len;
            run.chunks += 1;
            run.pending.push(object);
            self.emit(UploadEvent::ChunkUploaded {
                object: receipt.object,
                offset: receipt.offset,
                len: receipt.len,
                attempts: receipt.attempts,
            });
            self.emit(UploadEvent::Progress {
                bytes_written: run.bytes_written,
                total: len,
            });

            if run.pending.len() >= composer.limit() || run.bytes_written == len {
                let outcome = composer.compose(&destination, &run.pending).await?;
                run.compose_rounds += 1;
                run.last_digest = outcome.attrs.crc32c;
                self.emit(UploadEvent::Composed {
                    round: run.compose_rounds,
                    inputs: outcome.inputs,
                    size: outcome.attrs.size,
                });
                run.pending = vec![destination.clone()];
            }
        }

        self.set_state(SessionState::Finalizing);
        match run.last_digest {
            Some(remote) if remote == local => Ok(local),
            remote => Err(UploadError::Integrity {
                destination,
                local,
                remote,
            }),
        }
    }
}
