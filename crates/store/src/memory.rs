//! In-memory blob store with fault injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::{
    BlobStore, Crc32c, DEFAULT_COMPOSE_LIMIT, ObjectAttrs, ObjectWriter, StoreError, StoreFuture,
};

/// A store operation, recorded in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    OpenWriter(String),
    Close(String),
    Compose {
        destination: String,
        sources: Vec<String>,
    },
    Delete(String),
    List(String),
}

/// Failures to inject into a [`MemoryStore`].
#[derive(Debug, Default, Clone)]
struct FaultPlan {
    /// Object name -> pending write faults.
    writes: HashMap<String, WriteFault>,
    /// One entry per upcoming compose call: `true` = transient, `false` = rejected.
    composes: VecDeque<bool>,
    /// Report a wrong checksum on the next compose.
    corrupt_next_compose: bool,
    /// Object names whose deletion fails.
    deletes: HashMap<String, u32>,
}

#[derive(Debug, Clone, Copy)]
struct WriteFault {
    remaining: u32,
    after_bytes: usize,
}

/// In-process object store keyed by name.
///
/// Cloning yields another handle to the same objects, so tests can keep
/// one handle for inspection while the uploader owns another.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

struct MemoryInner {
    objects: BTreeMap<String, Vec<u8>>,
    faults: FaultPlan,
    calls: Vec<StoreCall>,
    compose_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                objects: BTreeMap::new(),
                faults: FaultPlan::default(),
                calls: Vec::new(),
                compose_limit: DEFAULT_COMPOSE_LIMIT,
            })),
        }
    }

    /// Overrides the compose fan-in limit.
    pub fn with_compose_limit(self, limit: usize) -> Self {
        self.lock().compose_limit = limit;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `times` writers opened on `name` fail with a transient
    /// error once `after_bytes` bytes have been written.
    pub fn fail_writes(&self, name: &str, times: u32, after_bytes: usize) {
        self.lock().faults.writes.insert(
            name.to_string(),
            WriteFault {
                remaining: times,
                after_bytes,
            },
        );
    }

    /// Queues a failure for the next compose call.
    pub fn fail_next_compose(&self, transient: bool) {
        self.lock().faults.composes.push_back(transient);
    }

    /// Makes the next compose report a checksum that does not match its
    /// content. The composed content itself is stored correctly.
    pub fn corrupt_next_compose(&self) {
        self.lock().faults.corrupt_next_compose = true;
    }

    /// Makes the next `times` deletions of `name` fail.
    pub fn fail_deletes(&self, name: &str, times: u32) {
        self.lock().faults.deletes.insert(name.to_string(), times);
    }

    /// Stores `data` under `name` directly.
    pub fn put(&self, name: &str, data: &[u8]) {
        self.lock().objects.insert(name.to_string(), data.to_vec());
    }

    /// Returns the content of `name`, if present.
    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(name).cloned()
    }

    /// Returns all object names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Returns every recorded call.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Returns the source lists of every compose call, in order.
    pub fn compose_calls(&self) -> Vec<Vec<String>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::Compose { sources, .. } => Some(sources.clone()),
                _ => None,
            })
            .collect()
    }
}

struct MemoryWriter {
    inner: Arc<Mutex<MemoryInner>>,
    name: String,
    buf: Vec<u8>,
    fault: Option<usize>,
}

impl ObjectWriter for MemoryWriter {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if let Some(limit) = self.fault
                && self.buf.len() + data.len() > limit
            {
                let accepted = limit.saturating_sub(self.buf.len());
                self.buf.extend_from_slice(&data[..accepted]);
                return Err(StoreError::Unavailable(format!(
                    "connection reset while writing {}",
                    self.name
                )));
            }
            self.buf.extend_from_slice(data);
            Ok(())
        })
    }

    fn close(self: Box<Self>) -> StoreFuture<'static, ObjectAttrs> {
        Box::pin(async move {
            let this = *self;
            let mut inner = this.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.calls.push(StoreCall::Close(this.name.clone()));
            let attrs = ObjectAttrs {
                name: this.name.clone(),
                size: this.buf.len() as u64,
                crc32c: Some(Crc32c::of(&this.buf)),
            };
            inner.objects.insert(this.name, this.buf);
            Ok(attrs)
        })
    }
}

impl BlobStore for MemoryStore {
    fn open_writer<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Box<dyn ObjectWriter>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(StoreCall::OpenWriter(name.to_string()));

            let mut fault = None;
            if let Some(f) = inner.faults.writes.get_mut(name)
                && f.remaining > 0
            {
                f.remaining -= 1;
                fault = Some(f.after_bytes);
            }
            trace!(object = %name, injected_fault = fault.is_some(), "memory writer opened");

            let writer: Box<dyn ObjectWriter> = Box::new(MemoryWriter {
                inner: Arc::clone(&self.inner),
                name: name.to_string(),
                buf: Vec::new(),
                fault,
            });
            Ok(writer)
        })
    }

    fn compose<'a>(
        &'a self,
        destination: &'a str,
        sources: &'a [String],
    ) -> StoreFuture<'a, ObjectAttrs> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(StoreCall::Compose {
                destination: destination.to_string(),
                sources: sources.to_vec(),
            });

            if sources.len() > inner.compose_limit {
                return Err(StoreError::ComposeLimit {
                    count: sources.len(),
                    limit: inner.compose_limit,
                });
            }
            if sources.is_empty() {
                return Err(StoreError::Rejected("compose requires at least one source".into()));
            }
            if let Some(transient) = inner.faults.composes.pop_front() {
                return Err(if transient {
                    StoreError::Unavailable(format!("compose into {destination} timed out"))
                } else {
                    StoreError::Rejected(format!("compose into {destination} rejected"))
                });
            }

            let mut content = Vec::new();
            for source in sources {
                let data = inner
                    .objects
                    .get(source)
                    .ok_or_else(|| StoreError::NotFound(source.clone()))?;
                content.extend_from_slice(data);
            }

            let mut crc = Crc32c::of(&content);
            if std::mem::take(&mut inner.faults.corrupt_next_compose) {
                crc = Crc32c(crc.value() ^ 0xdead_beef);
            }

            let attrs = ObjectAttrs {
                name: destination.to_string(),
                size: content.len() as u64,
                crc32c: Some(crc),
            };
            inner.objects.insert(destination.to_string(), content);
            Ok(attrs)
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(StoreCall::Delete(name.to_string()));

            if let Some(remaining) = inner.faults.deletes.get_mut(name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!("delete of {name} failed")));
            }
            inner.objects.remove(name);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectAttrs>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.calls.push(StoreCall::List(prefix.to_string()));
            Ok(inner
                .objects
                .range(prefix.to_string()..)
                .take_while(|(name, _)| name.starts_with(prefix))
                .map(|(name, data)| ObjectAttrs {
                    name: name.clone(),
                    size: data.len() as u64,
                    crc32c: Some(Crc32c::of(data)),
                })
                .collect())
        })
    }

    fn compose_limit(&self) -> usize {
        self.lock().compose_limit
    }

    fn location(&self) -> String {
        "memory://".into()
    }
}
