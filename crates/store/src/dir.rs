//! Directory-backed blob store.
//!
//! Each object is a file under the root directory. Writes and composes are
//! staged in hidden files and renamed into place, so readers never observe a
//! half-written object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    BlobStore, Crc32cHasher, DEFAULT_COMPOSE_LIMIT, ObjectAttrs, ObjectWriter, StoreError,
    StoreFuture, validate_object_name,
};

/// Prefix of in-flight staging files. Hidden from listings.
const STAGING_PREFIX: &str = ".snapvault-staging-";

const COPY_BUFFER: usize = 256 * 1024;

/// Blob store rooted at a local (or network-mounted) directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
    compose_limit: usize,
}

impl DirStore {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            compose_limit: DEFAULT_COMPOSE_LIMIT,
        }
    }

    /// Overrides the compose fan-in limit.
    pub fn with_compose_limit(mut self, limit: usize) -> Self {
        self.compose_limit = limit;
        self
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_object_name(name)?;
        if name.starts_with(STAGING_PREFIX) {
            return Err(StoreError::InvalidName(format!("reserved prefix: {name}")));
        }
        Ok(self.root.join(name))
    }

    async fn create_staging(&self) -> Result<(File, Staging), StoreError> {
        fs::create_dir_all(&self.root).await?;
        let path = self
            .root
            .join(format!("{STAGING_PREFIX}{}", uuid::Uuid::new_v4()));
        let file = File::create(&path).await?;
        Ok((file, Staging { path, armed: true }))
    }
}

/// Removes a staging file on drop unless it was committed.
struct Staging {
    path: PathBuf,
    armed: bool,
}

impl Staging {
    async fn commit(&mut self, target: &Path) -> Result<(), StoreError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&self.path, target).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove staging file");
        }
    }
}

struct DirWriter {
    name: String,
    target: PathBuf,
    file: File,
    staging: Staging,
    hasher: Crc32cHasher,
}

impl ObjectWriter for DirWriter {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.file.write_all(data).await?;
            self.hasher.update(data);
            Ok(())
        })
    }

    fn close(self: Box<Self>) -> StoreFuture<'static, ObjectAttrs> {
        Box::pin(async move {
            let mut this = self;
            this.file.flush().await?;
            this.file.sync_all().await?;
            this.staging.commit(&this.target).await?;
            debug!(object = %this.name, size = this.hasher.len(), "object written");
            Ok(ObjectAttrs {
                name: this.name.clone(),
                size: this.hasher.len(),
                crc32c: Some(this.hasher.finalize()),
            })
        })
    }
}

impl BlobStore for DirStore {
    fn open_writer<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Box<dyn ObjectWriter>> {
        Box::pin(async move {
            let target = self.object_path(name)?;
            let (file, staging) = self.create_staging().await?;
            let writer: Box<dyn ObjectWriter> = Box::new(DirWriter {
                name: name.to_string(),
                target,
                file,
                staging,
                hasher: Crc32cHasher::new(),
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
            if sources.len() > self.compose_limit {
                return Err(StoreError::ComposeLimit {
                    count: sources.len(),
                    limit: self.compose_limit,
                });
            }
            if sources.is_empty() {
                return Err(StoreError::Rejected(
                    "compose requires at least one source".into(),
                ));
            }

            let target = self.object_path(destination)?;
            let (mut out, mut staging) = self.create_staging().await?;
            let mut hasher = Crc32cHasher::new();
            let mut buf = vec![0u8; COPY_BUFFER];

            for source in sources {
                let path = self.object_path(source)?;
                let mut input = match File::open(&path).await {
                    Ok(f) => f,
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        return Err(StoreError::NotFound(source.clone()));
                    }
                    Err(e) => return Err(e.into()),
                };
                loop {
                    let n = input.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n]).await?;
                    hasher.update(&buf[..n]);
                }
            }

            out.flush().await?;
            out.sync_all().await?;
            drop(out);
            staging.commit(&target).await?;

            debug!(
                destination,
                sources = sources.len(),
                size = hasher.len(),
                "objects composed"
            );
            Ok(ObjectAttrs {
                name: destination.to_string(),
                size: hasher.len(),
                crc32c: Some(hasher.finalize()),
            })
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.object_path(name)?;
            match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectAttrs>> {
        Box::pin(async move {
            let mut objects = Vec::new();
            let mut pending = vec![self.root.clone()];

            while let Some(dir) = pending.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    let file_type = entry.file_type().await?;
                    let path = entry.path();
                    if file_type.is_dir() {
                        pending.push(path);
                        continue;
                    }
                    if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                        continue;
                    }
                    let Ok(relative) = path.strip_prefix(&self.root) else {
                        continue;
                    };
                    let name = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if !name.starts_with(prefix) {
                        continue;
                    }
                    let size = entry.metadata().await?.len();
                    objects.push(ObjectAttrs {
                        name,
                        size,
                        crc32c: None,
                    });
                }
            }

            objects.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(objects)
        })
    }

    fn compose_limit(&self) -> usize {
        self.compose_limit
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Crc32c;

    async fn write_object(store: &DirStore, name: &str, data: &[u8]) -> ObjectAttrs {
        let mut w = store.open_writer(name).await.unwrap();
        w.write(data).await.unwrap();
        w.close().await.unwrap()
    }

    fn staging_files(root: &Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(STAGING_PREFIX)
            })
            .count()
    }

    #[tokio::test]
    async fn writer_renames_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());

        let attrs = write_object(&store, "snap.part.0", b"hello").await;
        assert_eq!(attrs.size, 5);
        assert_eq!(attrs.crc32c, Some(Crc32c::of(b"hello")));
        assert_eq!(std::fs::read(dir.path().join("snap.part.0")).unwrap(), b"hello");
        assert_eq!(staging_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn dropped_writer_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());

        let mut w = store.open_writer("snap.part.0").await.unwrap();
        w.write(b"partial").await.unwrap();
        drop(w);

        assert!(!dir.path().join("snap.part.0").exists());
        assert_eq!(staging_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn compose_appends_to_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());

        write_object(&store, "p0", b"abc").await;
        write_object(&store, "p1", b"def").await;
        store
            .compose("snap", &["p0".to_string(), "p1".to_string()])
            .await
            .unwrap();

        write_object(&store, "p2", b"g").await;
        let attrs = store
            .compose("snap", &["snap".to_string(), "p2".to_string()])
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("snap")).unwrap(), b"abcdefg");
        assert_eq!(attrs.size, 7);
        assert_eq!(attrs.crc32c, Some(Crc32c::of(b"abcdefg")));
    }

    #[tokio::test]
    async fn compose_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        let err = store.compose("snap", &["gone".to_string()]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(name) if name == "gone"));
        assert_eq!(staging_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn compose_over_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path()).with_compose_limit(2);
        let sources: Vec<String> = (0..3).map(|i| format!("p{i}")).collect();
        let err = store.compose("snap", &sources).await.unwrap_err();
        assert!(matches!(err, StoreError::ComposeLimit { count: 3, limit: 2 }));
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        write_object(&store, "a", b"1").await;
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn list_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        write_object(&store, "host/snap.part.0", b"1").await;
        write_object(&store, "host/snap.part.8", b"22").await;
        write_object(&store, "other", b"3").await;

        let listed = store.list("host/snap.part.").await.unwrap();
        let names: Vec<&str> = listed.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["host/snap.part.0", "host/snap.part.8"]);
        assert_eq!(listed[1].size, 2);
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path().join("not-yet"));
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path());
        assert!(matches!(
            store.open_writer("../escape").await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.delete(".snapvault-staging-x").await,
            Err(StoreError::InvalidName(_))
        ));
    }
}
