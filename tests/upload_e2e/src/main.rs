fn main() {
    println!("Run `cargo test -p upload-e2e` to execute the end-to-end upload tests.");
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use snapvault_store::{
        BlobStore, Crc32c, DirStore, MemoryStore, ObjectAttrs, ObjectWriter, StoreError,
        StoreFuture,
    };
    use snapvault_upload::{
        PART_SEPARATOR, SessionState, UploadConfig, UploadError, UploadEvent, UploadSession,
        chunk_object_name,
    };

    const DEST: &str = "2024-05-01T12-00-00.sparseimage";

    fn config(chunk_size: u64, compose_limit: usize) -> UploadConfig {
        UploadConfig {
            chunk_size,
            compose_limit,
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 50,
            jitter: false,
            buffer_size: 7,
            ..UploadConfig::default()
        }
    }

    fn image(len: usize) -> Vec<u8> {
        // Deterministic, non-repeating at chunk boundaries.
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state >> 24) as u8
            })
            .collect()
    }

    async fn temp_objects(store: &dyn BlobStore) -> Vec<String> {
        store
            .list(&format!("{DEST}{PART_SEPARATOR}"))
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect()
    }

    async fn run(
        store: Arc<dyn BlobStore>,
        config: UploadConfig,
        data: &[u8],
    ) -> (Result<snapvault_upload::UploadReport, UploadError>, SessionState) {
        let mut session = UploadSession::new(store, DEST, config);
        let result = session
            .run(&mut Cursor::new(data.to_vec()), data.len() as u64)
            .await;
        (result, session.state())
    }

    // -----------------------------------------------------------------------
    // Store wrappers
    // -----------------------------------------------------------------------

    /// Checks after every compose that the destination holds a prefix of
    /// the image made of exactly the bytes written so far.
    struct PrefixChecker {
        inner: MemoryStore,
        image: Vec<u8>,
        violations: Mutex<Vec<String>>,
    }

    impl BlobStore for PrefixChecker {
        fn open_writer<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Box<dyn ObjectWriter>> {
            self.inner.open_writer(name)
        }

        fn compose<'a>(
            &'a self,
            destination: &'a str,
            sources: &'a [String],
        ) -> StoreFuture<'a, ObjectAttrs> {
            Box::pin(async move {
                let attrs = self.inner.compose(destination, sources).await?;
                let content = self.inner.object(destination).unwrap_or_default();
                if !self.image.starts_with(&content) {
                    self.violations
                        .lock()
                        .unwrap()
                        .push(format!("destination is not a prefix after {sources:?}"));
                }
                Ok(attrs)
            })
        }

        fn delete<'a>(&'a self, name: &'a str) -> StoreFuture<'a, ()> {
            self.inner.delete(name)
        }

        fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectAttrs>> {
            self.inner.list(prefix)
        }

        fn compose_limit(&self) -> usize {
            self.inner.compose_limit()
        }

        fn location(&self) -> String {
            self.inner.location()
        }
    }

    /// Reports no checksum for any object.
    struct NoDigest(MemoryStore);

    struct NoDigestWriter(Box<dyn ObjectWriter>);

    impl ObjectWriter for NoDigestWriter {
        fn write<'a>(&'a mut self, data: &'a [u8]) -> StoreFuture<'a, ()> {
            self.0.write(data)
        }

        fn close(self: Box<Self>) -> StoreFuture<'static, ObjectAttrs> {
            let NoDigestWriter(inner) = *self;
            Box::pin(async move {
                let attrs = inner.close().await?;
                Ok(ObjectAttrs {
                    crc32c: None,
                    ..attrs
                })
            })
        }
    }

    impl BlobStore for NoDigest {
        fn open_writer<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Box<dyn ObjectWriter>> {
            Box::pin(async move {
                let writer = self.0.open_writer(name).await?;
                let writer: Box<dyn ObjectWriter> = Box::new(NoDigestWriter(writer));
                Ok(writer)
            })
        }

        fn compose<'a>(
            &'a self,
            destination: &'a str,
            sources: &'a [String],
        ) -> StoreFuture<'a, ObjectAttrs> {
            Box::pin(async move {
                let attrs = self.0.compose(destination, sources).await?;
                Ok(ObjectAttrs {
                    crc32c: None,
                    ..attrs
                })
            })
        }

        fn delete<'a>(&'a self, name: &'a str) -> StoreFuture<'a, ()> {
            self.0.delete(name)
        }

        fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectAttrs>> {
            self.0.list(prefix)
        }

        fn location(&self) -> String {
            self.0.location()
        }
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn uploads_are_byte_exact_across_sizes() {
        for len in [1usize, 9, 10, 11, 39, 40, 41, 95, 250] {
            let data = image(len);
            let store = MemoryStore::new();
            let (result, state) = run(Arc::new(store.clone()), config(10, 4), &data).await;
            let report = result.unwrap_or_else(|e| panic!("len {len}: {e}"));

            assert_eq!(state, SessionState::Verified);
            assert_eq!(report.digest, Crc32c::of(&data), "len {len}");
            assert_eq!(report.chunks, len.div_ceil(10), "len {len}");
            assert_eq!(store.object(DEST).unwrap(), data, "len {len}");
            assert!(temp_objects(&store).await.is_empty(), "len {len}");
        }
    }

    #[tokio::test]
    async fn destination_is_always_a_valid_prefix() {
        let data = image(137);
        let checker = Arc::new(PrefixChecker {
            inner: MemoryStore::new(),
            image: data.clone(),
            violations: Mutex::new(Vec::new()),
        });
        let (result, _) = run(checker.clone(), config(8, 3), &data).await;
        result.unwrap();

        assert!(checker.violations.lock().unwrap().is_empty());
        assert_eq!(checker.inner.object(DEST).unwrap(), data);
    }

    #[tokio::test]
    async fn compose_fan_in_is_bounded_and_destination_leads() {
        let limit = 4;
        let data = image(10 * 11 + 3);
        let store = MemoryStore::new();
        let (result, _) = run(Arc::new(store.clone()), config(10, limit), &data).await;
        let report = result.unwrap();

        let rounds = store.compose_calls();
        assert_eq!(rounds.len(), report.compose_rounds);
        for (i, inputs) in rounds.iter().enumerate() {
            assert!(inputs.len() <= limit, "round {i} has {} inputs", inputs.len());
            if i == 0 {
                assert!(!inputs.contains(&DEST.to_string()));
            } else {
                assert_eq!(inputs[0], DEST, "round {i}");
                assert_eq!(inputs.iter().filter(|n| *n == DEST).count(), 1);
            }
        }

        // Every chunk is composed exactly once, in upload order.
        let chunks: Vec<&String> = rounds.iter().flatten().filter(|n| *n != DEST).collect();
        let expected: Vec<String> = (0..12).map(|i| chunk_object_name(DEST, i * 10)).collect();
        assert_eq!(chunks, expected.iter().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn store_limit_caps_configured_limit() {
        let data = image(100);
        let store = MemoryStore::new().with_compose_limit(3);
        let (result, _) = run(Arc::new(store.clone()), config(10, 32), &data).await;
        result.unwrap();
        assert!(store.compose_calls().iter().all(|inputs| inputs.len() <= 3));
    }

    #[tokio::test]
    async fn empty_source_writes_verified_empty_destination() {
        let store = MemoryStore::new();
        let (result, state) = run(Arc::new(store.clone()), config(10, 4), &[]).await;
        let report = result.unwrap();

        assert_eq!(state, SessionState::Verified);
        assert_eq!(report.digest, Crc32c(0));
        assert_eq!(report.chunks, 0);
        assert!(store.compose_calls().is_empty());
        assert_eq!(store.object(DEST), Some(Vec::new()));
        assert!(temp_objects(&store).await.is_empty());
    }

    #[tokio::test]
    async fn absent_remote_digest_is_integrity_failure() {
        for len in [0usize, 25] {
            let store = MemoryStore::new();
            let (result, state) =
                run(Arc::new(NoDigest(store.clone())), config(10, 4), &image(len)).await;

            assert_eq!(state, SessionState::Failed, "len {len}");
            match result.unwrap_err() {
                UploadError::Integrity { remote, local, .. } => {
                    assert_eq!(remote, None);
                    assert_eq!(local, Crc32c::of(&image(len)));
                }
                other => panic!("len {len}: expected integrity error, got {other:?}"),
            }
            // The destination is kept for inspection.
            assert!(store.object(DEST).is_some(), "len {len}");
        }
    }

    #[tokio::test]
    async fn exact_fan_in_multiple_composes_once() {
        let (chunk, limit) = (16u64, 5usize);
        let data = image(chunk as usize * limit);
        let store = MemoryStore::new();
        let (result, _) = run(Arc::new(store.clone()), config(chunk, limit), &data).await;
        let report = result.unwrap();

        assert_eq!(report.compose_rounds, 1);
        assert_eq!(store.compose_calls().len(), 1);
        assert_eq!(store.compose_calls()[0].len(), limit);
        assert_eq!(report.digest, Crc32c::of(&data));
    }

    #[tokio::test]
    async fn one_byte_past_fan_in_needs_second_round() {
        let (chunk, limit) = (16u64, 5usize);
        let len = chunk as usize * limit + 1;
        let data = image(len);
        let store = MemoryStore::new();
        let (result, _) = run(Arc::new(store.clone()), config(chunk, limit), &data).await;
        let report = result.unwrap();

        assert_eq!(report.compose_rounds, 2);
        let rounds = store.compose_calls();
        assert_eq!(
            rounds[1],
            vec![
                DEST.to_string(),
                chunk_object_name(DEST, chunk * limit as u64)
            ]
        );
        assert_eq!(store.object(DEST).unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_chunk_failures_are_absorbed() {
        let data = image(50);
        let store = MemoryStore::new();
        store.fail_writes(&chunk_object_name(DEST, 20), 2, 3);

        let mut session = UploadSession::new(Arc::new(store.clone()), DEST, config(10, 4));
        let mut rx = session.take_events().unwrap();
        session
            .run(&mut Cursor::new(data.clone()), 50)
            .await
            .unwrap();

        assert_eq!(store.object(DEST).unwrap(), data);
        let mut retries = 0;
        let mut chunk_attempts = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                UploadEvent::Retrying { .. } => retries += 1,
                UploadEvent::ChunkUploaded {
                    offset: 20,
                    attempts,
                    ..
                } => chunk_attempts = Some(attempts),
                _ => {}
            }
        }
        assert_eq!(retries, 2);
        assert_eq!(chunk_attempts, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_chunk_failure_fails_and_cleans_up() {
        let data = image(95);
        let store = MemoryStore::new();
        let failing = chunk_object_name(DEST, 60);
        store.fail_writes(&failing, 3, 4);

        let (result, state) = run(Arc::new(store.clone()), config(10, 4), &data).await;

        assert_eq!(state, SessionState::Failed);
        match result.unwrap_err() {
            UploadError::Transfer {
                object,
                offset,
                attempts,
                source,
            } => {
                assert_eq!(object, failing);
                assert_eq!(offset, 60);
                assert_eq!(attempts, 3);
                assert!(source.is_transient());
            }
            other => panic!("expected transfer error, got {other:?}"),
        }

        // Six chunks were written before the failure; none survive.
        assert!(temp_objects(&store).await.is_empty());
        let deleted = store
            .calls()
            .into_iter()
            .filter(|c| matches!(c, snapvault_store::StoreCall::Delete(_)))
            .count();
        assert_eq!(deleted, 7);
        // The partial destination from the first compose round is kept.
        assert_eq!(store.object(DEST).unwrap(), data[..40].to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_compose_fails_and_cleans_up() {
        let data = image(30);
        let store = MemoryStore::new();
        store.fail_next_compose(false);

        let (result, state) = run(Arc::new(store.clone()), config(10, 4), &data).await;
        assert_eq!(state, SessionState::Failed);
        assert!(matches!(
            result.unwrap_err(),
            UploadError::Compose {
                attempts: 1,
                source: StoreError::Rejected(_),
                ..
            }
        ));
        assert!(temp_objects(&store).await.is_empty());
        assert!(store.object(DEST).is_none());
    }

    #[tokio::test]
    async fn corrupted_compose_digest_is_integrity_failure() {
        let data = image(30);
        let store = MemoryStore::new();
        store.corrupt_next_compose();

        let (result, state) = run(Arc::new(store.clone()), config(10, 4), &data).await;

        assert_eq!(state, SessionState::Failed);
        let err = result.unwrap_err();
        assert!(err.is_integrity(), "{err:?}");
        // Not auto-deleted.
        assert_eq!(store.object(DEST).unwrap(), data);
        assert!(temp_objects(&store).await.is_empty());
    }

    #[tokio::test]
    async fn directory_store_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::new(tmp.path()).with_compose_limit(3);
        let data = image(1000);

        let (result, state) = run(Arc::new(store.clone()), config(64, 8), &data).await;
        let report = result.unwrap();

        assert_eq!(state, SessionState::Verified);
        assert_eq!(report.digest, Crc32c::of(&data));
        assert_eq!(std::fs::read(tmp.path().join(DEST)).unwrap(), data);
        let names: Vec<String> = store
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec![DEST.to_string()]);
    }
}
