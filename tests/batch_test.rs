//! Batch upload integration tests
//!
//! Runs [`Uploader`] batches against the in-memory store from `common`.

mod common;

#[cfg(test)]
mod tests {
    use super::common::{entries_in, test_config, MemoryStore, FAIL_MARKER};
    use hakobu::upload::{into_input_order, ErrorKind, UploadError};
    use hakobu::{UploadRequest, Uploader};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn requests(bodies: &[&[u8]]) -> Vec<UploadRequest> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, body)| UploadRequest::from_bytes(format!("file-{i}.txt"), body.to_vec()))
            .collect()
    }

    // ========================================================================
    // OUTCOME CARDINALITY AND ORDER
    // ========================================================================

    /// Every input gets exactly one outcome, failures stay in their slot
    #[tokio::test]
    async fn test_one_outcome_per_input_with_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store.clone()).unwrap();

        let bodies: Vec<Vec<u8>> = (0..12)
            .map(|i| {
                if i % 4 == 1 {
                    [b"body ".as_slice(), FAIL_MARKER].concat()
                } else {
                    format!("body {i}").into_bytes()
                }
            })
            .collect();
        let refs: Vec<&[u8]> = bodies.iter().map(Vec::as_slice).collect();

        let outcomes = uploader.upload_concurrent_batch(requests(&refs)).await;

        assert_eq!(outcomes.len(), 12);
        for (i, outcome) in outcomes.iter().enumerate() {
            if i % 4 == 1 {
                assert_eq!(outcome.error().unwrap().kind(), ErrorKind::TransferFailed);
            } else {
                let url = outcome.url().expect("upload should succeed");
                assert_eq!(store.get(url).unwrap(), bodies[i]);
            }
        }
        assert_eq!(store.keys().len(), 9);
    }

    /// Three files, the second fails: success, failure, success
    #[tokio::test]
    async fn test_middle_failure_keeps_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store.clone()).unwrap();

        let outcomes = uploader
            .upload_concurrent_batch(requests(&[b"one", b"FAIL two", b"three"]))
            .await;

        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
        assert_eq!(store.get(outcomes[2].url().unwrap()).unwrap(), b"three");
    }

    /// An empty batch returns nothing and never calls the store
    #[tokio::test]
    async fn test_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store.clone()).unwrap();

        assert!(uploader.upload_concurrent_batch(Vec::new()).await.is_empty());
        assert!(uploader.upload_single_batch(Vec::new()).await.is_empty());
        assert_eq!(store.calls(), 0);
        assert_eq!(uploader.pool_stats().workers, 0);
    }

    /// Indexed outcomes cover every input index exactly once
    #[tokio::test]
    async fn test_indexed_outcomes_cover_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(5)));
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store).unwrap();

        let outcomes = uploader
            .upload_concurrent_batch_cancellable(
                requests(&[b"a", b"b", b"c", b"d", b"e"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut indices: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(into_input_order(outcomes).iter().all(|o| o.is_success()));
    }

    // ========================================================================
    // CONTENT AND STAGING
    // ========================================================================

    /// Uploaded bytes match the input, including a file large enough for
    /// the chunked path
    #[tokio::test]
    async fn test_round_trip_small_and_large() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store.clone()).unwrap();

        let small = b"tiny banner".to_vec();
        let large: Vec<u8> = (0..(3 * 1024 * 1024 / 2)).map(|i| (i % 251) as u8).collect();
        let outcomes = uploader
            .upload_concurrent_batch(vec![
                UploadRequest::from_bytes("small.txt", small.clone()),
                UploadRequest::from_bytes("large.bin", large.clone()),
            ])
            .await;

        assert_eq!(store.get(outcomes[0].url().unwrap()).unwrap(), small);
        assert_eq!(store.get(outcomes[1].url().unwrap()).unwrap(), large);
        assert_eq!(store.put_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.resumable_calls.load(Ordering::SeqCst), 1);
    }

    /// Keys live under the context path and keep the extension
    #[tokio::test]
    async fn test_keys_under_context_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store.clone()).unwrap();

        let outcomes = uploader
            .upload_concurrent_batch(vec![
                UploadRequest::from_bytes("photo.JPG", "x"),
                UploadRequest::from_bytes("README", "y"),
            ])
            .await;
        assert!(outcomes.iter().all(|o| o.is_success()));

        let keys = store.keys();
        assert!(keys.iter().all(|k| k.starts_with("uploads/")));
        assert!(keys.iter().any(|k| k.ends_with(".JPG")));
        assert!(keys.iter().any(|k| !k.contains('.')));
    }

    /// Staged copies are removed whether the upload succeeded or not
    #[tokio::test]
    async fn test_staging_dir_left_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let config = test_config(dir.path(), 2, 4);
        let uploader = Uploader::new(&config, store).unwrap();

        let outcomes = uploader
            .upload_concurrent_batch(requests(&[b"ok", b"FAIL", b"ok again"]))
            .await;
        assert_eq!(outcomes.len(), 3);

        assert_eq!(entries_in(&config.upload.staging_root.join("uploads")), 0);
    }

    /// An unreachable store fails every file as unavailable
    #[tokio::test]
    async fn test_unavailable_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::unavailable());
        let uploader = Uploader::new(&test_config(dir.path(), 1, 2), store.clone()).unwrap();

        let outcomes = uploader.upload_concurrent_batch(requests(&[b"a", b"b"])).await;

        assert!(outcomes
            .iter()
            .all(|o| o.error().map(UploadError::kind) == Some(ErrorKind::StoreUnavailable)));
        assert_eq!(store.put_calls.load(Ordering::SeqCst), 0);
    }

    // ========================================================================
    // CONCURRENCY
    // ========================================================================

    /// No more transfers run at once than the pool's max size
    #[tokio::test]
    async fn test_concurrency_bounded_by_pool() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(30)));
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store.clone()).unwrap();

        let bodies: Vec<Vec<u8>> = (0..20).map(|i| format!("f{i}").into_bytes()).collect();
        let refs: Vec<&[u8]> = bodies.iter().map(Vec::as_slice).collect();
        let outcomes = uploader.upload_concurrent_batch(requests(&refs)).await;

        assert!(outcomes.iter().all(|o| o.is_success()));
        assert!(store.peak_in_flight() <= 4);
        assert!(store.peak_in_flight() >= 2);
        assert!(uploader.pool_stats().peak_active <= 4);
    }

    /// Sequential mode never overlaps transfers
    #[tokio::test]
    async fn test_sequential_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_delay(Duration::from_millis(5)));
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store.clone()).unwrap();

        let outcomes = uploader
            .upload_single_batch(requests(&[b"a", b"FAIL", b"c"]))
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
        assert_eq!(store.peak_in_flight(), 1);
        assert_eq!(uploader.pool_stats().completed, 0);
    }

    /// The same pool serves consecutive batches
    #[tokio::test]
    async fn test_pool_reused_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(&test_config(dir.path(), 2, 2), store).unwrap();

        for _ in 0..3 {
            let outcomes = uploader
                .upload_concurrent_batch(requests(&[b"a", b"b", b"c"]))
                .await;
            assert!(outcomes.iter().all(|o| o.is_success()));
        }

        // Counters settle just after the last result is delivered
        let mut stats = uploader.pool_stats();
        for _ in 0..100 {
            if stats.completed == 9 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            stats = uploader.pool_stats();
        }
        assert_eq!(stats.completed, 9);
        assert!(stats.workers <= 2);
    }

    /// Cancelling mid-batch yields a batch-level interruption
    #[tokio::test]
    async fn test_cancellation_interrupts_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_delay(Duration::from_secs(2)));
        let uploader = Uploader::new(&test_config(dir.path(), 2, 4), store).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = uploader
            .upload_concurrent_batch_cancellable(requests(&[b"a", b"b", b"c"]), &cancel)
            .await;
        assert_eq!(result, Err(UploadError::BatchInterrupted));
    }
}
