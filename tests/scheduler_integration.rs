//! Scheduler integration tests: admission order, recovery, pause and resume,
//! retry budget, groups and retention against a real SQLite file.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use debrid_core::scheduler::RetryPolicy;
use debrid_core::store::{
    DownloadRepository, ExtractedFile, GroupStatus, ProgressSnapshot, StoreDbErrorKind, StoreError,
};
use debrid_core::transfer::temp_file_name;
use debrid_core::{Download, DownloadStatus, DownloadStore, EngineError, ServiceError};
use tokio_util::sync::CancellationToken;

mod support;
use support::engine::{CDN, Engine, Running, ScriptedTransport};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
}

fn is(status: DownloadStatus) -> impl Fn(&debrid_core::Download) -> bool {
    move |download| download.status() == status
}

#[tokio::test]
async fn test_single_slot_runs_downloads_in_creation_order() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    let names = ["a.bin", "b.bin", "c.bin"];
    let mut ids = Vec::new();
    for name in names {
        engine.transport.serve(name, &payload(300));
        ids.push(engine.queue(name).await);
    }

    let running = Running::start(engine.scheduler(1));
    for id in &ids {
        engine.wait_for(*id, is(DownloadStatus::Completed)).await;
    }
    running.stop().await;

    let opened: Vec<String> = engine.transport.opened().into_iter().map(|(url, _)| url).collect();
    let expected: Vec<String> = names.iter().map(|name| format!("{CDN}/{name}")).collect();
    assert_eq!(opened, expected);

    for name in names {
        let written = std::fs::read(engine.paths.base().join(name)).unwrap();
        assert_eq!(written, payload(300));
    }
}

#[tokio::test]
async fn test_orphans_are_recovered_in_creation_order() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    let mut ids = Vec::new();
    for name in ["one.bin", "two.bin", "three.bin"] {
        engine.transport.serve(name, &payload(128));
        ids.push(engine.queue(name).await);
    }
    // A previous process claimed everything and died.
    for _ in 0..3 {
        engine.store.claim_next_pending().await.unwrap().unwrap();
    }

    let scheduler = engine.scheduler(1);
    let handle = scheduler.handle();
    let running = Running::start(scheduler);
    for id in &ids {
        engine.wait_for(*id, is(DownloadStatus::Completed)).await;
    }
    running.stop().await;

    assert_eq!(handle.stats().recovered(), 3);
    assert_eq!(handle.stats().completed(), 3);
    let opened: Vec<String> = engine.transport.opened().into_iter().map(|(url, _)| url).collect();
    assert_eq!(
        opened,
        vec![
            format!("{CDN}/one.bin"),
            format!("{CDN}/two.bin"),
            format!("{CDN}/three.bin"),
        ]
    );
}

#[tokio::test]
async fn test_pause_keeps_bytes_and_resume_continues_with_range() {
    let engine = Engine::new(ScriptedTransport::new(8, Duration::from_millis(5))).await;
    let data = payload(800);
    engine.transport.serve("movie.mkv", &data);
    let id = engine.queue("movie.mkv").await;

    let scheduler = engine.scheduler(1);
    let service = engine.service(&scheduler);
    let running = Running::start(scheduler);

    engine
        .wait_for(id, |d| {
            d.status() == DownloadStatus::Downloading && d.downloaded_bytes > 0
        })
        .await;
    service.pause(id).await.unwrap();

    let paused = engine.download(id).await;
    assert_eq!(paused.status(), DownloadStatus::Paused);
    assert!(paused.paused_at.is_some());
    let offset = paused.resume_offset();
    assert!(offset > 0 && offset < 800, "offset {offset}");

    // Paused rows are never claimed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.download(id).await.status(), DownloadStatus::Paused);
    assert_eq!(engine.transport.opened().len(), 1);

    service.resume(id).await.unwrap();
    let done = engine.wait_for(id, is(DownloadStatus::Completed)).await;
    running.stop().await;

    assert_eq!(done.downloaded_bytes, 800);
    assert_eq!(engine.transport.opened()[1].1, offset);
    let written = std::fs::read(engine.paths.base().join("movie.mkv")).unwrap();
    assert_eq!(written, data);
}

#[tokio::test]
async fn test_shutdown_leaves_row_downloading_for_next_start() {
    let engine = Engine::new(ScriptedTransport::new(8, Duration::from_millis(5))).await;
    let data = payload(640);
    engine.transport.serve("show.mkv", &data);
    let id = engine.queue("show.mkv").await;

    let running = Running::start(engine.scheduler(1));
    engine
        .wait_for(id, |d| {
            d.status() == DownloadStatus::Downloading && d.downloaded_bytes > 0
        })
        .await;
    running.stop().await;

    let stopped = engine.download(id).await;
    assert_eq!(stopped.status(), DownloadStatus::Downloading);
    assert!(stopped.downloaded_bytes > 0);

    let running = Running::start(engine.scheduler(1));
    engine.wait_for(id, is(DownloadStatus::Completed)).await;
    running.stop().await;

    let opened = engine.transport.opened();
    assert_eq!(opened.len(), 2);
    assert!(opened[1].1 > 0);
    let written = std::fs::read(engine.paths.base().join("show.mkv")).unwrap();
    assert_eq!(written, data);
}

#[tokio::test]
async fn test_failure_waits_for_explicit_retry_until_budget_is_spent() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    // Nothing is served, so every attempt answers 404.
    let id = engine.queue("gone.bin").await;

    let scheduler = engine.scheduler(2);
    let service = engine
        .service(&scheduler)
        .with_retry_policy(RetryPolicy::with_max_retries(2));
    let running = Running::start(scheduler);

    let failed = engine.wait_for(id, is(DownloadStatus::Failed)).await;
    assert!(failed.error_message.contains("404"), "{}", failed.error_message);
    assert_eq!(failed.retry_count, 0);

    // Failed rows are not picked up again on their own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.transport.opened().len(), 1);

    for attempt in 1..=2 {
        service.retry(id).await.unwrap();
        engine
            .wait_for(id, |d| {
                d.status() == DownloadStatus::Failed && d.retry_count == attempt
            })
            .await;
    }
    let result = service.retry(id).await;
    running.stop().await;

    assert!(matches!(
        result,
        Err(ServiceError::RetryExhausted { max_retries: 2, .. })
    ));
    assert_eq!(engine.transport.opened().len(), 3);
}

#[tokio::test]
async fn test_group_completes_when_every_member_completes() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    let links: Vec<String> = ["s01e01.mkv", "s01e02.mkv", "s01e03.mkv"]
        .iter()
        .map(|name| {
            engine.transport.serve(name, &payload(200));
            format!("https://hoster.example/{name}")
        })
        .collect();

    let scheduler = engine.scheduler(2);
    let service = engine.service(&scheduler);
    let running = Running::start(scheduler);

    let submission = service.submit(&links, Some("series")).await.unwrap();
    let group_id = submission.group_id.clone().unwrap();
    for id in &submission.download_ids {
        engine.wait_for(*id, is(DownloadStatus::Completed)).await;
    }
    running.stop().await;

    let group = service.group(&group_id).await.unwrap().unwrap();
    assert_eq!(group.status(), GroupStatus::Completed);
    assert_eq!(group.total_downloads, 3);
    assert_eq!(group.completed_downloads, 3);
    assert!(engine.paths.base().join("series/s01e02.mkv").exists());
}

#[tokio::test]
async fn test_group_fails_when_one_member_fails() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    engine.transport.serve("part1.bin", &payload(100));
    engine.transport.serve("part3.bin", &payload(100));
    let links: Vec<String> = ["part1.bin", "part2.bin", "part3.bin"]
        .iter()
        .map(|name| format!("https://hoster.example/{name}"))
        .collect();

    let scheduler = engine.scheduler(1);
    let service = engine.service(&scheduler);
    let running = Running::start(scheduler);

    let submission = service.submit(&links, None).await.unwrap();
    let ids = submission.download_ids.clone();
    engine.wait_for(ids[0], is(DownloadStatus::Completed)).await;
    engine.wait_for(ids[1], is(DownloadStatus::Failed)).await;
    engine.wait_for(ids[2], is(DownloadStatus::Completed)).await;
    running.stop().await;

    let group = service
        .group(submission.group_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.status(), GroupStatus::Failed);
    assert_eq!(group.completed_downloads, 3);
    assert!(group.processing_error.contains("404"), "{}", group.processing_error);
}

#[tokio::test]
async fn test_rar_volumes_complete_with_unsupported_format_warning() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    let links: Vec<String> = ["Show.S01.part1.rar", "Show.S01.part2.rar"]
        .iter()
        .map(|name| {
            engine.transport.serve(name, &payload(300));
            format!("https://hoster.example/{name}")
        })
        .collect();

    let scheduler = engine.scheduler(2);
    let service = engine.service(&scheduler);
    let running = Running::start(scheduler);

    let submission = service.submit(&links, Some("series")).await.unwrap();
    for id in &submission.download_ids {
        let done = engine.wait_for(*id, is(DownloadStatus::Completed)).await;
        assert!(done.is_archive);
    }
    running.stop().await;

    let group = service
        .group(submission.group_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.completed_downloads, 2);
    assert!(
        group.processing_error.contains("unsupported archive format 'rar'"),
        "{}",
        group.processing_error
    );
    assert!(engine.paths.base().join("series/Show.S01.part1.rar").exists());
    assert!(engine.paths.base().join("series/Show.S01.part2.rar").exists());
}

#[tokio::test]
async fn test_retention_spares_old_paused_downloads() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    let finished = engine.queue("old-finished.bin").await;
    let paused = engine.queue("old-paused.bin").await;
    let fresh = engine.queue("fresh-finished.bin").await;

    let mut leases = HashMap::new();
    for _ in 0..3 {
        let claimed = engine.store.claim_next_pending().await.unwrap().unwrap();
        leases.insert(claimed.id, claimed.lease);
    }
    assert!(engine.store.mark_completed(finished, leases[&finished], 10).await.unwrap());
    assert!(engine.store.mark_paused(paused).await.unwrap());
    assert!(engine.store.mark_completed(fresh, leases[&fresh], 10).await.unwrap());

    sqlx::query(
        "UPDATE downloads SET created_at = datetime('now', '-40 days') WHERE id IN (?, ?)",
    )
    .bind(finished)
    .bind(paused)
    .execute(engine.store.database().pool())
    .await
    .unwrap();

    let removed = engine.scheduler(1).run_retention().await.unwrap();

    assert_eq!(removed, 1);
    assert!(engine.store.get_download(finished).await.unwrap().is_none());
    assert_eq!(engine.download(paused).await.status(), DownloadStatus::Paused);
    assert_eq!(engine.download(fresh).await.status(), DownloadStatus::Completed);
}

#[tokio::test]
async fn test_pause_and_resume_from_another_process_never_overlap_streams() {
    let engine = Engine::new(ScriptedTransport::new(64, Duration::from_millis(5))).await;
    let data = payload(64 * 120);
    let url = engine.transport.serve("remote.bin", &data);
    let id = engine.queue("remote.bin").await;
    let running = Running::start(engine.scheduler(1));
    let remote = engine.remote_service().await;

    engine
        .wait_for(id, |d| {
            d.status() == DownloadStatus::Downloading && d.downloaded_bytes > 0
        })
        .await;
    remote.pause(id).await.unwrap();
    let paused = engine.download(id).await;
    assert_eq!(paused.status(), DownloadStatus::Paused);
    assert!(!paused.transfer_active, "pause returned before the worker let go");
    remote.resume(id).await.unwrap();

    let done = engine.wait_for(id, is(DownloadStatus::Completed)).await;
    running.stop().await;

    assert_eq!(engine.transport.max_concurrent_streams(&url), 1);
    let offsets: Vec<u64> = engine.transport.opened().into_iter().map(|(_, at)| at).collect();
    assert_eq!(offsets, vec![0, paused.resume_offset()]);
    assert!(paused.resume_offset() > 0);
    assert_eq!(done.lease, 2);
    let written = std::fs::read(engine.paths.base().join("remote.bin")).unwrap();
    assert_eq!(written, data);
}

#[tokio::test]
async fn test_cancel_from_another_process_stops_worker_before_cleanup() {
    let engine = Engine::new(ScriptedTransport::new(64, Duration::from_millis(5))).await;
    engine.transport.serve("doomed.bin", &payload(64 * 200));
    let id = engine.queue("doomed.bin").await;
    let running = Running::start(engine.scheduler(1));
    let remote = engine.remote_service().await;

    engine
        .wait_for(id, |d| {
            d.status() == DownloadStatus::Downloading && d.downloaded_bytes > 0
        })
        .await;
    remote.cancel(id).await.unwrap();

    let temp = engine.paths.base().join(temp_file_name(id));
    assert!(engine.store.get_download(id).await.unwrap().is_none());
    assert!(!temp.exists());
    // The worker must not recreate the temp file after cleanup.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!temp.exists());
    running.stop().await;
    assert_eq!(engine.transport.opened().len(), 1);
}

#[tokio::test]
async fn test_empty_file_completes_with_zero_progress() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    engine.transport.serve("empty.txt", b"");
    let id = engine.queue("empty.txt").await;

    let running = Running::start(engine.scheduler(1));
    let done = engine.wait_for(id, is(DownloadStatus::Completed)).await;
    running.stop().await;

    assert_eq!(done.downloaded_bytes, 0);
    assert!(done.progress.abs() < f64::EPSILON);
    assert!(!done.transfer_active);
    let written = std::fs::metadata(engine.paths.base().join("empty.txt")).unwrap();
    assert_eq!(written.len(), 0);
}

/// Delegates to the store but fails the first `failures` claims.
struct ContendedClaims {
    store: DownloadStore,
    failures: AtomicUsize,
    kind: StoreDbErrorKind,
}

impl ContendedClaims {
    fn new(store: DownloadStore, failures: usize, kind: StoreDbErrorKind) -> Self {
        Self {
            store,
            failures: AtomicUsize::new(failures),
            kind,
        }
    }
}

#[async_trait]
impl DownloadRepository for ContendedClaims {
    async fn get_download(&self, id: i64) -> Result<Option<Download>, StoreError> {
        self.store.get_download(id).await
    }

    async fn claim_next_pending(&self) -> Result<Option<Download>, StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Database {
                kind: self.kind,
                message: "database is locked".to_string(),
            });
        }
        self.store.claim_next_pending().await
    }

    async fn update_progress(
        &self,
        id: i64,
        lease: i64,
        snapshot: &ProgressSnapshot,
    ) -> Result<bool, StoreError> {
        self.store.update_progress(id, lease, snapshot).await
    }

    async fn save_partial_progress(
        &self,
        id: i64,
        lease: i64,
        downloaded_bytes: u64,
        file_size: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.store
            .save_partial_progress(id, lease, downloaded_bytes, file_size)
            .await
    }

    async fn mark_completed(
        &self,
        id: i64,
        lease: i64,
        final_bytes: u64,
    ) -> Result<bool, StoreError> {
        self.store.mark_completed(id, lease, final_bytes).await
    }

    async fn mark_failed(&self, id: i64, lease: i64, error: &str) -> Result<bool, StoreError> {
        self.store.mark_failed(id, lease, error).await
    }

    async fn release_transfer(&self, id: i64, lease: i64) -> Result<bool, StoreError> {
        self.store.release_transfer(id, lease).await
    }

    async fn add_extracted_file(
        &self,
        download_id: i64,
        file_path: &str,
    ) -> Result<i64, StoreError> {
        self.store.add_extracted_file(download_id, file_path).await
    }

    async fn list_live_extracted_files(
        &self,
        download_id: i64,
    ) -> Result<Vec<ExtractedFile>, StoreError> {
        self.store.list_live_extracted_files(download_id).await
    }

    async fn mark_extracted_file_deleted(&self, id: i64) -> Result<bool, StoreError> {
        self.store.mark_extracted_file_deleted(id).await
    }
}

#[tokio::test]
async fn test_locked_database_does_not_stop_the_loop() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    engine.transport.serve("late.bin", &payload(200));
    let id = engine.queue("late.bin").await;
    let claims = ContendedClaims::new(engine.store.clone(), 3, StoreDbErrorKind::BusyOrLocked);

    let running = Running::start(engine.scheduler(1).with_repository(Arc::new(claims)));
    engine.wait_for(id, is(DownloadStatus::Completed)).await;
    running.stop().await;
}

#[tokio::test]
async fn test_non_transient_claim_error_stops_the_loop() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    engine.queue("never.bin").await;
    let claims = ContendedClaims::new(engine.store.clone(), 1, StoreDbErrorKind::Other);
    let scheduler = engine.scheduler(1).with_repository(Arc::new(claims));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        scheduler.run(CancellationToken::new()),
    )
    .await
    .unwrap();

    assert!(matches!(result, Err(EngineError::Store(_))));
}
