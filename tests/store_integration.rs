//! Store behavior under concurrent access to one database file.

use std::collections::HashSet;

use debrid_core::{DownloadFilter, DownloadStatus};

mod support;
use support::engine::{Engine, ScriptedTransport};

#[tokio::test]
async fn test_concurrent_claims_never_hand_out_a_download_twice() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    for i in 0..20 {
        engine.queue(&format!("file-{i:02}.bin")).await;
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = engine.store.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(download) = store.claim_next_pending().await.unwrap() {
                claimed.push(download.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "download {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
    assert!(engine.store.claim_next_pending().await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_stamps_started_at_and_status() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    let first = engine.queue("first.bin").await;
    engine.queue("second.bin").await;

    let claimed = engine.store.claim_next_pending().await.unwrap().unwrap();

    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status(), DownloadStatus::Downloading);
    assert!(claimed.started_at.is_some());
    assert_eq!(
        engine
            .store
            .count_by_status(DownloadStatus::Pending)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_list_filters_by_status_and_text() {
    let engine = Engine::new(ScriptedTransport::fast()).await;
    engine.queue("Great.Movie.2023.mkv").await;
    engine.queue("Other_Show.S01E01.mkv").await;
    engine.queue("great_soundtrack.flac").await;
    engine.store.claim_next_pending().await.unwrap().unwrap();

    let great = engine
        .store
        .list_downloads(&DownloadFilter {
            search: Some("GREAT".to_string()),
            ..DownloadFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(great.len(), 2);

    let underscore = engine
        .store
        .list_downloads(&DownloadFilter {
            search: Some("_".to_string()),
            ..DownloadFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(underscore.len(), 2);

    let pending = engine
        .store
        .list_downloads(&DownloadFilter {
            status: Some(DownloadStatus::Pending),
            ..DownloadFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|d| d.status() == DownloadStatus::Pending));
}
