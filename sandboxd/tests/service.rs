//! Integration tests for the box service facade and the reclaim loop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockBackend;
use sandboxd::backend::BoxBackend;
use sandboxd::backend::types::{BoxKind, BoxStatus, CreateBoxParams};
use sandboxd::config::ServiceConfig;
use sandboxd::service::BoxService;
use sandboxd::SandboxError;

fn test_config(stop: Duration, delete: Duration) -> ServiceConfig {
    ServiceConfig {
        reclaim_stop_threshold: stop,
        reclaim_delete_threshold: delete,
        ..Default::default()
    }
}

fn service_with(backend: Arc<MockBackend>, config: ServiceConfig) -> BoxService {
    BoxService::with_backend(backend as Arc<dyn BoxBackend>, config)
}

// ============================================================================
// FACADE TESTS
// ============================================================================

#[tokio::test]
async fn create_assigns_unique_ids() {
    let backend = MockBackend::new();
    let service = service_with(Arc::clone(&backend), ServiceConfig::default());

    let mut seen = std::collections::HashSet::new();
    for _ in 0..10 {
        let info = service
            .create(CreateBoxParams::default(), None)
            .await
            .unwrap();
        assert!(!info.id.is_empty());
        assert!(seen.insert(info.id), "ids must never repeat");
    }
    service.close().await.unwrap();
}

#[tokio::test]
async fn android_create_is_unsupported() {
    let backend = MockBackend::new();
    let service = service_with(Arc::clone(&backend), ServiceConfig::default());

    let params = CreateBoxParams {
        kind: BoxKind::Android,
        ..Default::default()
    };
    let err = service.create(params, None).await.unwrap_err();
    assert!(matches!(err, SandboxError::Unsupported(_)));
    service.close().await.unwrap();
}

#[tokio::test]
async fn access_is_recorded_before_the_backend_call() {
    let backend = MockBackend::new();
    let service = service_with(Arc::clone(&backend), ServiceConfig::default());

    // The get fails, but the access still counts: a broken-but-accessed
    // box must not look idle to the reclaimer.
    let err = service.get("no-such-box").await.unwrap_err();
    assert!(matches!(err, SandboxError::NotFound(_)));
    let (_, existed) = service.tracker().last_accessed("no-such-box");
    assert!(existed);
    service.close().await.unwrap();
}

#[tokio::test]
async fn delete_clears_the_tracker_entry() {
    let backend = MockBackend::new();
    let service = service_with(Arc::clone(&backend), ServiceConfig::default());

    let info = service
        .create(CreateBoxParams::default(), None)
        .await
        .unwrap();
    let (_, existed) = service.tracker().last_accessed(&info.id);
    assert!(existed);

    service.delete(&info.id, false).await.unwrap();
    assert!(service.list(&[]).await.unwrap().is_empty());
    let (_, existed) = service.tracker().last_accessed(&info.id);
    assert!(!existed, "tracker must forget deleted boxes");
    service.close().await.unwrap();
}

#[tokio::test]
async fn delete_all_on_empty_service_returns_empty_list() {
    let backend = MockBackend::new();
    let service = service_with(Arc::clone(&backend), ServiceConfig::default());

    let deleted = service.delete_all(false).await.unwrap();
    assert!(deleted.is_empty());
    service.close().await.unwrap();
}

#[tokio::test]
async fn delete_all_removes_every_box() {
    let backend = MockBackend::new();
    let service = service_with(Arc::clone(&backend), ServiceConfig::default());

    for _ in 0..3 {
        service
            .create(CreateBoxParams::default(), None)
            .await
            .unwrap();
    }
    let deleted = service.delete_all(false).await.unwrap();
    assert_eq!(deleted.len(), 3);
    assert!(service.list(&[]).await.unwrap().is_empty());
    service.close().await.unwrap();
}

#[tokio::test]
async fn start_and_stop_are_noops_in_target_state() {
    let backend = MockBackend::new();
    let service = service_with(Arc::clone(&backend), ServiceConfig::default());

    let info = service
        .create(CreateBoxParams::default(), None)
        .await
        .unwrap();

    // Already running: start succeeds and reports running.
    let started = service.start(&info.id).await.unwrap();
    assert_eq!(started.status, BoxStatus::Running);

    let stopped = service.stop(&info.id).await.unwrap();
    assert_eq!(stopped.status, BoxStatus::Stopped);
    // Already stopped: stop succeeds again.
    let stopped = service.stop(&info.id).await.unwrap();
    assert_eq!(stopped.status, BoxStatus::Stopped);
    service.close().await.unwrap();
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let backend = MockBackend::new();
    let service = service_with(Arc::clone(&backend), ServiceConfig::default());

    let info = service
        .create(CreateBoxParams::default(), None)
        .await
        .unwrap();
    service
        .write_file(&info.id, "/tmp/note.txt", "hello")
        .await
        .unwrap();
    let content = service.read_file(&info.id, "/tmp/note.txt").await.unwrap();
    assert_eq!(content, "hello");
    service.close().await.unwrap();
}

// ============================================================================
// RECLAIM TESTS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn reclaim_stops_then_deletes_idle_boxes() {
    let backend = MockBackend::new();
    let service = service_with(
        Arc::clone(&backend),
        test_config(Duration::from_secs(10), Duration::from_secs(25)),
    );

    let box1 = service
        .create(CreateBoxParams::default(), None)
        .await
        .unwrap();
    let box2 = service
        .create(CreateBoxParams::default(), None)
        .await
        .unwrap();

    // Touch box2 a little later so the two diverge.
    tokio::time::advance(Duration::from_secs(4)).await;
    service.get(&box2.id).await.unwrap();

    // box1 idle 12s >= 10s: stopped. box2 idle 8s: skipped.
    tokio::time::advance(Duration::from_secs(8)).await;
    let report = service.reclaim().await.unwrap();
    assert_eq!(report.stopped_ids, vec![box1.id.clone()]);
    assert_eq!(report.stopped_count, 1);
    assert_eq!(report.deleted_count, 0);
    assert_eq!(backend.status_of(&box1.id), Some(BoxStatus::Stopped));
    assert_eq!(backend.status_of(&box2.id), Some(BoxStatus::Running));

    // Idempotent within one idle window: nothing changes without time
    // advancing.
    let report = service.reclaim().await.unwrap();
    assert_eq!(report.stopped_count, 0);
    assert_eq!(report.deleted_count, 0);

    // box1 idle 27s >= 25s: deleted, tracker forgets it. box2 idle 23s
    // >= 10s: stopped.
    tokio::time::advance(Duration::from_secs(15)).await;
    let report = service.reclaim().await.unwrap();
    assert_eq!(report.deleted_ids, vec![box1.id.clone()]);
    assert_eq!(report.stopped_ids, vec![box2.id.clone()]);
    assert_eq!(backend.status_of(&box1.id), None);
    let (_, existed) = service.tracker().last_accessed(&box1.id);
    assert!(!existed);
    service.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reclaim_skips_first_seen_boxes() {
    let backend = MockBackend::new();
    let service = service_with(
        Arc::clone(&backend),
        test_config(Duration::from_secs(10), Duration::from_secs(25)),
    );

    // Created behind the facade's back: the tracker has never seen it.
    let info = backend
        .create(CreateBoxParams::default(), None)
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    let report = service.reclaim().await.unwrap();
    // First scan only initializes the entry.
    assert_eq!(report.stopped_count, 0);
    assert_eq!(backend.status_of(&info.id), Some(BoxStatus::Running));

    // After a full idle window it is fair game.
    tokio::time::advance(Duration::from_secs(12)).await;
    let report = service.reclaim().await.unwrap();
    assert_eq!(report.stopped_ids, vec![info.id.clone()]);
    service.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reclaim_ignores_recently_accessed_boxes() {
    let backend = MockBackend::new();
    let service = service_with(
        Arc::clone(&backend),
        test_config(Duration::from_secs(10), Duration::from_secs(25)),
    );

    let info = service
        .create(CreateBoxParams::default(), None)
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(8)).await;
    // Any box-scoped operation counts as access, even an exec.
    service
        .exec(
            &info.id,
            sandboxd::backend::types::ExecParams {
                commands: vec!["true".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(8)).await;
    let report = service.reclaim().await.unwrap();
    assert_eq!(report.stopped_count, 0);
    assert_eq!(backend.status_of(&info.id), Some(BoxStatus::Running));
    service.close().await.unwrap();
}
