//! Integration tests for the image manager: pull deduplication,
//! prune-after-pull, and bounded admission.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::MockBackend;
use sandboxd::backend::{BoxBackend, ImageRecord};
use sandboxd::config::ServiceConfig;
use sandboxd::images::ImageManager;

fn manager_with(backend: Arc<MockBackend>) -> Arc<ImageManager> {
    ImageManager::start(backend as Arc<dyn BoxBackend>, ServiceConfig::default())
}

/// Poll until `predicate` holds or the budget runs out.
async fn eventually(mut predicate: impl FnMut() -> bool) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn concurrent_pulls_of_the_same_ref_run_once() {
    let backend = MockBackend::new();
    backend.set_pull_delay(Duration::from_millis(100));
    let manager = manager_with(Arc::clone(&backend));

    // Let the startup default pull drain first.
    eventually(|| backend.pull_count.load(Ordering::SeqCst) >= 1).await;
    let baseline = backend.pull_count.load(Ordering::SeqCst);

    let first = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.pull_and_wait("repo/img:tag").await })
    };
    let second = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.pull_and_wait("repo/img:tag").await })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // Both callers observed success, but the backend pulled exactly once.
    assert_eq!(backend.pull_count.load(Ordering::SeqCst), baseline + 1);
    manager.close().await;
}

#[tokio::test]
async fn distinct_refs_pull_separately() {
    let backend = MockBackend::new();
    let manager = manager_with(Arc::clone(&backend));
    eventually(|| backend.pull_count.load(Ordering::SeqCst) >= 1).await;
    let baseline = backend.pull_count.load(Ordering::SeqCst);

    manager.pull_and_wait("repo/a:1").await.unwrap();
    manager.pull_and_wait("repo/a:2").await.unwrap();
    assert_eq!(backend.pull_count.load(Ordering::SeqCst), baseline + 2);
    manager.close().await;
}

#[tokio::test]
async fn pull_triggers_prune_of_outdated_sibling_tags() {
    let backend = MockBackend::with_images(vec![
        ImageRecord {
            id: "sha256:new".to_string(),
            repo_tags: vec!["repo/img:latest".to_string()],
        },
        ImageRecord {
            id: "sha256:old".to_string(),
            repo_tags: vec!["repo/img:v1".to_string()],
        },
        ImageRecord {
            id: "sha256:other".to_string(),
            repo_tags: vec!["unrelated:latest".to_string()],
        },
    ]);
    let manager = manager_with(Arc::clone(&backend));

    manager.pull_and_wait("repo/img:latest").await.unwrap();

    // The prune runs as a follow-up trigger.
    eventually(|| !backend.removed_images.lock().is_empty()).await;
    let removed = backend.removed_images.lock().clone();
    assert_eq!(removed, vec!["repo/img:v1".to_string()]);
    // Unrelated repositories are untouched.
    assert!(
        backend
            .images
            .lock()
            .iter()
            .any(|r| r.repo_tags.contains(&"unrelated:latest".to_string()))
    );
    manager.close().await;
}

#[tokio::test]
async fn untagged_references_get_the_default_tag() {
    let backend = MockBackend::with_images(vec![
        ImageRecord {
            id: "sha256:new".to_string(),
            repo_tags: vec!["repo/img:latest".to_string()],
        },
        ImageRecord {
            id: "sha256:old".to_string(),
            repo_tags: vec!["repo/img:stale".to_string()],
        },
    ]);
    let manager = manager_with(Arc::clone(&backend));

    // `repo/img` normalizes to `repo/img:latest`, so the stale tag goes.
    manager.pull_and_wait("repo/img").await.unwrap();
    eventually(|| !backend.removed_images.lock().is_empty()).await;
    assert_eq!(
        backend.removed_images.lock().clone(),
        vec!["repo/img:stale".to_string()]
    );
    manager.close().await;
}

#[tokio::test]
async fn full_queue_drops_submissions_without_blocking() {
    let backend = MockBackend::new();
    // One pull occupies the worker long enough to fill the queue behind it.
    backend.set_pull_delay(Duration::from_secs(30));
    let manager = manager_with(Arc::clone(&backend));

    // Give the worker a moment to take the startup pull off the queue.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Fill the bounded queue with distinct references.
    for i in 0..10 {
        manager.trigger_pull(&format!("repo/fill:{}", i), None);
    }

    // The next submission finds the queue full and fails immediately
    // instead of blocking.
    let start = std::time::Instant::now();
    let result = manager.pull_and_wait("repo/overflow:1").await;
    assert!(result.is_err());
    assert!(start.elapsed() < Duration::from_secs(5));

    // Shutdown cancels the in-flight pull rather than waiting it out.
    manager.close().await;
}
