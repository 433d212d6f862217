//! In-memory map of box id to last-access instant.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Access tracker shared by the facade, the exec paths, and the reclaimer.
///
/// Purely in-memory; operations never block beyond the mutex. No
/// persistence: a restart forgets all access history, and lazy
/// initialization keeps freshly rediscovered boxes out of the reclaimer's
/// reach for one full idle window.
#[derive(Debug, Default)]
pub struct AccessTracker {
    entries: Mutex<HashMap<String, Instant>>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access now. Latest wall-clock wins under concurrency.
    pub fn update(&self, id: &str) {
        self.entries.lock().insert(id.to_string(), Instant::now());
    }

    /// Last access instant and whether the id was already tracked.
    ///
    /// A missing entry is initialized to now and reported with
    /// `existed = false`, so a first-seen box is never reclaimed on the
    /// scan that discovers it.
    pub fn last_accessed(&self, id: &str) -> (Instant, bool) {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(instant) => (*instant, true),
            None => {
                let now = Instant::now();
                entries.insert(id.to_string(), now);
                (now, false)
            }
        }
    }

    pub fn remove(&self, id: &str) {
        self.entries.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_entry_initializes_to_now() {
        let tracker = AccessTracker::new();
        let (first, existed) = tracker.last_accessed("b-1");
        assert!(!existed);
        // The lazily created entry is returned on the next read.
        let (second, existed) = tracker.last_accessed("b-1");
        assert!(existed);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_moves_the_instant_forward() {
        let tracker = AccessTracker::new();
        tracker.update("b-1");
        let (before, _) = tracker.last_accessed("b-1");

        tokio::time::advance(Duration::from_secs(60)).await;
        tracker.update("b-1");
        let (after, existed) = tracker.last_accessed("b-1");
        assert!(existed);
        assert_eq!(after - before, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_remove_forgets_the_entry() {
        let tracker = AccessTracker::new();
        tracker.update("b-1");
        tracker.remove("b-1");
        let (_, existed) = tracker.last_accessed("b-1");
        assert!(!existed);
    }

    #[tokio::test]
    async fn test_concurrent_updates() {
        let tracker = Arc::new(AccessTracker::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    tracker.update(&format!("b-{}", (worker + i) % 4));
                    let _ = tracker.last_accessed(&format!("b-{}", i % 4));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let (_, existed) = tracker.last_accessed("b-0");
        assert!(existed);
    }
}
