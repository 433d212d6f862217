//! Image manager: a trigger-driven background worker that keeps the
//! default image fresh and prunes outdated sibling tags after every pull.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use sandboxd_shared::errors::{SandboxError, SandboxResult};

use crate::backend::BoxBackend;
use crate::backend::types::ProgressSender;
use crate::config::ServiceConfig;
use crate::util::split_image_ref;

/// Bounded admission: at most this many queued triggers; overflow is
/// dropped with a warning rather than blocking the submitter.
const QUEUE_CAPACITY: usize = 10;

/// Work items consumed by the background worker.
#[derive(Debug)]
pub(crate) enum ImageTrigger {
    Pull {
        reference: String,
        progress: Option<ProgressSender>,
    },
    Prune {
        reference: String,
    },
}

/// Single-shot completion of an in-flight pull, shared by every caller
/// that requested the same reference.
type PullCompletion = Option<Result<(), String>>;

struct PullState {
    tx: watch::Sender<PullCompletion>,
    rx: watch::Receiver<PullCompletion>,
}

/// Trigger-driven image pull/prune worker with concurrent-pull
/// deduplication.
pub struct ImageManager {
    backend: Arc<dyn BoxBackend>,
    config: ServiceConfig,
    queue: mpsc::Sender<ImageTrigger>,
    in_flight: Arc<Mutex<HashMap<String, PullState>>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ImageManager {
    /// Start the worker and enqueue one pull of the configured default
    /// image.
    pub fn start(backend: Arc<dyn BoxBackend>, config: ServiceConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = Arc::new(Self {
            backend,
            config,
            queue: queue_tx,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown: shutdown_tx,
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(Self::worker_loop(
            Arc::clone(&manager),
            queue_rx,
            shutdown_rx,
        ));
        *manager.worker.lock() = Some(worker);

        manager.trigger_pull(&manager.config.default_image(), None);
        manager
    }

    /// Register interest in a pull of `reference`.
    ///
    /// Returns the completion receiver plus whether this caller is the one
    /// that must enqueue the work. Exactly one pull is in flight per
    /// normalized reference.
    fn pull_completion(&self, reference: &str) -> (watch::Receiver<PullCompletion>, bool) {
        let mut in_flight = self.in_flight.lock();
        if let Some(state) = in_flight.get(reference) {
            return (state.rx.clone(), false);
        }
        let (tx, rx) = watch::channel(None);
        in_flight.insert(
            reference.to_string(),
            PullState {
                tx,
                rx: rx.clone(),
            },
        );
        (rx, true)
    }

    fn finish_pull(&self, reference: &str, result: Result<(), String>) {
        if let Some(state) = self.in_flight.lock().remove(reference) {
            let _ = state.tx.send(Some(result));
        }
    }

    fn enqueue(&self, trigger: ImageTrigger) -> bool {
        match self.queue.try_send(trigger) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(trigger)) => {
                tracing::warn!(?trigger, "image trigger queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(trigger)) => {
                tracing::warn!(?trigger, "image worker stopped, dropping trigger");
                false
            }
        }
    }

    /// Fire-and-forget pull submission. Never blocks.
    pub fn trigger_pull(&self, reference: &str, progress: Option<ProgressSender>) {
        let reference = self.config.normalize_image(reference);
        let (_, should_enqueue) = self.pull_completion(&reference);
        if !should_enqueue {
            tracing::debug!(image = %reference, "pull already in flight");
            return;
        }
        if !self.enqueue(ImageTrigger::Pull {
            reference: reference.clone(),
            progress,
        }) {
            self.finish_pull(&reference, Err("image trigger queue full".to_string()));
        }
    }

    /// Pull `reference`, or await the pull another caller already started.
    pub async fn pull_and_wait(&self, reference: &str) -> SandboxResult<()> {
        let reference = self.config.normalize_image(reference);
        let (mut rx, should_enqueue) = self.pull_completion(&reference);
        if should_enqueue
            && !self.enqueue(ImageTrigger::Pull {
                reference: reference.clone(),
                progress: None,
            })
        {
            self.finish_pull(&reference, Err("image trigger queue full".to_string()));
        }

        loop {
            let completion = rx.borrow_and_update().clone();
            if let Some(result) = completion {
                return result.map_err(SandboxError::Upstream);
            }
            if rx.changed().await.is_err() {
                return Err(SandboxError::Canceled("image manager shut down".into()));
            }
        }
    }

    async fn worker_loop(
        manager: Arc<Self>,
        mut queue: mpsc::Receiver<ImageTrigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let trigger = tokio::select! {
                _ = shutdown.changed() => break,
                trigger = queue.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };
            // Cancelling the context unblocks an in-flight backend pull.
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::debug!("image worker cancelled mid-trigger");
                    break;
                }
                _ = manager.handle_trigger(trigger) => {}
            }
        }
        tracing::debug!("image worker stopped");
    }

    async fn handle_trigger(&self, trigger: ImageTrigger) {
        match trigger {
            ImageTrigger::Pull {
                reference,
                progress,
            } => {
                let result = self.backend.pull_image(&reference, progress).await;
                match &result {
                    Ok(()) => {
                        // A successful pull queues a prune of the same repo.
                        self.enqueue(ImageTrigger::Prune {
                            reference: reference.clone(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(image = %reference, error = %e, "image pull failed");
                    }
                }
                self.finish_pull(&reference, result.map_err(|e| e.to_string()));
            }
            ImageTrigger::Prune { reference } => {
                if let Err(e) = self.prune(&reference).await {
                    tracing::warn!(image = %reference, error = %e, "image prune failed");
                }
            }
        }
    }

    /// Remove every other tag of the target's repository.
    ///
    /// Removal is non-forcible; per-tag failures are logged and the prune
    /// continues.
    async fn prune(&self, reference: &str) -> SandboxResult<()> {
        let (repository, _) = split_image_ref(reference);
        let records = self.backend.list_images(Some(repository)).await?;

        // The image id currently carried by the target reference.
        let target_id = records
            .iter()
            .find(|record| record.repo_tags.iter().any(|tag| tag == reference))
            .map(|record| record.id.clone());

        for record in &records {
            for tag in &record.repo_tags {
                if tag == reference || split_image_ref(tag).0 != repository {
                    continue;
                }
                if target_id.as_deref() == Some(record.id.as_str()) {
                    continue;
                }
                match self.backend.remove_image(tag, false).await {
                    Ok(()) => {
                        tracing::info!(image = %tag, "pruned outdated tag");
                    }
                    Err(e) => {
                        tracing::warn!(image = %tag, error = %e, "failed to prune tag");
                    }
                }
            }
        }
        Ok(())
    }

    /// Cancel the worker and wait for it to stop.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
