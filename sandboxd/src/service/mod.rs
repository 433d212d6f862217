//! Box service facade: the stable operation surface the HTTP layer calls.
//!
//! Owns the access tracker, the image manager, and the reclaim loop; every
//! box-scoped operation records an access before touching the backend, so
//! a failed operation still counts as activity and a broken-but-accessed
//! box is not reclaimed mid-debug.

pub mod reclaim;
pub mod tracker;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use parking_lot::Mutex;
use sandboxd_shared::errors::SandboxResult;

use crate::backend::types::{
    BoxFile, BoxFilter, BoxInfo, CreateBoxParams, ExecOutput, ExecParams, ImageUpdateParams,
    ImageUpdateReport, InteractiveExecParams, InteractiveOutcome, PathStat, ProgressSender,
    RunCodeParams,
};
use crate::backend::{BackendRegistry, BoxBackend, BoxedDuplex, ByteStream};
use crate::config::ServiceConfig;
use crate::images::ImageManager;
use crate::service::tracker::AccessTracker;

pub use reclaim::ReclaimReport;

/// Stateful facade dispatching to the selected backend.
pub struct BoxService {
    backend: Arc<dyn BoxBackend>,
    tracker: Arc<AccessTracker>,
    images: Arc<ImageManager>,
    config: ServiceConfig,
    shutdown: watch::Sender<bool>,
    reclaim_worker: Mutex<Option<JoinHandle<()>>>,
}

impl BoxService {
    /// Resolve the backend from the registry by mode name and start the
    /// background workers.
    pub async fn new(registry: &BackendRegistry, config: ServiceConfig) -> SandboxResult<Self> {
        let backend = registry.resolve(&config.mode, &config).await?;
        Ok(Self::with_backend(backend, config))
    }

    /// Build the facade around an already-constructed backend.
    pub fn with_backend(backend: Arc<dyn BoxBackend>, config: ServiceConfig) -> Self {
        let tracker = Arc::new(AccessTracker::new());
        let images = ImageManager::start(Arc::clone(&backend), config.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reclaim_worker = reclaim::spawn_reclaim_loop(
            Arc::clone(&backend),
            Arc::clone(&tracker),
            config.reclaim_stop_threshold,
            config.reclaim_delete_threshold,
            shutdown_rx,
        );

        Self {
            backend,
            tracker,
            images,
            config,
            shutdown: shutdown_tx,
            reclaim_worker: Mutex::new(Some(reclaim_worker)),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn images(&self) -> &Arc<ImageManager> {
        &self.images
    }

    pub fn tracker(&self) -> &Arc<AccessTracker> {
        &self.tracker
    }

    pub async fn list(&self, filters: &[BoxFilter]) -> SandboxResult<Vec<BoxInfo>> {
        self.backend.list(filters).await
    }

    pub async fn get(&self, id: &str) -> SandboxResult<BoxInfo> {
        self.tracker.update(id);
        self.backend.get(id).await
    }

    pub async fn create(
        &self,
        params: CreateBoxParams,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<BoxInfo> {
        let info = self.backend.create(params, progress).await?;
        self.tracker.update(&info.id);
        Ok(info)
    }

    pub async fn start(&self, id: &str) -> SandboxResult<BoxInfo> {
        self.tracker.update(id);
        self.backend.start(id).await
    }

    pub async fn stop(&self, id: &str) -> SandboxResult<BoxInfo> {
        self.tracker.update(id);
        self.backend.stop(id, None).await
    }

    pub async fn delete(&self, id: &str, force: bool) -> SandboxResult<()> {
        self.tracker.update(id);
        self.backend.delete(id, force).await?;
        self.tracker.remove(id);
        Ok(())
    }

    /// Delete every box. Nothing to delete is success, not an error.
    pub async fn delete_all(&self, force: bool) -> SandboxResult<Vec<String>> {
        let boxes = self.backend.list(&[]).await?;
        let mut deleted = Vec::new();
        for info in boxes {
            self.tracker.update(&info.id);
            match self.backend.delete(&info.id, force).await {
                Ok(()) => {
                    self.tracker.remove(&info.id);
                    deleted.push(info.id);
                }
                Err(e) => {
                    tracing::warn!(box_id = %info.id, error = %e, "delete-all: failed to delete box");
                }
            }
        }
        Ok(deleted)
    }

    pub async fn exec(&self, id: &str, params: ExecParams) -> SandboxResult<ExecOutput> {
        self.tracker.update(id);
        self.backend.exec(id, params).await
    }

    pub async fn exec_interactive(
        &self,
        id: &str,
        params: InteractiveExecParams,
        conn: BoxedDuplex,
    ) -> SandboxResult<InteractiveOutcome> {
        self.tracker.update(id);
        self.backend.exec_interactive(id, params, conn).await
    }

    pub async fn run_code(&self, id: &str, params: RunCodeParams) -> SandboxResult<ExecOutput> {
        self.tracker.update(id);
        self.backend.run_code(id, params).await
    }

    pub async fn list_files(
        &self,
        id: &str,
        path: &str,
        depth: u32,
    ) -> SandboxResult<Vec<BoxFile>> {
        self.tracker.update(id);
        self.backend.list_files(id, path, depth).await
    }

    pub async fn read_file(&self, id: &str, path: &str) -> SandboxResult<String> {
        self.tracker.update(id);
        self.backend.read_file(id, path).await
    }

    pub async fn write_file(&self, id: &str, path: &str, content: &str) -> SandboxResult<()> {
        self.tracker.update(id);
        self.backend.write_file(id, path, content).await
    }

    pub async fn get_archive(&self, id: &str, path: &str) -> SandboxResult<(PathStat, ByteStream)> {
        self.tracker.update(id);
        self.backend.get_archive(id, path).await
    }

    pub async fn head_archive(&self, id: &str, path: &str) -> SandboxResult<PathStat> {
        self.tracker.update(id);
        self.backend.head_archive(id, path).await
    }

    pub async fn extract_archive(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> SandboxResult<()> {
        self.tracker.update(id);
        self.backend.extract_archive(id, path, archive).await
    }

    pub async fn get_external_port(&self, id: &str, internal_port: u16) -> SandboxResult<u16> {
        self.tracker.update(id);
        self.backend.get_external_port(id, internal_port).await
    }

    /// Run one reclaim cycle now, regardless of the periodic schedule.
    pub async fn reclaim(&self) -> SandboxResult<ReclaimReport> {
        reclaim::reclaim_cycle(
            &self.backend,
            &self.tracker,
            self.config.reclaim_stop_threshold,
            self.config.reclaim_delete_threshold,
        )
        .await
    }

    /// Synchronous image update, distinct from the background worker.
    pub async fn update_image(
        &self,
        params: ImageUpdateParams,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<ImageUpdateReport> {
        self.backend.update_image(params, progress).await
    }

    /// Stop the background workers and release the backend.
    pub async fn close(&self) -> SandboxResult<()> {
        let _ = self.shutdown.send(true);
        let reclaim_worker = self.reclaim_worker.lock().take();
        if let Some(worker) = reclaim_worker {
            let _ = worker.await;
        }
        self.images.close().await;
        self.backend.close().await
    }
}
