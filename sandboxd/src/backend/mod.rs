//! Backend port: the capability set the core requires from any box runtime.
//!
//! Two realizations exist: [`docker::DockerBackend`] against a local
//! container daemon and [`kube::KubeBackend`] against a cluster
//! orchestrator. They share no state, only this contract.

pub mod docker;
pub(crate) mod fsutil;
pub mod kube;
pub mod types;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite};

use sandboxd_shared::errors::{SandboxError, SandboxResult};

use crate::config::ServiceConfig;
use types::{
    BoxFile, BoxFilter, BoxInfo, CreateBoxParams, ExecOutput, ExecParams, ImageUpdateParams,
    ImageUpdateReport, InteractiveExecParams, InteractiveOutcome, PathStat, ProgressSender,
    RunCodeParams,
};

/// Mode name the daemon backend registers under.
pub const MODE_DAEMON: &str = "daemon";
/// Mode name the cluster backend registers under.
pub const MODE_CLUSTER: &str = "cluster";

/// Full-duplex byte stream handed to an interactive exec.
///
/// The backend owns the stream for the duration of the call and shuts it
/// down on every exit path.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

pub type BoxedDuplex = Box<dyn Duplex>;

/// Opaque archive byte stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = SandboxResult<Bytes>> + Send>>;

/// One backend image, as seen by the image manager.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// Capability contract every backend realizes.
///
/// All methods are cancellation-safe: dropping the returned future aborts
/// the operation at its next suspension point.
#[async_trait]
pub trait BoxBackend: Send + Sync {
    async fn get(&self, id: &str) -> SandboxResult<BoxInfo>;

    /// List boxes; always restricted to objects carrying the `name=box`
    /// label, additionally narrowed by `filters`.
    async fn list(&self, filters: &[BoxFilter]) -> SandboxResult<Vec<BoxInfo>>;

    /// Create a box. Returns only once the backend reports the object
    /// exists; with `wait_for_ready`, blocks until the backend-native
    /// health probe reports healthy and tears the box down on timeout.
    async fn create(
        &self,
        params: CreateBoxParams,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<BoxInfo>;

    /// No-op success when the box is already running.
    async fn start(&self, id: &str) -> SandboxResult<BoxInfo>;

    /// No-op success when the box is already stopped. `timeout` bounds the
    /// graceful stop; the backend default applies when `None`.
    async fn stop(&self, id: &str, timeout: Option<Duration>) -> SandboxResult<BoxInfo>;

    /// With `force`, succeeds on already-absent objects.
    async fn delete(&self, id: &str, force: bool) -> SandboxResult<()>;

    async fn exec(&self, id: &str, params: ExecParams) -> SandboxResult<ExecOutput>;

    async fn exec_interactive(
        &self,
        id: &str,
        params: InteractiveExecParams,
        conn: BoxedDuplex,
    ) -> SandboxResult<InteractiveOutcome>;

    async fn run_code(&self, id: &str, params: RunCodeParams) -> SandboxResult<ExecOutput>;

    async fn list_files(&self, id: &str, path: &str, depth: u32) -> SandboxResult<Vec<BoxFile>>;

    async fn read_file(&self, id: &str, path: &str) -> SandboxResult<String>;

    async fn write_file(&self, id: &str, path: &str, content: &str) -> SandboxResult<()>;

    /// Tar stream of `path` plus its stat.
    async fn get_archive(&self, id: &str, path: &str) -> SandboxResult<(PathStat, ByteStream)>;

    async fn head_archive(&self, id: &str, path: &str) -> SandboxResult<PathStat>;

    /// Unpack a tar stream into `path` inside the box.
    async fn extract_archive(&self, id: &str, path: &str, archive: Bytes) -> SandboxResult<()>;

    /// Host-visible port bound to `internal_port`; fails distinctly when
    /// the port is exposed but unpublished vs not exposed at all.
    async fn get_external_port(&self, id: &str, internal_port: u16) -> SandboxResult<u16>;

    async fn pull_image(
        &self,
        reference: &str,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<()>;

    /// Images whose repository matches `repository`, all images when `None`.
    async fn list_images(&self, repository: Option<&str>) -> SandboxResult<Vec<ImageRecord>>;

    async fn remove_image(&self, reference: &str, force: bool) -> SandboxResult<()>;

    async fn update_image(
        &self,
        params: ImageUpdateParams,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<ImageUpdateReport>;

    /// Release backend resources. Called once, on facade shutdown.
    async fn close(&self) -> SandboxResult<()>;
}

type BackendFuture = Pin<Box<dyn Future<Output = SandboxResult<Arc<dyn BoxBackend>>> + Send>>;
type BackendFactory = Box<dyn Fn(ServiceConfig) -> BackendFuture + Send + Sync>;

/// Explicit mode-name → constructor registry, populated by the binary's
/// main before the facade is built. No global singletons.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with both built-in backends registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MODE_DAEMON, |config| {
            Box::pin(async move {
                let backend = docker::DockerBackend::connect(&config).await?;
                Ok(Arc::new(backend) as Arc<dyn BoxBackend>)
            })
        });
        registry.register(MODE_CLUSTER, |config| {
            Box::pin(async move {
                let backend = kube::KubeBackend::connect(&config).await?;
                Ok(Arc::new(backend) as Arc<dyn BoxBackend>)
            })
        });
        registry
    }

    pub fn register<F>(&mut self, mode: &str, factory: F)
    where
        F: Fn(ServiceConfig) -> BackendFuture + Send + Sync + 'static,
    {
        self.factories.insert(mode.to_string(), Box::new(factory));
    }

    pub async fn resolve(
        &self,
        mode: &str,
        config: &ServiceConfig,
    ) -> SandboxResult<Arc<dyn BoxBackend>> {
        let factory = self.factories.get(mode).ok_or_else(|| {
            SandboxError::InvalidRequest(format!("unknown backend mode: {}", mode))
        })?;
        factory(config.clone()).await
    }

    pub fn modes(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }
}
