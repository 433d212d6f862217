//! Daemon backend: boxes as containers on a local container daemon.

mod exec;
mod fsops;
mod images;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum};
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use chrono::{DateTime, Utc};

use sandboxd_shared::constants::{DEFAULT_WORKING_DIR, SHARE_MOUNT_PATH, labels};
use sandboxd_shared::errors::{SandboxError, SandboxResult};

use crate::backend::types::{
    BoxConfig, BoxFile, BoxFilter, BoxInfo, BoxKind, BoxStatus, BrowserSpec, CreateBoxParams,
    ExecOutput, ExecParams, ImageUpdateParams, ImageUpdateReport, InteractiveExecParams,
    InteractiveOutcome, OsSpec, PathStat, ProgressRecord, ProgressSender, Resolution,
    RunCodeParams,
};
use crate::backend::{BoxBackend, BoxedDuplex, ByteStream, ImageRecord};
use crate::config::ServiceConfig;
use crate::util::parse_duration;

/// Graceful stop timeout applied when the caller supplies none.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on the create readiness wait.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval of the readiness wait.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Connection timeout handed to the bollard client, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Box backend against a local container daemon.
pub struct DockerBackend {
    pub(crate) docker: Docker,
    pub(crate) config: ServiceConfig,
}

impl DockerBackend {
    /// Connect using `DAEMON_HOST` when configured, else platform defaults.
    pub async fn connect(config: &ServiceConfig) -> SandboxResult<Self> {
        let docker = match config.daemon_host.as_deref() {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| SandboxError::Upstream(format!("connecting to container daemon: {}", e)))?;

        // Fail fast when the daemon is unreachable.
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Upstream(format!("container daemon not responding: {}", e)))?;

        Ok(Self {
            docker,
            config: config.clone(),
        })
    }

    /// Container name of a box: `sandboxd-<boxId>`.
    pub(crate) fn container_name(box_id: &str) -> String {
        format!("{}-{}", sandboxd_shared::constants::NAMESPACE, box_id)
    }

    /// Mandatory label set stamped on every container owned by sandboxd.
    fn build_labels(&self, box_id: &str, params: &CreateBoxParams) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert(labels::ID.to_string(), box_id.to_string());
        out.insert(labels::NAME.to_string(), labels::NAME_VALUE.to_string());
        out.insert(labels::INSTANCE.to_string(), Self::container_name(box_id));
        out.insert(labels::NAMESPACE.to_string(), self.config.namespace.clone());
        out.insert(labels::VERSION.to_string(), labels::VERSION_VALUE.to_string());
        out.insert(labels::COMPONENT.to_string(), labels::COMPONENT_VALUE.to_string());
        out.insert(labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string());
        out.insert(labels::BOX_TYPE.to_string(), params.kind.as_str().to_string());
        if let Some(expires_in) = &params.expires_in {
            out.insert(labels::EXPIRES_IN.to_string(), expires_in.clone());
        }
        for (k, v) in &params.labels {
            out.insert(format!("{}{}", labels::EXTRA_PREFIX, k), v.clone());
        }
        out
    }

    fn map_api_err(err: bollard::errors::Error) -> SandboxError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => SandboxError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => SandboxError::Conflict(message),
            other => SandboxError::Upstream(other.to_string()),
        }
    }

    pub(crate) async fn inspect(&self, box_id: &str) -> SandboxResult<ContainerInspectResponse> {
        self.docker
            .inspect_container(&Self::container_name(box_id), None)
            .await
            .map_err(|e| match Self::map_api_err(e) {
                SandboxError::NotFound(_) => SandboxError::NotFound(format!("box {}", box_id)),
                other => other,
            })
    }

    /// Fail with `NotRunning` unless the container is in the running state.
    pub(crate) async fn ensure_running(&self, box_id: &str) -> SandboxResult<()> {
        let inspect = self.inspect(box_id).await?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            let status = map_state_status(inspect.state.as_ref().and_then(|s| s.status));
            return Err(SandboxError::NotRunning(format!(
                "box {} is {}",
                box_id, status
            )));
        }
        Ok(())
    }

    fn box_from_inspect(&self, inspect: &ContainerInspectResponse) -> SandboxResult<BoxInfo> {
        let container_labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let id = container_labels.get(labels::ID).cloned().ok_or_else(|| {
            SandboxError::Internal(format!(
                "container {} has no box id label",
                inspect.name.as_deref().unwrap_or("<unnamed>")
            ))
        })?;

        let kind = match container_labels.get(labels::BOX_TYPE).map(String::as_str) {
            Some("android") => BoxKind::Android,
            _ => BoxKind::Linux,
        };

        let extra_labels: HashMap<String, String> = container_labels
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(labels::EXTRA_PREFIX)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();

        let created_at = inspect
            .created
            .as_deref()
            .and_then(parse_rfc3339)
            .unwrap_or_else(Utc::now);
        let state = inspect.state.as_ref();
        let updated_at = state
            .and_then(|s| s.finished_at.as_deref())
            .and_then(parse_rfc3339)
            .or_else(|| state.and_then(|s| s.started_at.as_deref()).and_then(parse_rfc3339))
            .unwrap_or(created_at);

        let expires_at = container_labels
            .get(labels::EXPIRES_IN)
            .and_then(|s| parse_duration(s).ok())
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| created_at + d);

        let envs: HashMap<String, String> = inspect
            .config
            .as_ref()
            .and_then(|c| c.env.as_ref())
            .map(|env| {
                env.iter()
                    .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let host_config = inspect.host_config.as_ref();
        let cpu = host_config
            .and_then(|h| h.nano_cpus)
            .filter(|n| *n > 0)
            .map(|n| n as f64 / 1_000_000_000.0);
        let memory_mib = host_config
            .and_then(|h| h.memory)
            .filter(|m| *m > 0)
            .map(|m| m / (1024 * 1024));
        let storage_gib = host_config
            .and_then(|h| h.storage_opt.as_ref())
            .and_then(|o| o.get("size"))
            .and_then(|s| s.trim_end_matches(['G', 'g']).parse::<i64>().ok());

        let (resolution, browser, os) = derive_specs(&envs);

        Ok(BoxInfo {
            id,
            status: map_state_status(state.and_then(|s| s.status)),
            image: inspect
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            kind,
            created_at,
            updated_at,
            expires_at,
            config: BoxConfig {
                envs,
                labels: extra_labels.clone(),
                working_dir: inspect
                    .config
                    .as_ref()
                    .and_then(|c| c.working_dir.clone())
                    .filter(|w| !w.is_empty()),
                cpu,
                memory_mib,
                storage_gib,
                resolution,
                browser,
                os,
            },
            extra_labels,
        })
    }

    /// Block until the container's health probe reports healthy.
    ///
    /// Containers without a configured probe count as healthy once running.
    /// On timeout the half-created box is stopped and force-deleted.
    async fn wait_ready(&self, box_id: &str, timeout: Duration) -> SandboxResult<()> {
        let wait = async {
            loop {
                let inspect = self.inspect(box_id).await?;
                let state = inspect.state.as_ref();
                match state.and_then(|s| s.health.as_ref()).and_then(|h| h.status) {
                    Some(HealthStatusEnum::HEALTHY) => return Ok(()),
                    Some(HealthStatusEnum::UNHEALTHY) => {
                        return Err(SandboxError::Conflict(format!(
                            "box {} reported unhealthy",
                            box_id
                        )));
                    }
                    Some(_) => {}
                    // No probe configured: running is as healthy as it gets.
                    None => {
                        if state.and_then(|s| s.running).unwrap_or(false) {
                            return Ok(());
                        }
                    }
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(box_id = %box_id, "readiness wait timed out, tearing down");
                let name = Self::container_name(box_id);
                let _ = self
                    .docker
                    .stop_container(&name, Some(StopContainerOptions { t: 0 }))
                    .await;
                let _ = self
                    .docker
                    .remove_container(
                        &name,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                Err(SandboxError::Timeout(format!(
                    "box {} did not become ready within {:?}",
                    box_id, timeout
                )))
            }
        }
    }
}

#[async_trait]
impl BoxBackend for DockerBackend {
    async fn get(&self, id: &str) -> SandboxResult<BoxInfo> {
        let inspect = self.inspect(id).await?;
        self.box_from_inspect(&inspect)
    }

    async fn list(&self, filters: &[BoxFilter]) -> SandboxResult<Vec<BoxInfo>> {
        let mut native: HashMap<String, Vec<String>> = HashMap::new();
        // Never list unrelated workloads.
        native
            .entry("label".to_string())
            .or_default()
            .push(format!("{}={}", labels::NAME, labels::NAME_VALUE));
        for filter in filters {
            match filter {
                BoxFilter::Id(id) => native
                    .entry("label".to_string())
                    .or_default()
                    .push(format!("{}={}", labels::ID, id)),
                BoxFilter::LabelKey(key) => native
                    .entry("label".to_string())
                    .or_default()
                    .push(format!("{}{}", labels::EXTRA_PREFIX, key)),
                BoxFilter::LabelKeyValue(key, value) => native
                    .entry("label".to_string())
                    .or_default()
                    .push(format!("{}{}={}", labels::EXTRA_PREFIX, key, value)),
                BoxFilter::Ancestor(image) => native
                    .entry("ancestor".to_string())
                    .or_default()
                    .push(image.clone()),
            }
        }

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: native,
                ..Default::default()
            }))
            .await
            .map_err(Self::map_api_err)?;

        let mut boxes = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(box_id) = summary
                .labels
                .as_ref()
                .and_then(|l| l.get(labels::ID))
                .cloned()
            else {
                continue;
            };
            match self.get(&box_id).await {
                Ok(info) => boxes.push(info),
                // Deleted between list and inspect; skip.
                Err(SandboxError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!(box_id = %box_id, error = %e, "failed to inspect listed box");
                }
            }
        }
        Ok(boxes)
    }

    async fn create(
        &self,
        params: CreateBoxParams,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<BoxInfo> {
        if params.kind == BoxKind::Android {
            return Err(SandboxError::Unsupported(
                "android boxes are not implemented on the daemon backend".into(),
            ));
        }
        if let Some(expires_in) = &params.expires_in {
            // Validate eagerly so a bad duration fails the request, not the
            // eventual reclaim math.
            parse_duration(expires_in)?;
        }

        let image = self
            .config
            .normalize_image(params.image.as_deref().unwrap_or(
                sandboxd_shared::constants::DEFAULT_IMAGE_REPO,
            ));
        let box_id = uuid::Uuid::new_v4().to_string();
        let name = Self::container_name(&box_id);

        if let Some(sink) = &progress {
            let _ = sink
                .send(ProgressRecord::prepare(format!("creating box from {}", image)))
                .await;
        }

        // Pull the image first when the daemon does not have it.
        if self.docker.inspect_image(&image).await.is_err() {
            self.pull_image(&image, progress.clone()).await?;
        }

        let env: Vec<String> = params
            .envs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        // The per-box host share is always mounted; user mounts follow.
        let mut binds = vec![format!(
            "{}:{}",
            self.config.host_share_for(&box_id).display(),
            SHARE_MOUNT_PATH
        )];
        for mount in &params.mounts {
            let mut options = Vec::new();
            if mount.read_only {
                options.push("ro".to_string());
            }
            if let Some(propagation) = &mount.propagation {
                options.push(propagation.clone());
            }
            if options.is_empty() {
                binds.push(format!("{}:{}", mount.host_path, mount.container_path));
            } else {
                binds.push(format!(
                    "{}:{}:{}",
                    mount.host_path,
                    mount.container_path,
                    options.join(",")
                ));
            }
        }

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<bollard::models::PortBinding>>> =
            HashMap::new();
        for port in &params.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: None,
                }]),
            );
        }

        let mut host_config = bollard::models::HostConfig {
            binds: Some(binds),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };
        if let Some(cpu) = params.cpu {
            host_config.nano_cpus = Some((cpu * 1_000_000_000.0) as i64);
        }
        if let Some(memory_mib) = params.memory_mib {
            host_config.memory = Some(memory_mib * 1024 * 1024);
        }
        if let Some(storage_gib) = params.storage_gib {
            host_config.storage_opt = Some(HashMap::from([(
                "size".to_string(),
                format!("{}G", storage_gib),
            )]));
        }

        let container_config = Config {
            image: Some(image.clone()),
            env: Some(env),
            working_dir: Some(
                params
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
            ),
            labels: Some(self.build_labels(&box_id, &params)),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(Self::map_api_err)?;

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            // Do not leave a created-but-unstartable container behind.
            let _ = self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(Self::map_api_err(e));
        }

        if params.wait_for_ready {
            let timeout = match &params.wait_timeout {
                Some(s) => parse_duration(s)?,
                None => DEFAULT_READY_TIMEOUT,
            };
            self.wait_ready(&box_id, timeout).await?;
        }

        tracing::info!(box_id = %box_id, image = %image, "created box");
        if let Some(sink) = &progress {
            let _ = sink
                .send(ProgressRecord::complete(format!("box {} created", box_id), None))
                .await;
        }

        self.get(&box_id).await
    }

    async fn start(&self, id: &str) -> SandboxResult<BoxInfo> {
        // Existence check first so a missing box is NotFound, not Upstream.
        let inspect = self.inspect(id).await?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            self.docker
                .start_container(&Self::container_name(id), None::<StartContainerOptions<String>>)
                .await
                .map_err(Self::map_api_err)?;
            tracing::debug!(box_id = %id, "started box");
        }
        self.get(id).await
    }

    async fn stop(&self, id: &str, timeout: Option<Duration>) -> SandboxResult<BoxInfo> {
        self.inspect(id).await?;
        let t = timeout.unwrap_or(DEFAULT_STOP_TIMEOUT).as_secs() as i64;
        match self
            .docker
            .stop_container(&Self::container_name(id), Some(StopContainerOptions { t }))
            .await
        {
            Ok(()) => {}
            // 304: already stopped. The target state holds, so succeed.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(Self::map_api_err(e)),
        }
        tracing::debug!(box_id = %id, "stopped box");
        self.get(id).await
    }

    async fn delete(&self, id: &str, force: bool) -> SandboxResult<()> {
        match self
            .docker
            .remove_container(
                &Self::container_name(id),
                Some(RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(box_id = %id, force = force, "deleted box");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) if force => Ok(()),
            Err(e) => Err(match Self::map_api_err(e) {
                SandboxError::NotFound(_) => SandboxError::NotFound(format!("box {}", id)),
                other => other,
            }),
        }
    }

    async fn exec(&self, id: &str, params: ExecParams) -> SandboxResult<ExecOutput> {
        self.exec_impl(id, params).await
    }

    async fn exec_interactive(
        &self,
        id: &str,
        params: InteractiveExecParams,
        conn: BoxedDuplex,
    ) -> SandboxResult<InteractiveOutcome> {
        self.exec_interactive_impl(id, params, conn).await
    }

    async fn run_code(&self, id: &str, params: RunCodeParams) -> SandboxResult<ExecOutput> {
        self.run_code_impl(id, params).await
    }

    async fn list_files(&self, id: &str, path: &str, depth: u32) -> SandboxResult<Vec<BoxFile>> {
        self.list_files_impl(id, path, depth).await
    }

    async fn read_file(&self, id: &str, path: &str) -> SandboxResult<String> {
        self.read_file_impl(id, path).await
    }

    async fn write_file(&self, id: &str, path: &str, content: &str) -> SandboxResult<()> {
        self.write_file_impl(id, path, content).await
    }

    async fn get_archive(&self, id: &str, path: &str) -> SandboxResult<(PathStat, ByteStream)> {
        self.get_archive_impl(id, path).await
    }

    async fn head_archive(&self, id: &str, path: &str) -> SandboxResult<PathStat> {
        self.head_archive_impl(id, path).await
    }

    async fn extract_archive(&self, id: &str, path: &str, archive: Bytes) -> SandboxResult<()> {
        self.extract_archive_impl(id, path, archive).await
    }

    async fn get_external_port(&self, id: &str, internal_port: u16) -> SandboxResult<u16> {
        let inspect = self.inspect(id).await?;
        let key = format!("{}/tcp", internal_port);
        let ports = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.ports.as_ref());

        let Some(bindings) = ports.and_then(|p| p.get(&key)) else {
            return Err(SandboxError::InvalidRequest(format!(
                "port {} is not exposed by box {}",
                internal_port, id
            )));
        };
        bindings
            .as_ref()
            .into_iter()
            .flatten()
            .find_map(|b| b.host_port.as_deref())
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                SandboxError::Conflict(format!(
                    "port {} of box {} is exposed but not published",
                    internal_port, id
                ))
            })
    }

    async fn pull_image(
        &self,
        reference: &str,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<()> {
        self.pull_image_impl(reference, progress).await
    }

    async fn list_images(&self, repository: Option<&str>) -> SandboxResult<Vec<ImageRecord>> {
        self.list_images_impl(repository).await
    }

    async fn remove_image(&self, reference: &str, force: bool) -> SandboxResult<()> {
        self.remove_image_impl(reference, force).await
    }

    async fn update_image(
        &self,
        params: ImageUpdateParams,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<ImageUpdateReport> {
        self.update_image_impl(params, progress).await
    }

    async fn close(&self) -> SandboxResult<()> {
        // The bollard client has no explicit shutdown; dropping the handle
        // closes its connection pool.
        Ok(())
    }
}

/// Fixed mapping from daemon-native state to the box status enum.
pub(crate) fn map_state_status(status: Option<ContainerStateStatusEnum>) -> BoxStatus {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => BoxStatus::Running,
        Some(ContainerStateStatusEnum::CREATED) => BoxStatus::Created,
        Some(ContainerStateStatusEnum::RESTARTING) => BoxStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => BoxStatus::Removing,
        Some(ContainerStateStatusEnum::PAUSED) => BoxStatus::Paused,
        Some(ContainerStateStatusEnum::EXITED) => BoxStatus::Stopped,
        Some(ContainerStateStatusEnum::DEAD) => BoxStatus::Dead,
        _ => BoxStatus::Unknown,
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    // The daemon reports the zero time for never-started containers.
    if s.is_empty() || s.starts_with("0001-") {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Derive display specs from well-known box environment variables.
fn derive_specs(
    envs: &HashMap<String, String>,
) -> (Option<Resolution>, Option<BrowserSpec>, Option<OsSpec>) {
    let resolution = envs.get("RESOLUTION").and_then(|raw| {
        let (w, h) = raw.split_once('x')?;
        Some(Resolution {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
        })
    });
    let browser = match (envs.get("BROWSER_TYPE"), envs.get("BROWSER_VERSION")) {
        (Some(kind), Some(version)) => Some(BrowserSpec {
            kind: kind.clone(),
            version: version.clone(),
        }),
        _ => None,
    };
    let os = envs.get("OS_VERSION").map(|version| OsSpec {
        version: version.clone(),
    });
    (resolution, browser, os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name() {
        assert_eq!(DockerBackend::container_name("abc-123"), "sandboxd-abc-123");
    }

    #[test]
    fn test_state_mapping() {
        use ContainerStateStatusEnum::*;
        assert_eq!(map_state_status(Some(RUNNING)), BoxStatus::Running);
        assert_eq!(map_state_status(Some(CREATED)), BoxStatus::Created);
        assert_eq!(map_state_status(Some(RESTARTING)), BoxStatus::Restarting);
        assert_eq!(map_state_status(Some(REMOVING)), BoxStatus::Removing);
        assert_eq!(map_state_status(Some(PAUSED)), BoxStatus::Paused);
        assert_eq!(map_state_status(Some(EXITED)), BoxStatus::Stopped);
        assert_eq!(map_state_status(Some(DEAD)), BoxStatus::Dead);
        assert_eq!(map_state_status(None), BoxStatus::Unknown);
    }

    #[test]
    fn test_derive_specs() {
        let mut envs = HashMap::new();
        envs.insert("RESOLUTION".to_string(), "1280x800".to_string());
        envs.insert("BROWSER_TYPE".to_string(), "chromium".to_string());
        envs.insert("BROWSER_VERSION".to_string(), "121".to_string());
        let (resolution, browser, os) = derive_specs(&envs);
        assert_eq!(
            resolution,
            Some(Resolution {
                width: 1280,
                height: 800
            })
        );
        assert_eq!(browser.unwrap().kind, "chromium");
        assert!(os.is_none());
    }

    #[test]
    fn test_parse_rfc3339_zero_time() {
        assert!(parse_rfc3339("0001-01-01T00:00:00Z").is_none());
        assert!(parse_rfc3339("").is_none());
        assert!(parse_rfc3339("2024-03-01T10:30:00Z").is_some());
    }
}
