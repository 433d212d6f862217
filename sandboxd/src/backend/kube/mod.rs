//! Cluster backend: boxes as single-replica deployments in a tenant
//! namespace, exec over the orchestrator's pod-exec streaming channel.

mod exec;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use sandboxd_shared::constants::DEFAULT_WORKING_DIR;
use sandboxd_shared::errors::{SandboxError, SandboxResult};

use crate::backend::types::{
    BoxConfig, BoxFile, BoxFilter, BoxInfo, BoxKind, BoxStatus, CreateBoxParams, ExecOutput,
    ExecParams, ImageUpdateParams, ImageUpdateReport, InteractiveExecParams, InteractiveOutcome,
    PathStat, ProgressSender, RunCodeParams,
};
use crate::backend::{BoxBackend, BoxedDuplex, ByteStream, ImageRecord};
use crate::config::ServiceConfig;
use crate::util::parse_duration;

/// Recommended-label taxonomy stamped on every deployment and pod.
pub(crate) mod k8s_labels {
    pub const NAME: &str = "app.kubernetes.io/name";
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    pub const VERSION: &str = "app.kubernetes.io/version";
    pub const COMPONENT: &str = "app.kubernetes.io/component";
    pub const PART_OF: &str = "app.kubernetes.io/part-of";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";

    pub const NAME_VALUE: &str = "box";
    pub const VERSION_VALUE: &str = "v1";
    pub const COMPONENT_VALUE: &str = "sandbox";
    pub const PART_OF_VALUE: &str = "sandboxd";
    pub const MANAGED_BY_VALUE: &str = "sandboxd";

    /// User labels carry this prefix on the cluster, stripped on read.
    pub const EXTRA_PREFIX: &str = "extra.sandboxd.io/";
}

/// Shell configuration and box metadata stored as annotations.
mod annotations {
    pub const CMD: &str = "sandboxd.io/cmd";
    pub const ARGS: &str = "sandboxd.io/args";
    pub const WORKING_DIR: &str = "sandboxd.io/working-dir";
    pub const BOX_TYPE: &str = "sandboxd.io/type";
    pub const EXPIRES_IN: &str = "sandboxd.io/expires-in";
}

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Box backend against a cluster orchestrator.
pub struct KubeBackend {
    pub(crate) client: Client,
    pub(crate) config: ServiceConfig,
}

impl KubeBackend {
    /// Connect using `CLUSTER_CONFIG` when set, else inferred (in-cluster or
    /// default kubeconfig).
    pub async fn connect(config: &ServiceConfig) -> SandboxResult<Self> {
        let client_config = match &config.cluster_config {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    SandboxError::Upstream(format!("reading kubeconfig {}: {}", path.display(), e))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| SandboxError::Upstream(format!("loading kubeconfig: {}", e)))?
            }
            None => Config::infer()
                .await
                .map_err(|e| SandboxError::Upstream(format!("inferring cluster config: {}", e)))?,
        };
        let client = Client::try_from(client_config)
            .map_err(|e| SandboxError::Upstream(format!("building cluster client: {}", e)))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub(crate) fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn map_api_err(err: kube::Error) -> SandboxError {
        match err {
            kube::Error::Api(response) if response.code == 404 => {
                SandboxError::NotFound(response.message)
            }
            kube::Error::Api(response) if response.code == 409 => {
                SandboxError::Conflict(response.message)
            }
            other => SandboxError::Upstream(other.to_string()),
        }
    }

    pub(crate) async fn get_deployment(&self, id: &str) -> SandboxResult<Deployment> {
        self.deployments().get(id).await.map_err(|e| {
            match Self::map_api_err(e) {
                SandboxError::NotFound(_) => SandboxError::NotFound(format!("box {}", id)),
                other => other,
            }
        })
    }

    fn build_labels(&self, id: &str, params: &CreateBoxParams) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(k8s_labels::NAME.to_string(), k8s_labels::NAME_VALUE.to_string());
        labels.insert(k8s_labels::INSTANCE.to_string(), id.to_string());
        labels.insert(
            k8s_labels::VERSION.to_string(),
            k8s_labels::VERSION_VALUE.to_string(),
        );
        labels.insert(
            k8s_labels::COMPONENT.to_string(),
            k8s_labels::COMPONENT_VALUE.to_string(),
        );
        labels.insert(
            k8s_labels::PART_OF.to_string(),
            k8s_labels::PART_OF_VALUE.to_string(),
        );
        labels.insert(
            k8s_labels::MANAGED_BY.to_string(),
            k8s_labels::MANAGED_BY_VALUE.to_string(),
        );
        for (k, v) in &params.labels {
            labels.insert(format!("{}{}", k8s_labels::EXTRA_PREFIX, k), v.clone());
        }
        labels
    }

    fn box_from_deployment(&self, deployment: &Deployment) -> SandboxResult<BoxInfo> {
        let metadata = &deployment.metadata;
        let id = metadata
            .name
            .clone()
            .ok_or_else(|| SandboxError::Internal("deployment without a name".into()))?;
        let annotations = metadata.annotations.clone().unwrap_or_default();
        let labels = metadata.labels.clone().unwrap_or_default();

        let container = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first());

        let envs: HashMap<String, String> = container
            .and_then(|c| c.env.as_ref())
            .map(|env| {
                env.iter()
                    .filter_map(|var| var.value.clone().map(|v| (var.name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();

        let extra_labels: HashMap<String, String> = labels
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(k8s_labels::EXTRA_PREFIX)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();

        let created_at = metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now);
        let expires_at = annotations
            .get(annotations::EXPIRES_IN)
            .and_then(|s| parse_duration(s).ok())
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| created_at + d);

        let kind = match annotations.get(annotations::BOX_TYPE).map(String::as_str) {
            Some("android") => BoxKind::Android,
            _ => BoxKind::Linux,
        };

        let resources = container.and_then(|c| c.resources.as_ref());
        let cpu = resources
            .and_then(|r| r.limits.as_ref())
            .and_then(|l| l.get("cpu"))
            .and_then(parse_cpu_quantity);
        let memory_mib = resources
            .and_then(|r| r.limits.as_ref())
            .and_then(|l| l.get("memory"))
            .and_then(parse_memory_quantity_mib);

        Ok(BoxInfo {
            id,
            status: map_deployment_status(deployment),
            image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
            kind,
            created_at,
            updated_at: created_at,
            expires_at,
            config: BoxConfig {
                envs,
                labels: extra_labels.clone(),
                working_dir: annotations.get(annotations::WORKING_DIR).cloned(),
                cpu,
                memory_mib,
                storage_gib: None,
                resolution: None,
                browser: None,
                os: None,
            },
            extra_labels,
        })
    }

    async fn wait_ready(&self, id: &str, timeout: Duration) -> SandboxResult<()> {
        let wait = async {
            loop {
                let deployment = self.get_deployment(id).await?;
                if map_deployment_status(&deployment) == BoxStatus::Running {
                    return Ok(());
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(box_id = %id, "readiness wait timed out, tearing down");
                let _ = self.deployments().delete(id, &DeleteParams::default()).await;
                Err(SandboxError::Timeout(format!(
                    "box {} did not become ready within {:?}",
                    id, timeout
                )))
            }
        }
    }
}

#[async_trait]
impl BoxBackend for KubeBackend {
    async fn get(&self, id: &str) -> SandboxResult<BoxInfo> {
        let deployment = self.get_deployment(id).await?;
        self.box_from_deployment(&deployment)
    }

    async fn list(&self, filters: &[BoxFilter]) -> SandboxResult<Vec<BoxInfo>> {
        let mut selector = vec![format!(
            "{}={}",
            k8s_labels::NAME,
            k8s_labels::NAME_VALUE
        )];
        let mut ancestor: Option<&str> = None;
        for filter in filters {
            match filter {
                BoxFilter::Id(id) => selector.push(format!("{}={}", k8s_labels::INSTANCE, id)),
                BoxFilter::LabelKey(key) => {
                    selector.push(format!("{}{}", k8s_labels::EXTRA_PREFIX, key))
                }
                BoxFilter::LabelKeyValue(key, value) => {
                    selector.push(format!("{}{}={}", k8s_labels::EXTRA_PREFIX, key, value))
                }
                // No native selector for images; filtered below.
                BoxFilter::Ancestor(image) => ancestor = Some(image),
            }
        }

        let params = ListParams::default().labels(&selector.join(","));
        let deployments = self
            .deployments()
            .list(&params)
            .await
            .map_err(Self::map_api_err)?;

        let mut boxes = Vec::new();
        for deployment in deployments.items {
            let info = self.box_from_deployment(&deployment)?;
            if let Some(image) = ancestor {
                if info.image != image && !info.image.starts_with(&format!("{}:", image)) {
                    continue;
                }
            }
            boxes.push(info);
        }
        Ok(boxes)
    }

    async fn create(
        &self,
        params: CreateBoxParams,
        _progress: Option<ProgressSender>,
    ) -> SandboxResult<BoxInfo> {
        if params.kind == BoxKind::Android {
            return Err(SandboxError::Unsupported(
                "android boxes are not implemented on the cluster backend".into(),
            ));
        }
        if let Some(expires_in) = &params.expires_in {
            parse_duration(expires_in)?;
        }

        let image = self
            .config
            .normalize_image(params.image.as_deref().unwrap_or(
                sandboxd_shared::constants::DEFAULT_IMAGE_REPO,
            ));
        let id = uuid::Uuid::new_v4().to_string();
        let labels = self.build_labels(&id, &params);

        let mut deployment_annotations = BTreeMap::new();
        deployment_annotations.insert(
            annotations::BOX_TYPE.to_string(),
            params.kind.as_str().to_string(),
        );
        deployment_annotations.insert(
            annotations::WORKING_DIR.to_string(),
            params
                .working_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
        );
        deployment_annotations.insert(annotations::CMD.to_string(), "[\"sleep\"]".to_string());
        deployment_annotations.insert(annotations::ARGS.to_string(), "[\"infinity\"]".to_string());
        if let Some(expires_in) = &params.expires_in {
            deployment_annotations.insert(annotations::EXPIRES_IN.to_string(), expires_in.clone());
        }

        let env: Vec<EnvVar> = params
            .envs
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();

        let mut limits: BTreeMap<String, Quantity> = BTreeMap::new();
        if let Some(cpu) = params.cpu {
            limits.insert("cpu".to_string(), Quantity(format!("{}", cpu)));
        }
        if let Some(memory_mib) = params.memory_mib {
            limits.insert("memory".to_string(), Quantity(format!("{}Mi", memory_mib)));
        }

        let ports: Vec<ContainerPort> = params
            .ports
            .iter()
            .map(|p| ContainerPort {
                container_port: *p as i32,
                ..Default::default()
            })
            .collect();

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(id.clone()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(deployment_annotations),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        k8s_labels::INSTANCE.to_string(),
                        id.clone(),
                    )])),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "box".to_string(),
                            image: Some(image),
                            command: Some(vec!["sleep".to_string()]),
                            args: Some(vec!["infinity".to_string()]),
                            env: (!env.is_empty()).then_some(env),
                            working_dir: params.working_dir.clone(),
                            ports: (!ports.is_empty()).then_some(ports),
                            resources: (!limits.is_empty()).then_some(ResourceRequirements {
                                limits: Some(limits),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .deployments()
            .create(&PostParams::default(), &deployment)
            .await
            .map_err(Self::map_api_err)?;

        if params.wait_for_ready {
            let timeout = match &params.wait_timeout {
                Some(s) => parse_duration(s)?,
                None => DEFAULT_READY_TIMEOUT,
            };
            self.wait_ready(&id, timeout).await?;
            return self.get(&id).await;
        }

        tracing::info!(box_id = %id, "created box deployment");
        self.box_from_deployment(&created)
    }

    async fn start(&self, _id: &str) -> SandboxResult<BoxInfo> {
        Err(SandboxError::Unsupported(
            "start is not implemented on the cluster backend".into(),
        ))
    }

    async fn stop(&self, _id: &str, _timeout: Option<Duration>) -> SandboxResult<BoxInfo> {
        Err(SandboxError::Unsupported(
            "stop is not implemented on the cluster backend".into(),
        ))
    }

    async fn delete(&self, id: &str, force: bool) -> SandboxResult<()> {
        match self.deployments().delete(id, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(box_id = %id, "deleted box deployment");
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 && force => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(SandboxError::NotFound(format!("box {}", id)))
            }
            Err(e) => Err(Self::map_api_err(e)),
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

    async fn run_code(&self, _id: &str, _params: RunCodeParams) -> SandboxResult<ExecOutput> {
        Err(SandboxError::Unsupported(
            "run-code is not implemented on the cluster backend".into(),
        ))
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
        // A NodePort/LoadBalancer service with the box's name is assumed.
        let service = self.services().get(id).await.map_err(|e| {
            match Self::map_api_err(e) {
                SandboxError::NotFound(_) => {
                    SandboxError::NotFound(format!("service for box {}", id))
                }
                other => other,
            }
        })?;
        let ports = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .ok_or_else(|| {
                SandboxError::InvalidRequest(format!(
                    "service for box {} exposes no ports",
                    id
                ))
            })?;

        ports
            .iter()
            .find(|p| p.port == internal_port as i32)
            .and_then(|p| p.node_port)
            .map(|p| p as u16)
            .ok_or_else(|| {
                SandboxError::Conflict(format!(
                    "no node port published for port {} of box {}",
                    internal_port, id
                ))
            })
    }

    async fn pull_image(
        &self,
        _reference: &str,
        _progress: Option<ProgressSender>,
    ) -> SandboxResult<()> {
        Err(SandboxError::Unsupported(
            "the cluster pulls images itself".into(),
        ))
    }

    async fn list_images(&self, _repository: Option<&str>) -> SandboxResult<Vec<ImageRecord>> {
        Err(SandboxError::Unsupported(
            "image listing is not implemented on the cluster backend".into(),
        ))
    }

    async fn remove_image(&self, _reference: &str, _force: bool) -> SandboxResult<()> {
        Err(SandboxError::Unsupported(
            "image removal is not implemented on the cluster backend".into(),
        ))
    }

    async fn update_image(
        &self,
        _params: ImageUpdateParams,
        _progress: Option<ProgressSender>,
    ) -> SandboxResult<ImageUpdateReport> {
        Err(SandboxError::Unsupported(
            "image update is not implemented on the cluster backend".into(),
        ))
    }

    async fn close(&self) -> SandboxResult<()> {
        Ok(())
    }
}

/// Map deployment readiness to the status enum: available replicas ≥ 1 is
/// running, deletion in progress is removing, anything else is created.
pub(crate) fn map_deployment_status(deployment: &Deployment) -> BoxStatus {
    if deployment.metadata.deletion_timestamp.is_some() {
        return BoxStatus::Removing;
    }
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    if available >= 1 {
        BoxStatus::Running
    } else {
        BoxStatus::Created
    }
}

fn parse_cpu_quantity(quantity: &Quantity) -> Option<f64> {
    let raw = quantity.0.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse::<f64>().ok().map(|m| m / 1000.0);
    }
    raw.parse::<f64>().ok()
}

fn parse_memory_quantity_mib(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();
    if let Some(mib) = raw.strip_suffix("Mi") {
        return mib.parse::<i64>().ok();
    }
    if let Some(gib) = raw.strip_suffix("Gi") {
        return gib.parse::<i64>().ok().map(|g| g * 1024);
    }
    raw.parse::<i64>().ok().map(|bytes| bytes / (1024 * 1024))
}
