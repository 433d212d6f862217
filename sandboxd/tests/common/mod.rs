//! Shared test fixtures: an in-memory mock backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;

use sandboxd::backend::types::{
    BoxConfig, BoxFile, BoxFilter, BoxInfo, BoxKind, BoxStatus, CreateBoxParams, ExecOutput,
    ExecParams, FileKind, ImageAction, ImageReport, ImageUpdateParams, ImageUpdateReport,
    InteractiveExecParams, InteractiveOutcome, PathStat, ProgressSender, RunCodeParams,
};
use sandboxd::backend::{BoxBackend, BoxedDuplex, ByteStream, ImageRecord};
use sandboxd::{SandboxError, SandboxResult};

#[derive(Debug, Clone)]
pub struct MockBox {
    pub info: BoxInfo,
    pub files: HashMap<String, String>,
}

/// In-memory backend recording every call that matters to the suites.
#[derive(Default)]
pub struct MockBackend {
    pub boxes: Mutex<HashMap<String, MockBox>>,
    pub images: Mutex<Vec<ImageRecord>>,
    pub removed_images: Mutex<Vec<String>>,
    pub pull_count: AtomicUsize,
    /// Simulated duration of one pull.
    pub pull_delay: Mutex<Option<Duration>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_images(images: Vec<ImageRecord>) -> Arc<Self> {
        let backend = Self::new();
        *backend.images.lock() = images;
        backend
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock() = Some(delay);
    }

    pub fn status_of(&self, id: &str) -> Option<BoxStatus> {
        self.boxes.lock().get(id).map(|b| b.info.status)
    }

    fn require_box(&self, id: &str) -> SandboxResult<MockBox> {
        self.boxes
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("box {}", id)))
    }
}

#[async_trait]
impl BoxBackend for MockBackend {
    async fn get(&self, id: &str) -> SandboxResult<BoxInfo> {
        self.require_box(id).map(|b| b.info)
    }

    async fn list(&self, filters: &[BoxFilter]) -> SandboxResult<Vec<BoxInfo>> {
        let boxes = self.boxes.lock();
        let mut out: Vec<BoxInfo> = boxes
            .values()
            .filter(|b| {
                filters.iter().all(|filter| match filter {
                    BoxFilter::Id(id) => b.info.id == *id,
                    BoxFilter::LabelKey(key) => b.info.extra_labels.contains_key(key),
                    BoxFilter::LabelKeyValue(key, value) => {
                        b.info.extra_labels.get(key) == Some(value)
                    }
                    BoxFilter::Ancestor(image) => b.info.image == *image,
                })
            })
            .map(|b| b.info.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn create(
        &self,
        params: CreateBoxParams,
        _progress: Option<ProgressSender>,
    ) -> SandboxResult<BoxInfo> {
        if params.kind == BoxKind::Android {
            return Err(SandboxError::Unsupported("android boxes".into()));
        }
        let now = Utc::now();
        let info = BoxInfo {
            id: uuid::Uuid::new_v4().to_string(),
            status: BoxStatus::Running,
            image: params.image.clone().unwrap_or_else(|| "mock:latest".into()),
            kind: params.kind,
            created_at: now,
            updated_at: now,
            expires_at: None,
            config: BoxConfig {
                envs: params.envs.clone(),
                labels: params.labels.clone(),
                working_dir: params.working_dir.clone(),
                cpu: params.cpu,
                memory_mib: params.memory_mib,
                ..Default::default()
            },
            extra_labels: params.labels,
        };
        self.boxes.lock().insert(
            info.id.clone(),
            MockBox {
                info: info.clone(),
                files: HashMap::new(),
            },
        );
        Ok(info)
    }

    async fn start(&self, id: &str) -> SandboxResult<BoxInfo> {
        let mut boxes = self.boxes.lock();
        let entry = boxes
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("box {}", id)))?;
        entry.info.status = BoxStatus::Running;
        Ok(entry.info.clone())
    }

    async fn stop(&self, id: &str, _timeout: Option<Duration>) -> SandboxResult<BoxInfo> {
        let mut boxes = self.boxes.lock();
        let entry = boxes
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("box {}", id)))?;
        entry.info.status = BoxStatus::Stopped;
        Ok(entry.info.clone())
    }

    async fn delete(&self, id: &str, force: bool) -> SandboxResult<()> {
        let removed = self.boxes.lock().remove(id).is_some();
        if !removed && !force {
            return Err(SandboxError::NotFound(format!("box {}", id)));
        }
        Ok(())
    }

    async fn exec(&self, id: &str, params: ExecParams) -> SandboxResult<ExecOutput> {
        let entry = self.require_box(id)?;
        if entry.info.status != BoxStatus::Running {
            return Err(SandboxError::NotRunning(format!("box {}", id)));
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: params.commands.join(" "),
            stderr: String::new(),
        })
    }

    async fn exec_interactive(
        &self,
        id: &str,
        _params: InteractiveExecParams,
        _conn: BoxedDuplex,
    ) -> SandboxResult<InteractiveOutcome> {
        self.require_box(id)?;
        Ok(InteractiveOutcome { exit_code: 0 })
    }

    async fn run_code(&self, id: &str, _params: RunCodeParams) -> SandboxResult<ExecOutput> {
        self.require_box(id)?;
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn list_files(&self, id: &str, path: &str, _depth: u32) -> SandboxResult<Vec<BoxFile>> {
        let entry = self.require_box(id)?;
        Ok(entry
            .files
            .iter()
            .filter(|(p, _)| p.starts_with(path))
            .map(|(p, content)| BoxFile {
                name: p.rsplit('/').next().unwrap_or(p).to_string(),
                path: p.clone(),
                kind: FileKind::File,
                size: content.len() as i64,
                mode: "-rw-r--r--".to_string(),
                mod_time: None,
            })
            .collect())
    }

    async fn read_file(&self, id: &str, path: &str) -> SandboxResult<String> {
        let entry = self.require_box(id)?;
        entry
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("file {}", path)))
    }

    async fn write_file(&self, id: &str, path: &str, content: &str) -> SandboxResult<()> {
        let mut boxes = self.boxes.lock();
        let entry = boxes
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(format!("box {}", id)))?;
        entry.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn get_archive(&self, id: &str, _path: &str) -> SandboxResult<(PathStat, ByteStream)> {
        self.require_box(id)?;
        Err(SandboxError::Unsupported("mock archives".into()))
    }

    async fn head_archive(&self, id: &str, _path: &str) -> SandboxResult<PathStat> {
        self.require_box(id)?;
        Err(SandboxError::Unsupported("mock archives".into()))
    }

    async fn extract_archive(&self, id: &str, _path: &str, _archive: Bytes) -> SandboxResult<()> {
        self.require_box(id)?;
        Err(SandboxError::Unsupported("mock archives".into()))
    }

    async fn get_external_port(&self, id: &str, internal_port: u16) -> SandboxResult<u16> {
        self.require_box(id)?;
        Err(SandboxError::InvalidRequest(format!(
            "port {} is not exposed",
            internal_port
        )))
    }

    async fn pull_image(
        &self,
        _reference: &str,
        _progress: Option<ProgressSender>,
    ) -> SandboxResult<()> {
        let delay = *self.pull_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_images(&self, repository: Option<&str>) -> SandboxResult<Vec<ImageRecord>> {
        let images = self.images.lock();
        Ok(images
            .iter()
            .filter(|record| match repository {
                Some(repo) => record.repo_tags.iter().any(|tag| tag.starts_with(repo)),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn remove_image(&self, reference: &str, _force: bool) -> SandboxResult<()> {
        self.removed_images.lock().push(reference.to_string());
        self.images.lock().retain(|record| {
            !record.repo_tags.iter().any(|tag| tag == reference)
        });
        Ok(())
    }

    async fn update_image(
        &self,
        params: ImageUpdateParams,
        _progress: Option<ProgressSender>,
    ) -> SandboxResult<ImageUpdateReport> {
        Ok(ImageUpdateReport {
            target: ImageReport {
                reference: params.image_reference.unwrap_or_else(|| "mock:latest".into()),
                image_id: None,
                action: ImageAction::UpToDate,
            },
            outdated: Vec::new(),
        })
    }

    async fn close(&self) -> SandboxResult<()> {
        Ok(())
    }
}
