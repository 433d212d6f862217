//! Canonical box representation and operation parameter types.
//!
//! These are the types the HTTP layer serializes; both backends translate
//! between them and their native object models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sandboxd_shared::errors::{SandboxError, SandboxResult};

/// Lifecycle status of a box, derived from the backend-native state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxStatus {
    Created,
    Running,
    Restarting,
    Removing,
    Paused,
    Stopped,
    Dead,
    /// Cannot determine box state.
    Unknown,
}

impl BoxStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, BoxStatus::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, BoxStatus::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BoxStatus::Created => "created",
            BoxStatus::Running => "running",
            BoxStatus::Restarting => "restarting",
            BoxStatus::Removing => "removing",
            BoxStatus::Paused => "paused",
            BoxStatus::Stopped => "stopped",
            BoxStatus::Dead => "dead",
            BoxStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for BoxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of box a caller may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BoxKind {
    #[default]
    Linux,
    Android,
}

impl BoxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoxKind::Linux => "linux",
            BoxKind::Android => "android",
        }
    }
}

/// Screen resolution recorded on a box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Browser installed in the box image, if the image declares one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsSpec {
    pub version: String,
}

/// User-facing configuration snapshot of a box.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxConfig {
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// User-visible labels (internal prefix stripped).
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Decimal CPU cores.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Memory limit in MiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<i64>,
    /// Storage limit in GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_gib: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsSpec>,
}

/// Canonical box representation returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxInfo {
    /// Opaque, globally unique, immutable.
    pub id: String,
    pub status: BoxStatus,
    /// `repository:tag`.
    pub image: String,
    #[serde(rename = "type")]
    pub kind: BoxKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `created_at + expires_in` when an expiry was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub config: BoxConfig,
    /// User labels only, internal prefix stripped.
    #[serde(default)]
    pub extra_labels: HashMap<String, String>,
}

/// Bind mount requested at create time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation: Option<String>,
}

/// Parameters for creating a box.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBoxParams {
    /// `repository[:tag]`; the configured default image when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: BoxKind,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// User labels, persisted under the internal extra prefix.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_gib: Option<i64>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Container ports to publish on the host.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Duration string, e.g. `2h`; recorded, enforcement is the reclaimer's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<String>,
    /// Block until the backend-native health probe reports healthy.
    #[serde(default)]
    pub wait_for_ready: bool,
    /// Duration string bounding the readiness wait; default 30s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout: Option<String>,
}

/// Listing filters; each backend maps these to its native filter syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoxFilter {
    Id(String),
    LabelKey(String),
    LabelKeyValue(String, String),
    Ancestor(String),
}

impl BoxFilter {
    /// Parse a `key=value` query term: `id=v`, `label=k`, `label=k=v`,
    /// `ancestor=image`.
    pub fn parse(term: &str) -> SandboxResult<Self> {
        let (key, value) = term
            .split_once('=')
            .ok_or_else(|| SandboxError::InvalidRequest(format!("bad filter: {}", term)))?;
        match key {
            "id" => Ok(BoxFilter::Id(value.to_string())),
            "ancestor" => Ok(BoxFilter::Ancestor(value.to_string())),
            "label" => match value.split_once('=') {
                Some((k, v)) => Ok(BoxFilter::LabelKeyValue(k.to_string(), v.to_string())),
                None => Ok(BoxFilter::LabelKey(value.to_string())),
            },
            other => Err(SandboxError::InvalidRequest(format!(
                "unknown filter key: {}",
                other
            ))),
        }
    }
}

/// Parameters for a non-interactive exec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecParams {
    pub commands: Vec<String>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Duration string, e.g. `30s`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Keep only the first N lines of stdout; -1 disables the cap.
    #[serde(default = "no_line_cap")]
    pub stdout_line_limit: i64,
    #[serde(default = "no_line_cap")]
    pub stderr_line_limit: i64,
}

fn no_line_cap() -> i64 {
    -1
}

/// Result of a non-interactive exec or run-code call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Wire format negotiated for an interactive exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// TTY; no framing, single raw byte stream.
    Raw,
    /// Framed stdout/stderr multiplexing.
    #[default]
    Multiplexed,
}

impl StreamMode {
    pub fn is_tty(&self) -> bool {
        matches!(self, StreamMode::Raw)
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            StreamMode::Raw => sandboxd_shared::constants::media::RAW_STREAM,
            StreamMode::Multiplexed => sandboxd_shared::constants::media::MULTIPLEXED_STREAM,
        }
    }
}

/// Parameters for an interactive, bidirectional exec.
#[derive(Debug, Clone, Default)]
pub struct InteractiveExecParams {
    pub commands: Vec<String>,
    pub envs: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub mode: StreamMode,
}

/// Outcome of an interactive exec; output has already been streamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveOutcome {
    pub exit_code: i64,
}

/// Languages accepted by run-code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    Python3,
    Typescript,
    Bash,
}

/// Parameters for running inlined code inside a box.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCodeParams {
    pub language: CodeLanguage,
    pub code: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// One directory entry reported by the file listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoxFile {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: i64,
    /// Permission string as printed by `ls`, e.g. `-rw-r--r--`.
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Stat of the path addressed by an archive request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathStat {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
}

/// Parameters for the synchronous image-update request path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdateParams {
    /// `repository[:tag]`; the configured default image when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_reference: Option<String>,
    /// Report only; nothing is pulled or deleted.
    #[serde(default)]
    pub dry_run: bool,
    /// Pull even when the target tag is already present.
    #[serde(default)]
    pub force: bool,
}

/// What happened (or would happen) to one image reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageAction {
    UpToDate,
    Pulled,
    WouldPull,
    Removed,
    WouldRemove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReport {
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub action: ImageAction,
}

/// Report of an image-update request: the target plus every outdated
/// sibling tag of the same repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageUpdateReport {
    pub target: ImageReport,
    pub outdated: Vec<ImageReport>,
}

/// One record of a streamed progress sequence (create, image update).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub status: ProgressStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Prepare,
    Progress,
    Complete,
    Error,
}

impl ProgressRecord {
    pub fn progress(message: impl Into<String>) -> Self {
        Self {
            status: ProgressStatus::Progress,
            message: Some(message.into()),
            error: None,
            image_id: None,
        }
    }

    pub fn prepare(message: impl Into<String>) -> Self {
        Self {
            status: ProgressStatus::Prepare,
            message: Some(message.into()),
            error: None,
            image_id: None,
        }
    }

    pub fn complete(message: impl Into<String>, image_id: Option<String>) -> Self {
        Self {
            status: ProgressStatus::Complete,
            message: Some(message.into()),
            error: None,
            image_id,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: ProgressStatus::Error,
            message: None,
            error: Some(error.into()),
            image_id: None,
        }
    }
}

/// Channel end progress records are pushed into; dropped receivers are fine.
pub type ProgressSender = tokio::sync::mpsc::Sender<ProgressRecord>;
