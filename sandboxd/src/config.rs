//! Service configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::time::Duration;

use sandboxd_shared::constants::DEFAULT_IMAGE_REPO;
use sandboxd_shared::errors::SandboxResult;

use crate::backend::MODE_DAEMON;
use crate::util::{normalize_image_ref, parse_duration};

/// Immutable configuration snapshot held by the facade and both backends.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Backend selection: `daemon` or `cluster`.
    pub mode: String,
    /// Label namespace value; also the tenant namespace of the cluster
    /// backend.
    pub namespace: String,
    /// Daemon endpoint, e.g. `unix:///var/run/docker.sock` or
    /// `tcp://127.0.0.1:2375`. Platform default when unset.
    pub daemon_host: Option<String>,
    /// Kubeconfig path for the cluster backend; in-cluster config when
    /// unset.
    pub cluster_config: Option<PathBuf>,
    /// Where the service reads per-box share directories.
    pub share_dir: PathBuf,
    /// The same directories as seen by the container daemon's host.
    pub host_share_dir: PathBuf,
    /// Idle time after which a running box is stopped.
    pub reclaim_stop_threshold: Duration,
    /// Idle time after which a stopped box is deleted.
    pub reclaim_delete_threshold: Duration,
    /// Tag applied to untagged image references.
    pub default_image_tag: Option<String>,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mode: MODE_DAEMON.to_string(),
            namespace: "sandboxd".to_string(),
            daemon_host: None,
            cluster_config: None,
            share_dir: PathBuf::from("/var/lib/sandboxd/share"),
            host_share_dir: PathBuf::from("/var/lib/sandboxd/share"),
            reclaim_stop_threshold: Duration::from_secs(30 * 60),
            reclaim_delete_threshold: Duration::from_secs(24 * 60 * 60),
            default_image_tag: None,
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Build the configuration from the process environment.
    ///
    /// Unset variables fall back to defaults; ill-formed duration strings
    /// are an error rather than a silent fallback.
    pub fn from_env() -> SandboxResult<Self> {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("MODE") {
            config.mode = mode;
        }
        if let Ok(namespace) = std::env::var("NAMESPACE") {
            config.namespace = namespace;
        }
        if let Ok(host) = std::env::var("DAEMON_HOST") {
            config.daemon_host = Some(host);
        }
        if let Ok(path) = std::env::var("CLUSTER_CONFIG") {
            config.cluster_config = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("SHARE_DIR") {
            config.share_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("HOST_SHARE_DIR") {
            config.host_share_dir = PathBuf::from(dir);
        }
        if let Ok(threshold) = std::env::var("RECLAIM_STOP_THRESHOLD") {
            config.reclaim_stop_threshold = parse_duration(&threshold)?;
        }
        if let Ok(threshold) = std::env::var("RECLAIM_DELETE_THRESHOLD") {
            config.reclaim_delete_threshold = parse_duration(&threshold)?;
        }
        if let Ok(tag) = std::env::var("DEFAULT_IMAGE_TAG") {
            config.default_image_tag = Some(tag);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// The image pulled at startup and used when a create omits one.
    pub fn default_image(&self) -> String {
        self.normalize_image(DEFAULT_IMAGE_REPO)
    }

    /// Normalize a reference to `repository:tag` using the configured
    /// default tag, falling back to `latest`.
    pub fn normalize_image(&self, reference: &str) -> String {
        normalize_image_ref(reference, self.default_image_tag.as_deref())
    }

    /// Host directory bind-mounted into a box at the share mount point.
    pub fn host_share_for(&self, box_id: &str) -> PathBuf {
        self.host_share_dir.join(box_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_image_uses_configured_tag() {
        let config = ServiceConfig {
            default_image_tag: Some("v0.3".to_string()),
            ..Default::default()
        };
        assert_eq!(config.default_image(), format!("{}:v0.3", DEFAULT_IMAGE_REPO));

        let config = ServiceConfig::default();
        assert_eq!(config.default_image(), format!("{}:latest", DEFAULT_IMAGE_REPO));
    }

    #[test]
    fn test_host_share_for() {
        let config = ServiceConfig::default();
        assert_eq!(
            config.host_share_for("abc"),
            PathBuf::from("/var/lib/sandboxd/share/abc")
        );
    }
}
