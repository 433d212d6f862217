//! Container filesystem operations, built on exec and the archive API.

use bollard::container::{DownloadFromContainerOptions, UploadToContainerOptions};
use bytes::Bytes;
use futures::StreamExt;

use sandboxd_shared::errors::{SandboxError, SandboxResult};

use super::DockerBackend;
use crate::backend::ByteStream;
use crate::backend::fsutil::{
    exec_failure, list_command, parse_listing_line, stat_from_tar, write_script,
};
use crate::backend::types::{BoxFile, PathStat};

impl DockerBackend {
    pub(crate) async fn list_files_impl(
        &self,
        id: &str,
        path: &str,
        depth: u32,
    ) -> SandboxResult<Vec<BoxFile>> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        self.ensure_running(id).await?;

        let (cmd, format) = list_command(path, depth);
        let (exit_code, streams) = self.exec_collect(id, cmd, None, Vec::new(), None).await?;
        if exit_code != 0 {
            return Err(exec_failure("listing", path, &streams));
        }

        let stdout = streams.stdout_utf8();
        Ok(stdout
            .lines()
            .filter_map(|line| parse_listing_line(line, path, format))
            .collect())
    }

    pub(crate) async fn read_file_impl(&self, id: &str, path: &str) -> SandboxResult<String> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        self.ensure_running(id).await?;

        let cmd = vec!["cat".to_string(), path.to_string()];
        let (exit_code, streams) = self.exec_collect(id, cmd, None, Vec::new(), None).await?;
        if exit_code != 0 {
            return Err(exec_failure("reading", path, &streams));
        }
        Ok(streams.stdout_utf8().trim_end().to_string())
    }

    pub(crate) async fn write_file_impl(
        &self,
        id: &str,
        path: &str,
        content: &str,
    ) -> SandboxResult<()> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        self.ensure_running(id).await?;

        if let Some((dir, _)) = path.rsplit_once('/') {
            if !dir.is_empty() {
                let cmd = vec!["mkdir".to_string(), "-p".to_string(), dir.to_string()];
                let (exit_code, streams) =
                    self.exec_collect(id, cmd, None, Vec::new(), None).await?;
                if exit_code != 0 {
                    return Err(exec_failure("creating directory for", path, &streams));
                }
            }
        }

        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            write_script(path, content),
        ];
        let (exit_code, streams) = self.exec_collect(id, cmd, None, Vec::new(), None).await?;
        if exit_code != 0 {
            return Err(exec_failure("writing", path, &streams));
        }
        Ok(())
    }

    async fn download_archive(&self, id: &str, path: &str) -> SandboxResult<Vec<u8>> {
        let mut stream = self.docker.download_from_container(
            &Self::container_name(id),
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message,
                } => SandboxError::NotFound(message),
                other => SandboxError::Upstream(format!("downloading archive: {}", other)),
            })?;
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }

    pub(crate) async fn get_archive_impl(
        &self,
        id: &str,
        path: &str,
    ) -> SandboxResult<(PathStat, ByteStream)> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        self.inspect(id).await?;
        let data = self.download_archive(id, path).await?;
        let stat = stat_from_tar(&data, path)?;
        let stream: ByteStream =
            Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }));
        Ok((stat, stream))
    }

    pub(crate) async fn head_archive_impl(&self, id: &str, path: &str) -> SandboxResult<PathStat> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        self.inspect(id).await?;
        let data = self.download_archive(id, path).await?;
        stat_from_tar(&data, path)
    }

    pub(crate) async fn extract_archive_impl(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> SandboxResult<()> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        self.inspect(id).await?;
        self.docker
            .upload_to_container(
                &Self::container_name(id),
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| SandboxError::Upstream(format!("extracting archive: {}", e)))
    }
}
