//! Exec and filesystem operations over the orchestrator's pod-exec
//! streaming channel.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, ListParams};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use sandboxd_shared::constants::DEFAULT_WORKING_DIR;
use sandboxd_shared::errors::{SandboxError, SandboxResult};

use super::KubeBackend;
use crate::backend::BoxedDuplex;
use crate::backend::fsutil::{
    archive_read_command, archive_write_command, exec_failure, list_command, parse_listing_line,
    stat_from_tar, write_script,
};
use crate::backend::types::{
    BoxFile, ExecOutput, ExecParams, InteractiveExecParams, InteractiveOutcome, PathStat,
    StreamMode,
};
use crate::backend::{ByteStream, kube::k8s_labels};
use crate::stream::{self, Frame, StdStreams, StreamKind};
use crate::util::{is_clean_close, parse_duration, shell_quote, truncate_lines};

/// Budget for exit-status retrieval after the streams close.
const EXIT_CODE_TIMEOUT: Duration = Duration::from_secs(15);

/// The pod-exec channel has no env or working-dir options; wrap the command
/// with `env` and a `cd` shell when either is requested.
fn wrap_command(
    cmd: &[String],
    envs: &HashMap<String, String>,
    working_dir: Option<&str>,
) -> Vec<String> {
    let mut wrapped: Vec<String> = Vec::new();
    if !envs.is_empty() {
        wrapped.push("env".to_string());
        for (k, v) in envs {
            wrapped.push(format!("{}={}", k, v));
        }
    }
    if let Some(dir) = working_dir {
        wrapped.push("sh".to_string());
        wrapped.push("-c".to_string());
        wrapped.push(format!("cd {} && exec \"$@\"", shell_quote(dir)));
        wrapped.push("sh".to_string());
    }
    if wrapped.is_empty() {
        return cmd.to_vec();
    }
    wrapped.extend(cmd.iter().cloned());
    wrapped
}

/// Exit code of a finished pod exec from its terminal Status object.
fn exit_code_from_status(status: Option<Status>) -> i64 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_ref())
        .and_then(|message| message.parse().ok())
        .unwrap_or(-1)
}

impl KubeBackend {
    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Name of a running pod of the box's deployment.
    pub(crate) async fn find_running_pod(&self, id: &str) -> SandboxResult<String> {
        let params =
            ListParams::default().labels(&format!("{}={}", k8s_labels::INSTANCE, id));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| SandboxError::Upstream(format!("listing pods for box {}: {}", id, e)))?;
        if pods.items.is_empty() {
            // Distinguish a missing box from one with no running pod.
            self.get_deployment(id).await?;
        }
        pods.items
            .into_iter()
            .find(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|status| status.phase.as_deref())
                    == Some("Running")
            })
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| SandboxError::NotRunning(format!("box {} has no running pod", id)))
    }

    /// Run a command in the box's pod, feed optional stdin, and collect
    /// both output streams plus the exit code.
    pub(crate) async fn pod_exec_collect(
        &self,
        id: &str,
        cmd: Vec<String>,
        stdin: Option<Bytes>,
    ) -> SandboxResult<(i64, StdStreams)> {
        let pod = self.find_running_pod(id).await?;
        let attach = AttachParams::default()
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true)
            .tty(false);
        let mut attached = self
            .pods()
            .exec(&pod, cmd, &attach)
            .await
            .map_err(|e| SandboxError::Upstream(format!("pod exec: {}", e)))?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let stdin_writer = attached.stdin();
        let status_future = attached.take_status();

        let stdout_fut = async {
            let mut buf = Vec::new();
            if let Some(mut reader) = stdout_reader {
                let _ = reader.read_to_end(&mut buf).await;
            }
            buf
        };
        let stderr_fut = async {
            let mut buf = Vec::new();
            if let Some(mut reader) = stderr_reader {
                let _ = reader.read_to_end(&mut buf).await;
            }
            buf
        };
        let stdin_fut = async {
            if let (Some(mut writer), Some(data)) = (stdin_writer, stdin) {
                if let Err(e) = writer.write_all(&data).await {
                    tracing::debug!(box_id = %id, error = %e, "stdin write failed");
                }
                // Half-close so the child sees EOF.
                let _ = writer.shutdown().await;
            }
        };
        let (stdout, stderr, ()) = tokio::join!(stdout_fut, stderr_fut, stdin_fut);

        let status = match status_future {
            Some(fut) => tokio::time::timeout(EXIT_CODE_TIMEOUT, fut).await.ok().flatten(),
            None => None,
        };

        let mut sink = StdStreams::new();
        sink.push(StreamKind::Stdout, &stdout);
        sink.push(StreamKind::Stderr, &stderr);
        Ok((exit_code_from_status(status), sink))
    }

    pub(crate) async fn exec_impl(&self, id: &str, params: ExecParams) -> SandboxResult<ExecOutput> {
        if params.commands.is_empty() {
            return Err(SandboxError::InvalidRequest("commands must not be empty".into()));
        }
        let timeout = params.timeout.as_deref().map(parse_duration).transpose()?;

        let working_dir = params
            .working_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string());
        let cmd = wrap_command(&params.commands, &params.envs, Some(&working_dir));

        let fut = self.pod_exec_collect(id, cmd, None);
        let (exit_code, streams) = match timeout {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| {
                SandboxError::Timeout(format!("exec did not finish within {:?}", d))
            })??,
            None => fut.await?,
        };

        Ok(ExecOutput {
            exit_code,
            stdout: truncate_lines(&streams.stdout_utf8(), params.stdout_line_limit),
            stderr: truncate_lines(&streams.stderr_utf8(), params.stderr_line_limit),
        })
    }

    /// Interactive exec: the caller-supplied duplex stream is wired to the
    /// pod's stdin/stdout/stderr with the TTY flag from params.
    pub(crate) async fn exec_interactive_impl(
        &self,
        id: &str,
        params: InteractiveExecParams,
        conn: BoxedDuplex,
    ) -> SandboxResult<InteractiveOutcome> {
        if params.commands.is_empty() {
            return Err(SandboxError::InvalidRequest("commands must not be empty".into()));
        }
        let pod = self.find_running_pod(id).await?;
        let tty = params.mode.is_tty();
        let working_dir = params
            .working_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string());
        let cmd = wrap_command(&params.commands, &params.envs, Some(&working_dir));

        let attach = AttachParams::default()
            .stdin(true)
            .stdout(true)
            // TTY merges stderr into stdout.
            .stderr(!tty)
            .tty(tty);
        let mut attached = self
            .pods()
            .exec(&pod, cmd, &attach)
            .await
            .map_err(|e| SandboxError::Upstream(format!("pod exec: {}", e)))?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let stdin_writer = attached.stdin();
        let status_future = attached.take_status();

        let (mut client_read, client_write) = tokio::io::split(conn);
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(32);

        if let Some(mut reader) = stdout_reader {
            let tx = frame_tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                while let Ok(n) = reader.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if tx.send(Frame::stdout(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(mut reader) = stderr_reader {
            let tx = frame_tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                while let Ok(n) = reader.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if tx.send(Frame::stderr(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(frame_tx);

        let mode = params.mode;
        let mut writer_pipe = tokio::spawn(async move {
            let mut client_write = client_write;
            let result: io::Result<()> = async {
                while let Some(frame) = frame_rx.recv().await {
                    match mode {
                        StreamMode::Raw => client_write.write_all(&frame.payload).await?,
                        StreamMode::Multiplexed => {
                            stream::write_frame(&mut client_write, frame.kind, &frame.payload)
                                .await?
                        }
                    }
                    client_write.flush().await?;
                }
                Ok(())
            }
            .await;
            let _ = client_write.shutdown().await;
            result
        });

        let stdin_pipe = tokio::spawn(async move {
            if let Some(mut writer) = stdin_writer {
                let _ = tokio::io::copy(&mut client_read, &mut writer).await;
                // Orderly client close: half-close the child's stdin.
                let _ = writer.shutdown().await;
            }
        });

        // The writer pipe completes once both pod output streams close.
        let pipe_result = match (&mut writer_pipe).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        };

        let exit_code = match status_future {
            Some(fut) => {
                exit_code_from_status(tokio::time::timeout(EXIT_CODE_TIMEOUT, fut).await.ok().flatten())
            }
            None => -1,
        };
        stdin_pipe.abort();

        match pipe_result {
            Err(e) if !is_clean_close(&e) => Err(SandboxError::Upstream(format!(
                "interactive exec pipe failed: {}",
                e
            ))),
            _ => Ok(InteractiveOutcome { exit_code }),
        }
    }

    pub(crate) async fn list_files_impl(
        &self,
        id: &str,
        path: &str,
        depth: u32,
    ) -> SandboxResult<Vec<BoxFile>> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        let (cmd, format) = list_command(path, depth);
        let (exit_code, streams) = self.pod_exec_collect(id, cmd, None).await?;
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
        let cmd = vec!["cat".to_string(), path.to_string()];
        let (exit_code, streams) = self.pod_exec_collect(id, cmd, None).await?;
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
        if let Some((dir, _)) = path.rsplit_once('/') {
            if !dir.is_empty() {
                let cmd = vec!["mkdir".to_string(), "-p".to_string(), dir.to_string()];
                let (exit_code, streams) = self.pod_exec_collect(id, cmd, None).await?;
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
        let (exit_code, streams) = self.pod_exec_collect(id, cmd, None).await?;
        if exit_code != 0 {
            return Err(exec_failure("writing", path, &streams));
        }
        Ok(())
    }

    pub(crate) async fn get_archive_impl(
        &self,
        id: &str,
        path: &str,
    ) -> SandboxResult<(PathStat, ByteStream)> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        let (exit_code, streams) = self
            .pod_exec_collect(id, archive_read_command(path), None)
            .await?;
        if exit_code != 0 {
            return Err(exec_failure("archiving", path, &streams));
        }
        let data = streams.stdout;
        let stat = stat_from_tar(&data, path)?;
        let byte_stream: ByteStream =
            Box::pin(futures::stream::once(async move { Ok(Bytes::from(data)) }));
        Ok((stat, byte_stream))
    }

    pub(crate) async fn head_archive_impl(&self, id: &str, path: &str) -> SandboxResult<PathStat> {
        if path.is_empty() {
            return Err(SandboxError::InvalidRequest("path must not be empty".into()));
        }
        let (exit_code, streams) = self
            .pod_exec_collect(id, archive_read_command(path), None)
            .await?;
        if exit_code != 0 {
            return Err(exec_failure("archiving", path, &streams));
        }
        stat_from_tar(&streams.stdout, path)
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
        let (exit_code, streams) = self
            .pod_exec_collect(id, archive_write_command(path), Some(archive))
            .await?;
        if exit_code != 0 {
            return Err(exec_failure("extracting archive into", path, &streams));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails};

    #[test]
    fn test_wrap_command_passthrough() {
        let cmd = vec!["ls".to_string()];
        assert_eq!(wrap_command(&cmd, &HashMap::new(), None), vec!["ls"]);
    }

    #[test]
    fn test_wrap_command_with_env_and_cwd() {
        let cmd = vec!["ls".to_string(), "-la".to_string()];
        let envs = HashMap::from([("X".to_string(), "1".to_string())]);
        let wrapped = wrap_command(&cmd, &envs, Some("/work"));
        assert_eq!(
            wrapped,
            vec![
                "env",
                "X=1",
                "sh",
                "-c",
                "cd '/work' && exec \"$@\"",
                "sh",
                "ls",
                "-la"
            ]
        );
    }

    #[test]
    fn test_exit_code_success() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(status)), 0);
    }

    #[test]
    fn test_exit_code_from_causes() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("3".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(status)), 3);
    }

    #[test]
    fn test_exit_code_missing_status() {
        assert_eq!(exit_code_from_status(None), -1);
        let vague = Status {
            status: Some("Failure".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(vague)), -1);
    }
}
