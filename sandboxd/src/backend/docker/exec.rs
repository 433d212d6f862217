//! Exec engine: non-interactive exec, run-code, and interactive streaming
//! against the daemon's exec API.

use std::io;
use std::time::Duration;

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use sandboxd_shared::constants::DEFAULT_WORKING_DIR;
use sandboxd_shared::errors::{SandboxError, SandboxResult};

use super::DockerBackend;
use crate::backend::BoxedDuplex;
use crate::backend::types::{
    CodeLanguage, ExecOutput, ExecParams, InteractiveExecParams, InteractiveOutcome, RunCodeParams,
    StreamMode,
};
use crate::stream::{self, StdStreams, StreamKind};
use crate::util::{is_clean_close, parse_duration, truncate_lines};

/// Budget for exit-code retrieval, independent of the request context so
/// cancellation does not erase the status.
const EXIT_CODE_TIMEOUT: Duration = Duration::from_secs(15);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Map a run-code language to the command line and the stdin payload.
pub(crate) fn code_command(
    language: CodeLanguage,
    code: &str,
    argv: &[String],
) -> (Vec<String>, Option<Bytes>) {
    let (mut cmd, stdin): (Vec<String>, Option<Bytes>) = match language {
        CodeLanguage::Python3 => (
            vec!["python3".to_string()],
            Some(Bytes::copy_from_slice(code.as_bytes())),
        ),
        CodeLanguage::Typescript => (
            vec!["npx".to_string(), "ts-node".to_string()],
            Some(Bytes::copy_from_slice(code.as_bytes())),
        ),
        CodeLanguage::Bash => (
            vec!["sh".to_string(), "-c".to_string(), code.to_string()],
            None,
        ),
    };
    cmd.extend(argv.iter().cloned());
    (cmd, stdin)
}

fn env_vec(envs: &std::collections::HashMap<String, String>) -> Vec<String> {
    envs.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = SandboxResult<T>>,
) -> SandboxResult<T> {
    match timeout {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| SandboxError::Timeout(format!("exec did not finish within {:?}", d)))?,
        None => fut.await,
    }
}

fn log_output_kind(output: &LogOutput) -> Option<StreamKind> {
    match output {
        LogOutput::StdOut { .. } => Some(StreamKind::Stdout),
        LogOutput::StdErr { .. } => Some(StreamKind::Stderr),
        // TTY mode collapses everything onto one stream.
        LogOutput::Console { .. } => Some(StreamKind::Stdout),
        LogOutput::StdIn { .. } => None,
    }
}

impl DockerBackend {
    /// Create and attach an exec, feed optional stdin, collect both output
    /// streams to end-of-stream, then read the exit code.
    pub(crate) async fn exec_collect(
        &self,
        box_id: &str,
        cmd: Vec<String>,
        working_dir: Option<String>,
        env: Vec<String>,
        stdin: Option<Bytes>,
    ) -> SandboxResult<(i64, StdStreams)> {
        let name = Self::container_name(box_id);
        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions::<String> {
                    cmd: Some(cmd),
                    env: Some(env),
                    working_dir,
                    attach_stdin: Some(stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Upstream(format!("creating exec: {}", e)))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Upstream(format!("starting exec: {}", e)))?;

        let StartExecResults::Attached { mut output, mut input } = started else {
            return Err(SandboxError::Internal("exec started detached".into()));
        };

        if let Some(data) = stdin {
            // A child that exits without reading stdin breaks the pipe;
            // its output and exit code are still what the caller wants.
            if let Err(e) = input.write_all(&data).await {
                tracing::debug!(box_id = %box_id, error = %e, "stdin write failed");
            }
            // Half-close so the child sees EOF.
            let _ = input.shutdown().await;
        }
        drop(input);

        let mut sink = StdStreams::new();
        while let Some(item) = output.next().await {
            let frame = item.map_err(|e| SandboxError::Upstream(format!("reading exec stream: {}", e)))?;
            if let Some(kind) = log_output_kind(&frame) {
                sink.push(kind, &frame.into_bytes());
            }
        }

        let exit_code = self.wait_exec_exit(&exec.id).await;
        Ok((exit_code, sink))
    }

    /// Poll the exec until it is no longer running and return its exit
    /// code; -1 when the status cannot be retrieved within the budget.
    pub(crate) async fn wait_exec_exit(&self, exec_id: &str) -> i64 {
        let poll = async {
            loop {
                match self.docker.inspect_exec(exec_id).await {
                    Ok(inspect) => {
                        if inspect.running != Some(true) {
                            return inspect.exit_code.unwrap_or(-1);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(exec_id = %exec_id, error = %e, "exec inspect failed");
                        return -1;
                    }
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(EXIT_CODE_TIMEOUT, poll).await {
            Ok(code) => code,
            Err(_) => {
                tracing::warn!(exec_id = %exec_id, "timed out waiting for exec exit code");
                -1
            }
        }
    }

    pub(crate) async fn exec_impl(&self, id: &str, params: ExecParams) -> SandboxResult<ExecOutput> {
        if params.commands.is_empty() {
            return Err(SandboxError::InvalidRequest("commands must not be empty".into()));
        }
        let timeout = params.timeout.as_deref().map(parse_duration).transpose()?;
        self.ensure_running(id).await?;

        let working_dir = Some(
            params
                .working_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
        );
        let (exit_code, streams) = with_timeout(
            timeout,
            self.exec_collect(id, params.commands.clone(), working_dir, env_vec(&params.envs), None),
        )
        .await?;

        Ok(ExecOutput {
            exit_code,
            stdout: truncate_lines(&streams.stdout_utf8(), params.stdout_line_limit),
            stderr: truncate_lines(&streams.stderr_utf8(), params.stderr_line_limit),
        })
    }

    pub(crate) async fn run_code_impl(
        &self,
        id: &str,
        params: RunCodeParams,
    ) -> SandboxResult<ExecOutput> {
        if params.code.is_empty() {
            return Err(SandboxError::InvalidRequest("code must not be empty".into()));
        }
        let timeout = params.timeout.as_deref().map(parse_duration).transpose()?;
        self.ensure_running(id).await?;

        let (cmd, stdin) = code_command(params.language, &params.code, &params.argv);
        let working_dir = Some(
            params
                .working_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
        );
        let (exit_code, streams) = with_timeout(
            timeout,
            self.exec_collect(id, cmd, working_dir, env_vec(&params.envs), stdin),
        )
        .await?;

        Ok(ExecOutput {
            exit_code,
            stdout: streams.stdout_utf8(),
            stderr: streams.stderr_utf8(),
        })
    }

    /// Interactive exec over a hijacked full-duplex stream.
    ///
    /// Two pipes run concurrently: backend output to the client (raw bytes
    /// in TTY mode, re-framed otherwise) and client input to the child's
    /// stdin, which is half-closed when the client closes its write side.
    pub(crate) async fn exec_interactive_impl(
        &self,
        id: &str,
        params: InteractiveExecParams,
        conn: BoxedDuplex,
    ) -> SandboxResult<InteractiveOutcome> {
        if params.commands.is_empty() {
            return Err(SandboxError::InvalidRequest("commands must not be empty".into()));
        }
        self.ensure_running(id).await?;

        let name = Self::container_name(id);
        let tty = params.mode.is_tty();
        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions::<String> {
                    cmd: Some(params.commands.clone()),
                    env: Some(env_vec(&params.envs)),
                    working_dir: Some(
                        params
                            .working_dir
                            .clone()
                            .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
                    ),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(tty),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::Upstream(format!("creating exec: {}", e)))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| SandboxError::Upstream(format!("starting exec: {}", e)))?;
        let StartExecResults::Attached { output, input } = started else {
            return Err(SandboxError::Internal("exec started detached".into()));
        };

        let (client_read, client_write) = tokio::io::split(conn);
        // Termination channel: first completion or error from either pipe
        // decides when to collect the exit code and tear down.
        let (done_tx, mut done_rx) = mpsc::channel::<(&'static str, io::Result<()>)>(2);

        let mode = params.mode;
        let out_tx = done_tx.clone();
        let mut output_pipe = tokio::spawn(async move {
            let mut output = output;
            let mut client_write = client_write;
            let result = async {
                while let Some(item) = output.next().await {
                    let frame = item.map_err(io::Error::other)?;
                    let Some(kind) = log_output_kind(&frame) else {
                        continue;
                    };
                    let payload = frame.into_bytes();
                    match mode {
                        StreamMode::Raw => client_write.write_all(&payload).await?,
                        StreamMode::Multiplexed => {
                            stream::write_frame(&mut client_write, kind, &payload).await?
                        }
                    }
                    client_write.flush().await?;
                }
                Ok(())
            }
            .await;
            // Best-effort closing of the client's read side on every path.
            let _ = client_write.shutdown().await;
            let _ = out_tx.send(("output", result)).await;
        });

        let in_tx = done_tx;
        let stdin_pipe = tokio::spawn(async move {
            let mut client_read = client_read;
            let mut input = input;
            let result = async {
                tokio::io::copy(&mut client_read, &mut input).await?;
                // Orderly client close: half-close the child's stdin.
                input.shutdown().await?;
                Ok(())
            }
            .await;
            let _ = in_tx.send(("stdin", result)).await;
        });

        let (pipe, first) = done_rx.recv().await.unwrap_or(("output", Ok(())));
        if pipe == "stdin" && first.is_ok() {
            // Client half-closed; give the child's remaining output a
            // bounded chance to drain before collecting the exit code.
            let _ = tokio::time::timeout(EXIT_CODE_TIMEOUT, &mut output_pipe).await;
        }

        let exit_code = self.wait_exec_exit(&exec.id).await;

        output_pipe.abort();
        stdin_pipe.abort();

        match first {
            Err(e) if !is_clean_close(&e) => Err(SandboxError::Upstream(format!(
                "interactive exec {} pipe failed: {}",
                pipe, e
            ))),
            _ => Ok(InteractiveOutcome { exit_code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_command_python() {
        let (cmd, stdin) = code_command(CodeLanguage::Python3, "print(1)", &[]);
        assert_eq!(cmd, vec!["python3"]);
        assert_eq!(stdin.unwrap(), Bytes::from_static(b"print(1)"));
    }

    #[test]
    fn test_code_command_typescript_with_argv() {
        let argv = vec!["--fast".to_string()];
        let (cmd, stdin) = code_command(CodeLanguage::Typescript, "console.log(1)", &argv);
        assert_eq!(cmd, vec!["npx", "ts-node", "--fast"]);
        assert!(stdin.is_some());
    }

    #[test]
    fn test_code_command_bash_inlines_code() {
        let argv = vec!["a".to_string(), "b".to_string()];
        let (cmd, stdin) = code_command(CodeLanguage::Bash, "echo $0 $1", &argv);
        assert_eq!(cmd, vec!["sh", "-c", "echo $0 $1", "a", "b"]);
        assert!(stdin.is_none());
    }
}
