//! Subprocess agent.
//!
//! Runs the configured agent CLI once per execution. Key responsibilities:
//! - Stream stdout/stderr lines to the engine as they arrive
//! - Bound in-memory output capture
//! - Enforce an optional timeout and kill the child on interrupt
//! - Log a heartbeat while the agent runs

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use taskloop_core::{AgentResult, AgentStatus, Config, Id, OutputStream};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentError, AgentInfo, ExecuteOptions, ExecutionHandle, OutputChunk, Result};

/// Interval between heartbeat log messages during long-running executions.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for collecting stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes of stdout/stderr kept in memory per stream.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Upper bound for `<command> --version`.
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut(Duration),
    Cancelled,
    WaitFailed(std::io::Error),
}

/// Read `reader` line by line, forwarding each line to `output` and keeping
/// at most `max_bytes` in the returned buffer.
async fn stream_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: OutputStream,
    output: UnboundedSender<OutputChunk>,
    max_bytes: usize,
) -> std::io::Result<String> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(1024);
    let mut captured = String::new();
    let mut truncated = false;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line).into_owned();

        if !truncated {
            let remaining = max_bytes.saturating_sub(captured.len());
            if text.len() <= remaining {
                captured.push_str(&text);
            } else {
                let mut cut = remaining;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                captured.push_str(&text[..cut]);
                warn!(max_bytes, stream = ?stream, "agent output exceeded limit, truncating");
                truncated = true;
            }
        }

        // The engine may have stopped listening; keep draining the pipe anyway.
        let _ = output.send(OutputChunk { stream, data: text });
    }

    Ok(captured)
}

/// Wait for a capture task, giving up after `IO_CAPTURE_TIMEOUT`.
async fn collect(
    task: Option<JoinHandle<std::io::Result<String>>>,
    stream: &str,
    execution_id: &str,
) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(execution_id, stream, error = %err, "output capture failed");
            String::new()
        }
        Ok(Err(err)) => {
            warn!(execution_id, stream, error = %err, "output task panicked");
            String::new()
        }
        Err(_) => {
            warn!(execution_id, stream, "output capture timed out");
            String::new()
        }
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Agent that spawns `command args.. flags.. prompt` per execution.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    command: String,
    args: Vec<String>,
}

impl ProcessAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.agent_command.clone(), config.agent_args.clone())
    }

    fn spawn_error(&self, err: std::io::Error) -> AgentError {
        if err.kind() == std::io::ErrorKind::NotFound {
            AgentError::Unavailable(format!("`{}` not found on PATH", self.command))
        } else {
            AgentError::Spawn(format!("{}: {err}", self.command))
        }
    }

    /// Attached files are referenced from the prompt as `@path` mentions.
    fn full_prompt(prompt: &str, files: &[PathBuf]) -> String {
        if files.is_empty() {
            return prompt.to_string();
        }
        let mentions: Vec<String> = files
            .iter()
            .map(|f| format!("@{}", f.display()))
            .collect();
        format!("{prompt}\n\n{}", mentions.join("\n"))
    }
}

#[async_trait]
impl Agent for ProcessAgent {
    fn name(&self) -> &str {
        &self.command
    }

    async fn detect(&self) -> Result<AgentInfo> {
        let probe = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(DETECT_TIMEOUT, probe)
            .await
            .map_err(|_| {
                AgentError::Unavailable(format!("`{} --version` timed out", self.command))
            })?
            .map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            return Err(AgentError::Unavailable(format!(
                "`{} --version` exited with {}",
                self.command, output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(AgentInfo {
            name: self.command.clone(),
            version: (!version.is_empty()).then_some(version),
        })
    }

    fn execute(
        &self,
        prompt: &str,
        files: &[PathBuf],
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle> {
        let execution_id = Id::new().to_string();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .args(&options.flags)
            .arg(Self::full_prompt(prompt, files))
            .current_dir(&options.cwd)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            execution_id = %execution_id,
            command = %self.command,
            cwd = %options.cwd.display(),
            "spawning agent process"
        );
        let child = cmd.spawn().map_err(|err| self.spawn_error(err))?;

        let cancel = CancellationToken::new();
        let supervised = supervise(child, execution_id.clone(), options, cancel.clone());
        Ok(ExecutionHandle::spawn(execution_id, cancel, supervised))
    }
}

/// Drive one child process to completion and build its result.
async fn supervise(
    mut child: Child,
    execution_id: String,
    options: ExecuteOptions,
    cancel: CancellationToken,
) -> AgentResult {
    let started = Instant::now();
    let ExecuteOptions {
        timeout: limit,
        output,
        ..
    } = options;

    let stdout_task = child.stdout.take().map(|stdout| {
        tokio::spawn(stream_lines(
            stdout,
            OutputStream::Stdout,
            output.clone(),
            MAX_OUTPUT_BYTES,
        ))
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(stream_lines(
            stderr,
            OutputStream::Stderr,
            output.clone(),
            MAX_OUTPUT_BYTES,
        ))
    });
    drop(output);

    let outcome = loop {
        let elapsed = started.elapsed();

        if let Some(limit) = limit {
            if elapsed >= limit {
                warn!(execution_id = %execution_id, timeout_sec = limit.as_secs(), "agent timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(execution_id = %execution_id, error = %err, "failed to kill timed-out agent");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut(limit);
            }
        }

        let remaining = limit.map_or(Duration::MAX, |l| l.saturating_sub(elapsed));
        let sleep_for = HEARTBEAT_INTERVAL.min(remaining);

        tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => break ProcessOutcome::Completed(status),
                    Err(err) => break ProcessOutcome::WaitFailed(err),
                }
            }
            () = cancel.cancelled() => {
                info!(execution_id = %execution_id, "interrupt requested; killing agent");
                if let Err(err) = child.kill().await {
                    warn!(execution_id = %execution_id, error = %err, "failed to kill interrupted agent");
                }
                let _ = child.wait().await;
                break ProcessOutcome::Cancelled;
            }
            () = tokio::time::sleep(sleep_for) => {
                info!(
                    execution_id = %execution_id,
                    elapsed_sec = started.elapsed().as_secs(),
                    "agent still running"
                );
            }
        }
    };

    let stdout = collect(stdout_task, "stdout", &execution_id).await;
    let stderr = collect(stderr_task, "stderr", &execution_id).await;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (status, exit_code, interrupted, error) = match outcome {
        ProcessOutcome::Completed(exit) => {
            let status = if exit.success() {
                AgentStatus::Completed
            } else {
                AgentStatus::Failed
            };
            (status, exit.code(), false, None)
        }
        ProcessOutcome::TimedOut(limit) => (
            AgentStatus::Failed,
            None,
            false,
            Some(format!("agent timed out after {}s", limit.as_secs())),
        ),
        ProcessOutcome::Cancelled => (
            AgentStatus::Failed,
            None,
            true,
            Some("agent execution interrupted".to_string()),
        ),
        ProcessOutcome::WaitFailed(err) => (
            AgentStatus::Failed,
            None,
            false,
            Some(format!("failed to wait for agent: {err}")),
        ),
    };

    let preview = {
        let lines: Vec<&str> = stdout.lines().rev().take(3).collect();
        lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
    };
    info!(
        execution_id = %execution_id,
        status = ?status,
        exit_code = ?exit_code,
        duration_ms,
        output_bytes = stdout.len(),
        output_preview = %truncate_str(&preview, 120),
        "agent execution complete"
    );

    AgentResult {
        execution_id,
        status,
        exit_code,
        stdout,
        stderr,
        duration_ms,
        interrupted,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn shell(script: &str) -> ProcessAgent {
        ProcessAgent::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn options(
        cwd: PathBuf,
        limit: Option<Duration>,
    ) -> (ExecuteOptions, mpsc::UnboundedReceiver<OutputChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ExecuteOptions {
                cwd,
                flags: Vec::new(),
                env: HashMap::new(),
                timeout: limit,
                output: tx,
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutputChunk>) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn execute_streams_both_streams() {
        let dir = TempDir::new().unwrap();
        let agent = shell("echo hello; echo oops >&2; echo '<promise>COMPLETE</promise>'");
        let (opts, mut rx) = options(dir.path().to_path_buf(), None);

        let result = agent.execute("prompt", &[], opts).unwrap().wait().await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("hello"));
        assert!(result.stdout.contains("<promise>COMPLETE</promise>"));
        assert_eq!(result.stderr, "oops\n");

        let chunks = drain(&mut rx);
        assert!(chunks.contains(&OutputChunk::stdout("hello\n")));
        assert!(chunks.contains(&OutputChunk::stderr("oops\n")));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let dir = TempDir::new().unwrap();
        let (opts, _rx) = options(dir.path().to_path_buf(), None);
        let result = shell("exit 3")
            .execute("prompt", &[], opts)
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.interrupted);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn interrupt_kills_process() {
        let dir = TempDir::new().unwrap();
        let (opts, _rx) = options(dir.path().to_path_buf(), None);
        let handle = shell("sleep 30").execute("prompt", &[], opts).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_running());
        handle.interrupt();

        let started = Instant::now();
        let result = handle.wait().await.unwrap();
        assert!(result.interrupted);
        assert_eq!(result.status, AgentStatus::Failed);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_fails_without_interrupt_flag() {
        let dir = TempDir::new().unwrap();
        let (opts, _rx) = options(dir.path().to_path_buf(), Some(Duration::from_millis(200)));
        let result = shell("sleep 30")
            .execute("prompt", &[], opts)
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(result.status, AgentStatus::Failed);
        assert!(!result.interrupted);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cwd_and_env_are_applied() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "in-workdir\n").unwrap();
        let (mut opts, _rx) = options(dir.path().to_path_buf(), None);
        opts.env
            .insert("TASKLOOP_TEST_VAR".to_string(), "from-env".to_string());

        let result = shell("cat marker.txt; echo \"$TASKLOOP_TEST_VAR\"")
            .execute("prompt", &[], opts)
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(result.stdout, "in-workdir\nfrom-env\n");
    }

    #[tokio::test]
    async fn prompt_and_flags_are_passed_as_arguments() {
        let dir = TempDir::new().unwrap();
        let (mut opts, _rx) = options(dir.path().to_path_buf(), None);
        opts.flags = vec!["--model".to_string(), "opus".to_string()];

        // With `sh -c`, the first trailing argument becomes $0.
        let result = shell("echo \"$0 $1 $2\"")
            .execute("do the thing", &[], opts)
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(result.stdout, "--model opus do the thing\n");
    }

    #[tokio::test]
    async fn missing_command_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let (opts, _rx) = options(dir.path().to_path_buf(), None);
        let agent = ProcessAgent::new("taskloop-definitely-missing-agent", Vec::new());

        let err = agent.execute("prompt", &[], opts).unwrap_err();
        assert!(matches!(err, AgentError::Unavailable(_)));

        let err = agent.detect().await.unwrap_err();
        assert!(matches!(err, AgentError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detect_reports_version() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-agent");
        std::fs::write(&script, "#!/bin/sh\necho \"fake-agent 1.2.3\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let agent = ProcessAgent::new(script.display().to_string(), Vec::new());
        let info = agent.detect().await.unwrap();
        assert_eq!(info.version.as_deref(), Some("fake-agent 1.2.3"));
    }

    #[test]
    fn files_become_prompt_mentions() {
        let prompt = ProcessAgent::full_prompt("fix it", &[PathBuf::from("src/lib.rs")]);
        assert_eq!(prompt, "fix it\n\n@src/lib.rs");
        assert_eq!(ProcessAgent::full_prompt("fix it", &[]), "fix it");
    }

    #[tokio::test]
    async fn stream_lines_bounds_capture_but_forwards_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let captured = stream_lines(&b"aaaa\nbbbb\n"[..], OutputStream::Stdout, tx, 6)
            .await
            .unwrap();

        assert_eq!(captured, "aaaa\nb");
        let chunks = drain(&mut rx);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].data, "bbbb\n");
    }

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("héllo", 2), "h...");
    }
}
