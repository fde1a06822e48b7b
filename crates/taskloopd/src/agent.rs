//! Agent capability used by the engine.
//!
//! An agent spawns one external process per `execute` call and streams its
//! output back over a channel. The engine never sees how the process is
//! started; see `runner::ProcessAgent` for the subprocess implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskloop_core::{AgentResult, OutputStream};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent not available: {0}")]
    Unavailable(String),
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent execution aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// What `detect` learned about the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub name: String,
    pub version: Option<String>,
}

/// A chunk of agent output, tagged with its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            data: data.into(),
        }
    }
}

/// Options for a single execution.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub cwd: PathBuf,
    /// Extra CLI flags (model selection etc.).
    pub flags: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    /// Receives output chunks as they arrive. Dropped when the execution ends.
    pub output: mpsc::UnboundedSender<OutputChunk>,
}

/// Requests that a running execution stop.
///
/// Must tolerate being called more than once and after the execution ended.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

impl Interrupt for CancellationToken {
    fn interrupt(&self) {
        self.cancel();
    }
}

/// Handle to one in-flight execution.
pub struct ExecutionHandle {
    execution_id: String,
    interrupter: Arc<dyn Interrupt>,
    task: JoinHandle<AgentResult>,
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("execution_id", &self.execution_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ExecutionHandle {
    pub fn new(
        execution_id: impl Into<String>,
        interrupter: Arc<dyn Interrupt>,
        task: JoinHandle<AgentResult>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            interrupter,
            task,
        }
    }

    /// Spawn `fut` on the runtime; `cancel` is fired by `interrupt()`.
    pub fn spawn<F>(execution_id: impl Into<String>, cancel: CancellationToken, fut: F) -> Self
    where
        F: Future<Output = AgentResult> + Send + 'static,
    {
        Self::new(execution_id, Arc::new(cancel), tokio::spawn(fut))
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// A shareable interrupter that outlives `wait()`.
    pub fn interrupter(&self) -> Arc<dyn Interrupt> {
        Arc::clone(&self.interrupter)
    }

    pub fn interrupt(&self) {
        self.interrupter.interrupt();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait for the execution to settle.
    pub async fn wait(self) -> Result<AgentResult> {
        self.task
            .await
            .map_err(|err| AgentError::Aborted(err.to_string()))
    }
}

/// Capability contract for an AI coding agent.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Check that the agent can run at all.
    async fn detect(&self) -> Result<AgentInfo>;

    /// Start an execution. Output streams through `options.output`.
    fn execute(
        &self,
        prompt: &str,
        files: &[PathBuf],
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle>;
}
