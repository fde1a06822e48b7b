//! Session persistence capability.
//!
//! The engine reports progress and hands over each finished iteration here.
//! Failures are logged by the engine and never stop the run.

use async_trait::async_trait;
use std::path::Path;
use taskloop_core::{Config, IterationResult, SessionStatus};
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Record the iteration counter and completed-task counter.
    async fn update_session_iteration(&self, cwd: &Path, iteration: u32, completed: u32)
        -> Result<()>;

    async fn update_session_status(&self, cwd: &Path, status: SessionStatus) -> Result<()>;

    /// Persist one finished iteration with its captured output. Must be durable
    /// before returning.
    async fn save_iteration_log(
        &self,
        cwd: &Path,
        result: &IterationResult,
        stdout: &str,
        stderr: &str,
        config: &Config,
    ) -> Result<()>;
}
