//! Tracker capability and a JSON-file tracker.
//!
//! The engine trusts the tracker for ordering and readiness. `FileTracker`
//! keeps the backlog in a single JSON document:
//!
//! ```json
//! { "name": "backlog", "tasks": [ { "id": "T-1", "title": "...", "depends_on": [] } ] }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use taskloop_core::{Task, TaskStatus};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid task file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Filter for `get_tasks`. Empty `statuses` matches every status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub parent_id: Option<String>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Tasks that can still be picked up.
    pub fn actionable() -> Self {
        Self {
            statuses: vec![TaskStatus::Open, TaskStatus::InProgress],
            parent_id: None,
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && self
                .parent_id
                .as_ref()
                .map_or(true, |parent| task.parent_id.as_ref() == Some(parent))
    }
}

/// Capability contract for a task tracker.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Refresh backing state. Called once during engine initialization.
    async fn sync(&self) -> Result<()>;

    /// Tasks matching `filter`, in the tracker's own order.
    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let tasks = self.get_tasks(&TaskFilter::all()).await?;
        Ok(tasks.into_iter().find(|t| t.id == id))
    }

    /// Whether every dependency of the task is resolved.
    async fn is_task_ready(&self, id: &str) -> Result<bool>;

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()>;

    async fn complete_task(&self, id: &str, reason: Option<&str>) -> Result<()>;

    /// Whether every task in scope is closed or cancelled. Tasks outside
    /// `filter` (an epic's own row, other epics) never hold the run open.
    async fn is_complete(&self, filter: &TaskFilter) -> Result<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TaskFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Tracker backed by a JSON file on disk.
///
/// Every mutation is written back with a temp-file rename so a crash never
/// leaves a half-written backlog.
#[derive(Debug)]
pub struct FileTracker {
    path: PathBuf,
    file: Mutex<TaskFile>,
}

impl FileTracker {
    /// Create a tracker for `path`. Nothing is read until `sync`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(TaskFile::default()),
        }
    }

    /// Create a tracker and load the file immediately.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let tracker = Self::new(path);
        tracker.sync().await?;
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(path: &Path) -> Result<TaskFile> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(|source| TrackerError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    async fn write_file(&self, file: &TaskFile) -> Result<()> {
        let json = serde_json::to_string_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn set_status(file: &mut TaskFile, id: &str, status: TaskStatus) -> Result<()> {
        let task = file
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound(id.to_string()))?;
        task.status = status;
        Ok(())
    }
}

#[async_trait]
impl Tracker for FileTracker {
    async fn sync(&self) -> Result<()> {
        let loaded = Self::read_file(&self.path).await?;
        debug!(path = %self.path.display(), tasks = loaded.tasks.len(), "task file loaded");
        *self.file.lock().await = loaded;
        Ok(())
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let file = self.file.lock().await;
        Ok(file
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn is_task_ready(&self, id: &str) -> Result<bool> {
        let file = self.file.lock().await;
        let task = file
            .tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| TrackerError::TaskNotFound(id.to_string()))?;

        if task.status.is_terminal() || task.status == TaskStatus::Blocked {
            return Ok(false);
        }

        // Unknown dependency ids count as unresolved.
        Ok(task.depends_on.iter().all(|dep| {
            file.tasks
                .iter()
                .any(|t| &t.id == dep && t.status.is_terminal())
        }))
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut file = self.file.lock().await;
        Self::set_status(&mut file, id, status)?;
        self.write_file(&file).await
    }

    async fn complete_task(&self, id: &str, reason: Option<&str>) -> Result<()> {
        let mut file = self.file.lock().await;
        Self::set_status(&mut file, id, TaskStatus::Closed)?;
        self.write_file(&file).await?;
        info!(task_id = id, reason = reason.unwrap_or(""), "task closed");
        Ok(())
    }

    async fn is_complete(&self, filter: &TaskFilter) -> Result<bool> {
        let file = self.file.lock().await;
        Ok(file
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .all(|t| t.status.is_terminal()))
    }
}
