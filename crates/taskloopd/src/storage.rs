//! SQLite storage for sessions, iterations and the event audit log.
//!
//! Also writes one plain-text log per iteration under `log_dir`, named
//! `iter-NN-<task>.log`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use taskloop_core::{Config, EngineEvent, Id, IterationResult, SessionStatus};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{EventBus, Subscription};
use crate::session::{self, SessionSink};

const SESSIONS_COLUMNS: &str =
    "id, cwd, status, iteration, tasks_completed, config_json, created_at, updated_at";

const ITERATIONS_COLUMNS: &str = "session_id, iteration, task_id, task_title, status, \
    task_completed, promise_complete, exit_code, duration_ms, error, log_path, started_at, ended_at";

/// Picks the newest session for a working directory.
const LATEST_FOR_CWD: &str =
    "SELECT id FROM sessions WHERE cwd = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A persisted session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: Id,
    pub cwd: String,
    pub status: SessionStatus,
    pub iteration: u32,
    pub tasks_completed: u32,
    pub config_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted iteration row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationRecord {
    pub session_id: Id,
    pub iteration: u32,
    pub task_id: String,
    pub task_title: String,
    pub status: String,
    pub task_completed: bool,
    pub promise_complete: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub log_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// A persisted audit event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: i64,
    pub session_id: Id,
    pub event_type: String,
    pub iteration: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}

/// Storage backend for the daemon.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the compiled-in schema. Safe to run on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Sessions ---

    /// Insert a new running session for `cwd`.
    pub async fn create_session(
        &self,
        id: &Id,
        cwd: &Path,
        config: &Config,
    ) -> Result<SessionRecord> {
        let now = Utc::now();
        let record = SessionRecord {
            id: id.clone(),
            cwd: cwd.display().to_string(),
            status: SessionStatus::Running,
            iteration: 0,
            tasks_completed: 0,
            config_json: Some(serde_json::to_string(config)?),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r"
            INSERT INTO sessions (id, cwd, status, iteration, tasks_completed, config_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(record.id.as_ref())
        .bind(&record.cwd)
        .bind(record.status.as_str())
        .bind(i64::from(record.iteration))
        .bind(i64::from(record.tasks_completed))
        .bind(&record.config_json)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_session(&self, id: &Id) -> Result<SessionRecord> {
        let query = format!("SELECT {SESSIONS_COLUMNS} FROM sessions WHERE id = ?1");
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::SessionNotFound(id.to_string()))?;
        Ok(row.into_record())
    }

    /// The newest session recorded for `cwd`, if any.
    pub async fn latest_session(&self, cwd: &Path) -> Result<Option<SessionRecord>> {
        let query = format!(
            "SELECT {SESSIONS_COLUMNS} FROM sessions WHERE cwd = ?1 \
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(cwd.display().to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SessionRow::into_record))
    }

    async fn latest_session_id(&self, cwd: &Path) -> Result<Id> {
        let cwd = cwd.display().to_string();
        let id = sqlx::query_scalar::<_, String>(LATEST_FOR_CWD)
            .bind(&cwd)
            .fetch_optional(&self.pool)
            .await?;
        id.map(Id::from_string)
            .ok_or(StorageError::SessionNotFound(cwd))
    }

    pub async fn set_session_status(&self, cwd: &Path, status: SessionStatus) -> Result<()> {
        let id = self.latest_session_id(cwd).await?;
        sqlx::query("UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_progress(
        &self,
        cwd: &Path,
        iteration: u32,
        tasks_completed: u32,
    ) -> Result<()> {
        let id = self.latest_session_id(cwd).await?;
        sqlx::query(
            "UPDATE sessions SET iteration = ?1, tasks_completed = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(i64::from(iteration))
        .bind(i64::from(tasks_completed))
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Iterations ---

    pub async fn insert_iteration(
        &self,
        session_id: &Id,
        result: &IterationResult,
        log_path: Option<&Path>,
    ) -> Result<()> {
        let exit_code = result.agent_result.as_ref().and_then(|r| r.exit_code);
        let duration_ms = i64::try_from(result.duration_ms).unwrap_or(i64::MAX);

        sqlx::query(
            r"
            INSERT OR REPLACE INTO iterations
                (session_id, iteration, task_id, task_title, status, task_completed,
                 promise_complete, exit_code, duration_ms, error, log_path, started_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
        )
        .bind(session_id.as_ref())
        .bind(i64::from(result.iteration))
        .bind(&result.task.id)
        .bind(&result.task.title)
        .bind(result.status.as_str())
        .bind(result.task_completed)
        .bind(result.promise_complete)
        .bind(exit_code)
        .bind(duration_ms)
        .bind(&result.error)
        .bind(log_path.map(|p| p.display().to_string()))
        .bind(result.started_at.timestamp_millis())
        .bind(result.ended_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_iterations(&self, session_id: &Id) -> Result<Vec<IterationRecord>> {
        let query = format!(
            "SELECT {ITERATIONS_COLUMNS} FROM iterations WHERE session_id = ?1 ORDER BY iteration"
        );
        let rows = sqlx::query_as::<_, IterationRow>(&query)
            .bind(session_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(IterationRow::into_record).collect())
    }

    // --- Events ---

    pub async fn append_event(&self, session_id: &Id, event: &EngineEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (session_id, type, iteration, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id.as_ref())
        .bind(event.event_type().as_str())
        .bind(event.iteration().map(i64::from))
        .bind(event.timestamp().timestamp_millis())
        .bind(event.to_json()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_events(&self, session_id: &Id) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, session_id, type, iteration, ts, payload_json FROM events \
             WHERE session_id = ?1 ORDER BY id",
        )
        .bind(session_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_record).collect())
    }

    /// Persist every lifecycle event emitted on `bus` under `session_id`.
    /// Agent output is not recorded; it already lands in the iteration logs.
    pub fn record_events(&self, bus: &EventBus, session_id: Id) -> EventRecorder {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        let subscription = bus.subscribe(move |event| {
            if !matches!(event, EngineEvent::AgentOutput { .. }) {
                let _ = tx.send(event.clone());
            }
        });

        let storage = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = storage.append_event(&session_id, &event).await {
                    warn!(
                        event = event.event_type().as_str(),
                        error = %err,
                        "failed to record event"
                    );
                }
            }
        });

        EventRecorder { subscription, task }
    }
}

/// Background writer created by `Storage::record_events`.
#[derive(Debug)]
pub struct EventRecorder {
    subscription: Subscription,
    task: JoinHandle<()>,
}

impl EventRecorder {
    /// Stop listening and wait until every queued event is written.
    pub async fn finish(self) {
        self.subscription.unsubscribe();
        if let Err(err) = self.task.await {
            warn!(error = %err, "event recorder task failed");
        }
    }
}

// --- Iteration log files ---

/// `<session>/iter-NN-<task>.log`, with the task id made filesystem safe.
/// Each session gets its own directory so later runs never overwrite earlier
/// logs.
pub fn iteration_log_path(
    log_dir: &Path,
    session_id: &Id,
    iteration: u32,
    task_id: &str,
) -> PathBuf {
    let safe: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    log_dir
        .join(session_id.to_string())
        .join(format!("iter-{iteration:02}-{safe}.log"))
}

/// Render the iteration log: a metadata header, stdout, then stderr.
pub fn render_iteration_log(
    result: &IterationResult,
    stdout: &str,
    stderr: &str,
    config: &Config,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Iteration {}", result.iteration);
    let _ = writeln!(out, "task: {} ({})", result.task.id, result.task.title);
    let _ = writeln!(out, "status: {}", result.status.as_str());
    let _ = writeln!(out, "task_completed: {}", result.task_completed);
    let _ = writeln!(out, "promise_complete: {}", result.promise_complete);
    let _ = writeln!(out, "duration_ms: {}", result.duration_ms);
    let _ = writeln!(out, "started_at: {}", result.started_at.to_rfc3339());
    let _ = writeln!(out, "ended_at: {}", result.ended_at.to_rfc3339());
    let _ = writeln!(out, "agent: {}", config.agent_command);
    if let Some(model) = &config.model {
        let _ = writeln!(out, "model: {model}");
    }
    if let Some(agent) = &result.agent_result {
        let _ = writeln!(out, "execution_id: {}", agent.execution_id);
        if let Some(code) = agent.exit_code {
            let _ = writeln!(out, "exit_code: {code}");
        }
    }
    if let Some(error) = &result.error {
        let _ = writeln!(out, "error: {error}");
    }

    out.push_str("\n--- STDOUT ---\n");
    out.push_str(stdout);
    if !stderr.is_empty() {
        if !stdout.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("\n--- STDERR ---\n");
        out.push_str(stderr);
    }
    out
}

#[async_trait]
impl SessionSink for Storage {
    async fn update_session_iteration(
        &self,
        cwd: &Path,
        iteration: u32,
        completed: u32,
    ) -> session::Result<()> {
        Ok(self.set_session_progress(cwd, iteration, completed).await?)
    }

    async fn update_session_status(&self, cwd: &Path, status: SessionStatus) -> session::Result<()> {
        Ok(self.set_session_status(cwd, status).await?)
    }

    async fn save_iteration_log(
        &self,
        cwd: &Path,
        result: &IterationResult,
        stdout: &str,
        stderr: &str,
        config: &Config,
    ) -> session::Result<()> {
        let session_id = self.latest_session_id(cwd).await?;
        let path = iteration_log_path(
            &config.resolve(&config.log_dir),
            &session_id,
            result.iteration,
            &result.task.id,
        );
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, render_iteration_log(result, stdout, stderr, config)).await?;
        debug!(iteration = result.iteration, path = %path.display(), "iteration log written");

        self.insert_iteration(&session_id, result, Some(&path))
            .await?;
        Ok(())
    }
}

// --- Row types for SQLx ---

fn millis(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap_or_default()
}

fn count(value: i64) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    cwd: String,
    status: String,
    iteration: i64,
    tasks_completed: i64,
    config_json: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl SessionRow {
    fn into_record(self) -> SessionRecord {
        SessionRecord {
            id: Id::from_string(self.id),
            cwd: self.cwd,
            status: SessionStatus::parse(&self.status).unwrap_or(SessionStatus::Failed),
            iteration: count(self.iteration),
            tasks_completed: count(self.tasks_completed),
            config_json: self.config_json,
            created_at: millis(self.created_at),
            updated_at: millis(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct IterationRow {
    session_id: String,
    iteration: i64,
    task_id: String,
    task_title: String,
    status: String,
    task_completed: bool,
    promise_complete: bool,
    exit_code: Option<i32>,
    duration_ms: i64,
    error: Option<String>,
    log_path: Option<String>,
    started_at: i64,
    ended_at: i64,
}

impl IterationRow {
    fn into_record(self) -> IterationRecord {
        IterationRecord {
            session_id: Id::from_string(self.session_id),
            iteration: count(self.iteration),
            task_id: self.task_id,
            task_title: self.task_title,
            status: self.status,
            task_completed: self.task_completed,
            promise_complete: self.promise_complete,
            exit_code: self.exit_code,
            duration_ms: u64::try_from(self.duration_ms).unwrap_or_default(),
            error: self.error,
            log_path: self.log_path,
            started_at: millis(self.started_at),
            ended_at: millis(self.ended_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    session_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    iteration: Option<i64>,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_record(self) -> EventRecord {
        EventRecord {
            id: self.id,
            session_id: Id::from_string(self.session_id),
            event_type: self.event_type,
            iteration: self.iteration.map(count),
            timestamp: millis(self.ts),
            payload_json: self.payload_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloop_core::{
        AgentResult, AgentStatus, IterationStatus, OutputStream, StopReason, Task,
    };
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        dir: TempDir,
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("session.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, dir }
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            cwd: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn test_result(iteration: u32, task_id: &str) -> IterationResult {
        let now = Utc::now();
        IterationResult {
            iteration,
            status: IterationStatus::Completed,
            task: Task::new(task_id, "Write docs"),
            agent_result: Some(AgentResult {
                execution_id: "exec-1".to_string(),
                status: AgentStatus::Completed,
                exit_code: Some(0),
                stdout: "done\n".to_string(),
                stderr: String::new(),
                duration_ms: 12,
                interrupted: false,
                error: None,
            }),
            task_completed: true,
            promise_complete: false,
            duration_ms: 15,
            error: None,
            started_at: now,
            ended_at: now,
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();
    }

    #[tokio::test]
    async fn create_and_get_session() {
        let ts = create_test_storage().await;
        let id = Id::new();
        let config = test_config(ts.dir.path());

        let created = ts
            .storage
            .create_session(&id, ts.dir.path(), &config)
            .await
            .unwrap();
        let fetched = ts.storage.get_session(&id).await.unwrap();

        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.status, SessionStatus::Running);
        assert_eq!(fetched.iteration, 0);
        assert!(fetched.config_json.unwrap().contains("\"agent_command\":\"claude\""));
    }

    #[tokio::test]
    async fn get_session_not_found() {
        let ts = create_test_storage().await;
        let result = ts.storage.get_session(&Id::new()).await;
        assert!(matches!(result, Err(StorageError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn updates_target_latest_session_for_cwd() {
        let ts = create_test_storage().await;
        let config = test_config(ts.dir.path());
        let old = Id::new();
        let new = Id::new();
        ts.storage
            .create_session(&old, ts.dir.path(), &config)
            .await
            .unwrap();
        ts.storage
            .create_session(&new, ts.dir.path(), &config)
            .await
            .unwrap();

        ts.storage
            .update_session_iteration(ts.dir.path(), 4, 2)
            .await
            .unwrap();
        ts.storage
            .update_session_status(ts.dir.path(), SessionStatus::from(StopReason::NoTasks))
            .await
            .unwrap();

        let latest = ts.storage.latest_session(ts.dir.path()).await.unwrap().unwrap();
        assert_eq!(latest.id, new);
        assert_eq!(latest.iteration, 4);
        assert_eq!(latest.tasks_completed, 2);
        assert_eq!(latest.status, SessionStatus::Completed);

        let untouched = ts.storage.get_session(&old).await.unwrap();
        assert_eq!(untouched.iteration, 0);
        assert_eq!(untouched.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn update_without_session_fails() {
        let ts = create_test_storage().await;
        let err = ts
            .storage
            .set_session_status(Path::new("/nowhere"), SessionStatus::Paused)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound(ref cwd) if cwd == "/nowhere"));
    }

    #[tokio::test]
    async fn save_iteration_log_writes_file_and_row() {
        let ts = create_test_storage().await;
        let config = test_config(ts.dir.path());
        let id = Id::new();
        ts.storage
            .create_session(&id, ts.dir.path(), &config)
            .await
            .unwrap();

        let result = test_result(3, "T/1");
        ts.storage
            .save_iteration_log(ts.dir.path(), &result, "done\n", "warning\n", &config)
            .await
            .unwrap();

        let path = ts
            .dir
            .path()
            .join(format!(".taskloop/iterations/{id}/iter-03-T_1.log"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# Iteration 3\n"));
        assert!(content.contains("--- STDOUT ---\ndone\n"));
        assert!(content.contains("--- STDERR ---\nwarning\n"));

        let rows = ts.storage.list_iterations(&id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].iteration, 3);
        assert_eq!(rows[0].status, "completed");
        assert!(rows[0].task_completed);
        assert_eq!(rows[0].exit_code, Some(0));
        assert_eq!(rows[0].log_path.as_deref(), Some(path.display().to_string().as_str()));
    }

    #[tokio::test]
    async fn later_session_keeps_earlier_iteration_logs() {
        let ts = create_test_storage().await;
        let config = test_config(ts.dir.path());
        let result = test_result(1, "T-1");

        let first = Id::new();
        ts.storage
            .create_session(&first, ts.dir.path(), &config)
            .await
            .unwrap();
        ts.storage
            .save_iteration_log(ts.dir.path(), &result, "first run\n", "", &config)
            .await
            .unwrap();

        let second = Id::new();
        ts.storage
            .create_session(&second, ts.dir.path(), &config)
            .await
            .unwrap();
        ts.storage
            .save_iteration_log(ts.dir.path(), &result, "second run\n", "", &config)
            .await
            .unwrap();

        let first_rows = ts.storage.list_iterations(&first).await.unwrap();
        let second_rows = ts.storage.list_iterations(&second).await.unwrap();
        let first_path = first_rows[0].log_path.clone().unwrap();
        let second_path = second_rows[0].log_path.clone().unwrap();
        assert_ne!(first_path, second_path);

        let first_log = std::fs::read_to_string(&first_path).unwrap();
        let second_log = std::fs::read_to_string(&second_path).unwrap();
        assert!(first_log.contains("--- STDOUT ---\nfirst run\n"));
        assert!(second_log.contains("--- STDOUT ---\nsecond run\n"));
    }

    #[tokio::test]
    async fn recorder_persists_lifecycle_events_only() {
        let ts = create_test_storage().await;
        let config = test_config(ts.dir.path());
        let id = Id::new();
        ts.storage
            .create_session(&id, ts.dir.path(), &config)
            .await
            .unwrap();

        let bus = EventBus::new();
        let recorder = ts.storage.record_events(&bus, id.clone());
        bus.emit(&EngineEvent::EngineStarted {
            timestamp: Utc::now(),
            session_id: id.to_string(),
            total_tasks: 2,
        });
        bus.emit(&EngineEvent::AgentOutput {
            timestamp: Utc::now(),
            iteration: 1,
            stream: OutputStream::Stdout,
            data: "noise".to_string(),
        });
        bus.emit(&EngineEvent::EngineStopped {
            timestamp: Utc::now(),
            reason: StopReason::Completed,
            total_iterations: 1,
            tasks_completed: 1,
        });
        recorder.finish().await;

        let events = ts.storage.list_events(&id).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["engine_started", "engine_stopped"]);
        assert!(events[1].payload_json.contains("\"reason\":\"completed\""));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn log_path_sanitizes_task_id() {
        let session = Id::from_string("s-1");
        let path = iteration_log_path(Path::new("/logs"), &session, 7, "epic:1/task 2");
        assert_eq!(path, PathBuf::from("/logs/s-1/iter-07-epic_1_task_2.log"));
    }

    #[test]
    fn log_omits_stderr_section_when_empty() {
        let config = Config::default();
        let content = render_iteration_log(&test_result(1, "T-1"), "out", "", &config);
        assert!(content.ends_with("--- STDOUT ---\nout"));
        assert!(!content.contains("STDERR"));
    }
}
