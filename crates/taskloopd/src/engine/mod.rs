//! Iteration engine.
//!
//! Drives the loop: select a ready task, render a prompt, run the agent,
//! detect completion, update the tracker, apply the error strategy. The engine
//! is shared as `Arc<Engine>` so `pause`, `resume` and `stop` can be called
//! while `start` is running on another task.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await` or while listeners run.

mod iteration;
mod policy;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use taskloop_core::{
    Config, EngineEvent, EngineStatus, ErrorStrategy, Id, IterationResult, SessionStatus,
    StopReason, Task,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{Agent, AgentError, AgentInfo, Interrupt};
use crate::bus::{EventBus, Subscription};
use crate::prompt::PromptRenderer;
use crate::session::SessionSink;
use crate::tracker::{TaskFilter, Tracker, TrackerError};

/// How often a paused engine checks for resume.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not initialized; call initialize() first")]
    NotInitialized,
    #[error("invalid state transition from {from} to {to}")]
    InvalidState {
        from: &'static str,
        to: &'static str,
    },
    #[error("agent not available: {0}")]
    AgentUnavailable(#[source] AgentError),
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Snapshot of the engine's run state.
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub status: EngineStatus,
    /// Number of attempts started so far (retries included).
    pub current_iteration: u32,
    pub current_task: Option<Task>,
    pub tasks_completed: u32,
    pub total_tasks: usize,
    /// Every attempt, in the order it finished.
    pub iterations: Vec<IterationResult>,
    pub started_at: Option<DateTime<Utc>>,
    /// Output buffers for the in-flight attempt.
    pub current_output: String,
    pub current_stderr: String,
    /// Tasks excluded for the rest of the run.
    pub skipped_tasks: HashSet<String>,
    pub retry_counts: HashMap<String, u32>,
}

/// Collaborators the engine drives.
#[derive(Clone)]
pub struct Capabilities {
    pub agent: Arc<dyn Agent>,
    pub tracker: Arc<dyn Tracker>,
    pub prompts: Arc<dyn PromptRenderer>,
    pub session: Arc<dyn SessionSink>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("agent", &self.agent.name())
            .finish_non_exhaustive()
    }
}

struct Inner {
    state: EngineState,
    initialized: bool,
    /// Replaced on every `start`.
    stop: CancellationToken,
    /// Interrupter for the in-flight execution. Taken exactly once by `stop`.
    running: Option<Arc<dyn Interrupt>>,
}

pub struct Engine {
    config: Config,
    agent: Arc<dyn Agent>,
    tracker: Arc<dyn Tracker>,
    prompts: Arc<dyn PromptRenderer>,
    session: Arc<dyn SessionSink>,
    bus: EventBus,
    session_id: Id,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: Config, capabilities: Capabilities) -> Self {
        Self {
            config,
            agent: capabilities.agent,
            tracker: capabilities.tracker,
            prompts: capabilities.prompts,
            session: capabilities.session,
            bus: EventBus::new(),
            session_id: Id::new(),
            inner: Mutex::new(Inner {
                state: EngineState::default(),
                initialized: false,
                stop: CancellationToken::new(),
                running: None,
            }),
        }
    }

    /// Use an existing session id (e.g. one already recorded in storage).
    pub fn with_session_id(mut self, session_id: Id) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn session_id(&self) -> &Id {
        &self.session_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener)
    }

    /// A copy of the current state.
    pub fn state(&self) -> EngineState {
        self.lock().state.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.lock().state.status
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        self.bus.emit(&event);
    }

    /// Detect the agent, sync the tracker and snapshot the task count.
    pub async fn initialize(&self) -> Result<AgentInfo> {
        let status = self.status();
        if status != EngineStatus::Idle {
            return Err(EngineError::InvalidState {
                from: status.as_str(),
                to: "initialized",
            });
        }

        let info = self
            .agent
            .detect()
            .await
            .map_err(EngineError::AgentUnavailable)?;
        self.tracker.sync().await?;
        let tasks = self.tracker.get_tasks(&self.scope_filter()).await?;

        {
            let mut inner = self.lock();
            inner.state.total_tasks = tasks.len();
            inner.initialized = true;
        }
        info!(
            agent = %info.name,
            version = info.version.as_deref().unwrap_or("unknown"),
            total_tasks = tasks.len(),
            "engine initialized"
        );
        Ok(info)
    }

    /// Run the loop until it stops. Returns once the engine is idle again.
    pub async fn start(&self) -> Result<()> {
        let (stop, total_tasks) = {
            let mut inner = self.lock();
            if inner.state.status != EngineStatus::Idle {
                return Err(EngineError::InvalidState {
                    from: inner.state.status.as_str(),
                    to: EngineStatus::Running.as_str(),
                });
            }
            if !inner.initialized {
                return Err(EngineError::NotInitialized);
            }
            inner.stop = CancellationToken::new();
            inner.state.status = EngineStatus::Running;
            inner.state.started_at.get_or_insert_with(Utc::now);
            (inner.stop.clone(), inner.state.total_tasks)
        };

        info!(session_id = %self.session_id, total_tasks, "engine started");
        self.persist_status(SessionStatus::Running).await;
        self.emit(EngineEvent::EngineStarted {
            timestamp: Utc::now(),
            session_id: self.session_id.to_string(),
            total_tasks,
        });

        let outcome = self.run_loop(&stop).await;

        {
            let mut inner = self.lock();
            inner.state.status = EngineStatus::Idle;
            inner.state.current_task = None;
            inner.running = None;
        }
        outcome
    }

    /// Request a pause at the next iteration boundary.
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.state.status == EngineStatus::Running {
            inner.state.status = EngineStatus::Pausing;
            info!("pause requested");
        }
    }

    /// Cancel a pending pause or leave the paused state.
    pub fn resume(&self) {
        let mut inner = self.lock();
        match inner.state.status {
            EngineStatus::Pausing | EngineStatus::Paused => {
                inner.state.status = EngineStatus::Running;
                info!("resume requested");
            }
            _ => {}
        }
    }

    /// Stop the run. Interrupts the in-flight agent execution; the loop records
    /// that attempt and then exits.
    pub async fn stop(&self) {
        let (running, total_iterations, tasks_completed) = {
            let mut inner = self.lock();
            if matches!(
                inner.state.status,
                EngineStatus::Idle | EngineStatus::Stopping
            ) {
                return;
            }
            inner.stop.cancel();
            inner.state.status = EngineStatus::Stopping;
            (
                inner.running.take(),
                inner.state.current_iteration,
                inner.state.tasks_completed,
            )
        };

        info!(total_iterations, "stop requested");
        if let Some(running) = running {
            running.interrupt();
        }
        self.persist_status(SessionStatus::Interrupted).await;
        self.emit(EngineEvent::EngineStopped {
            timestamp: Utc::now(),
            reason: StopReason::Interrupted,
            total_iterations,
            tasks_completed,
        });
    }

    async fn run_loop(&self, stop: &CancellationToken) -> Result<()> {
        loop {
            if !self.pause_checkpoint(stop).await || stop.is_cancelled() {
                break;
            }

            let (iteration, tasks_completed) = {
                let inner = self.lock();
                (inner.state.current_iteration, inner.state.tasks_completed)
            };
            if self.config.max_iterations > 0 && iteration >= self.config.max_iterations {
                self.finish(StopReason::MaxIterations).await;
                break;
            }

            match self.tracker.is_complete(&self.scope_filter()).await {
                Ok(true) => {
                    self.emit(EngineEvent::AllComplete {
                        timestamp: Utc::now(),
                        total_completed: tasks_completed,
                        total_iterations: iteration,
                    });
                    self.finish(StopReason::Completed).await;
                    break;
                }
                Ok(false) => {}
                Err(err) => return self.fail(err).await,
            }

            let task = match self.select_next_task().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    self.finish(StopReason::NoTasks).await;
                    break;
                }
                Err(err) => return self.fail(err).await,
            };

            let result = self.run_with_error_handling(task, stop).await;

            if stop.is_cancelled() {
                self.persist_progress().await;
                break;
            }

            if result.is_failed() && self.config.error_handling.strategy == ErrorStrategy::Abort
            {
                self.finish(StopReason::Error).await;
                break;
            }

            self.persist_progress().await;

            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(self.config.iteration_delay_ms)) => {}
            }
        }
        Ok(())
    }

    /// Enter and hold the paused state if a pause was requested. Returns false
    /// if the engine was stopped while paused.
    async fn pause_checkpoint(&self, stop: &CancellationToken) -> bool {
        let current_iteration = {
            let mut inner = self.lock();
            if inner.state.status != EngineStatus::Pausing {
                return true;
            }
            inner.state.status = EngineStatus::Paused;
            inner.state.current_iteration
        };

        info!(current_iteration, "engine paused");
        self.persist_status(SessionStatus::Paused).await;
        self.emit(EngineEvent::EnginePaused {
            timestamp: Utc::now(),
            current_iteration,
        });

        while self.status() == EngineStatus::Paused {
            tokio::select! {
                biased;
                () = stop.cancelled() => return false,
                () = tokio::time::sleep(PAUSE_POLL_INTERVAL) => {}
            }
        }
        if stop.is_cancelled() {
            return false;
        }

        let from_iteration = self.lock().state.current_iteration;
        info!(from_iteration, "engine resumed");
        self.persist_status(SessionStatus::Running).await;
        self.emit(EngineEvent::EngineResumed {
            timestamp: Utc::now(),
            from_iteration,
        });
        true
    }

    /// First actionable task, in tracker order, that is ready and not skipped.
    async fn select_next_task(&self) -> std::result::Result<Option<Task>, TrackerError> {
        let filter = TaskFilter {
            parent_id: self.config.epic_id.clone(),
            ..TaskFilter::actionable()
        };
        let candidates = self.tracker.get_tasks(&filter).await?;
        let skipped = self.lock().state.skipped_tasks.clone();

        for task in candidates {
            if skipped.contains(&task.id) {
                continue;
            }
            if self.tracker.is_task_ready(&task.id).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    fn scope_filter(&self) -> TaskFilter {
        TaskFilter {
            parent_id: self.config.epic_id.clone(),
            ..TaskFilter::all()
        }
    }

    /// Emit `engine_stopped` for a loop-initiated stop. Skipped if `stop()`
    /// already reported the run as interrupted.
    async fn finish(&self, reason: StopReason) {
        let (total_iterations, tasks_completed) = {
            let mut inner = self.lock();
            if inner.state.status == EngineStatus::Stopping {
                return;
            }
            inner.state.status = EngineStatus::Stopping;
            (inner.state.current_iteration, inner.state.tasks_completed)
        };

        info!(
            reason = reason.as_str(),
            total_iterations, tasks_completed, "engine stopped"
        );
        self.persist_status(SessionStatus::from(reason)).await;
        self.emit(EngineEvent::EngineStopped {
            timestamp: Utc::now(),
            reason,
            total_iterations,
            tasks_completed,
        });
    }

    async fn fail(&self, err: TrackerError) -> Result<()> {
        error!(error = %err, "tracker error; stopping engine");
        self.finish(StopReason::Error).await;
        Err(err.into())
    }

    async fn persist_status(&self, status: SessionStatus) {
        if let Err(err) = self
            .session
            .update_session_status(&self.config.cwd, status)
            .await
        {
            warn!(status = status.as_str(), error = %err, "failed to persist session status");
        }
    }

    async fn persist_progress(&self) {
        let (iteration, completed) = {
            let inner = self.lock();
            (inner.state.current_iteration, inner.state.tasks_completed)
        };
        if let Err(err) = self
            .session
            .update_session_iteration(&self.config.cwd, iteration, completed)
            .await
        {
            warn!(iteration, error = %err, "failed to persist session progress");
        }
    }
}
