//! A single iteration attempt.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Instant;
use taskloop_core::completion::{check_completion, CompletionResult};
use taskloop_core::prompt::fallback_prompt;
use taskloop_core::{
    AgentResult, EngineEvent, IterationResult, IterationStatus, OutputStream, Task, TaskStatus,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Engine;
use crate::agent::{AgentError, ExecuteOptions, OutputChunk};
use crate::tracker::TrackerError;

/// Anything that turns an attempt into a failed result.
#[derive(Debug, Error)]
enum AttemptError {
    #[error("{0}")]
    Tracker(#[from] TrackerError),
    #[error("{0}")]
    Agent(#[from] AgentError),
}

struct Attempt {
    agent_result: AgentResult,
    completion: CompletionResult,
}

impl Engine {
    /// Run one attempt against `task`. Never fails: errors become a failed
    /// `IterationResult`.
    pub(super) async fn run_attempt(&self, task: &Task) -> IterationResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let iteration = {
            let mut inner = self.lock();
            inner.state.current_iteration += 1;
            inner.state.current_output.clear();
            inner.state.current_stderr.clear();
            inner.state.current_task = Some(task.clone());
            inner.state.current_iteration
        };

        info!(iteration, task_id = %task.id, title = %task.title, "iteration started");
        self.emit(EngineEvent::IterationStarted {
            timestamp: Utc::now(),
            iteration,
            task: task.clone(),
        });
        self.emit(EngineEvent::TaskSelected {
            timestamp: Utc::now(),
            iteration,
            task: task.clone(),
        });

        let outcome = self.execute_task(iteration, task).await;
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        let ended_at = Utc::now();

        match outcome {
            Ok(Attempt {
                agent_result,
                completion,
            }) => {
                let status = if agent_result.interrupted {
                    IterationStatus::Interrupted
                } else if agent_result.succeeded() {
                    IterationStatus::Completed
                } else {
                    IterationStatus::Failed
                };
                let error = match status {
                    IterationStatus::Failed => {
                        Some(agent_result.error.clone().unwrap_or_else(|| {
                            match agent_result.exit_code {
                                Some(code) => format!("agent exited with code {code}"),
                                None => "agent failed without an exit code".to_string(),
                            }
                        }))
                    }
                    _ => agent_result.error.clone(),
                };

                IterationResult {
                    iteration,
                    status,
                    task: task.clone(),
                    agent_result: Some(agent_result),
                    task_completed: completion.task_completed,
                    promise_complete: completion.promise_complete,
                    duration_ms,
                    error,
                    started_at,
                    ended_at,
                }
            }
            Err(err) => {
                warn!(iteration, task_id = %task.id, error = %err, "iteration failed before completion");
                IterationResult {
                    iteration,
                    status: IterationStatus::Failed,
                    task: task.clone(),
                    agent_result: None,
                    task_completed: false,
                    promise_complete: false,
                    duration_ms,
                    error: Some(err.to_string()),
                    started_at,
                    ended_at,
                }
            }
        }
    }

    async fn execute_task(&self, iteration: u32, task: &Task) -> Result<Attempt, AttemptError> {
        self.tracker
            .update_task_status(&task.id, TaskStatus::InProgress)
            .await?;

        let prompt = self.build_prompt(task).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = ExecuteOptions {
            cwd: self.config.cwd.clone(),
            flags: self.config.model_flags(),
            env: HashMap::new(),
            timeout: self.config.agent_timeout(),
            output: tx,
        };

        let handle = self.agent.execute(&prompt, &[], options)?;
        debug!(
            iteration,
            execution_id = handle.execution_id(),
            "agent execution started"
        );
        {
            let mut inner = self.lock();
            if inner.stop.is_cancelled() {
                handle.interrupt();
            } else {
                inner.running = Some(handle.interrupter());
            }
        }

        let wait = handle.wait();
        tokio::pin!(wait);
        let waited = loop {
            tokio::select! {
                biased;
                Some(chunk) = rx.recv() => self.record_output(iteration, chunk),
                result = &mut wait => break result,
            }
        };
        self.lock().running = None;
        while let Ok(chunk) = rx.try_recv() {
            self.record_output(iteration, chunk);
        }
        let agent_result = waited?;

        debug!(
            iteration,
            status = ?agent_result.status,
            exit_code = ?agent_result.exit_code,
            duration_ms = agent_result.duration_ms,
            "agent execution finished"
        );

        let completion = check_completion(&agent_result);
        if completion.task_completed {
            self.tracker
                .complete_task(&task.id, Some("completed by agent"))
                .await?;
            info!(
                iteration,
                task_id = %task.id,
                promise_complete = completion.promise_complete,
                "task completed"
            );
            self.emit(EngineEvent::TaskCompleted {
                timestamp: Utc::now(),
                iteration,
                task: task.clone(),
            });
        }

        Ok(Attempt {
            agent_result,
            completion,
        })
    }

    async fn build_prompt(&self, task: &Task) -> String {
        let epic = self.resolve_epic(task).await;
        match self.prompts.render(task, &self.config, epic.as_ref()) {
            Ok(rendered) => {
                debug!(task_id = %task.id, source = ?rendered.source, "prompt rendered");
                rendered.prompt
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "prompt rendering failed; using fallback prompt");
                fallback_prompt(task)
            }
        }
    }

    async fn resolve_epic(&self, task: &Task) -> Option<Task> {
        let epic_id = task.parent_id.as_ref().or(self.config.epic_id.as_ref())?;
        match self.tracker.get_task(epic_id).await {
            Ok(epic) => epic,
            Err(err) => {
                warn!(epic_id = %epic_id, error = %err, "failed to load epic");
                None
            }
        }
    }

    fn record_output(&self, iteration: u32, chunk: OutputChunk) {
        {
            let mut inner = self.lock();
            match chunk.stream {
                OutputStream::Stdout => inner.state.current_output.push_str(&chunk.data),
                OutputStream::Stderr => inner.state.current_stderr.push_str(&chunk.data),
            }
        }
        self.emit(EngineEvent::AgentOutput {
            timestamp: Utc::now(),
            iteration,
            stream: chunk.stream,
            data: chunk.data,
        });
    }

    /// Hand the result to the session sink, then announce it. Observers of
    /// `iteration_completed` can rely on the log already being written.
    pub(super) async fn finish_iteration(&self, result: &IterationResult) {
        let buffered;
        let (stdout, stderr) = match &result.agent_result {
            Some(agent) => (agent.stdout.as_str(), agent.stderr.as_str()),
            None => {
                buffered = {
                    let inner = self.lock();
                    (
                        inner.state.current_output.clone(),
                        inner.state.current_stderr.clone(),
                    )
                };
                (buffered.0.as_str(), buffered.1.as_str())
            }
        };

        if let Err(err) = self
            .session
            .save_iteration_log(&self.config.cwd, result, stdout, stderr, &self.config)
            .await
        {
            warn!(iteration = result.iteration, error = %err, "failed to save iteration log");
        }

        self.emit(EngineEvent::IterationCompleted {
            timestamp: Utc::now(),
            result: Box::new(result.clone()),
        });
    }
}
