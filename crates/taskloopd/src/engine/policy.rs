//! Error-handling wrapper around single attempts.

use chrono::Utc;
use std::time::Duration;
use taskloop_core::{EngineEvent, ErrorStrategy, FailureAction, IterationResult, Task};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Engine;

impl Engine {
    /// Run `task` under the configured error strategy. Retries re-run the same
    /// task as new iterations; the last attempt's result is returned.
    pub(super) async fn run_with_error_handling(
        &self,
        task: Task,
        stop: &CancellationToken,
    ) -> IterationResult {
        let policy = &self.config.error_handling;

        loop {
            let result = self.run_attempt(&task).await;
            self.lock().state.iterations.push(result.clone());

            if !result.is_failed() {
                if result.task_completed {
                    let mut inner = self.lock();
                    inner.state.tasks_completed += 1;
                    inner.state.retry_counts.remove(&task.id);
                }
                self.finish_iteration(&result).await;
                return result;
            }

            let iteration = result.iteration;
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());

            // No further attempt will run, so no failure action is announced.
            if stop.is_cancelled() {
                info!(iteration, task_id = %task.id, error = %error, "iteration failed after stop");
                self.finish_iteration(&result).await;
                return result;
            }

            match policy.strategy {
                ErrorStrategy::Retry => {
                    let attempts = self
                        .lock()
                        .state
                        .retry_counts
                        .get(&task.id)
                        .copied()
                        .unwrap_or(0);

                    if attempts < policy.max_retries {
                        let retry_attempt = attempts + 1;
                        warn!(
                            iteration,
                            task_id = %task.id,
                            retry_attempt,
                            max_retries = policy.max_retries,
                            error = %error,
                            "iteration failed; retrying"
                        );
                        self.emit(EngineEvent::IterationFailed {
                            timestamp: Utc::now(),
                            iteration,
                            task: task.clone(),
                            error: error.clone(),
                            action: FailureAction::Retry,
                        });
                        self.emit(EngineEvent::IterationRetrying {
                            timestamp: Utc::now(),
                            iteration,
                            task: task.clone(),
                            retry_attempt,
                            max_retries: policy.max_retries,
                            previous_error: error,
                            delay_ms: policy.retry_delay_ms,
                        });
                        self.lock()
                            .state
                            .retry_counts
                            .insert(task.id.clone(), retry_attempt);
                        self.finish_iteration(&result).await;

                        tokio::select! {
                            biased;
                            () = stop.cancelled() => return result,
                            () = tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms)) => {}
                        }
                        continue;
                    }

                    let reason = format!("max retries ({}) exceeded", policy.max_retries);
                    warn!(iteration, task_id = %task.id, error = %error, "{reason}; skipping task");
                    self.emit(EngineEvent::IterationFailed {
                        timestamp: Utc::now(),
                        iteration,
                        task: task.clone(),
                        error: format!("{error} ({reason})"),
                        action: FailureAction::Skip,
                    });
                    self.skip_task(iteration, &task, reason);
                }
                ErrorStrategy::Skip => {
                    warn!(iteration, task_id = %task.id, error = %error, "iteration failed; skipping task");
                    self.emit(EngineEvent::IterationFailed {
                        timestamp: Utc::now(),
                        iteration,
                        task: task.clone(),
                        error: error.clone(),
                        action: FailureAction::Skip,
                    });
                    self.skip_task(iteration, &task, error);
                }
                ErrorStrategy::Abort => {
                    warn!(iteration, task_id = %task.id, error = %error, "iteration failed; aborting");
                    self.emit(EngineEvent::IterationFailed {
                        timestamp: Utc::now(),
                        iteration,
                        task: task.clone(),
                        error,
                        action: FailureAction::Abort,
                    });
                }
            }

            self.finish_iteration(&result).await;
            return result;
        }
    }

    fn skip_task(&self, iteration: u32, task: &Task, reason: String) {
        {
            let mut inner = self.lock();
            inner.state.skipped_tasks.insert(task.id.clone());
            inner.state.retry_counts.remove(&task.id);
        }
        info!(iteration, task_id = %task.id, "task skipped for the rest of the run");
        self.emit(EngineEvent::IterationSkipped {
            timestamp: Utc::now(),
            iteration,
            task: task.clone(),
            reason,
        });
    }
}
