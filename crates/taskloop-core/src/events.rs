//! Engine lifecycle events.
//!
//! Every observer (terminal output, session persistence, audit log) sees the
//! engine only through this stream.

use crate::types::{FailureAction, IterationResult, OutputStream, StopReason, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EngineStarted,
    EnginePaused,
    EngineResumed,
    EngineStopped,
    IterationStarted,
    IterationCompleted,
    IterationFailed,
    IterationRetrying,
    IterationSkipped,
    TaskSelected,
    TaskCompleted,
    AgentOutput,
    AllComplete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EngineStarted => "engine_started",
            Self::EnginePaused => "engine_paused",
            Self::EngineResumed => "engine_resumed",
            Self::EngineStopped => "engine_stopped",
            Self::IterationStarted => "iteration_started",
            Self::IterationCompleted => "iteration_completed",
            Self::IterationFailed => "iteration_failed",
            Self::IterationRetrying => "iteration_retrying",
            Self::IterationSkipped => "iteration_skipped",
            Self::TaskSelected => "task_selected",
            Self::TaskCompleted => "task_completed",
            Self::AgentOutput => "agent_output",
            Self::AllComplete => "all_complete",
        }
    }
}

/// An event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    EngineStarted {
        timestamp: DateTime<Utc>,
        session_id: String,
        total_tasks: usize,
    },
    EnginePaused {
        timestamp: DateTime<Utc>,
        current_iteration: u32,
    },
    EngineResumed {
        timestamp: DateTime<Utc>,
        from_iteration: u32,
    },
    EngineStopped {
        timestamp: DateTime<Utc>,
        reason: StopReason,
        total_iterations: u32,
        tasks_completed: u32,
    },
    IterationStarted {
        timestamp: DateTime<Utc>,
        iteration: u32,
        task: Task,
    },
    IterationCompleted {
        timestamp: DateTime<Utc>,
        result: Box<IterationResult>,
    },
    IterationFailed {
        timestamp: DateTime<Utc>,
        iteration: u32,
        task: Task,
        error: String,
        action: FailureAction,
    },
    IterationRetrying {
        timestamp: DateTime<Utc>,
        iteration: u32,
        task: Task,
        /// 1-indexed retry number.
        retry_attempt: u32,
        max_retries: u32,
        previous_error: String,
        delay_ms: u64,
    },
    IterationSkipped {
        timestamp: DateTime<Utc>,
        iteration: u32,
        task: Task,
        reason: String,
    },
    TaskSelected {
        timestamp: DateTime<Utc>,
        iteration: u32,
        task: Task,
    },
    TaskCompleted {
        timestamp: DateTime<Utc>,
        iteration: u32,
        task: Task,
    },
    AgentOutput {
        timestamp: DateTime<Utc>,
        iteration: u32,
        stream: OutputStream,
        data: String,
    },
    AllComplete {
        timestamp: DateTime<Utc>,
        total_completed: u32,
        total_iterations: u32,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::EngineStarted { .. } => EventType::EngineStarted,
            Self::EnginePaused { .. } => EventType::EnginePaused,
            Self::EngineResumed { .. } => EventType::EngineResumed,
            Self::EngineStopped { .. } => EventType::EngineStopped,
            Self::IterationStarted { .. } => EventType::IterationStarted,
            Self::IterationCompleted { .. } => EventType::IterationCompleted,
            Self::IterationFailed { .. } => EventType::IterationFailed,
            Self::IterationRetrying { .. } => EventType::IterationRetrying,
            Self::IterationSkipped { .. } => EventType::IterationSkipped,
            Self::TaskSelected { .. } => EventType::TaskSelected,
            Self::TaskCompleted { .. } => EventType::TaskCompleted,
            Self::AgentOutput { .. } => EventType::AgentOutput,
            Self::AllComplete { .. } => EventType::AllComplete,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::EngineStarted { timestamp, .. }
            | Self::EnginePaused { timestamp, .. }
            | Self::EngineResumed { timestamp, .. }
            | Self::EngineStopped { timestamp, .. }
            | Self::IterationStarted { timestamp, .. }
            | Self::IterationCompleted { timestamp, .. }
            | Self::IterationFailed { timestamp, .. }
            | Self::IterationRetrying { timestamp, .. }
            | Self::IterationSkipped { timestamp, .. }
            | Self::TaskSelected { timestamp, .. }
            | Self::TaskCompleted { timestamp, .. }
            | Self::AgentOutput { timestamp, .. }
            | Self::AllComplete { timestamp, .. } => *timestamp,
        }
    }

    /// Iteration number the event belongs to, if any.
    pub fn iteration(&self) -> Option<u32> {
        match self {
            Self::IterationStarted { iteration, .. }
            | Self::IterationFailed { iteration, .. }
            | Self::IterationRetrying { iteration, .. }
            | Self::IterationSkipped { iteration, .. }
            | Self::TaskSelected { iteration, .. }
            | Self::TaskCompleted { iteration, .. }
            | Self::AgentOutput { iteration, .. } => Some(*iteration),
            Self::IterationCompleted { result, .. } => Some(result.iteration),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&EventType::IterationRetrying).unwrap(),
            "\"iteration_retrying\""
        );
        assert_eq!(EventType::AllComplete.as_str(), "all_complete");
    }

    #[test]
    fn engine_stopped_is_tagged() {
        let event = EngineEvent::EngineStopped {
            timestamp: Utc::now(),
            reason: StopReason::NoTasks,
            total_iterations: 3,
            tasks_completed: 0,
        };
        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"engine_stopped\""));
        assert!(json.contains("\"reason\":\"no_tasks\""));
        assert_eq!(event.event_type(), EventType::EngineStopped);
        assert_eq!(event.iteration(), None);
    }

    #[test]
    fn agent_output_carries_stream_and_iteration() {
        let event = EngineEvent::AgentOutput {
            timestamp: Utc::now(),
            iteration: 4,
            stream: OutputStream::Stderr,
            data: "warning: unused".to_string(),
        };
        let json = event.to_json().unwrap();
        assert!(json.contains("\"stream\":\"stderr\""));
        assert_eq!(event.iteration(), Some(4));
    }

    #[test]
    fn iteration_failed_round_trips_through_json() {
        let event = EngineEvent::IterationFailed {
            timestamp: Utc::now(),
            iteration: 2,
            task: Task::new("T-1", "Fix login"),
            error: "exit code 1".to_string(),
            action: FailureAction::Retry,
        };
        let parsed: EngineEvent = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        match parsed {
            EngineEvent::IterationFailed { task, action, .. } => {
                assert_eq!(task.id, "T-1");
                assert_eq!(action, FailureAction::Retry);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
