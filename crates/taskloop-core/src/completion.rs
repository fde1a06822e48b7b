//! Completion detection for agent output.
//!
//! The agent signals that a task is done by printing the completion token
//! anywhere in stdout. Matching is case-insensitive and tolerates whitespace
//! inside the tags.

use crate::types::AgentResult;
use regex::Regex;
use std::sync::LazyLock;

/// The canonical completion token agents are asked to print.
pub const COMPLETION_TOKEN: &str = "<promise>COMPLETE</promise>";

static COMPLETION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<promise>\s*COMPLETE\s*</promise>").expect("completion pattern is valid")
});

/// Result of completion detection for one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionResult {
    /// Whether the completion token was found in stdout.
    pub promise_complete: bool,
    /// Whether the task should be treated as done.
    pub task_completed: bool,
}

/// Check whether the output contains the completion token.
///
/// # Example
/// ```
/// use taskloop_core::completion::has_completion_token;
///
/// assert!(has_completion_token("Done.\n<promise>COMPLETE</promise>"));
/// assert!(has_completion_token("<Promise> complete </PROMISE>"));
/// assert!(!has_completion_token("<promise>INCOMPLETE</promise>"));
/// ```
pub fn has_completion_token(output: &str) -> bool {
    COMPLETION_PATTERN.is_match(output)
}

/// Decide whether an agent run completed its task.
///
/// Either signal is sufficient: the token in stdout, or the adapter reporting
/// a successful run. An agent that exits cleanly without printing the token
/// therefore still closes its task.
pub fn check_completion(result: &AgentResult) -> CompletionResult {
    let promise_complete = has_completion_token(&result.stdout);
    CompletionResult {
        promise_complete,
        task_completed: promise_complete || result.succeeded(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentStatus;

    fn agent_result(status: AgentStatus, stdout: &str) -> AgentResult {
        AgentResult {
            execution_id: "exec-1".to_string(),
            status,
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 10,
            interrupted: false,
            error: None,
        }
    }

    #[test]
    fn detects_bare_token() {
        assert!(has_completion_token(COMPLETION_TOKEN));
    }

    #[test]
    fn detects_token_embedded_in_output() {
        assert!(has_completion_token(
            "Implemented the parser.\nAll tests pass. <promise>COMPLETE</promise> bye"
        ));
    }

    #[test]
    fn detection_is_case_insensitive() {
        assert!(has_completion_token("<PROMISE>complete</PROMISE>"));
    }

    #[test]
    fn detection_tolerates_inner_whitespace() {
        assert!(has_completion_token("<promise>\n  COMPLETE\n</promise>"));
    }

    #[test]
    fn rejects_other_promise_content() {
        assert!(!has_completion_token("<promise>NOT DONE</promise>"));
        assert!(!has_completion_token("COMPLETE"));
        assert!(!has_completion_token(""));
    }

    #[test]
    fn token_alone_completes_failed_run() {
        let result = check_completion(&agent_result(AgentStatus::Failed, COMPLETION_TOKEN));
        assert!(result.promise_complete);
        assert!(result.task_completed);
    }

    #[test]
    fn successful_run_completes_without_token() {
        let result = check_completion(&agent_result(AgentStatus::Completed, "partial work"));
        assert!(!result.promise_complete);
        assert!(result.task_completed);
    }

    #[test]
    fn failed_run_without_token_is_incomplete() {
        let result = check_completion(&agent_result(AgentStatus::Failed, "crashed"));
        assert!(!result.task_completed);
    }
}
