//! Prompt assembly for agent iterations.
//!
//! `render_task_prompt` is the full built-in format. `fallback_prompt` is the
//! minimal format used when a prompt renderer fails.

use crate::completion::COMPLETION_TOKEN;
use crate::types::Task;
use serde::{Deserialize, Serialize};

/// Where a rendered prompt came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum PromptSource {
    /// The built-in task prompt.
    Builtin,
    /// Built-in prompt with a user preamble file.
    File(String),
    /// The minimal fallback prompt.
    Fallback,
}

/// A prompt ready to hand to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub prompt: String,
    pub source: PromptSource,
}

/// Render the full built-in prompt for a task.
///
/// `preamble` is prepended verbatim when present (e.g. project conventions).
pub fn render_task_prompt(task: &Task, epic: Option<&Task>, preamble: Option<&str>) -> String {
    let mut out = String::new();

    if let Some(preamble) = preamble.map(str::trim).filter(|p| !p.is_empty()) {
        out.push_str(preamble);
        out.push_str("\n\n");
    }

    if let Some(epic) = epic {
        out.push_str(&format!("## Epic\n**{}**: {}\n", epic.id, epic.title));
        if let Some(desc) = epic.description.as_deref().filter(|d| !d.trim().is_empty()) {
            out.push_str(&format!("\n{}\n", desc.trim()));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "## Task\n**ID**: {}\n**Title**: {}\n",
        task.id, task.title
    ));
    if let Some(kind) = &task.kind {
        out.push_str(&format!("**Type**: {kind}\n"));
    }
    if let Some(priority) = task.priority {
        out.push_str(&format!("**Priority**: P{priority}\n"));
    }
    if !task.labels.is_empty() {
        out.push_str(&format!("**Labels**: {}\n", task.labels.join(", ")));
    }
    if !task.depends_on.is_empty() {
        out.push_str(&format!(
            "**Depends on** (already done): {}\n",
            task.depends_on.join(", ")
        ));
    }

    if let Some(desc) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(&format!("\n## Description\n{}\n", desc.trim()));
    }

    out.push_str(&format!(
        r#"
## Instructions
1. Work on this task only. Avoid unrelated changes.
2. Run the checks relevant to the task before finishing.
3. Commit your changes with a message that references {id}.
4. If (and only if) the task is fully done, end your response with:
{token}"#,
        id = task.id,
        token = COMPLETION_TOKEN,
    ));

    out
}

/// Minimal prompt used when the configured renderer fails.
pub fn fallback_prompt(task: &Task) -> String {
    let description = task
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or("No description provided.");

    format!(
        "## Task\n**ID**: {id}\n**Title**: {title}\n\n## Description\n{description}\n\n\
         ## Instructions\nComplete the task described above. When finished, signal completion with:\n{token}\n",
        id = task.id,
        title = task.title,
        token = COMPLETION_TOKEN,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            description: Some("Add a --json flag to `status`.".to_string()),
            labels: vec!["cli".to_string(), "ux".to_string()],
            priority: Some(1),
            kind: Some("feature".to_string()),
            depends_on: vec!["T-0".to_string()],
            ..Task::new("T-7", "JSON status output")
        }
    }

    #[test]
    fn task_prompt_includes_task_fields() {
        let prompt = render_task_prompt(&sample_task(), None, None);
        assert!(prompt.starts_with("## Task"));
        assert!(prompt.contains("**ID**: T-7"));
        assert!(prompt.contains("**Title**: JSON status output"));
        assert!(prompt.contains("**Type**: feature"));
        assert!(prompt.contains("**Priority**: P1"));
        assert!(prompt.contains("**Labels**: cli, ux"));
        assert!(prompt.contains("T-0"));
        assert!(prompt.contains("Add a --json flag"));
        assert!(prompt.trim_end().ends_with(COMPLETION_TOKEN));
    }

    #[test]
    fn task_prompt_includes_epic_and_preamble() {
        let epic = Task {
            description: Some("Make the CLI scriptable.".to_string()),
            ..Task::new("E-1", "Scripting")
        };
        let prompt = render_task_prompt(&sample_task(), Some(&epic), Some("Use rustfmt.\n"));
        assert!(prompt.starts_with("Use rustfmt."));
        assert!(prompt.contains("## Epic\n**E-1**: Scripting"));
        assert!(prompt.contains("Make the CLI scriptable."));
    }

    #[test]
    fn blank_preamble_is_ignored() {
        let prompt = render_task_prompt(&sample_task(), None, Some("   \n"));
        assert!(prompt.starts_with("## Task"));
    }

    #[test]
    fn fallback_prompt_has_minimal_sections() {
        let prompt = fallback_prompt(&Task::new("T-9", "Bump deps"));
        assert!(prompt.contains("**ID**: T-9"));
        assert!(prompt.contains("No description provided."));
        assert!(prompt.contains(COMPLETION_TOKEN));
        assert!(!prompt.contains("## Epic"));
    }
}
