//! Prompt capability used by the engine.

use std::path::PathBuf;
use taskloop_core::prompt::{render_task_prompt, PromptSource, RenderedPrompt};
use taskloop_core::{Config, Task};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("failed to read prompt file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt rendering failed: {0}")]
    Render(String),
}

pub type Result<T> = std::result::Result<T, PromptError>;

/// Turns a task into prompt text. The engine falls back to a minimal prompt
/// when this fails.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, task: &Task, config: &Config, epic: Option<&Task>) -> Result<RenderedPrompt>;
}

/// Built-in renderer. The optional preamble from `config.prompt_file` is
/// read once by `load`, not on every iteration.
#[derive(Debug, Clone, Default)]
pub struct BuiltinPrompt {
    preamble: Option<Preamble>,
}

#[derive(Debug, Clone)]
struct Preamble {
    path: PathBuf,
    text: String,
}

impl BuiltinPrompt {
    /// Renderer without a preamble.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the configured prompt file, if any.
    pub async fn load(config: &Config) -> Result<Self> {
        let Some(file) = &config.prompt_file else {
            return Ok(Self::new());
        };
        let path = config.resolve(file);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| PromptError::Read {
                path: path.display().to_string(),
                source,
            })?;
        debug!(path = %path.display(), bytes = text.len(), "prompt preamble loaded");
        Ok(Self {
            preamble: Some(Preamble { path, text }),
        })
    }
}

impl PromptRenderer for BuiltinPrompt {
    fn render(&self, task: &Task, _config: &Config, epic: Option<&Task>) -> Result<RenderedPrompt> {
        match &self.preamble {
            Some(preamble) => Ok(RenderedPrompt {
                prompt: render_task_prompt(task, epic, Some(&preamble.text)),
                source: PromptSource::File(preamble.path.display().to_string()),
            }),
            None => Ok(RenderedPrompt {
                prompt: render_task_prompt(task, epic, None),
                source: PromptSource::Builtin,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn renders_builtin_without_prompt_file() {
        let prompts = BuiltinPrompt::load(&Config::default()).await.unwrap();
        let rendered = prompts
            .render(&Task::new("T-1", "Add tests"), &Config::default(), None)
            .unwrap();
        assert_eq!(rendered.source, PromptSource::Builtin);
        assert!(rendered.prompt.contains("**ID**: T-1"));
    }

    #[tokio::test]
    async fn prompt_file_is_resolved_against_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("preamble.md"), "Always run cargo fmt.").unwrap();
        let config = Config {
            cwd: dir.path().to_path_buf(),
            prompt_file: Some(PathBuf::from("preamble.md")),
            ..Config::default()
        };

        let prompts = BuiltinPrompt::load(&config).await.unwrap();
        let rendered = prompts
            .render(&Task::new("T-2", "Refactor"), &config, None)
            .unwrap();
        assert!(rendered.prompt.starts_with("Always run cargo fmt."));
        assert!(matches!(rendered.source, PromptSource::File(ref p) if p.ends_with("preamble.md")));
    }

    #[tokio::test]
    async fn preamble_is_read_once_at_load() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("preamble.md");
        std::fs::write(&file, "Original rules.").unwrap();
        let config = Config {
            cwd: dir.path().to_path_buf(),
            prompt_file: Some(PathBuf::from("preamble.md")),
            ..Config::default()
        };

        let prompts = BuiltinPrompt::load(&config).await.unwrap();
        std::fs::remove_file(&file).unwrap();

        let rendered = prompts
            .render(&Task::new("T-4", "Ship"), &config, None)
            .unwrap();
        assert!(rendered.prompt.starts_with("Original rules."));
    }

    #[tokio::test]
    async fn missing_prompt_file_fails_load() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            cwd: dir.path().to_path_buf(),
            prompt_file: Some(PathBuf::from("missing.md")),
            ..Config::default()
        };
        let err = BuiltinPrompt::load(&config).await.unwrap_err();
        assert!(matches!(err, PromptError::Read { .. }));
    }
}
