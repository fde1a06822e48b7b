//! taskloopd - autonomous task loop
//!
//! Library components for the `taskloopd` binary: the iteration engine, its
//! capability traits, and the concrete adapters (subprocess agent, JSON task
//! file, SQLite session store).

pub mod agent;
pub mod bus;
pub mod engine;
pub mod prompt;
pub mod runner;
pub mod session;
pub mod storage;
pub mod tracker;

use std::sync::Arc;

use engine::{Capabilities, Engine, EngineError};
use prompt::{BuiltinPrompt, PromptError};
use runner::ProcessAgent;
use storage::{Storage, StorageError};
use taskloop_core::{Config, Id, SessionStatus};
use thiserror::Error;
use tracing::{info, warn};
use tracker::FileTracker;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// An engine wired to the concrete adapters, with one recorded session.
#[derive(Debug)]
pub struct Daemon {
    engine: Arc<Engine>,
    storage: Storage,
}

impl Daemon {
    /// Open storage, record a new session and build the engine.
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        let prompts = BuiltinPrompt::load(&config).await?;
        let storage = Storage::new(&config.resolve(&config.session_db)).await?;
        storage.migrate_embedded().await?;

        let session_id = Id::new();
        storage
            .create_session(&session_id, &config.cwd, &config)
            .await?;
        info!(session_id = %session_id, cwd = %config.cwd.display(), "session created");

        let capabilities = Capabilities {
            agent: Arc::new(ProcessAgent::from_config(&config)),
            tracker: Arc::new(FileTracker::new(config.resolve(&config.tracker_file))),
            prompts: Arc::new(prompts),
            session: Arc::new(storage.clone()),
        };
        let engine = Engine::new(config, capabilities).with_session_id(session_id);

        Ok(Self {
            engine: Arc::new(engine),
            storage,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Initialize and run the engine to completion, recording events.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let recorder = self
            .storage
            .record_events(self.engine.bus(), self.engine.session_id().clone());

        let outcome = match self.engine.initialize().await {
            Ok(_) => self.engine.start().await,
            Err(err) => {
                let cwd = &self.engine.config().cwd;
                if let Err(store_err) = self
                    .storage
                    .set_session_status(cwd, SessionStatus::Failed)
                    .await
                {
                    warn!(error = %store_err, "failed to mark session failed");
                }
                Err(err)
            }
        };

        recorder.finish().await;
        outcome.map_err(DaemonError::from)
    }

    /// Stop the engine. `run` returns once the in-flight iteration is recorded.
    pub async fn shutdown(&self) {
        self.engine.stop().await;
    }
}
