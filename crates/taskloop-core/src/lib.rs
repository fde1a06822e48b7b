pub mod completion;
pub mod config;
pub mod events;
pub mod prompt;
pub mod types;

pub use config::{Config, ErrorHandling};
pub use events::{EngineEvent, EventType};
pub use types::*;
