pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod messages;
pub mod orchestrator;
pub mod persona;
pub mod speech;
pub mod state;
pub mod stream;

pub use error::{ColloquyError, Result};
pub use orchestrator::{Orchestrator, OrchestratorCommand, OrchestratorEvent, OrchestratorHandle};
pub use state::{InteractionState, Phase, SharedInteractionState};
