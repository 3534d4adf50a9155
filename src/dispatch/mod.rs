//! AI request dispatching: processor contract, fallbacks, single-flight queue

pub mod dispatcher;
pub mod fallback;
pub mod processor;

pub use dispatcher::{
    DispatchCommand, DispatchEvent, DispatcherConfig, DispatcherHandle, DropReason, QueueEntry,
    RequestDispatcher,
};
pub use fallback::FallbackResponses;
pub use processor::{AiOutput, AiProcessor, Chunk, ContextMessage, ConversationContext, Role};
