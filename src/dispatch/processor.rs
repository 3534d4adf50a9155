//! The AI processor collaborator and the conversation context it receives

use crate::error::DispatchError;
use crate::messages::StreamChannel;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Incremental fragment of a streamed answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub channel: StreamChannel,
    pub text: String,
    pub is_complete: bool,
}

impl Chunk {
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            channel: StreamChannel::Thinking,
            text: text.into(),
            is_complete: false,
        }
    }

    pub fn response(text: impl Into<String>) -> Self {
        Self {
            channel: StreamChannel::Response,
            text: text.into(),
            is_complete: false,
        }
    }

    /// Mark this chunk as the last one on its channel
    pub fn complete(mut self) -> Self {
        self.is_complete = true;
        self
    }
}

/// What the processor hands back for one request
pub enum AiOutput {
    /// Whole answer at once
    Response(String),
    /// Chunk stream; thinking and response may interleave
    Stream(BoxStream<'static, Result<Chunk, DispatchError>>),
}

impl std::fmt::Debug for AiOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AiOutput::Response(text) => f.debug_tuple("Response").field(text).finish(),
            AiOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The language-model collaborator
///
/// Called by the dispatcher worker at most once concurrently. An `Err`
/// before any output is replaced with a fallback reply.
pub trait AiProcessor: Send + Sync {
    fn process<'a>(
        &'a self,
        input: &'a str,
        context: &'a ConversationContext,
    ) -> BoxFuture<'a, Result<AiOutput, DispatchError>>;
}

/// Role of a message in the conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in the conversation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl ContextMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// System prompt plus a bounded window of completed turns
#[derive(Clone, Debug)]
pub struct ConversationContext {
    system_prompt: String,
    /// Completed (user, assistant) pairs, oldest first
    turns: Vec<(String, String)>,
    max_turns: usize,
}

impl ConversationContext {
    pub fn new(system_prompt: &str, max_turns: usize) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            turns: Vec::new(),
            max_turns,
        }
    }

    /// Record a completed turn, evicting the oldest past the limit
    pub fn push_turn(&mut self, user: &str, assistant: &str) {
        if self.max_turns == 0 {
            return;
        }
        self.turns.push((user.to_string(), assistant.to_string()));
        if self.turns.len() > self.max_turns {
            let excess = self.turns.len() - self.max_turns;
            self.turns.drain(..excess);
        }
    }

    /// Clear history (keeps system prompt)
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// All messages, system prompt first
    pub fn messages(&self) -> Vec<ContextMessage> {
        let mut result = vec![ContextMessage::new(Role::System, &self.system_prompt)];
        for (user, assistant) in &self.turns {
            result.push(ContextMessage::new(Role::User, user));
            result.push(ContextMessage::new(Role::Assistant, assistant));
        }
        result
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: &str) {
        self.system_prompt = prompt.to_string();
    }

    /// Number of completed turns held
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}
