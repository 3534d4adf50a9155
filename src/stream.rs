//! Reassembly of streamed AI answers
//!
//! A streamed answer arrives as chunk events on two channels (thinking and
//! response) keyed by a message id. `StreamAggregator` applies them in arrival
//! order to append-only buffers and hands out snapshots that surfaces can
//! render any number of times with the same visible result.

use crate::messages::{MessageId, StreamChannel};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Number of archived ids remembered to reject late duplicates
const FINISHED_MEMORY: usize = 64;

/// Messages held at once; the oldest is evicted to make room
const MAX_ACTIVE: usize = 32;

/// An in-progress (or just finished) AI answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamingMessage {
    pub id: MessageId,
    thinking: String,
    thinking_started: bool,
    thinking_complete: bool,
    response: String,
    response_started: bool,
    response_complete: bool,
}

impl StreamingMessage {
    fn new(id: MessageId) -> Self {
        Self {
            id,
            thinking: String::new(),
            thinking_started: false,
            thinking_complete: false,
            response: String::new(),
            response_started: false,
            response_complete: false,
        }
    }

    pub fn thinking_buffer(&self) -> &str {
        &self.thinking
    }

    pub fn response_buffer(&self) -> &str {
        &self.response
    }

    pub fn thinking_complete(&self) -> bool {
        self.thinking_complete
    }

    pub fn response_complete(&self) -> bool {
        self.response_complete
    }

    /// Immutable once the response is complete and thinking, if it was
    /// ever opened, is complete too
    pub fn is_complete(&self) -> bool {
        self.response_complete && (self.thinking_complete || !self.thinking_started)
    }

    /// Thinking is shown as done once its flag is set or the response has
    /// begun; the buffer itself stays open until its own completion marker
    pub fn thinking_done_for_display(&self) -> bool {
        self.thinking_complete || self.response_started
    }

    fn channel_complete(&self, channel: StreamChannel) -> bool {
        match channel {
            StreamChannel::Thinking => self.thinking_complete,
            StreamChannel::Response => self.response_complete,
        }
    }

    fn apply(&mut self, channel: StreamChannel, text: &str, is_complete: bool) {
        let (buffer, started, complete) = match channel {
            StreamChannel::Thinking => (
                &mut self.thinking,
                &mut self.thinking_started,
                &mut self.thinking_complete,
            ),
            StreamChannel::Response => (
                &mut self.response,
                &mut self.response_started,
                &mut self.response_complete,
            ),
        };
        *started = true;
        buffer.push_str(text);
        if is_complete {
            *complete = true;
        }
    }

    /// Display form of this message
    pub fn render(&self) -> RenderedMessage {
        let thinking = if self.thinking_started {
            let done = self.thinking_done_for_display();
            Some(ThinkingPanel {
                text: self.thinking.clone(),
                status: if done {
                    ThinkingStatus::Done
                } else {
                    ThinkingStatus::InProgress
                },
                collapsed: done,
            })
        } else {
            None
        };

        RenderedMessage {
            id: self.id.clone(),
            thinking,
            response: self.response.clone(),
            complete: self.is_complete(),
        }
    }
}

/// Label of the thinking panel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThinkingStatus {
    InProgress,
    Done,
}

impl std::fmt::Display for ThinkingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThinkingStatus::InProgress => write!(f, "Thinking…"),
            ThinkingStatus::Done => write!(f, "Thought process"),
        }
    }
}

/// Thinking section of a rendered answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThinkingPanel {
    pub text: String,
    pub status: ThinkingStatus,
    pub collapsed: bool,
}

/// What a surface draws for one streamed answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedMessage {
    pub id: MessageId,
    pub thinking: Option<ThinkingPanel>,
    pub response: String,
    pub complete: bool,
}

/// Result of applying one chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Buffer updated (or completion flag set)
    Applied,
    /// The channel was already complete; chunk ignored
    ChannelClosed,
    /// The message is finished or archived; chunk ignored
    Finished,
}

/// Accumulates chunk events into per-id streaming messages
#[derive(Debug, Default)]
pub struct StreamAggregator {
    messages: HashMap<MessageId, StreamingMessage>,
    /// Held ids, oldest first
    arrival: VecDeque<MessageId>,
    finished: VecDeque<MessageId>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk event
    ///
    /// Creates the message on first sight of `id`. Text sent to a completed
    /// channel is dropped, and a repeated completion flag is a no-op.
    pub fn on_chunk(
        &mut self,
        id: &MessageId,
        channel: StreamChannel,
        text: &str,
        is_complete: bool,
    ) -> ChunkOutcome {
        if self.finished.contains(id) {
            debug!("Ignoring chunk for archived message {}", id);
            return ChunkOutcome::Finished;
        }

        if !self.messages.contains_key(id) {
            while self.messages.len() >= MAX_ACTIVE {
                let Some(oldest) = self.arrival.front().cloned() else {
                    break;
                };
                warn!("Evicting unfinished message {}", oldest);
                self.archive(&oldest);
            }
            self.arrival.push_back(id.clone());
        }

        let message = self
            .messages
            .entry(id.clone())
            .or_insert_with(|| StreamingMessage::new(id.clone()));

        if message.is_complete() {
            return ChunkOutcome::Finished;
        }

        if message.channel_complete(channel) {
            debug!("Ignoring {:?} chunk for message {}: channel complete", channel, id);
            return ChunkOutcome::ChannelClosed;
        }

        message.apply(channel, text, is_complete);
        ChunkOutcome::Applied
    }

    /// Copy of the current state of `id`
    pub fn snapshot(&self, id: &MessageId) -> Option<StreamingMessage> {
        self.messages.get(id).cloned()
    }

    /// Rendered form of `id`
    pub fn render(&self, id: &MessageId) -> Option<RenderedMessage> {
        self.messages.get(id).map(StreamingMessage::render)
    }

    /// Remove a rendered message; later chunks for its id are ignored
    pub fn archive(&mut self, id: &MessageId) -> Option<StreamingMessage> {
        let removed = self.messages.remove(id);
        if removed.is_some() {
            self.arrival.retain(|held| held != id);
            if self.finished.len() >= FINISHED_MEMORY {
                self.finished.pop_front();
            }
            self.finished.push_back(id.clone());
        }
        removed
    }

    /// Forget everything, including archived ids
    pub fn clear(&mut self) {
        self.messages.clear();
        self.arrival.clear();
        self.finished.clear();
    }

    /// Ids of messages still held
    pub fn active_ids(&self) -> Vec<MessageId> {
        self.messages.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MessageId {
        MessageId::new(s)
    }

    #[test]
    fn test_creates_on_first_sight() {
        let mut agg = StreamAggregator::new();
        assert!(agg.snapshot(&id("1")).is_none());

        agg.on_chunk(&id("1"), StreamChannel::Response, "Hi", false);
        let snap = agg.snapshot(&id("1")).unwrap();
        assert_eq!(snap.response_buffer(), "Hi");
        assert!(!snap.response_complete());
    }

    #[test]
    fn test_buffer_is_ordered_concatenation() {
        let mut agg = StreamAggregator::new();
        let chunks = ["It ", "is ", "sun", "ny"];
        for chunk in chunks {
            agg.on_chunk(&id("42"), StreamChannel::Response, chunk, false);
        }
        assert_eq!(agg.snapshot(&id("42")).unwrap().response_buffer(), "It is sunny");
    }

    #[test]
    fn test_chunks_after_completion_are_ignored() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("a"), StreamChannel::Thinking, "plan", true);
        let outcome = agg.on_chunk(&id("a"), StreamChannel::Thinking, " more", false);
        assert_eq!(outcome, ChunkOutcome::ChannelClosed);
        assert_eq!(agg.snapshot(&id("a")).unwrap().thinking_buffer(), "plan");
    }

    #[test]
    fn test_duplicate_completion_is_noop() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("a"), StreamChannel::Thinking, "x", false);
        agg.on_chunk(&id("a"), StreamChannel::Thinking, "", true);
        let before = agg.snapshot(&id("a")).unwrap();

        let outcome = agg.on_chunk(&id("a"), StreamChannel::Thinking, "", true);
        assert_eq!(outcome, ChunkOutcome::ChannelClosed);
        assert_eq!(agg.snapshot(&id("a")).unwrap(), before);
    }

    #[test]
    fn test_response_start_collapses_thinking_for_display() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("42"), StreamChannel::Thinking, "", false);
        agg.on_chunk(&id("42"), StreamChannel::Thinking, "analyzing", false);

        let rendered = agg.render(&id("42")).unwrap();
        let panel = rendered.thinking.unwrap();
        assert_eq!(panel.status, ThinkingStatus::InProgress);
        assert!(!panel.collapsed);

        agg.on_chunk(&id("42"), StreamChannel::Response, "It is ", false);
        let snap = agg.snapshot(&id("42")).unwrap();
        assert!(!snap.thinking_complete());
        assert!(snap.thinking_done_for_display());

        let panel = snap.render().thinking.unwrap();
        assert_eq!(panel.status, ThinkingStatus::Done);
        assert!(panel.collapsed);
        assert_eq!(panel.text, "analyzing");
    }

    #[test]
    fn test_late_thinking_chunk_does_not_corrupt_response() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("1"), StreamChannel::Thinking, "a", false);
        agg.on_chunk(&id("1"), StreamChannel::Response, "answer", false);
        agg.on_chunk(&id("1"), StreamChannel::Thinking, "b", false);

        let snap = agg.snapshot(&id("1")).unwrap();
        assert_eq!(snap.thinking_buffer(), "ab");
        assert_eq!(snap.response_buffer(), "answer");
    }

    #[test]
    fn test_completion_without_thinking() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("1"), StreamChannel::Response, "done", true);
        let snap = agg.snapshot(&id("1")).unwrap();
        assert!(snap.is_complete());
        assert!(snap.render().thinking.is_none());

        let outcome = agg.on_chunk(&id("1"), StreamChannel::Thinking, "late", false);
        assert_eq!(outcome, ChunkOutcome::Finished);
    }

    #[test]
    fn test_incomplete_until_both_flags() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("1"), StreamChannel::Thinking, "t", false);
        agg.on_chunk(&id("1"), StreamChannel::Response, "r", true);
        assert!(!agg.snapshot(&id("1")).unwrap().is_complete());

        agg.on_chunk(&id("1"), StreamChannel::Thinking, "", true);
        assert!(agg.snapshot(&id("1")).unwrap().is_complete());
    }

    #[test]
    fn test_render_is_idempotent() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("1"), StreamChannel::Thinking, "why", true);
        agg.on_chunk(&id("1"), StreamChannel::Response, "because", true);
        let snap = agg.snapshot(&id("1")).unwrap();
        assert_eq!(snap.render(), snap.render());
        assert_eq!(agg.render(&id("1")), agg.render(&id("1")));
    }

    #[test]
    fn test_replay_yields_identical_render() {
        let sequence = [
            (StreamChannel::Thinking, "analyzing", false),
            (StreamChannel::Thinking, "", true),
            (StreamChannel::Response, "It is ", false),
            (StreamChannel::Response, "sunny", false),
            (StreamChannel::Response, "", true),
        ];

        let mut first = StreamAggregator::new();
        for (channel, text, complete) in sequence {
            first.on_chunk(&id("42"), channel, text, complete);
        }
        let rendered = first.render(&id("42")).unwrap();

        // Replaying into the same aggregator changes nothing
        for (channel, text, complete) in sequence {
            first.on_chunk(&id("42"), channel, text, complete);
        }
        assert_eq!(first.render(&id("42")).unwrap(), rendered);

        // Replaying into a fresh one yields the same output
        let mut second = StreamAggregator::new();
        for (channel, text, complete) in sequence {
            second.on_chunk(&id("42"), channel, text, complete);
        }
        assert_eq!(second.render(&id("42")).unwrap(), rendered);
        assert_eq!(rendered.response, "It is sunny");
    }

    #[test]
    fn test_archive_rejects_late_chunks() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("1"), StreamChannel::Response, "x", true);
        assert!(agg.archive(&id("1")).is_some());
        assert!(agg.is_empty());

        let outcome = agg.on_chunk(&id("1"), StreamChannel::Response, "", true);
        assert_eq!(outcome, ChunkOutcome::Finished);
        assert!(agg.snapshot(&id("1")).is_none());
    }

    #[test]
    fn test_archive_memory_is_bounded() {
        let mut agg = StreamAggregator::new();
        for i in 0..(FINISHED_MEMORY + 10) {
            let key = id(&i.to_string());
            agg.on_chunk(&key, StreamChannel::Response, "x", true);
            agg.archive(&key);
        }
        assert_eq!(agg.finished.len(), FINISHED_MEMORY);
        // The oldest id has been forgotten and may be reused
        let outcome = agg.on_chunk(&id("0"), StreamChannel::Response, "again", false);
        assert_eq!(outcome, ChunkOutcome::Applied);
    }

    #[test]
    fn test_unfinished_messages_are_evicted_oldest_first() {
        let mut agg = StreamAggregator::new();
        for i in 0..(MAX_ACTIVE + 3) {
            // Thinking never completes, so none of these finish on their own
            agg.on_chunk(&id(&i.to_string()), StreamChannel::Thinking, "hmm", false);
        }
        assert_eq!(agg.len(), MAX_ACTIVE);
        assert!(agg.snapshot(&id("0")).is_none());
        assert!(agg.snapshot(&id("2")).is_none());
        assert!(agg.snapshot(&id("3")).is_some());

        // An evicted id stays finished
        let outcome = agg.on_chunk(&id("0"), StreamChannel::Response, "late", true);
        assert_eq!(outcome, ChunkOutcome::Finished);
        assert_eq!(agg.len(), MAX_ACTIVE);
    }

    #[test]
    fn test_independent_ids() {
        let mut agg = StreamAggregator::new();
        agg.on_chunk(&id("a"), StreamChannel::Response, "one", false);
        agg.on_chunk(&id("b"), StreamChannel::Response, "two", false);
        agg.on_chunk(&id("a"), StreamChannel::Response, " more", false);
        assert_eq!(agg.snapshot(&id("a")).unwrap().response_buffer(), "one more");
        assert_eq!(agg.snapshot(&id("b")).unwrap().response_buffer(), "two");
        assert_eq!(agg.len(), 2);
    }
}
