//! Single-flight FIFO request dispatcher
//!
//! One worker thread owns the queue and calls the AI processor for the head
//! entry only. Commands that arrive while a request is in flight are handled
//! between polls of the processor future, so an enqueue while busy only
//! appends and cancel/shutdown take effect mid-request.

use super::fallback::FallbackResponses;
use super::processor::{AiOutput, AiProcessor, Chunk, ConversationContext};
use crate::error::DispatchError;
use crate::messages::{MessageId, MessageSource, StreamChannel};
use crate::persona::{Language, Persona};
use crate::{ColloquyError, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Interval at which commands are checked while a request is in flight
const COMMAND_POLL: Duration = Duration::from_millis(10);

/// A pending user input, owned by the dispatcher until it is dispatched
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    /// Identifier of the AI turn this entry produces
    pub id: MessageId,
    pub text: String,
    pub enqueued_at: DateTime<Utc>,
    pub origin: MessageSource,
}

impl QueueEntry {
    pub fn new(text: impl Into<String>, origin: MessageSource) -> Self {
        Self {
            id: MessageId::generate(),
            text: text.into(),
            enqueued_at: Utc::now(),
            origin,
        }
    }
}

/// Configuration for the dispatcher worker
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Overall time allowed for one AI response
    pub response_timeout: Duration,
    pub persona: Persona,
    pub language: Language,
    pub system_prompt: String,
    /// Completed turns kept in the conversation context
    pub history_limit: usize,
    pub channel_buffer_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            persona: Persona::default(),
            language: Language::default(),
            system_prompt: "You are a helpful voice assistant.".to_string(),
            history_limit: 20,
            channel_buffer_size: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_persona(mut self, persona: Persona, language: Language) -> Self {
        self.persona = persona;
        self.language = language;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Commands sent to the dispatcher worker
#[derive(Clone, Debug)]
pub enum DispatchCommand {
    /// Append an entry to the queue
    Enqueue(QueueEntry),
    /// Drop the in-flight entry, if any; the queue resumes
    CancelInFlight,
    /// Drop every pending (not yet dispatched) entry
    ClearQueue,
    /// Stop the worker
    Shutdown,
}

/// Why an entry was dropped without an answer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Cancelled,
    Cleared,
    Shutdown,
}

/// Events emitted by the dispatcher worker
#[derive(Clone, Debug)]
pub enum DispatchEvent {
    /// The entry became the in-flight request
    Started(QueueEntry),
    /// One streamed chunk of the in-flight request
    Chunk { id: MessageId, chunk: Chunk },
    /// The request finished; the queue advances
    Completed {
        entry: QueueEntry,
        /// Response text (the concatenated response channel when streamed)
        response: String,
        /// Chunks were emitted for this entry
        streamed: bool,
        /// `response` is a generated fallback
        fallback: bool,
    },
    /// The processor failed and no fallback reply exists
    Failed {
        entry: QueueEntry,
        error: DispatchError,
    },
    /// The entry was dropped without an answer
    Dropped {
        entry: QueueEntry,
        reason: DropReason,
    },
    /// Worker shut down
    Shutdown,
}

/// Handle for interacting with a running dispatcher
pub struct DispatcherHandle {
    command_tx: Sender<DispatchCommand>,
    event_rx: Receiver<DispatchEvent>,
    pending: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    worker_handle: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Queue a user input; returns the id of the AI turn it will produce
    pub fn enqueue(&self, text: &str, origin: MessageSource) -> Result<MessageId> {
        let entry = QueueEntry::new(text, origin);
        let id = entry.id.clone();
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.command_tx
            .send(DispatchCommand::Enqueue(entry))
            .map_err(|e| {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                ColloquyError::ChannelError(format!("Failed to send enqueue command: {}", e))
            })?;
        Ok(id)
    }

    /// Drop the in-flight request
    pub fn cancel_in_flight(&self) -> Result<()> {
        self.send(DispatchCommand::CancelInFlight)
    }

    /// Drop all pending entries
    pub fn clear_queue(&self) -> Result<()> {
        self.send(DispatchCommand::ClearQueue)
    }

    /// Entries waiting behind the in-flight one
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether a request is in flight
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn command_sender(&self) -> Sender<DispatchCommand> {
        self.command_tx.clone()
    }

    pub fn event_receiver(&self) -> Receiver<DispatchEvent> {
        self.event_rx.clone()
    }

    /// Try to receive an event without blocking
    pub fn try_recv_event(&self) -> Option<DispatchEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive an event, blocking until available
    pub fn recv_event(&self) -> Result<DispatchEvent> {
        self.event_rx
            .recv()
            .map_err(|e| ColloquyError::ChannelError(format!("Failed to receive event: {}", e)))
    }

    /// Receive an event, waiting at most `timeout`
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<DispatchEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Stop the worker and wait for it to exit
    ///
    /// Events still in flight are discarded so a worker waiting on a full
    /// event channel can reach the shutdown command.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.command_tx.send(DispatchCommand::Shutdown);
        let mut discarded = 0usize;
        while self.event_rx.recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} dispatcher events at shutdown", discarded);
        }
        if let Some(handle) = self.worker_handle.take() {
            handle
                .join()
                .map_err(|_| ColloquyError::ChannelError("Dispatcher thread panicked".into()))?;
        }
        Ok(())
    }

    fn send(&self, command: DispatchCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| ColloquyError::ChannelError(format!("Failed to send command: {}", e)))
    }
}

/// Spawns the dispatcher worker
pub struct RequestDispatcher {
    config: DispatcherConfig,
    processor: Arc<dyn AiProcessor>,
    fallbacks: FallbackResponses,
}

impl RequestDispatcher {
    pub fn new(config: DispatcherConfig, processor: Arc<dyn AiProcessor>) -> Self {
        Self {
            config,
            processor,
            fallbacks: FallbackResponses::builtin(),
        }
    }

    /// Replace the fallback reply table
    pub fn with_fallbacks(mut self, fallbacks: FallbackResponses) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Start the worker thread
    ///
    /// The worker runs its own tokio runtime for the processor futures.
    pub fn start(self) -> Result<DispatcherHandle> {
        // Commands never block the sender; events apply backpressure to streams
        let (command_tx, command_rx) = unbounded::<DispatchCommand>();
        let (event_tx, event_rx) = bounded::<DispatchEvent>(self.config.channel_buffer_size.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicBool::new(false));

        let mut worker = Worker {
            context: ConversationContext::new(&self.config.system_prompt, self.config.history_limit),
            config: self.config,
            processor: self.processor,
            fallbacks: self.fallbacks,
            queue: VecDeque::new(),
            command_rx,
            event_tx,
            pending: pending.clone(),
            busy: busy.clone(),
            fallback_seed: 0,
        };

        let worker_handle = std::thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create tokio runtime: {}", e);
                        let _ = worker.event_tx.send(DispatchEvent::Shutdown);
                        return;
                    }
                };
                runtime.block_on(worker.run());
            })
            .map_err(|e| ColloquyError::IOError(format!("Failed to spawn dispatcher: {}", e)))?;

        Ok(DispatcherHandle {
            command_tx,
            event_rx,
            pending,
            busy,
            worker_handle: Some(worker_handle),
        })
    }
}

/// How an in-flight request ended
enum Outcome {
    Answered {
        response: String,
        streamed: bool,
    },
    /// Failed before any output
    Failed(DispatchError),
    Interrupted(DropReason),
}

struct Worker {
    config: DispatcherConfig,
    processor: Arc<dyn AiProcessor>,
    fallbacks: FallbackResponses,
    context: ConversationContext,
    queue: VecDeque<QueueEntry>,
    command_rx: Receiver<DispatchCommand>,
    event_tx: Sender<DispatchEvent>,
    pending: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    fallback_seed: u64,
}

impl Worker {
    async fn run(&mut self) {
        info!("Dispatcher worker started");

        'outer: loop {
            if let Some(entry) = self.queue.pop_front() {
                // Busy before the entry leaves the pending count
                self.busy.store(true, Ordering::SeqCst);
                self.pending.fetch_sub(1, Ordering::SeqCst);
                if !self.dispatch(entry).await {
                    break 'outer;
                }
                continue;
            }

            let command = match self.command_rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => {
                    info!("Command channel closed, shutting down");
                    break;
                }
            };

            match command {
                DispatchCommand::Enqueue(entry) => {
                    debug!("Enqueued {} ({:?})", entry.id, entry.origin);
                    self.queue.push_back(entry);
                }
                DispatchCommand::CancelInFlight => {
                    debug!("Cancel requested while idle");
                }
                DispatchCommand::ClearQueue => self.clear_queue(),
                DispatchCommand::Shutdown => {
                    info!("Received shutdown command");
                    break;
                }
            }
        }

        self.drop_queue(DropReason::Shutdown);
        let _ = self.event_tx.send(DispatchEvent::Shutdown);
        info!("Dispatcher worker shutdown complete");
    }

    /// Run one entry to completion; returns false when the worker must stop
    async fn dispatch(&mut self, entry: QueueEntry) -> bool {
        debug!("Dispatching {}: {:?}", entry.id, entry.text);

        if self.event_tx.send(DispatchEvent::Started(entry.clone())).is_err() {
            error!("Event channel closed");
            self.busy.store(false, Ordering::SeqCst);
            return false;
        }

        let outcome = self.process(&entry).await;
        self.busy.store(false, Ordering::SeqCst);

        let event = match outcome {
            Outcome::Answered { response, streamed } => {
                self.context.push_turn(&entry.text, &response);
                DispatchEvent::Completed {
                    entry,
                    response,
                    streamed,
                    fallback: false,
                }
            }
            Outcome::Failed(e) => {
                warn!("Request {} failed: {}", entry.id, e);
                let seed = self.fallback_seed;
                self.fallback_seed = self.fallback_seed.wrapping_add(1);
                match self
                    .fallbacks
                    .pick(self.config.persona, self.config.language, seed)
                {
                    Some(reply) => DispatchEvent::Completed {
                        entry,
                        response: reply.to_string(),
                        streamed: false,
                        fallback: true,
                    },
                    None => DispatchEvent::Failed { entry, error: e },
                }
            }
            Outcome::Interrupted(DropReason::Shutdown) => {
                warn!("Request {} dropped by shutdown", entry.id);
                let _ = self.event_tx.send(DispatchEvent::Dropped {
                    entry,
                    reason: DropReason::Shutdown,
                });
                return false;
            }
            Outcome::Interrupted(reason) => {
                warn!("Request {} dropped: {:?}", entry.id, reason);
                return self
                    .event_tx
                    .send(DispatchEvent::Dropped { entry, reason })
                    .is_ok();
            }
        };

        if self.event_tx.send(event).is_err() {
            error!("Event channel closed");
            return false;
        }
        true
    }

    /// Drive the processor for one entry, servicing commands between polls
    async fn process(&mut self, entry: &QueueEntry) -> Outcome {
        let deadline = Instant::now() + self.config.response_timeout;
        let processor = self.processor.clone();
        let context = self.context.clone();

        let output = {
            let mut request = processor.process(&entry.text, &context);
            loop {
                if let Some(reason) = self.service_commands() {
                    return Outcome::Interrupted(reason);
                }
                match tokio::time::timeout(COMMAND_POLL, &mut request).await {
                    Ok(Ok(output)) => break output,
                    Ok(Err(e)) => return Outcome::Failed(e),
                    Err(_) if Instant::now() >= deadline => {
                        return Outcome::Failed(DispatchError::Timeout)
                    }
                    Err(_) => continue,
                }
            }
        };

        match output {
            AiOutput::Response(text) => Outcome::Answered {
                response: text,
                streamed: false,
            },
            AiOutput::Stream(stream) => self.consume_stream(entry, stream, deadline).await,
        }
    }

    async fn consume_stream(
        &mut self,
        entry: &QueueEntry,
        mut stream: futures::stream::BoxStream<'static, std::result::Result<Chunk, DispatchError>>,
        deadline: Instant,
    ) -> Outcome {
        let mut response = String::new();
        let mut emitted = false;
        let mut open = [false; 2];
        let mut closed = [false; 2];

        let interrupted = loop {
            if let Some(reason) = self.service_commands() {
                break Some(reason);
            }

            let next = match tokio::time::timeout(COMMAND_POLL, stream.next()).await {
                Ok(next) => next,
                Err(_) if Instant::now() >= deadline => {
                    if !emitted {
                        return Outcome::Failed(DispatchError::Timeout);
                    }
                    warn!("Stream {} timed out after partial output", entry.id);
                    break None;
                }
                Err(_) => continue,
            };

            match next {
                Some(Ok(chunk)) => {
                    let slot = channel_slot(chunk.channel);
                    if closed[slot] {
                        debug!("Dropping chunk on closed {:?} channel", chunk.channel);
                        continue;
                    }
                    let complete = chunk.is_complete;
                    if chunk.channel == StreamChannel::Response {
                        response.push_str(&chunk.text);
                    }
                    if let Err(reason) = self.emit_chunk(&entry.id, chunk, true) {
                        break Some(reason);
                    }
                    emitted = true;
                    open[slot] = true;
                    closed[slot] = complete;
                }
                Some(Err(e)) if !emitted => return Outcome::Failed(e),
                Some(Err(e)) => {
                    warn!("Stream {} failed after partial output: {}", entry.id, e);
                    break None;
                }
                None => break None,
            }
        };

        // Close what is still open, except on shutdown
        if emitted && interrupted != Some(DropReason::Shutdown) {
            if let Err(reason) = self.close_channels(&entry.id, open, closed) {
                return Outcome::Interrupted(reason);
            }
        }

        if let Some(reason) = interrupted {
            return Outcome::Interrupted(reason);
        }

        if !emitted {
            return Outcome::Failed(DispatchError::ProcessorThrew("empty stream".into()));
        }

        Outcome::Answered {
            response,
            streamed: true,
        }
    }

    /// Send completion chunks for every channel still open
    fn close_channels(
        &mut self,
        id: &MessageId,
        open: [bool; 2],
        closed: [bool; 2],
    ) -> std::result::Result<(), DropReason> {
        for channel in [StreamChannel::Thinking, StreamChannel::Response] {
            let slot = channel_slot(channel);
            let needs_close = match channel {
                StreamChannel::Thinking => open[slot] && !closed[slot],
                StreamChannel::Response => !closed[slot],
            };
            if needs_close {
                let close = Chunk {
                    channel,
                    text: String::new(),
                    is_complete: true,
                };
                self.emit_chunk(id, close, false)?;
            }
        }
        Ok(())
    }

    /// Deliver one chunk, handling commands while the event channel is full
    ///
    /// A cancel only interrupts when `cancellable`; shutdown always does.
    fn emit_chunk(
        &mut self,
        id: &MessageId,
        chunk: Chunk,
        cancellable: bool,
    ) -> std::result::Result<(), DropReason> {
        let mut event = DispatchEvent::Chunk {
            id: id.clone(),
            chunk,
        };
        loop {
            match self.event_tx.send_timeout(event, COMMAND_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Disconnected(_)) => {
                    error!("Event channel closed during streaming");
                    return Err(DropReason::Shutdown);
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    event = back;
                    match self.service_commands() {
                        Some(DropReason::Cancelled) if !cancellable => {
                            debug!("Cancel ignored while closing stream {}", id)
                        }
                        Some(reason) => return Err(reason),
                        None => {}
                    }
                }
            }
        }
    }

    /// Handle commands that arrived while busy
    fn service_commands(&mut self) -> Option<DropReason> {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                DispatchCommand::Enqueue(entry) => {
                    debug!("Busy; queued {} behind in-flight request", entry.id);
                    self.queue.push_back(entry);
                }
                DispatchCommand::ClearQueue => self.clear_queue(),
                DispatchCommand::CancelInFlight => return Some(DropReason::Cancelled),
                DispatchCommand::Shutdown => return Some(DropReason::Shutdown),
            }
        }
        None
    }

    fn clear_queue(&mut self) {
        if !self.queue.is_empty() {
            info!("Clearing {} pending requests", self.queue.len());
        }
        self.drop_queue(DropReason::Cleared);
    }

    fn drop_queue(&mut self, reason: DropReason) {
        while let Some(entry) = self.queue.pop_front() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let _ = self.event_tx.send(DispatchEvent::Dropped { entry, reason });
        }
    }
}

fn channel_slot(channel: StreamChannel) -> usize {
    match channel {
        StreamChannel::Thinking => 0,
        StreamChannel::Response => 1,
    }
}
