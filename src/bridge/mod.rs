//! Message bridge between the chat surface, the voice surface and the
//! orchestrator
//!
//! Publishing is fire-and-forget: messages go into the bridge's command
//! channel and a single worker thread routes them in arrival order, so every
//! surface sees messages in the order they were published. Inputs that need
//! an AI answer come back out as `BridgeEvent::Enqueue`.

pub mod poll;
pub mod routing;

pub use poll::{ChannelPollSource, PollAdapter, PollSource};
pub use routing::{route, EnqueueRequest, Route, SurfaceUpdate, VOICE_PREFIX};

use crate::error::BridgeError;
use crate::messages::Message;
use crate::stream::{ChunkOutcome, StreamAggregator};
use crate::{ColloquyError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A UI entry/exit point for the conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Surface {
    Chat,
    Voice,
}

/// Receives updates for one surface
pub trait SurfaceHandler: Send {
    fn handle(&mut self, update: &SurfaceUpdate);

    /// Whether status messages are shown on this surface
    fn accepts_status(&self) -> bool {
        true
    }
}

/// Handler that forwards every update into a channel
pub struct ChannelSurface {
    tx: Sender<SurfaceUpdate>,
    accepts_status: bool,
}

impl ChannelSurface {
    pub fn new(tx: Sender<SurfaceUpdate>) -> Self {
        Self {
            tx,
            accepts_status: true,
        }
    }

    /// Drop status messages for this surface
    pub fn without_status(mut self) -> Self {
        self.accepts_status = false;
        self
    }
}

impl SurfaceHandler for ChannelSurface {
    fn handle(&mut self, update: &SurfaceUpdate) {
        let _ = self.tx.send(update.clone());
    }

    fn accepts_status(&self) -> bool {
        self.accepts_status
    }
}

/// Commands for the bridge worker
pub enum BridgeCommand {
    Publish(Message),
    /// Raw JSON wire message, validated by the worker
    PublishRaw(String),
    Subscribe(Surface, Box<dyn SurfaceHandler>),
    Shutdown,
}

impl std::fmt::Debug for BridgeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeCommand::Publish(m) => f.debug_tuple("Publish").field(m).finish(),
            BridgeCommand::PublishRaw(raw) => f.debug_tuple("PublishRaw").field(raw).finish(),
            BridgeCommand::Subscribe(surface, _) => {
                f.debug_tuple("Subscribe").field(surface).finish()
            }
            BridgeCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Events from the bridge worker
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    /// An input the routing table sends to the dispatcher
    Enqueue(EnqueueRequest),
    /// A message was rejected and dropped
    Dropped(BridgeError),
    Shutdown,
}

/// Handle for a running bridge
pub struct BridgeHandle {
    command_tx: Sender<BridgeCommand>,
    event_rx: Receiver<BridgeEvent>,
    dropped: Arc<AtomicU64>,
    worker_handle: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Publish a message to every subscribed surface
    pub fn publish(&self, message: Message) -> Result<()> {
        self.send(BridgeCommand::Publish(message))
    }

    /// Publish a raw JSON wire message
    pub fn publish_raw(&self, json: impl Into<String>) -> Result<()> {
        self.send(BridgeCommand::PublishRaw(json.into()))
    }

    /// Register a handler for `surface`
    pub fn subscribe(&self, surface: Surface, handler: Box<dyn SurfaceHandler>) -> Result<()> {
        self.send(BridgeCommand::Subscribe(surface, handler))
    }

    /// Subscribe `surface` and receive its updates on a channel
    pub fn subscribe_channel(&self, surface: Surface) -> Result<Receiver<SurfaceUpdate>> {
        let (tx, rx) = unbounded();
        self.subscribe(surface, Box::new(ChannelSurface::new(tx)))?;
        Ok(rx)
    }

    /// Number of messages dropped as malformed
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn command_sender(&self) -> Sender<BridgeCommand> {
        self.command_tx.clone()
    }

    pub fn event_receiver(&self) -> Receiver<BridgeEvent> {
        self.event_rx.clone()
    }

    pub fn try_recv_event(&self) -> Option<BridgeEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<BridgeEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Stop the worker after it has routed everything already published
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.command_tx.send(BridgeCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            handle
                .join()
                .map_err(|_| ColloquyError::ChannelError("Bridge thread panicked".into()))?;
        }
        Ok(())
    }

    fn send(&self, command: BridgeCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| ColloquyError::ChannelError(format!("Failed to send bridge command: {}", e)))
    }
}

/// Builds and starts the bridge worker
pub struct MessageBridge {
    channel_buffer_size: usize,
    subscribers: Vec<(Surface, Box<dyn SurfaceHandler>)>,
}

impl Default for MessageBridge {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MessageBridge {
    pub fn new(channel_buffer_size: usize) -> Self {
        Self {
            channel_buffer_size: channel_buffer_size.max(1),
            subscribers: Vec::new(),
        }
    }

    /// Subscribe a handler before the worker starts
    pub fn with_subscriber(mut self, surface: Surface, handler: Box<dyn SurfaceHandler>) -> Self {
        self.subscribers.push((surface, handler));
        self
    }

    pub fn start(self) -> Result<BridgeHandle> {
        let (command_tx, command_rx) = bounded::<BridgeCommand>(self.channel_buffer_size);
        // Enqueue events must never block routing
        let (event_tx, event_rx) = unbounded::<BridgeEvent>();
        let dropped = Arc::new(AtomicU64::new(0));

        let mut worker = Worker {
            subscribers: self.subscribers,
            aggregator: StreamAggregator::new(),
            event_tx,
            dropped: dropped.clone(),
        };

        let worker_handle = std::thread::Builder::new()
            .name("bridge".into())
            .spawn(move || {
                info!("Message bridge started");
                loop {
                    let command = match command_rx.recv() {
                        Ok(cmd) => cmd,
                        Err(_) => {
                            debug!("Bridge command channel closed");
                            break;
                        }
                    };

                    match command {
                        BridgeCommand::Publish(message) => worker.publish(&message),
                        BridgeCommand::PublishRaw(raw) => match Message::from_json(&raw) {
                            Ok(message) => worker.publish(&message),
                            Err(e) => worker.drop_message(e),
                        },
                        BridgeCommand::Subscribe(surface, handler) => {
                            debug!("Surface {:?} subscribed", surface);
                            worker.subscribers.push((surface, handler));
                        }
                        BridgeCommand::Shutdown => {
                            info!("Message bridge shutting down");
                            break;
                        }
                    }
                }
                let _ = worker.event_tx.send(BridgeEvent::Shutdown);
            })
            .map_err(|e| ColloquyError::IOError(format!("Failed to spawn bridge: {}", e)))?;

        Ok(BridgeHandle {
            command_tx,
            event_rx,
            dropped,
            worker_handle: Some(worker_handle),
        })
    }
}

struct Worker {
    subscribers: Vec<(Surface, Box<dyn SurfaceHandler>)>,
    aggregator: StreamAggregator,
    event_tx: Sender<BridgeEvent>,
    dropped: Arc<AtomicU64>,
}

impl Worker {
    fn publish(&mut self, message: &Message) {
        let route = match route(message) {
            Ok(route) => route,
            Err(e) => return self.drop_message(e),
        };

        match route {
            Route::Display { update, enqueue } => {
                self.deliver(&update);
                if let Some(request) = enqueue {
                    if self.event_tx.send(BridgeEvent::Enqueue(request)).is_err() {
                        error!("Bridge event channel closed");
                    }
                }
            }
            Route::Stream {
                id,
                channel,
                text,
                is_complete,
            } => match self.aggregator.on_chunk(&id, channel, &text, is_complete) {
                ChunkOutcome::Applied => {
                    if let Some(rendered) = self.aggregator.render(&id) {
                        let complete = rendered.complete;
                        self.deliver(&SurfaceUpdate::Stream(rendered));
                        if complete {
                            debug!("Stream {} complete, archiving", id);
                            self.aggregator.archive(&id);
                        }
                    }
                }
                outcome => debug!("Chunk for {} not applied: {:?}", id, outcome),
            },
        }
    }

    fn deliver(&mut self, update: &SurfaceUpdate) {
        let is_status = matches!(update, SurfaceUpdate::Status(_));
        for (_, handler) in self.subscribers.iter_mut() {
            if is_status && !handler.accepts_status() {
                continue;
            }
            handler.handle(update);
        }
    }

    fn drop_message(&mut self, error: BridgeError) {
        warn!("Dropping message: {}", error);
        self.dropped.fetch_add(1, Ordering::SeqCst);
        let _ = self.event_tx.send(BridgeEvent::Dropped(error));
    }
}
