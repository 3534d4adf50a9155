//! Interaction orchestrator
//!
//! Owns the `InteractionState` and sequences speech input, the request
//! dispatcher, the message bridge and spoken output. Every component reports
//! into one `select!` loop on the orchestrator thread, which is the only
//! place the phase changes. A periodic tick evaluates the phase timeouts and
//! the per-turn safety timeout.

use crate::bridge::{
    BridgeCommand, BridgeEvent, BridgeHandle, ChannelSurface, MessageBridge, Surface,
    SurfaceHandler, SurfaceUpdate,
};
use crate::config::{OrchestratorConfig, SharedSpeechConfig};
use crate::dispatch::{
    AiProcessor, DispatchEvent, DispatcherConfig, DispatcherHandle, FallbackResponses,
    RequestDispatcher,
};
use crate::error::recognition_status;
use crate::messages::{HistoryStore, Message, MessageId, MessageSource, Turn};
use crate::speech::{
    SpeechBackend, SpeechEngine, SpeechEvent, SpeechInput, TextToSpeech, TtsConfig, TtsEvent,
    TtsHandle, UtteranceId,
};
use crate::state::{
    InteractionState, Phase, SharedInteractionState, TransitionContext, Trigger, VisualSink,
};
use crate::{ColloquyError, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Inputs that cancel instead of asking the AI
const STOP_WORDS: [&str; 7] = [
    "stop",
    "cancel",
    "never mind",
    "nevermind",
    "quiet",
    "be quiet",
    "stop talking",
];

/// Whether `text` is only a stop word
pub fn is_stop_word(text: &str) -> bool {
    let normalized = text
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    STOP_WORDS.contains(&normalized.as_str())
}

/// Commands accepted by the orchestrator
#[derive(Debug, Clone)]
pub enum OrchestratorCommand {
    /// Start listening now
    Activate,
    /// Start listening after the configured hotword delay
    ActivateAfterHotword,
    /// Typed input from the chat surface
    SendText(String),
    /// Cancel listening, speaking and the in-flight request
    Stop,
    Shutdown,
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    PhaseChanged { from: Phase, to: Phase },
    /// A turn finished with an answer and was recorded
    TurnCompleted(Turn),
    Shutdown,
}

/// Handle for a running orchestrator
pub struct OrchestratorHandle {
    command_tx: Sender<OrchestratorCommand>,
    event_rx: Receiver<OrchestratorEvent>,
    bridge_tx: Sender<BridgeCommand>,
    state: SharedInteractionState,
    speech_config: SharedSpeechConfig,
    shutdown_timeout: Duration,
    dropped_events: Arc<AtomicU64>,
    done_rx: Receiver<()>,
    worker_handle: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn send_command(&self, command: OrchestratorCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| ColloquyError::ChannelError(format!("Failed to send command: {}", e)))
    }

    /// User-initiated listening
    pub fn activate(&self) -> Result<()> {
        self.send_command(OrchestratorCommand::Activate)
    }

    /// Listening triggered by a hotword
    pub fn activate_after_hotword(&self) -> Result<()> {
        self.send_command(OrchestratorCommand::ActivateAfterHotword)
    }

    /// Typed input
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_command(OrchestratorCommand::SendText(text.into()))
    }

    pub fn stop(&self) -> Result<()> {
        self.send_command(OrchestratorCommand::Stop)
    }

    /// Publish a message from a surface onto the bridge
    pub fn publish(&self, message: Message) -> Result<()> {
        self.send_bridge(BridgeCommand::Publish(message))
    }

    /// Publish a raw JSON wire message onto the bridge
    pub fn publish_raw(&self, json: impl Into<String>) -> Result<()> {
        self.send_bridge(BridgeCommand::PublishRaw(json.into()))
    }

    pub fn subscribe(&self, surface: Surface, handler: Box<dyn SurfaceHandler>) -> Result<()> {
        self.send_bridge(BridgeCommand::Subscribe(surface, handler))
    }

    /// Subscribe `surface` and receive its updates on a channel
    pub fn subscribe_channel(&self, surface: Surface) -> Result<Receiver<SurfaceUpdate>> {
        let (tx, rx) = unbounded();
        self.subscribe(surface, Box::new(ChannelSurface::new(tx)))?;
        Ok(rx)
    }

    /// Sender for poll adapters and other bridge producers
    pub fn bridge_sender(&self) -> Sender<BridgeCommand> {
        self.bridge_tx.clone()
    }

    pub fn state(&self) -> SharedInteractionState {
        self.state.clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Live speech settings; edits apply at the next listening session
    pub fn speech_config(&self) -> SharedSpeechConfig {
        self.speech_config.clone()
    }

    pub fn event_receiver(&self) -> Receiver<OrchestratorEvent> {
        self.event_rx.clone()
    }

    pub fn try_recv_event(&self) -> Option<OrchestratorEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<OrchestratorEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Number of events discarded because the event channel was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::SeqCst)
    }

    /// Stop every component and wait up to the shutdown timeout
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.command_tx.send(OrchestratorCommand::Shutdown);

        match self.done_rx.recv_timeout(self.shutdown_timeout) {
            Ok(()) => {
                if let Some(handle) = self.worker_handle.take() {
                    handle.join().map_err(|_| {
                        ColloquyError::ChannelError("Orchestrator thread panicked".into())
                    })?;
                }
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Orchestrator did not confirm shutdown within {:?}",
                    self.shutdown_timeout
                );
                Err(ColloquyError::ChannelError("shutdown timed out".into()))
            }
        }
    }

    fn send_bridge(&self, command: BridgeCommand) -> Result<()> {
        self.bridge_tx
            .send(command)
            .map_err(|e| ColloquyError::ChannelError(format!("Failed to send bridge command: {}", e)))
    }
}

/// Assembles the components and starts the orchestrator thread
pub struct Orchestrator {
    config: OrchestratorConfig,
    processor: Arc<dyn AiProcessor>,
    speech_engine: Box<dyn SpeechEngine>,
    on_device: Box<dyn SpeechBackend>,
    networked: Box<dyn SpeechBackend>,
    speech_config: Option<SharedSpeechConfig>,
    fallbacks: FallbackResponses,
    history: Option<Arc<dyn HistoryStore>>,
    visual: Option<Box<dyn VisualSink>>,
    subscribers: Vec<(Surface, Box<dyn SurfaceHandler>)>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        processor: Arc<dyn AiProcessor>,
        speech_engine: Box<dyn SpeechEngine>,
        on_device: Box<dyn SpeechBackend>,
        networked: Box<dyn SpeechBackend>,
    ) -> Self {
        Self {
            config,
            processor,
            speech_engine,
            on_device,
            networked,
            speech_config: None,
            fallbacks: FallbackResponses::builtin(),
            history: None,
            visual: None,
            subscribers: Vec::new(),
        }
    }

    /// Share speech settings with a configuration editor
    pub fn with_speech_config(mut self, speech_config: SharedSpeechConfig) -> Self {
        self.speech_config = Some(speech_config);
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: FallbackResponses) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Record completed turns
    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_visual_sink(mut self, visual: Box<dyn VisualSink>) -> Self {
        self.visual = Some(visual);
        self
    }

    /// Subscribe a surface before anything is published
    pub fn with_surface(mut self, surface: Surface, handler: Box<dyn SurfaceHandler>) -> Self {
        self.subscribers.push((surface, handler));
        self
    }

    /// Start every component and the orchestrator loop
    pub fn start(self) -> Result<OrchestratorHandle> {
        self.config.validate()?;
        let config = self.config;

        let speech_config = self
            .speech_config
            .unwrap_or_else(|| SharedSpeechConfig::new(config.speech.clone()));

        let mut bridge = MessageBridge::new(config.channel_buffer_size);
        for (surface, handler) in self.subscribers {
            bridge = bridge.with_subscriber(surface, handler);
        }
        let bridge = bridge.start()?;

        let dispatcher = RequestDispatcher::new(
            DispatcherConfig {
                response_timeout: config.timeouts.response(),
                persona: config.persona,
                language: config.language,
                system_prompt: config.system_prompt.clone(),
                history_limit: config.history_limit,
                channel_buffer_size: config.channel_buffer_size,
            },
            self.processor,
        )
        .with_fallbacks(self.fallbacks)
        .start()?;

        let tts = TextToSpeech::new(
            TtsConfig::default().with_persona(config.persona, config.language),
            self.speech_engine,
        )
        .start()?;

        let speech = SpeechInput::new(speech_config.clone(), self.on_device, self.networked);

        let (command_tx, command_rx) = bounded::<OrchestratorCommand>(config.channel_buffer_size);
        let (event_tx, event_rx) = bounded::<OrchestratorEvent>(config.channel_buffer_size);
        let (done_tx, done_rx) = bounded::<()>(1);

        let initial = InteractionState::new(speech_config.get().stt_engine);
        let shared = SharedInteractionState::new(initial.clone());
        let bridge_tx = bridge.command_sender();
        let shutdown_timeout = Duration::from_millis(config.shutdown_timeout_ms);
        let dropped_events = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            state: initial,
            shared: shared.clone(),
            speech,
            speech_config: speech_config.clone(),
            dispatcher,
            tts,
            bridge,
            history: self.history,
            visual: self.visual,
            event_tx,
            dropped_events: dropped_events.clone(),
            phase_deadline: None,
            turn_deadline: None,
            pending_listen: None,
            speaking: None,
            started: HashMap::new(),
            config,
        };

        let worker_handle = std::thread::Builder::new()
            .name("orchestrator".into())
            .spawn(move || {
                worker.run(command_rx);
                let _ = done_tx.send(());
            })
            .map_err(|e| ColloquyError::IOError(format!("Failed to spawn orchestrator: {}", e)))?;

        Ok(OrchestratorHandle {
            command_tx,
            event_rx,
            bridge_tx,
            state: shared,
            speech_config,
            shutdown_timeout,
            dropped_events,
            done_rx,
            worker_handle: Some(worker_handle),
        })
    }
}

struct Worker {
    config: OrchestratorConfig,
    state: InteractionState,
    shared: SharedInteractionState,
    speech: SpeechInput,
    speech_config: SharedSpeechConfig,
    dispatcher: DispatcherHandle,
    tts: TtsHandle,
    bridge: BridgeHandle,
    history: Option<Arc<dyn HistoryStore>>,
    visual: Option<Box<dyn VisualSink>>,
    event_tx: Sender<OrchestratorEvent>,
    dropped_events: Arc<AtomicU64>,
    /// Timeout of the current phase
    phase_deadline: Option<Instant>,
    /// Safety bound of the current turn
    turn_deadline: Option<Instant>,
    /// Delayed activation after a hotword
    pending_listen: Option<Instant>,
    /// Utterance whose completion ends the Speaking phase
    speaking: Option<UtteranceId>,
    /// Dispatch start time per in-flight entry
    started: HashMap<MessageId, DateTime<Utc>>,
}

impl Worker {
    fn run(mut self, command_rx: Receiver<OrchestratorCommand>) {
        info!("Orchestrator started");
        let speech_rx = self.speech.signal_receiver();
        let bridge_rx = self.bridge.event_receiver();
        let dispatch_rx = self.dispatcher.event_receiver();
        let tts_rx = self.tts.event_receiver();
        let tick = self.config.tick();

        loop {
            select! {
                recv(command_rx) -> command => match command {
                    Ok(OrchestratorCommand::Shutdown) => {
                        info!("Orchestrator shutdown requested");
                        break;
                    }
                    Ok(command) => self.on_command(command),
                    Err(_) => {
                        warn!("Command channel disconnected");
                        break;
                    }
                },
                recv(speech_rx) -> signal => {
                    if let Ok(signal) = signal {
                        if let Some(event) = self.speech.handle(signal) {
                            self.on_speech(event);
                        }
                    }
                }
                recv(bridge_rx) -> event => match event {
                    Ok(event) => self.on_bridge(event),
                    Err(_) => {
                        error!("Bridge stopped unexpectedly");
                        break;
                    }
                },
                recv(dispatch_rx) -> event => match event {
                    Ok(event) => self.on_dispatch(event),
                    Err(_) => {
                        error!("Dispatcher stopped unexpectedly");
                        break;
                    }
                },
                recv(tts_rx) -> event => match event {
                    Ok(event) => self.on_tts(event),
                    Err(_) => {
                        error!("TTS worker stopped unexpectedly");
                        break;
                    }
                },
                default(tick) => {}
            }

            self.check_timers(Instant::now());
        }

        self.finish();
    }

    fn on_command(&mut self, command: OrchestratorCommand) {
        debug!("Command: {:?}", command);
        match command {
            OrchestratorCommand::Activate => {
                self.pending_listen = None;
                self.activate();
            }
            OrchestratorCommand::ActivateAfterHotword => {
                let delay = Duration::from_millis(self.speech_config.get().delay_after_hotword_ms);
                if delay.is_zero() {
                    self.activate();
                } else {
                    debug!("Listening in {:?}", delay);
                    self.pending_listen = Some(Instant::now() + delay);
                }
            }
            OrchestratorCommand::SendText(text) => {
                self.publish(Message::user_input(text, MessageSource::TypedInput));
            }
            OrchestratorCommand::Stop => self.stop_all("Stopped."),
            OrchestratorCommand::Shutdown => {}
        }
    }

    fn on_speech(&mut self, event: SpeechEvent) {
        match event {
            SpeechEvent::Ready => debug!("Speech backend ready"),
            SpeechEvent::SpeechStart => debug!("Speech detected"),
            SpeechEvent::Amplitude(db) => {
                if let Some(visual) = self.visual.as_mut() {
                    visual.amplitude(db);
                }
            }
            SpeechEvent::PartialText(text) => debug!("Partial: {:?}", text),
            SpeechEvent::FinalText(text) => {
                if self.state.phase != Phase::Listening {
                    debug!("Ignoring transcript while {}", self.state.phase);
                    return;
                }
                info!("Heard: {:?}", text);
                if is_stop_word(&text) {
                    self.stop_all("Stopped.");
                    return;
                }
                self.publish(Message::user_input(text, MessageSource::VoiceSurfaceSpeech));
                self.transition(Trigger::InputQueued);
            }
            SpeechEvent::Error(e) => {
                if self.state.phase != Phase::Listening {
                    return;
                }
                self.publish(Message::system_status(recognition_status(&e)));
                self.transition(Trigger::RecognitionFailed);
            }
        }
    }

    fn on_bridge(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Enqueue(request) => {
                if is_stop_word(&request.text) {
                    self.stop_all("Stopped.");
                    return;
                }
                match self.dispatcher.enqueue(&request.text, request.source) {
                    Ok(id) => {
                        debug!("Queued {} from {:?}", id, request.source);
                        if matches!(self.state.phase, Phase::Standby | Phase::Listening | Phase::Error) {
                            self.transition(Trigger::InputQueued);
                        }
                    }
                    Err(e) => {
                        error!("Failed to queue input: {}", e);
                        self.publish(Message::error(e.user_message()));
                    }
                }
            }
            BridgeEvent::Dropped(e) => debug!("Bridge dropped a message: {}", e),
            BridgeEvent::Shutdown => debug!("Bridge shut down"),
        }
    }

    fn on_dispatch(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Started(entry) => {
                self.started.insert(entry.id.clone(), Utc::now());
                if self.state.phase == Phase::Standby {
                    self.transition(Trigger::InputQueued);
                }
                if self.state.phase != Phase::Standby {
                    self.turn_deadline = Some(Instant::now() + self.config.timeouts.safety());
                }
                self.state.current_streaming_message_id = Some(entry.id);
                self.shared.store(&self.state);
            }
            DispatchEvent::Chunk { id, chunk } => {
                self.publish(Message::chunk(chunk.channel, id, chunk.text, chunk.is_complete));
            }
            DispatchEvent::Completed {
                entry,
                response,
                streamed,
                fallback,
            } => {
                if !streamed {
                    if response.trim().is_empty() {
                        self.publish(Message::error("The assistant returned an empty answer."));
                    } else {
                        self.publish(Message::ai_response(response.clone()));
                    }
                }

                let started_at = self.started.remove(&entry.id).unwrap_or(entry.enqueued_at);
                let turn_id = Uuid::parse_str(entry.id.as_str()).unwrap_or_else(|_| Uuid::new_v4());
                let turn = Turn::new(turn_id, entry.text, response.clone(), entry.origin, started_at)
                    .with_fallback(fallback);
                if let Some(history) = &self.history {
                    history.store(turn.clone());
                }
                self.emit(OrchestratorEvent::TurnCompleted(turn));

                self.answer_ready(&response);
            }
            DispatchEvent::Failed { entry, error } => {
                self.started.remove(&entry.id);
                let error = ColloquyError::from(error);
                warn!("No answer for {}: {}", entry.id, error);
                self.publish(Message::error(error.user_message()));
                if self.state.phase == Phase::Thinking {
                    self.transition(Trigger::DispatchFailed);
                }
            }
            DispatchEvent::Dropped { entry, reason } => {
                self.started.remove(&entry.id);
                info!("Request {} dropped: {:?}", entry.id, reason);
                if self.state.phase == Phase::Thinking && !self.work_pending() {
                    self.transition(Trigger::TurnFinished);
                }
            }
            DispatchEvent::Shutdown => debug!("Dispatcher shut down"),
        }
    }

    /// Speak (or just finish) a completed answer
    fn answer_ready(&mut self, response: &str) {
        let speak = self.config.speak_responses && !response.trim().is_empty();
        match self.state.phase {
            Phase::Thinking if speak => match self.tts.speak(response) {
                Ok(id) => {
                    self.speaking = Some(id);
                    self.transition(Trigger::ResponseReady);
                }
                Err(e) => {
                    error!("Failed to speak answer: {}", e);
                    self.transition(Trigger::TurnFinished);
                }
            },
            Phase::Thinking => self.transition(Trigger::TurnFinished),
            // A queued answer replaces the one being spoken
            Phase::Speaking if speak => match self.tts.speak(response) {
                Ok(id) => {
                    self.speaking = Some(id);
                    self.phase_deadline = Some(Instant::now() + self.config.timeouts.speaking());
                }
                Err(e) => error!("Failed to speak answer: {}", e),
            },
            phase => debug!("Answer shown without speaking while {}", phase),
        }
    }

    fn on_tts(&mut self, event: TtsEvent) {
        match event {
            TtsEvent::Started(id) => debug!("Speaking utterance {}", id),
            TtsEvent::Done(id) if self.speaking == Some(id) => {
                self.speaking = None;
                self.transition(Trigger::TurnFinished);
            }
            TtsEvent::Error { id, error } if self.speaking == Some(id) => {
                self.speaking = None;
                let error = ColloquyError::from(error);
                warn!("Spoken output failed: {}", error);
                self.publish(Message::system_status(error.user_message()));
                self.transition(Trigger::SpeechFailed);
            }
            TtsEvent::Shutdown => debug!("TTS shut down"),
            other => debug!("Ignoring stale TTS event {:?}", other),
        }
    }

    fn check_timers(&mut self, now: Instant) {
        if self.pending_listen.is_some_and(|at| now >= at) {
            self.pending_listen = None;
            self.activate();
        }

        if self.turn_deadline.is_some_and(|at| now >= at) {
            warn!("Safety timeout while {}; aborting turn", self.state.phase);
            self.turn_deadline = None;
            self.speech.stop();
            self.tts.cancel();
            self.speaking = None;
            if let Err(e) = self.dispatcher.cancel_in_flight() {
                error!("Failed to cancel in-flight request: {}", e);
            }
            self.publish(Message::error("That took too long, so I stopped."));
            self.transition(Trigger::Abort);
            return;
        }

        if !self.phase_deadline.is_some_and(|at| now >= at) {
            return;
        }
        self.phase_deadline = None;

        match self.state.phase {
            Phase::Listening => {
                warn!("Recognition timed out");
                self.speech.stop();
                self.publish(Message::system_status(recognition_status(
                    &crate::error::RecognitionError::Timeout,
                )));
                self.transition(Trigger::RecognitionFailed);
            }
            Phase::Speaking => {
                warn!("Speaking timed out");
                self.tts.cancel();
                self.speaking = None;
                self.transition(Trigger::TurnFinished);
            }
            Phase::Error => self.transition(Trigger::ErrorCleared),
            Phase::Standby | Phase::Thinking => {}
        }
    }

    fn activate(&mut self) {
        let ctx = self.context();
        if crate::state::next_phase(self.state.phase, Trigger::Activate, ctx).is_none() {
            debug!("Ignoring activation while {}", self.state.phase);
            return;
        }
        self.transition(Trigger::Activate);
    }

    /// Cancel everything and return to Standby
    fn stop_all(&mut self, status: &str) {
        info!("Stopping current interaction");
        self.pending_listen = None;
        self.speech.stop();
        self.tts.cancel();
        self.speaking = None;
        if let Err(e) = self
            .dispatcher
            .cancel_in_flight()
            .and_then(|_| self.dispatcher.clear_queue())
        {
            error!("Failed to cancel requests: {}", e);
        }
        self.transition(Trigger::Abort);
        self.publish(Message::system_status(status));
    }

    fn transition(&mut self, trigger: Trigger) {
        let from = self.state.phase;
        let ctx = self.context();
        let Some(to) = self.state.apply(trigger, ctx) else {
            debug!("{:?} ignored while {}", trigger, from);
            return;
        };
        info!("{} -> {} ({:?})", from, to, trigger);

        if from == Phase::Listening {
            self.speech.stop();
        }
        if from == Phase::Speaking {
            self.tts.cancel();
            self.speaking = None;
        }

        let now = Instant::now();
        let timeouts = &self.config.timeouts;
        self.phase_deadline = match to {
            Phase::Listening => Some(now + timeouts.recognition()),
            Phase::Speaking => Some(now + timeouts.speaking()),
            Phase::Error => Some(now + timeouts.error_display()),
            Phase::Standby | Phase::Thinking => None,
        };
        if to == Phase::Standby {
            self.turn_deadline = None;
        } else if from == Phase::Standby || to == Phase::Listening {
            self.turn_deadline = Some(now + timeouts.safety());
        }

        self.shared.store(&self.state);
        if let Some(visual) = self.visual.as_mut() {
            visual.phase_changed(to);
        }
        self.emit(OrchestratorEvent::PhaseChanged { from, to });

        if to == Phase::Listening {
            self.start_listening();
        }
    }

    fn start_listening(&mut self) {
        match self.speech.start() {
            Ok(kind) => {
                self.state.active_backend = kind;
                self.shared.store(&self.state);
                self.publish(Message::system_status("Listening..."));
            }
            Err(e) => {
                warn!("Could not start listening: {}", e);
                self.publish(Message::system_status(recognition_status(&e)));
                self.transition(Trigger::RecognitionFailed);
            }
        }
    }

    fn context(&self) -> TransitionContext {
        TransitionContext {
            continuous: self.config.continuous_listening,
            work_pending: self.work_pending(),
        }
    }

    fn work_pending(&self) -> bool {
        self.dispatcher.is_busy() || self.dispatcher.pending() > 0
    }

    fn publish(&self, message: Message) {
        if let Err(e) = self.bridge.publish(message) {
            error!("Failed to publish: {}", e);
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped_events.fetch_add(1, Ordering::SeqCst);
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Tear down every component
    fn finish(mut self) {
        self.pending_listen = None;
        self.speech.shutdown();
        self.tts.cancel();

        if let Err(e) = self.tts.shutdown() {
            warn!("TTS shutdown: {}", e);
        }
        if let Err(e) = self.dispatcher.shutdown() {
            warn!("Dispatcher shutdown: {}", e);
        }
        if let Err(e) = self.bridge.shutdown() {
            warn!("Bridge shutdown: {}", e);
        }

        let from = self.state.phase;
        self.state = InteractionState::new(self.state.active_backend);
        self.shared.store(&self.state);
        if from != Phase::Standby {
            if let Some(visual) = self.visual.as_mut() {
                visual.phase_changed(Phase::Standby);
            }
            let _ = self.event_tx.try_send(OrchestratorEvent::PhaseChanged {
                from,
                to: Phase::Standby,
            });
        }
        let _ = self.event_tx.try_send(OrchestratorEvent::Shutdown);
        info!("Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_words() {
        assert!(is_stop_word("stop"));
        assert!(is_stop_word("  Stop! "));
        assert!(is_stop_word("never   mind."));
        assert!(is_stop_word("Cancel"));
        assert!(!is_stop_word("stop the music in ten minutes"));
        assert!(!is_stop_word("bus stop"));
        assert!(!is_stop_word(""));
    }
}
