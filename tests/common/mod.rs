//! Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use colloquy::bridge::{ChannelSurface, Surface, SurfaceUpdate};
use colloquy::config::{BackendKind, OrchestratorConfig, SpeechConfig, TimeoutConfig};
use colloquy::dispatch::{AiOutput, AiProcessor, Chunk, ConversationContext};
use colloquy::error::{DispatchError, RecognitionError, SpeechOutputError};
use colloquy::messages::{MessageStorage, Turn};
use colloquy::speech::{
    BackendSink, CancelToken, SpeechBackend, SpeechEngine, SpeechEvent, VoiceInfo, VoiceSettings,
};
use colloquy::state::{Phase, VisualSink};
use colloquy::{Orchestrator, OrchestratorEvent, OrchestratorHandle};
use crossbeam_channel::{unbounded, Receiver};
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

/// What the scripted processor does for one input
#[derive(Clone, Debug)]
pub enum Reply {
    Text(String),
    Delayed(Duration, String),
    Stream(Vec<Chunk>),
    /// Thinking, then this many response chunks with no pause, then done
    Flood(usize),
    /// Thinking and one response chunk, then silence until cancelled
    Stall(String),
    Fail,
    /// Never completes
    Hang,
}

/// AI processor answering from a script; unknown inputs are echoed
#[derive(Default)]
pub struct ScriptedProcessor {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(self: &Arc<Self>, input: &str, reply: Reply) -> Arc<Self> {
        self.replies.lock().insert(input.to_string(), reply);
        self.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AiProcessor for ScriptedProcessor {
    fn process<'a>(
        &'a self,
        input: &'a str,
        _context: &'a ConversationContext,
    ) -> BoxFuture<'a, Result<AiOutput, DispatchError>> {
        self.calls.lock().push(input.to_string());
        let reply = self
            .replies
            .lock()
            .get(input)
            .cloned()
            .unwrap_or_else(|| Reply::Text(format!("echo: {}", input)));

        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let _guard = ActiveGuard(&self.active);

            match reply {
                Reply::Text(text) => Ok(AiOutput::Response(text)),
                Reply::Delayed(delay, text) => {
                    tokio::time::sleep(delay).await;
                    Ok(AiOutput::Response(text))
                }
                Reply::Stream(chunks) => {
                    let stream = futures::stream::iter(chunks.into_iter().map(Ok))
                        .then(|chunk| async move {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            chunk
                        })
                        .boxed();
                    Ok(AiOutput::Stream(stream))
                }
                Reply::Flood(count) => {
                    let chunks = std::iter::once(Chunk::thinking("counting"))
                        .chain((0..count).map(|i| Chunk::response(format!("{} ", i))))
                        .chain(std::iter::once(Chunk::response("").complete()))
                        .map(Ok)
                        .collect::<Vec<_>>();
                    Ok(AiOutput::Stream(futures::stream::iter(chunks).boxed()))
                }
                Reply::Stall(text) => {
                    let chunks = vec![Ok(Chunk::thinking("checking")), Ok(Chunk::response(text))];
                    Ok(AiOutput::Stream(
                        futures::stream::iter(chunks)
                            .chain(futures::stream::pending())
                            .boxed(),
                    ))
                }
                Reply::Fail => Err(DispatchError::ProcessorThrew("model crashed".into())),
                Reply::Hang => futures::future::pending().await,
            }
        })
    }
}

/// Test-side view of a `ManualBackend`
#[derive(Clone, Default)]
pub struct BackendControl {
    sink: Arc<Mutex<Option<BackendSink>>>,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    fail_start: Arc<Mutex<Option<RecognitionError>>>,
}

impl BackendControl {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Make the next starts fail
    pub fn fail_start(&self, error: RecognitionError) {
        *self.fail_start.lock() = Some(error);
    }

    /// Wait until the backend has been started `count` times
    pub fn wait_started(&self, count: usize) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.starts() >= count && self.is_listening() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    pub fn emit(&self, event: SpeechEvent) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    pub fn end(&self) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.end();
        }
    }
}

/// Speech backend driven by the test through its control
pub struct ManualBackend {
    kind: BackendKind,
    control: BackendControl,
}

impl ManualBackend {
    pub fn new(kind: BackendKind) -> (Self, BackendControl) {
        let control = BackendControl::default();
        (
            Self {
                kind,
                control: control.clone(),
            },
            control,
        )
    }
}

impl SpeechBackend for ManualBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn start(&mut self, _config: &SpeechConfig, sink: BackendSink) -> Result<(), RecognitionError> {
        if let Some(error) = self.control.fail_start.lock().clone() {
            return Err(error);
        }
        self.control.starts.fetch_add(1, Ordering::SeqCst);
        sink.emit(SpeechEvent::Ready);
        *self.control.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        if self.control.sink.lock().take().is_some() {
            self.control.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Speech engine that records what it was asked to say
pub struct MockEngine {
    spoken: Arc<Mutex<Vec<String>>>,
    duration: Duration,
    fail: bool,
}

impl MockEngine {
    pub fn new(duration: Duration) -> (Self, Arc<Mutex<Vec<String>>>) {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                spoken: spoken.clone(),
                duration,
                fail: false,
            },
            spoken,
        )
    }

    pub fn failing() -> (Self, Arc<Mutex<Vec<String>>>) {
        let (mut engine, spoken) = Self::new(Duration::ZERO);
        engine.fail = true;
        (engine, spoken)
    }
}

impl SpeechEngine for MockEngine {
    fn voices(&self) -> Vec<VoiceInfo> {
        vec![VoiceInfo::new("test", "Samantha", "en-US")]
    }

    fn speak(
        &mut self,
        text: &str,
        _settings: &VoiceSettings,
        cancel: &CancelToken,
    ) -> Result<(), SpeechOutputError> {
        self.spoken.lock().push(text.to_string());
        if self.fail {
            return Err(SpeechOutputError::EngineThrew("audio device lost".into()));
        }
        let started = Instant::now();
        while started.elapsed() < self.duration {
            if cancel.is_cancelled() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }
}

/// Records visual signals
#[derive(Clone, Default)]
pub struct RecordingVisual {
    pub phases: Arc<Mutex<Vec<Phase>>>,
    pub levels: Arc<Mutex<Vec<f32>>>,
}

impl VisualSink for RecordingVisual {
    fn phase_changed(&mut self, phase: Phase) {
        self.phases.lock().push(phase);
    }

    fn amplitude(&mut self, db: f32) {
        self.levels.lock().push(db);
    }
}

/// Short timeouts so failure paths finish quickly
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_timeouts(TimeoutConfig {
            recognition_timeout_ms: 2_000,
            response_timeout_ms: 2_000,
            speaking_timeout_ms: 2_000,
            safety_timeout_ms: 5_000,
            error_display_ms: 100,
        })
        .with_tick_ms(10)
        .with_shutdown_timeout_ms(3_000)
}

/// A running orchestrator plus handles on every scripted collaborator
pub struct Harness {
    pub handle: OrchestratorHandle,
    pub events: Receiver<OrchestratorEvent>,
    pub chat: Receiver<SurfaceUpdate>,
    pub voice: Receiver<SurfaceUpdate>,
    pub processor: Arc<ScriptedProcessor>,
    pub on_device: BackendControl,
    pub networked: BackendControl,
    pub spoken: Arc<Mutex<Vec<String>>>,
    pub history: Arc<MessageStorage>,
    pub visual: RecordingVisual,
}

impl Harness {
    pub fn start(config: OrchestratorConfig, processor: Arc<ScriptedProcessor>) -> Self {
        let (engine, spoken) = MockEngine::new(Duration::from_millis(30));
        Self::with_engine(config, processor, engine, spoken)
    }

    pub fn with_engine(
        config: OrchestratorConfig,
        processor: Arc<ScriptedProcessor>,
        engine: MockEngine,
        spoken: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self::build(config, processor, engine, spoken, |o| o)
    }

    pub fn build(
        config: OrchestratorConfig,
        processor: Arc<ScriptedProcessor>,
        engine: MockEngine,
        spoken: Arc<Mutex<Vec<String>>>,
        customize: impl FnOnce(Orchestrator) -> Orchestrator,
    ) -> Self {
        let (on_device, on_device_control) = ManualBackend::new(BackendKind::OnDevice);
        let (networked, networked_control) = ManualBackend::new(BackendKind::NetworkedServer);
        let (chat_tx, chat) = unbounded();
        let (voice_tx, voice) = unbounded();
        let history = Arc::new(MessageStorage::new());
        let visual = RecordingVisual::default();

        let orchestrator = Orchestrator::new(
            config,
            processor.clone(),
            Box::new(engine),
            Box::new(on_device),
            Box::new(networked),
        )
        .with_history(history.clone())
        .with_visual_sink(Box::new(visual.clone()))
        .with_surface(Surface::Chat, Box::new(ChannelSurface::new(chat_tx)))
        .with_surface(Surface::Voice, Box::new(ChannelSurface::new(voice_tx)));

        let handle = customize(orchestrator).start().expect("orchestrator starts");
        let events = handle.event_receiver();

        Self {
            handle,
            events,
            chat,
            voice,
            processor,
            on_device: on_device_control,
            networked: networked_control,
            spoken,
            history,
            visual,
        }
    }

    /// Consume events until the phase becomes `phase`
    pub fn wait_phase(&self, phase: Phase) {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(OrchestratorEvent::PhaseChanged { to, .. }) if to == phase => return,
                Ok(_) => continue,
                Err(_) => panic!(
                    "timed out waiting for {:?}; phase is {:?}",
                    phase,
                    self.handle.phase()
                ),
            }
        }
    }

    /// Consume events until a turn is recorded
    pub fn wait_turn(&self) -> Turn {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(OrchestratorEvent::TurnCompleted(turn)) => return turn,
                Ok(_) => continue,
                Err(_) => panic!("timed out waiting for a completed turn"),
            }
        }
    }

    pub fn shutdown(self) {
        self.handle.shutdown().expect("clean shutdown");
    }
}

/// Next update on `rx` matching `pred`, skipping others
pub fn next_matching(
    rx: &Receiver<SurfaceUpdate>,
    pred: impl Fn(&SurfaceUpdate) -> bool,
) -> SurfaceUpdate {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(update) if pred(&update) => return update,
            Ok(_) => continue,
            Err(_) => panic!("timed out waiting for surface update"),
        }
    }
}

/// Every AI text message a surface has shown so far, waiting for `count`
pub fn ai_messages(rx: &Receiver<SurfaceUpdate>, count: usize) -> Vec<String> {
    (0..count)
        .map(|_| match next_matching(rx, |u| matches!(u, SurfaceUpdate::AiMessage(_))) {
            SurfaceUpdate::AiMessage(text) => text,
            _ => unreachable!(),
        })
        .collect()
}
