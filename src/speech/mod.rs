//! Speech input and output
//!
//! `SpeechInput` puts the on-device recognizer and the networked
//! transcription server behind one session contract. Backends report raw
//! signals tagged with a session number; `SpeechInput::handle` turns them
//! into at most one terminal event per session and drops anything from a
//! session that is no longer active.
//!
//! `TextToSpeech` is the single-flight spoken output sink.

pub mod level;
pub mod network;
pub mod ondevice;
pub mod tts;

pub use level::{amplitude_db, LevelTransition, SilenceDetector};
pub use network::{
    AudioFrame, AudioSource, ChannelAudioSource, NetworkedBackend, ServerEvent,
    TranscriptionTransport, TransportLink, WebSocketTransport,
};
pub use ondevice::{ChannelRecognizer, OnDeviceBackend, Recognizer, RecognizerUpdate};
pub use tts::{
    normalize_text_for_tts, CancelToken, SpeechEngine, TextToSpeech, TtsCommand, TtsConfig,
    TtsEvent, TtsHandle, UtteranceId, VoiceInfo, VoiceSelector, VoiceSettings, VoiceTable,
};

use crate::config::{BackendKind, SharedSpeechConfig, SpeechConfig};
use crate::error::RecognitionError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

/// Events of one listening session
#[derive(Clone, Debug, PartialEq)]
pub enum SpeechEvent {
    /// Backend is capturing
    Ready,
    /// Voice activity detected
    SpeechStart,
    /// Input level in dBFS
    Amplitude(f32),
    /// Interim transcript
    PartialText(String),
    /// Final transcript; ends the session
    FinalText(String),
    /// Failure; ends the session
    Error(RecognitionError),
}

impl SpeechEvent {
    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, SpeechEvent::FinalText(_) | SpeechEvent::Error(_))
    }
}

/// What a backend reports for its session
#[derive(Clone, Debug, PartialEq)]
pub enum BackendSignal {
    Event(SpeechEvent),
    /// The backend finished capturing, with or without a transcript
    Ended,
}

/// A backend signal tagged with its session number
#[derive(Clone, Debug)]
pub struct SessionSignal {
    pub session: u64,
    pub signal: BackendSignal,
}

/// Where a backend sends the signals of one session
#[derive(Clone, Debug)]
pub struct BackendSink {
    session: u64,
    tx: Sender<SessionSignal>,
}

impl BackendSink {
    pub fn new(session: u64, tx: Sender<SessionSignal>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Report an event; false once nobody is listening
    pub fn emit(&self, event: SpeechEvent) -> bool {
        self.send(BackendSignal::Event(event))
    }

    /// Report the end of capture
    pub fn end(&self) {
        self.send(BackendSignal::Ended);
    }

    fn send(&self, signal: BackendSignal) -> bool {
        self.tx
            .send(SessionSignal {
                session: self.session,
                signal,
            })
            .is_ok()
    }
}

/// A speech-to-text engine usable by `SpeechInput`
///
/// `start` must return promptly and deliver events from its own thread.
/// `stop` must be idempotent and must not emit further events.
pub trait SpeechBackend: Send {
    fn kind(&self) -> BackendKind;

    fn start(&mut self, config: &SpeechConfig, sink: BackendSink) -> Result<(), RecognitionError>;

    fn stop(&mut self);
}

#[derive(Clone, Copy, Debug)]
struct ActiveSession {
    session: u64,
    kind: BackendKind,
}

/// One recognition capability over two interchangeable backends
pub struct SpeechInput {
    config: SharedSpeechConfig,
    on_device: Box<dyn SpeechBackend>,
    networked: Box<dyn SpeechBackend>,
    signal_tx: Sender<SessionSignal>,
    signal_rx: Receiver<SessionSignal>,
    next_session: u64,
    active: Option<ActiveSession>,
}

impl SpeechInput {
    pub fn new(
        config: SharedSpeechConfig,
        on_device: Box<dyn SpeechBackend>,
        networked: Box<dyn SpeechBackend>,
    ) -> Self {
        // Unbounded so a backend thread never blocks on the consumer while
        // the consumer is joining it
        let (signal_tx, signal_rx) = unbounded();
        Self {
            config,
            on_device,
            networked,
            signal_tx,
            signal_rx,
            next_session: 0,
            active: None,
        }
    }

    /// Raw backend signals; feed each one to `handle`
    pub fn signal_receiver(&self) -> Receiver<SessionSignal> {
        self.signal_rx.clone()
    }

    /// Backend of the current session
    pub fn active_backend(&self) -> Option<BackendKind> {
        self.active.map(|a| a.kind)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Start a session on the configured backend
    ///
    /// Settings are read now, so edits apply from the next start. Fails with
    /// `Busy` while a session is active; switching backends needs `stop`
    /// first.
    pub fn start(&mut self) -> Result<BackendKind, RecognitionError> {
        if self.active.is_some() {
            return Err(RecognitionError::Busy);
        }

        let config = self.config.get();
        let kind = config.stt_engine;
        self.next_session += 1;
        let session = self.next_session;
        let sink = BackendSink::new(session, self.signal_tx.clone());

        info!("Starting {} speech session {}", kind, session);
        self.backend_mut(kind).start(&config, sink)?;
        self.active = Some(ActiveSession { session, kind });
        Ok(kind)
    }

    /// End the current session without a terminal event
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            debug!("Stopping speech session {}", active.session);
            self.backend_mut(active.kind).stop();
        }
    }

    /// Filter one backend signal into a session event
    ///
    /// Signals from stale sessions are dropped. The first `FinalText` or
    /// `Error` closes the session; a session that ends without either
    /// yields `Error(NoMatch)`.
    pub fn handle(&mut self, signal: SessionSignal) -> Option<SpeechEvent> {
        let active = match self.active {
            Some(active) if active.session == signal.session => active,
            _ => {
                debug!("Dropping signal from stale session {}", signal.session);
                return None;
            }
        };

        let event = match signal.signal {
            BackendSignal::Event(SpeechEvent::FinalText(text)) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    SpeechEvent::Error(RecognitionError::NoMatch)
                } else {
                    SpeechEvent::FinalText(text)
                }
            }
            BackendSignal::Event(SpeechEvent::Error(e)) => {
                warn!("Speech session {} failed: {}", active.session, e);
                SpeechEvent::Error(e)
            }
            BackendSignal::Event(event) => return Some(event),
            BackendSignal::Ended => {
                debug!("Speech session {} ended without transcript", active.session);
                SpeechEvent::Error(RecognitionError::NoMatch)
            }
        };

        self.active = None;
        self.backend_mut(active.kind).stop();
        Some(event)
    }

    /// Stop both backends
    pub fn shutdown(&mut self) {
        self.active = None;
        self.on_device.stop();
        self.networked.stop();
    }

    fn backend_mut(&mut self, kind: BackendKind) -> &mut dyn SpeechBackend {
        match kind {
            BackendKind::OnDevice => self.on_device.as_mut(),
            BackendKind::NetworkedServer => self.networked.as_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Backend that hands its sink to the test
    struct Manual {
        kind: BackendKind,
        sinks: Arc<Mutex<Vec<BackendSink>>>,
        stops: Arc<Mutex<usize>>,
        fail_with: Option<RecognitionError>,
    }

    impl SpeechBackend for Manual {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn start(&mut self, _config: &SpeechConfig, sink: BackendSink) -> Result<(), RecognitionError> {
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            self.sinks.lock().push(sink);
            Ok(())
        }

        fn stop(&mut self) {
            *self.stops.lock() += 1;
        }
    }

    struct Rig {
        input: SpeechInput,
        config: SharedSpeechConfig,
        on_device: Arc<Mutex<Vec<BackendSink>>>,
        networked: Arc<Mutex<Vec<BackendSink>>>,
    }

    fn rig() -> Rig {
        let config = SharedSpeechConfig::new(SpeechConfig::default());
        let on_device = Arc::new(Mutex::new(Vec::new()));
        let networked = Arc::new(Mutex::new(Vec::new()));
        let input = SpeechInput::new(
            config.clone(),
            Box::new(Manual {
                kind: BackendKind::OnDevice,
                sinks: on_device.clone(),
                stops: Arc::new(Mutex::new(0)),
                fail_with: None,
            }),
            Box::new(Manual {
                kind: BackendKind::NetworkedServer,
                sinks: networked.clone(),
                stops: Arc::new(Mutex::new(0)),
                fail_with: None,
            }),
        );
        Rig {
            input,
            config,
            on_device,
            networked,
        }
    }

    fn next(input: &mut SpeechInput) -> Option<SpeechEvent> {
        let signal = input.signal_receiver().try_recv().ok()?;
        input.handle(signal)
    }

    #[test]
    fn test_final_text_delivered_once() {
        let mut rig = rig();
        rig.input.start().unwrap();
        let sink = rig.on_device.lock()[0].clone();

        sink.emit(SpeechEvent::Ready);
        sink.emit(SpeechEvent::FinalText("turn on the radio".into()));
        sink.emit(SpeechEvent::FinalText("again".into()));
        sink.end();

        assert_eq!(next(&mut rig.input), Some(SpeechEvent::Ready));
        assert_eq!(
            next(&mut rig.input),
            Some(SpeechEvent::FinalText("turn on the radio".into()))
        );
        assert!(!rig.input.is_active());
        assert_eq!(next(&mut rig.input), None);
        assert_eq!(next(&mut rig.input), None);
    }

    #[test]
    fn test_end_without_transcript_is_no_match() {
        let mut rig = rig();
        rig.input.start().unwrap();
        let sink = rig.on_device.lock()[0].clone();
        sink.emit(SpeechEvent::Ready);
        sink.end();

        assert_eq!(next(&mut rig.input), Some(SpeechEvent::Ready));
        assert_eq!(
            next(&mut rig.input),
            Some(SpeechEvent::Error(RecognitionError::NoMatch))
        );
    }

    #[test]
    fn test_blank_final_is_no_match() {
        let mut rig = rig();
        rig.input.start().unwrap();
        let sink = rig.on_device.lock()[0].clone();
        sink.emit(SpeechEvent::FinalText("   ".into()));
        assert_eq!(
            next(&mut rig.input),
            Some(SpeechEvent::Error(RecognitionError::NoMatch))
        );
    }

    #[test]
    fn test_start_while_active_is_busy() {
        let mut rig = rig();
        rig.input.start().unwrap();
        assert_eq!(rig.input.start(), Err(RecognitionError::Busy));
    }

    #[test]
    fn test_switching_backend_applies_on_next_start() {
        let mut rig = rig();
        assert_eq!(rig.input.start().unwrap(), BackendKind::OnDevice);

        rig.config
            .set(SpeechConfig::default().with_engine(BackendKind::NetworkedServer));
        assert_eq!(rig.input.active_backend(), Some(BackendKind::OnDevice));

        rig.input.stop();
        assert_eq!(rig.input.start().unwrap(), BackendKind::NetworkedServer);
        assert_eq!(rig.networked.lock().len(), 1);
    }

    #[test]
    fn test_stale_session_signals_are_dropped() {
        let mut rig = rig();
        rig.input.start().unwrap();
        let old = rig.on_device.lock()[0].clone();
        rig.input.stop();
        rig.input.start().unwrap();

        old.emit(SpeechEvent::FinalText("late".into()));
        assert_eq!(next(&mut rig.input), None);
        assert!(rig.input.is_active());
    }

    #[test]
    fn test_network_error_closes_session() {
        let mut rig = rig();
        rig.config
            .set(SpeechConfig::default().with_engine(BackendKind::NetworkedServer));
        rig.input.start().unwrap();
        let sink = rig.networked.lock()[0].clone();
        sink.emit(SpeechEvent::Amplitude(-30.0));
        sink.emit(SpeechEvent::Error(RecognitionError::Network("reset".into())));

        assert_eq!(next(&mut rig.input), Some(SpeechEvent::Amplitude(-30.0)));
        assert_eq!(
            next(&mut rig.input),
            Some(SpeechEvent::Error(RecognitionError::Network("reset".into())))
        );
        assert!(!rig.input.is_active());
    }

    #[test]
    fn test_backend_start_failure_leaves_idle() {
        let config = SharedSpeechConfig::new(SpeechConfig::default());
        let mut input = SpeechInput::new(
            config,
            Box::new(Manual {
                kind: BackendKind::OnDevice,
                sinks: Arc::new(Mutex::new(Vec::new())),
                stops: Arc::new(Mutex::new(0)),
                fail_with: Some(RecognitionError::Permission),
            }),
            Box::new(Manual {
                kind: BackendKind::NetworkedServer,
                sinks: Arc::new(Mutex::new(Vec::new())),
                stops: Arc::new(Mutex::new(0)),
                fail_with: None,
            }),
        );
        assert_eq!(input.start(), Err(RecognitionError::Permission));
        assert!(!input.is_active());
    }
}
