//! On-device recognizer backend
//!
//! Platform recognizers are poll-driven: results sit in the engine until they
//! are asked for. `OnDeviceBackend` polls the `Recognizer` from a session
//! thread at the configured interval (never above 500 ms) and reports
//! through the same sink as push-based backends.

use super::{BackendSink, SpeechBackend, SpeechEvent};
use crate::config::{BackendKind, SpeechConfig};
use crate::error::RecognitionError;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One update read from a recognizer
#[derive(Clone, Debug, PartialEq)]
pub enum RecognizerUpdate {
    SpeechStarted,
    /// Input level in dBFS, when the engine exposes it
    Level(f32),
    Partial(String),
    Final(String),
    /// Engine stopped listening without a result
    Finished,
    Failed(RecognitionError),
}

/// A poll-only speech recognizer
pub trait Recognizer: Send {
    /// Begin capturing in `language`
    fn begin(&mut self, language: &str) -> Result<(), RecognitionError>;

    /// Next pending update, if any
    fn poll(&mut self) -> Option<RecognizerUpdate>;

    /// Abort capture
    fn cancel(&mut self);
}

/// Recognizer fed from a channel of finished transcripts
///
/// Each received string is reported as speech followed by a final result.
/// Useful where an upstream callback already produced the text.
pub struct ChannelRecognizer {
    rx: Receiver<String>,
    pending: Vec<RecognizerUpdate>,
    listening: bool,
}

impl ChannelRecognizer {
    /// Returns the recognizer and the sender that feeds it
    pub fn new() -> (Self, Sender<String>) {
        let (tx, rx) = bounded(16);
        (
            Self {
                rx,
                pending: Vec::new(),
                listening: false,
            },
            tx,
        )
    }
}

impl Recognizer for ChannelRecognizer {
    fn begin(&mut self, _language: &str) -> Result<(), RecognitionError> {
        if self.listening {
            return Err(RecognitionError::Busy);
        }
        self.listening = true;
        self.pending.clear();
        Ok(())
    }

    fn poll(&mut self) -> Option<RecognizerUpdate> {
        if !self.listening {
            return None;
        }
        if self.pending.is_empty() {
            if let Ok(text) = self.rx.try_recv() {
                // Reversed: popped from the back
                self.pending.push(RecognizerUpdate::Final(text));
                self.pending.push(RecognizerUpdate::SpeechStarted);
            }
        }
        let update = self.pending.pop();
        if matches!(update, Some(RecognizerUpdate::Final(_))) {
            self.listening = false;
        }
        update
    }

    fn cancel(&mut self) {
        self.listening = false;
        self.pending.clear();
    }
}

struct Session {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// `SpeechBackend` over a poll-only `Recognizer`
pub struct OnDeviceBackend {
    recognizer: Arc<Mutex<Box<dyn Recognizer>>>,
    session: Option<Session>,
}

impl OnDeviceBackend {
    pub fn new(recognizer: Box<dyn Recognizer>) -> Self {
        Self {
            recognizer: Arc::new(Mutex::new(recognizer)),
            session: None,
        }
    }
}

impl SpeechBackend for OnDeviceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OnDevice
    }

    fn start(&mut self, config: &SpeechConfig, sink: BackendSink) -> Result<(), RecognitionError> {
        self.stop();

        self.recognizer.lock().begin(&config.language)?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let recognizer = self.recognizer.clone();
        let interval = config.poll_interval();
        let capture_timeout = config.capture_timeout();

        let thread = std::thread::Builder::new()
            .name("speech-ondevice".into())
            .spawn(move || {
                info!("On-device session {} polling every {:?}", sink.session(), interval);
                sink.emit(SpeechEvent::Ready);
                let deadline = Instant::now() + capture_timeout;

                loop {
                    select! {
                        recv(stop_rx) -> _ => {
                            debug!("On-device session {} stopped", sink.session());
                            recognizer.lock().cancel();
                            return;
                        }
                        default(interval) => {}
                    }

                    if drain(&recognizer, &sink) {
                        return;
                    }

                    if Instant::now() >= deadline {
                        warn!("On-device capture timed out");
                        recognizer.lock().cancel();
                        sink.end();
                        return;
                    }
                }
            })
            .map_err(|e| {
                error!("Failed to spawn recognizer thread: {}", e);
                self.recognizer.lock().cancel();
                RecognitionError::Busy
            })?;

        self.session = Some(Session { stop_tx, thread });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.stop_tx.try_send(());
            if session.thread.join().is_err() {
                error!("On-device session thread panicked");
            }
        }
    }
}

impl Drop for OnDeviceBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Forward every pending update; true once the session is over
fn drain(recognizer: &Arc<Mutex<Box<dyn Recognizer>>>, sink: &BackendSink) -> bool {
    loop {
        let update = recognizer.lock().poll();
        let Some(update) = update else {
            return false;
        };

        let (event, terminal) = match update {
            RecognizerUpdate::SpeechStarted => (SpeechEvent::SpeechStart, false),
            RecognizerUpdate::Level(db) => (SpeechEvent::Amplitude(db), false),
            RecognizerUpdate::Partial(text) => (SpeechEvent::PartialText(text), false),
            RecognizerUpdate::Final(text) => (SpeechEvent::FinalText(text), true),
            RecognizerUpdate::Failed(e) => (SpeechEvent::Error(e), true),
            RecognizerUpdate::Finished => {
                sink.end();
                return true;
            }
        };

        if !sink.emit(event) || terminal {
            if terminal {
                sink.end();
            }
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::{BackendSignal, SessionSignal};
    use crossbeam_channel::unbounded;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct Scripted {
        updates: VecDeque<RecognizerUpdate>,
        cancelled: Arc<Mutex<bool>>,
    }

    impl Recognizer for Scripted {
        fn begin(&mut self, _language: &str) -> Result<(), RecognitionError> {
            Ok(())
        }

        fn poll(&mut self) -> Option<RecognizerUpdate> {
            self.updates.pop_front()
        }

        fn cancel(&mut self) {
            *self.cancelled.lock() = true;
        }
    }

    fn config(poll_ms: u64, capture_ms: u64) -> SpeechConfig {
        SpeechConfig::default()
            .with_poll_interval_ms(poll_ms)
            .with_capture_timeout_ms(capture_ms)
    }

    fn collect(rx: &Receiver<SessionSignal>) -> Vec<BackendSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = rx.recv_timeout(Duration::from_secs(2)) {
            let done = signal.signal == BackendSignal::Ended;
            signals.push(signal.signal);
            if done {
                break;
            }
        }
        signals
    }

    #[test]
    fn test_polls_until_final() {
        let updates = VecDeque::from(vec![
            RecognizerUpdate::SpeechStarted,
            RecognizerUpdate::Partial("turn on".into()),
            RecognizerUpdate::Final("turn on the radio".into()),
        ]);
        let mut backend = OnDeviceBackend::new(Box::new(Scripted {
            updates,
            cancelled: Arc::new(Mutex::new(false)),
        }));
        let (tx, rx) = unbounded();
        backend.start(&config(10, 5000), BackendSink::new(1, tx)).unwrap();

        let signals = collect(&rx);
        assert_eq!(
            signals,
            vec![
                BackendSignal::Event(SpeechEvent::Ready),
                BackendSignal::Event(SpeechEvent::SpeechStart),
                BackendSignal::Event(SpeechEvent::PartialText("turn on".into())),
                BackendSignal::Event(SpeechEvent::FinalText("turn on the radio".into())),
                BackendSignal::Ended,
            ]
        );
        backend.stop();
    }

    #[test]
    fn test_capture_timeout_ends_session() {
        let cancelled = Arc::new(Mutex::new(false));
        let mut backend = OnDeviceBackend::new(Box::new(Scripted {
            updates: VecDeque::new(),
            cancelled: cancelled.clone(),
        }));
        let (tx, rx) = unbounded();
        backend.start(&config(10, 50), BackendSink::new(7, tx)).unwrap();

        let signals = collect(&rx);
        assert_eq!(
            signals,
            vec![BackendSignal::Event(SpeechEvent::Ready), BackendSignal::Ended]
        );
        assert!(*cancelled.lock());
        backend.stop();
    }

    #[test]
    fn test_stop_cancels_recognizer() {
        let cancelled = Arc::new(Mutex::new(false));
        let mut backend = OnDeviceBackend::new(Box::new(Scripted {
            updates: VecDeque::new(),
            cancelled: cancelled.clone(),
        }));
        let (tx, _rx) = unbounded();
        backend.start(&config(500, 60_000), BackendSink::new(1, tx)).unwrap();

        let started = Instant::now();
        backend.stop();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(*cancelled.lock());

        // Idempotent
        backend.stop();
    }

    #[test]
    fn test_channel_recognizer() {
        let (mut recognizer, tx) = ChannelRecognizer::new();
        assert_eq!(recognizer.poll(), None);

        recognizer.begin("en-US").unwrap();
        assert_eq!(recognizer.begin("en-US"), Err(RecognitionError::Busy));
        assert_eq!(recognizer.poll(), None);

        tx.send("hello there".into()).unwrap();
        assert_eq!(recognizer.poll(), Some(RecognizerUpdate::SpeechStarted));
        assert_eq!(
            recognizer.poll(),
            Some(RecognizerUpdate::Final("hello there".into()))
        );
        assert_eq!(recognizer.poll(), None);

        recognizer.begin("en-US").unwrap();
        recognizer.cancel();
        tx.send("ignored".into()).unwrap();
        assert_eq!(recognizer.poll(), None);
    }
}
