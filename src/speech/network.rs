//! Networked streaming transcription backend
//!
//! Audio frames are streamed to a transcription server over a WebSocket;
//! the server answers with interim (`partial`) and final (`text`)
//! transcripts. Levels are computed locally for metering and for the
//! silence-based end of utterance. Any transport failure ends the session
//! with `Error(Network)`; retrying is left to the caller.

use super::level::{amplitude_db, frame_duration, LevelTransition, SilenceDetector};
use super::{BackendSink, SpeechBackend, SpeechEvent};
use crate::config::{BackendKind, SpeechConfig};
use crate::error::RecognitionError;
use crossbeam_channel::{bounded, Receiver, Sender};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Longest wait for the connection to open
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time the server gets to deliver its final transcript after end of stream
const FINAL_GRACE: Duration = Duration::from_secs(2);

/// Interval at which the session loop checks for stop and new audio
const LOOP_POLL: Duration = Duration::from_millis(10);

/// A block of mono samples in `[-1.0, 1.0]`
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Microphone collaborator for the networked backend
pub trait AudioSource: Send + Sync {
    /// Start capture; frames arrive on the returned channel
    fn open(&self) -> Result<Receiver<AudioFrame>, RecognitionError>;

    /// Stop capture
    fn close(&self);
}

/// `AudioSource` fed by whoever holds the returned sender
pub struct ChannelAudioSource {
    rx: Receiver<AudioFrame>,
    open: AtomicBool,
}

impl ChannelAudioSource {
    pub fn new() -> (Self, Sender<AudioFrame>) {
        let (tx, rx) = bounded(256);
        (
            Self {
                rx,
                open: AtomicBool::new(false),
            },
            tx,
        )
    }
}

impl AudioSource for ChannelAudioSource {
    fn open(&self) -> Result<Receiver<AudioFrame>, RecognitionError> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(RecognitionError::Busy);
        }
        Ok(self.rx.clone())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Frames sent to the transcription server
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    /// Stream parameters; sent before the first audio frame
    Config { sample_rate: u32, language: String },
    Audio(Vec<f32>),
    EndOfStream,
}

/// Transcripts received from the transcription server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Partial(String),
    Final(String),
}

/// An open connection to a transcription server
pub struct TransportLink {
    pub outbound: mpsc::Sender<ClientFrame>,
    /// Closes when the server goes away
    pub inbound: mpsc::Receiver<Result<ServerEvent, RecognitionError>>,
}

/// Connects to a transcription server
pub trait TranscriptionTransport: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a str)
        -> BoxFuture<'a, Result<TransportLink, RecognitionError>>;
}

#[derive(Serialize)]
struct ConfigWire<'a> {
    config: ConfigBody<'a>,
}

#[derive(Serialize)]
struct ConfigBody<'a> {
    sample_rate: u32,
    language: &'a str,
}

#[derive(Deserialize)]
struct ServerWire {
    partial: Option<String>,
    text: Option<String>,
}

/// Parse one text frame from the server
///
/// `{"partial": ".."}` is interim, `{"text": ".."}` is final; anything else
/// is ignored.
pub fn parse_server_message(text: &str) -> Option<ServerEvent> {
    let wire: ServerWire = serde_json::from_str(text).ok()?;
    match (wire.text, wire.partial) {
        (Some(text), _) => Some(ServerEvent::Final(text)),
        (None, Some(partial)) if !partial.is_empty() => Some(ServerEvent::Partial(partial)),
        _ => None,
    }
}

/// Encode samples as 16-bit little-endian PCM
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// WebSocket transport
#[derive(Clone, Debug, Default)]
pub struct WebSocketTransport;

impl TranscriptionTransport for WebSocketTransport {
    fn connect<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> BoxFuture<'a, Result<TransportLink, RecognitionError>> {
        async move {
            use tokio_tungstenite::{connect_async, tungstenite::Message};

            let (ws_stream, _) = connect_async(endpoint)
                .await
                .map_err(|e| RecognitionError::Network(format!("connect: {}", e)))?;
            let (mut write, mut read) = ws_stream.split();

            let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(64);
            let (inbound_tx, inbound_rx) = mpsc::channel(64);

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = outbound_rx.recv() => {
                            let message = match frame {
                                Some(ClientFrame::Config { sample_rate, language }) => {
                                    let wire = ConfigWire {
                                        config: ConfigBody { sample_rate, language: &language },
                                    };
                                    match serde_json::to_string(&wire) {
                                        Ok(json) => Message::Text(json),
                                        Err(e) => {
                                            error!("Failed to encode stream config: {}", e);
                                            continue;
                                        }
                                    }
                                }
                                Some(ClientFrame::Audio(samples)) => Message::Binary(encode_pcm16(&samples)),
                                Some(ClientFrame::EndOfStream) => Message::Text(r#"{"eof":1}"#.to_string()),
                                None => {
                                    let _ = write.close().await;
                                    return;
                                }
                            };
                            if let Err(e) = write.send(message).await {
                                let _ = inbound_tx
                                    .send(Err(RecognitionError::Network(format!("send: {}", e))))
                                    .await;
                                return;
                            }
                        }
                        message = read.next() => {
                            match message {
                                Some(Ok(Message::Text(text))) => {
                                    if let Some(event) = parse_server_message(&text) {
                                        if inbound_tx.send(Ok(event)).await.is_err() {
                                            return;
                                        }
                                    } else {
                                        debug!("Ignoring server message: {}", text);
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => return,
                                Some(Err(e)) => {
                                    let _ = inbound_tx
                                        .send(Err(RecognitionError::Network(format!("read: {}", e))))
                                        .await;
                                    return;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }
            });

            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
        .boxed()
    }
}

/// Stop request shared between `stop()` and the session task
#[derive(Default)]
struct StopSignal {
    set: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn trigger(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        while !self.is_set() {
            self.notify.notified().await;
        }
    }

    /// Run `work` unless a stop arrives first
    async fn guard<T>(&self, work: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            out = work => Some(out),
            _ = self.wait() => None,
        }
    }
}

struct NetSession {
    stop: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

/// `SpeechBackend` streaming to a transcription server
pub struct NetworkedBackend {
    transport: Arc<dyn TranscriptionTransport>,
    audio: Arc<dyn AudioSource>,
    session: Option<NetSession>,
}

impl NetworkedBackend {
    pub fn new(transport: Arc<dyn TranscriptionTransport>, audio: Arc<dyn AudioSource>) -> Self {
        Self {
            transport,
            audio,
            session: None,
        }
    }

    /// WebSocket transport over the given microphone
    pub fn websocket(audio: Arc<dyn AudioSource>) -> Self {
        Self::new(Arc::new(WebSocketTransport), audio)
    }
}

impl SpeechBackend for NetworkedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NetworkedServer
    }

    fn start(&mut self, config: &SpeechConfig, sink: BackendSink) -> Result<(), RecognitionError> {
        self.stop();

        let endpoint = url::Url::parse(&config.endpoint)
            .map_err(|e| RecognitionError::Network(format!("invalid endpoint: {}", e)))?;

        let stop = Arc::new(StopSignal::default());
        let params = SessionParams {
            endpoint: endpoint.to_string(),
            language: config.language.clone(),
            capture_timeout: config.capture_timeout(),
            detector: SilenceDetector::new(config.silence_threshold_db, config.silence_duration()),
        };
        let transport = self.transport.clone();
        let audio = self.audio.clone();
        let stop_flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name("speech-network".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create tokio runtime: {}", e);
                        sink.emit(SpeechEvent::Error(RecognitionError::Network(e.to_string())));
                        return;
                    }
                };
                runtime.block_on(run_session(params, transport, audio, sink, stop_flag));
                // A stopped connect may leave a DNS lookup on the blocking pool
                runtime.shutdown_background();
            })
            .map_err(|e| RecognitionError::Network(format!("spawn: {}", e)))?;

        self.session = Some(NetSession { stop, thread });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop.trigger();
            if session.thread.join().is_err() {
                error!("Network session thread panicked");
            }
        }
    }
}

impl Drop for NetworkedBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SessionParams {
    endpoint: String,
    language: String,
    capture_timeout: Duration,
    detector: SilenceDetector,
}

/// How the session loop ended
enum Exit {
    /// Caller stopped the session; report nothing
    Stopped,
    /// Terminal event already reported
    Reported,
    /// Capture over; no transcript arrived
    Ended,
}

async fn run_session(
    mut params: SessionParams,
    transport: Arc<dyn TranscriptionTransport>,
    audio: Arc<dyn AudioSource>,
    sink: BackendSink,
    stop: Arc<StopSignal>,
) {
    info!("Connecting to transcription server {}", params.endpoint);

    let connect = tokio::time::timeout(CONNECT_TIMEOUT, transport.connect(&params.endpoint));
    let link = match stop.guard(connect).await {
        None => {
            debug!("Network session {} stopped while connecting", sink.session());
            return;
        }
        Some(Ok(Ok(link))) => link,
        Some(Ok(Err(e))) => {
            warn!("Transcription server unreachable: {}", e);
            sink.emit(SpeechEvent::Error(e));
            return;
        }
        Some(Err(_)) => {
            warn!("Transcription server connect timed out");
            sink.emit(SpeechEvent::Error(RecognitionError::Network(
                "connect timed out".into(),
            )));
            return;
        }
    };

    let frames = match audio.open() {
        Ok(frames) => frames,
        Err(e) => {
            sink.emit(SpeechEvent::Error(e));
            return;
        }
    };

    sink.emit(SpeechEvent::Ready);
    let exit = stream_audio(&mut params, link, &frames, &sink, &stop).await;
    audio.close();

    match exit {
        Exit::Ended => sink.end(),
        Exit::Reported => {}
        Exit::Stopped => debug!("Network session {} stopped", sink.session()),
    }
}

async fn stream_audio(
    params: &mut SessionParams,
    link: TransportLink,
    frames: &Receiver<AudioFrame>,
    sink: &BackendSink,
    stop: &StopSignal,
) -> Exit {
    let TransportLink {
        outbound,
        mut inbound,
    } = link;
    let capture_deadline = Instant::now() + params.capture_timeout;
    let mut finish_deadline: Option<Instant> = None;
    let mut config_sent = false;

    let network_error = |what: &str| {
        sink.emit(SpeechEvent::Error(RecognitionError::Network(what.to_string())));
        Exit::Reported
    };

    loop {
        if stop.is_set() {
            let _ = outbound.try_send(ClientFrame::EndOfStream);
            return Exit::Stopped;
        }

        if finish_deadline.is_none() {
            while let Ok(frame) = frames.try_recv() {
                if !config_sent {
                    let config = ClientFrame::Config {
                        sample_rate: frame.sample_rate,
                        language: params.language.clone(),
                    };
                    match stop.guard(outbound.send(config)).await {
                        None => return Exit::Stopped,
                        Some(Err(_)) => return network_error("connection closed"),
                        Some(Ok(())) => {}
                    }
                    config_sent = true;
                }

                let level = amplitude_db(&frame.samples);
                sink.emit(SpeechEvent::Amplitude(level));
                let duration = frame_duration(frame.samples.len(), frame.sample_rate);
                let transition = params.detector.update(level, duration);

                match stop.guard(outbound.send(ClientFrame::Audio(frame.samples))).await {
                    None => return Exit::Stopped,
                    Some(Err(_)) => return network_error("connection closed"),
                    Some(Ok(())) => {}
                }

                match transition {
                    LevelTransition::SpeechStarted => {
                        sink.emit(SpeechEvent::SpeechStart);
                    }
                    LevelTransition::UtteranceEnded => {
                        debug!("End of utterance detected");
                        finish_deadline = Some(Instant::now() + FINAL_GRACE);
                        break;
                    }
                    LevelTransition::None => {}
                }
            }

            if finish_deadline.is_none() && Instant::now() >= capture_deadline {
                warn!("Capture window elapsed");
                finish_deadline = Some(Instant::now() + FINAL_GRACE);
            }

            if finish_deadline.is_some() {
                match stop.guard(outbound.send(ClientFrame::EndOfStream)).await {
                    None => return Exit::Stopped,
                    Some(Err(_)) => return network_error("connection closed"),
                    Some(Ok(())) => {}
                }
            }
        }

        match tokio::time::timeout(LOOP_POLL, inbound.recv()).await {
            Ok(Some(Ok(ServerEvent::Partial(text)))) => {
                sink.emit(SpeechEvent::PartialText(text));
            }
            Ok(Some(Ok(ServerEvent::Final(text)))) => {
                sink.emit(SpeechEvent::FinalText(text));
                return Exit::Reported;
            }
            Ok(Some(Err(e))) => {
                sink.emit(SpeechEvent::Error(e));
                return Exit::Reported;
            }
            Ok(None) if finish_deadline.is_some() => return Exit::Ended,
            Ok(None) => return network_error("connection closed by server"),
            Err(_) => {}
        }

        if let Some(limit) = finish_deadline {
            if Instant::now() >= limit {
                return Exit::Ended;
            }
        }
    }
}
