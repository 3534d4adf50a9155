use anyhow::{Context, Result};
use colloquy::bridge::{Surface, SurfaceHandler, SurfaceUpdate};
use colloquy::config::OrchestratorConfig;
use colloquy::dispatch::{AiOutput, AiProcessor, Chunk, ConversationContext};
use colloquy::error::{DispatchError, SpeechOutputError};
use colloquy::messages::MessageStorage;
use colloquy::speech::{
    CancelToken, ChannelAudioSource, ChannelRecognizer, NetworkedBackend, OnDeviceBackend,
    SpeechEngine, VoiceInfo, VoiceSettings,
};
use colloquy::Orchestrator;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::io::BufRead;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Streams the input back with a short thinking preamble
struct EchoProcessor;

impl AiProcessor for EchoProcessor {
    fn process<'a>(
        &'a self,
        input: &'a str,
        context: &'a ConversationContext,
    ) -> BoxFuture<'a, std::result::Result<AiOutput, DispatchError>> {
        let mut chunks: Vec<std::result::Result<Chunk, DispatchError>> = vec![
            Ok(Chunk::thinking(format!(
                "Turn {} of this conversation.",
                context.turn_count() + 1
            ))
            .complete()),
            Ok(Chunk::response("You said: ")),
        ];
        for word in input.split_whitespace() {
            chunks.push(Ok(Chunk::response(format!("{} ", word))));
        }
        Box::pin(async move {
            let stream = futures::stream::iter(chunks)
                .then(|chunk| async move {
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    chunk
                })
                .boxed();
            Ok(AiOutput::Stream(stream))
        })
    }
}

/// Prints utterances instead of playing them
struct ConsoleVoice;

impl SpeechEngine for ConsoleVoice {
    fn voices(&self) -> Vec<VoiceInfo> {
        vec![VoiceInfo::new("console", "Console", "en-US")]
    }

    fn speak(
        &mut self,
        text: &str,
        _settings: &VoiceSettings,
        cancel: &CancelToken,
    ) -> std::result::Result<(), SpeechOutputError> {
        println!("  🔊 {}", text);
        let duration = Duration::from_millis(60 * text.split_whitespace().count() as u64);
        let started = Instant::now();
        while started.elapsed() < duration {
            if cancel.is_cancelled() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

/// Prints bridge updates to stdout
struct ConsoleSurface;

impl SurfaceHandler for ConsoleSurface {
    fn handle(&mut self, update: &SurfaceUpdate) {
        match update {
            SurfaceUpdate::UserMessage { text, .. } => println!("you> {}", text),
            SurfaceUpdate::AiMessage(text) => println!("ai> {}", text),
            SurfaceUpdate::Status(text) => println!("   [{}]", text),
            SurfaceUpdate::ErrorMessage(text) => println!("ai!> {}", text),
            SurfaceUpdate::Stream(rendered) if rendered.complete => {
                if let Some(thinking) = &rendered.thinking {
                    println!("   ({}: {})", thinking.status, thinking.text);
                }
                println!("ai> {}", rendered.response.trim_end());
            }
            SurfaceUpdate::Stream(_) => {}
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colloquy=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => OrchestratorConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => OrchestratorConfig::default(),
    };

    info!("Starting Colloquy demo");

    let (recognizer, heard) = ChannelRecognizer::new();
    let (audio, _frames) = ChannelAudioSource::new();
    let history = Arc::new(MessageStorage::new());

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(EchoProcessor),
        Box::new(ConsoleVoice),
        Box::new(OnDeviceBackend::new(Box::new(recognizer))),
        Box::new(NetworkedBackend::websocket(Arc::new(audio))),
    )
    .with_history(history.clone())
    .with_surface(Surface::Chat, Box::new(ConsoleSurface));

    let handle = orchestrator.start()?;

    println!("Type a message, or: /listen, /hotword, /say <words>, /stop, /quit");
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest)) {
            ("/quit", _) => break,
            ("/listen", _) => handle.activate()?,
            ("/hotword", _) => handle.activate_after_hotword()?,
            ("/stop", _) => handle.stop()?,
            ("/say", words) => heard.send(words.to_string())?,
            ("", _) => {}
            _ => handle.send_text(line)?,
        }
    }

    handle.shutdown()?;
    info!("{} turns recorded", history.len());
    Ok(())
}
