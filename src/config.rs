//! Configuration for the orchestrator and its speech backends
//!
//! The speech settings mirror the shape owned by the configuration editor
//! (`sttEngine`, `endpoint`, `captureTimeoutMs`, ...). They are read at every
//! `SpeechInput::start`, so edits take effect on the next listening session.

use crate::persona::{Language, Persona};
use crate::{ColloquyError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any poll-based adapter interval
pub const MAX_POLL_INTERVAL_MS: u64 = 500;

/// Lower bound for poll intervals, to avoid spinning
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Which speech-to-text backend to use
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    /// Platform recognizer running on the device
    #[default]
    OnDevice,
    /// Streaming transcription server reached over the network
    NetworkedServer,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::OnDevice => write!(f, "onDevice"),
            BackendKind::NetworkedServer => write!(f, "networkedServer"),
        }
    }
}

/// Speech input settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeechConfig {
    /// Backend selected at the next start
    pub stt_engine: BackendKind,

    /// Streaming transcription server URL (networked backend only)
    pub endpoint: String,

    /// Maximum length of one listening session
    pub capture_timeout_ms: u64,

    /// Level (dBFS) under which audio counts as silence
    pub silence_threshold_db: f32,

    /// Silence after speech that ends the utterance
    pub silence_duration_ms: u64,

    /// Pause between a hotword and the start of capture
    pub delay_after_hotword_ms: u64,

    /// Poll interval for callback/poll-only recognizers
    pub poll_interval_ms: u64,

    /// Recognition language tag
    pub language: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            stt_engine: BackendKind::OnDevice,
            endpoint: "ws://127.0.0.1:2700".to_string(),
            capture_timeout_ms: 8000,
            silence_threshold_db: -40.0,
            silence_duration_ms: 1200,
            delay_after_hotword_ms: 300,
            poll_interval_ms: 100,
            language: "en-US".to_string(),
        }
    }
}

impl SpeechConfig {
    /// Set the backend
    pub fn with_engine(mut self, engine: BackendKind) -> Self {
        self.stt_engine = engine;
        self
    }

    /// Set the networked endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the capture timeout
    pub fn with_capture_timeout_ms(mut self, ms: u64) -> Self {
        self.capture_timeout_ms = ms;
        self
    }

    /// Set the silence threshold and duration
    pub fn with_silence(mut self, threshold_db: f32, duration_ms: u64) -> Self {
        self.silence_threshold_db = threshold_db;
        self.silence_duration_ms = duration_ms;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Capture window as a `Duration`
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Silence window as a `Duration`
    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    /// Poll interval clamped to `[MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS]`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }

    /// Parse the JSON form written by the configuration editor
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ColloquyError::ConfigError(format!("Invalid speech config: {}", e)))
    }

    /// Serialize to the configuration editor's JSON form
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ColloquyError::ConfigError(format!("Failed to encode config: {}", e)))
    }

    /// Validate the speech settings
    pub fn validate(&self) -> Result<()> {
        if self.capture_timeout_ms == 0 {
            return Err(ColloquyError::ConfigError(
                "captureTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.silence_duration_ms == 0 {
            return Err(ColloquyError::ConfigError(
                "silenceDurationMs must be greater than zero".into(),
            ));
        }
        if self.stt_engine == BackendKind::NetworkedServer {
            let url = url::Url::parse(&self.endpoint).map_err(|e| {
                ColloquyError::ConfigError(format!("Invalid endpoint {:?}: {}", self.endpoint, e))
            })?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(ColloquyError::ConfigError(format!(
                    "Endpoint must use ws:// or wss://, got {}",
                    url.scheme()
                )));
            }
        }
        Ok(())
    }
}

/// Phase timeouts for the interaction state machine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Backstop for a listening session that never reports back
    pub recognition_timeout_ms: u64,

    /// Overall time allowed for one AI response
    pub response_timeout_ms: u64,

    /// Longest utterance before speaking is abandoned
    pub speaking_timeout_ms: u64,

    /// Wall-clock bound on a whole turn; dominates every other timeout
    pub safety_timeout_ms: u64,

    /// How long the Error phase is held before returning to Standby
    pub error_display_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            recognition_timeout_ms: 15_000,
            response_timeout_ms: 30_000,
            speaking_timeout_ms: 60_000,
            safety_timeout_ms: 90_000,
            error_display_ms: 1_500,
        }
    }
}

impl TimeoutConfig {
    pub fn recognition(&self) -> Duration {
        Duration::from_millis(self.recognition_timeout_ms)
    }

    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn speaking(&self) -> Duration {
        Duration::from_millis(self.speaking_timeout_ms)
    }

    pub fn safety(&self) -> Duration {
        Duration::from_millis(self.safety_timeout_ms)
    }

    pub fn error_display(&self) -> Duration {
        Duration::from_millis(self.error_display_ms)
    }

    /// Validate ordering between the timeouts
    pub fn validate(&self) -> Result<()> {
        let subs = [
            ("recognition_timeout_ms", self.recognition_timeout_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("speaking_timeout_ms", self.speaking_timeout_ms),
        ];
        for (name, value) in subs {
            if value == 0 {
                return Err(ColloquyError::ConfigError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
            if value > self.safety_timeout_ms {
                return Err(ColloquyError::ConfigError(format!(
                    "{} ({}ms) exceeds safety_timeout_ms ({}ms)",
                    name, value, self.safety_timeout_ms
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for the orchestrator
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Speech input settings
    pub speech: SpeechConfig,
    /// Phase timeouts
    pub timeouts: TimeoutConfig,
    /// Persona for fallback replies and voice selection
    pub persona: Persona,
    /// Language for fallback replies and voice selection
    pub language: Language,
    /// Re-enter Listening after speaking instead of returning to Standby
    pub continuous_listening: bool,
    /// Speak AI responses through TextToSpeech
    pub speak_responses: bool,
    /// System prompt handed to the AI processor
    pub system_prompt: String,
    /// Completed turns kept in the conversation context
    pub history_limit: usize,
    /// Channel buffer size
    pub channel_buffer_size: usize,
    /// Shutdown timeout in milliseconds
    pub shutdown_timeout_ms: u64,
    /// Orchestrator loop tick used to evaluate timeouts
    pub tick_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            speech: SpeechConfig::default(),
            timeouts: TimeoutConfig::default(),
            persona: Persona::default(),
            language: Language::default(),
            continuous_listening: false,
            speak_responses: true,
            system_prompt: "You are a helpful voice assistant. Keep answers short and conversational."
                .to_string(),
            history_limit: 20,
            channel_buffer_size: 100,
            shutdown_timeout_ms: 5000,
            tick_ms: 20,
        }
    }
}

impl OrchestratorConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ColloquyError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: OrchestratorConfig = toml::from_str(content)
            .map_err(|e| ColloquyError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the speech configuration
    pub fn with_speech(mut self, speech: SpeechConfig) -> Self {
        self.speech = speech;
        self
    }

    /// Set the timeouts
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set persona and language
    pub fn with_persona(mut self, persona: Persona, language: Language) -> Self {
        self.persona = persona;
        self.language = language;
        self
    }

    /// Enable or disable continuous listening
    pub fn with_continuous_listening(mut self, enabled: bool) -> Self {
        self.continuous_listening = enabled;
        self
    }

    /// Enable or disable spoken responses
    pub fn with_speak_responses(mut self, enabled: bool) -> Self {
        self.speak_responses = enabled;
        self
    }

    /// Set the channel buffer size
    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout_ms(mut self, timeout: u64) -> Self {
        self.shutdown_timeout_ms = timeout;
        self
    }

    /// Set the loop tick
    pub fn with_tick_ms(mut self, tick: u64) -> Self {
        self.tick_ms = tick;
        self
    }

    /// Loop tick as a `Duration` (at least 1ms)
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.speech.validate()?;
        self.timeouts.validate()?;
        if self.channel_buffer_size == 0 {
            return Err(ColloquyError::ConfigError(
                "channel_buffer_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// The external configuration editor's storage
pub trait ConfigStore: Send + Sync {
    /// Read the current configuration as JSON
    fn read_config(&self) -> Result<String>;

    /// Replace the stored configuration
    fn write_config(&self, json: &str) -> Result<()>;
}

/// In-memory `ConfigStore`, used by the demo binary and tests
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    json: Mutex<String>,
}

impl MemoryConfigStore {
    pub fn new(config: &SpeechConfig) -> Result<Self> {
        Ok(Self {
            json: Mutex::new(config.to_json()?),
        })
    }
}

impl ConfigStore for MemoryConfigStore {
    fn read_config(&self) -> Result<String> {
        Ok(self.json.lock().clone())
    }

    fn write_config(&self, json: &str) -> Result<()> {
        SpeechConfig::from_json(json)?;
        *self.json.lock() = json.to_string();
        Ok(())
    }
}

/// Speech settings shared between the settings surface and `SpeechInput`
#[derive(Clone, Debug, Default)]
pub struct SharedSpeechConfig {
    inner: Arc<RwLock<SpeechConfig>>,
}

impl SharedSpeechConfig {
    pub fn new(config: SpeechConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current settings
    pub fn get(&self) -> SpeechConfig {
        self.inner.read().clone()
    }

    /// Replace the settings; applies from the next listening session
    pub fn set(&self, config: SpeechConfig) {
        *self.inner.write() = config;
    }

    /// Reload from the configuration editor's store
    pub fn reload_from(&self, store: &dyn ConfigStore) -> Result<()> {
        let config = SpeechConfig::from_json(&store.read_config()?)?;
        config.validate()?;
        self.set(config);
        Ok(())
    }
}
