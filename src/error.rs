//! Error types for the Colloquy orchestrator
//!
//! Component failures are grouped into four families (recognition, dispatch,
//! spoken output, bridge). None of them crosses a component boundary as a
//! panic: each is recovered locally into a status message, a fallback reply,
//! or a dropped message.

use thiserror::Error;

/// Speech recognition failures reported by `SpeechInput`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    /// The listening session ended without a final transcript
    #[error("no speech was recognized")]
    NoMatch,

    /// The backend never became ready or the capture window elapsed
    #[error("speech recognition timed out")]
    Timeout,

    /// Transport failure on the networked backend (terminal for the session)
    #[error("network error: {0}")]
    Network(String),

    /// Microphone or recognizer permission denied
    #[error("microphone permission denied")]
    Permission,

    /// The recognizer is already in use
    #[error("recognizer busy")]
    Busy,
}

impl RecognitionError {
    /// Short machine-friendly kind name, used in status messages and logs
    pub fn kind(&self) -> &'static str {
        match self {
            RecognitionError::NoMatch => "no_match",
            RecognitionError::Timeout => "timeout",
            RecognitionError::Network(_) => "network",
            RecognitionError::Permission => "permission",
            RecognitionError::Busy => "busy",
        }
    }
}

/// AI request failures seen by `RequestDispatcher`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No processor is configured or it refused the request
    #[error("AI processor unavailable")]
    ProcessorUnavailable,

    /// The processor raised an error
    #[error("AI processor failed: {0}")]
    ProcessorThrew(String),

    /// The AI-response timeout elapsed
    #[error("AI response timed out")]
    Timeout,
}

/// Spoken output failures from `TextToSpeech`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpeechOutputError {
    /// No speech engine (or no voice) is available
    #[error("speech engine unavailable")]
    EngineUnavailable,

    /// The engine failed mid-utterance
    #[error("speech engine failed: {0}")]
    EngineThrew(String),
}

/// Message bridge failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A message was missing required fields or carried an unknown type
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// Colloquy errors
#[derive(Error, Debug, Clone)]
pub enum ColloquyError {
    #[error("Recognition error: {0}")]
    Recognition(#[from] RecognitionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Speech output error: {0}")]
    SpeechOutput(#[from] SpeechOutputError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// Channel communication error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// File system I/O error
    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for ColloquyError {
    fn from(e: std::io::Error) -> Self {
        ColloquyError::IOError(e.to_string())
    }
}

impl ColloquyError {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors end the current turn but leave the orchestrator
    /// running; the others usually need a restart or a settings change.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ColloquyError::Recognition(RecognitionError::Permission) => false,
            ColloquyError::Recognition(_) => true,
            ColloquyError::Dispatch(_) => true,
            ColloquyError::SpeechOutput(SpeechOutputError::EngineUnavailable) => false,
            ColloquyError::SpeechOutput(_) => true,
            ColloquyError::Bridge(_) => true,
            ColloquyError::ChannelError(_) => false,
            ColloquyError::ConfigError(_) => false,
            ColloquyError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description of the error
    ///
    /// Returns a message suitable for display on either surface.
    pub fn user_message(&self) -> String {
        match self {
            ColloquyError::Recognition(e) => recognition_status(e).to_string(),
            ColloquyError::Dispatch(_) => {
                "The assistant could not answer right now. Please try again.".to_string()
            }
            ColloquyError::SpeechOutput(SpeechOutputError::EngineUnavailable) => {
                "Voice output is unavailable. Responses will be shown as text.".to_string()
            }
            ColloquyError::SpeechOutput(_) => {
                "Voice output failed. The response is shown as text.".to_string()
            }
            ColloquyError::Bridge(_) => "A message could not be displayed.".to_string(),
            ColloquyError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            ColloquyError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            ColloquyError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

/// Status text shown on the surfaces for a recognition failure
pub fn recognition_status(error: &RecognitionError) -> &'static str {
    match error {
        RecognitionError::NoMatch => "I didn't catch that. Please try again.",
        RecognitionError::Timeout => "Listening timed out.",
        RecognitionError::Network(_) => "Speech service unreachable. Check your connection.",
        RecognitionError::Permission => "Microphone access is required for voice input.",
        RecognitionError::Busy => "The recognizer is busy. Please try again in a moment.",
    }
}

/// Result type alias for Colloquy operations
pub type Result<T> = std::result::Result<T, ColloquyError>;
