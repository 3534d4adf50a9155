//! Routing policy: what the bridge does with each `(type, source)` pair

use crate::error::BridgeError;
use crate::messages::{Message, MessageId, MessageSource, MessageType, StreamChannel};
use crate::stream::RenderedMessage;

/// Prefix shown before user inputs that came from speech
pub const VOICE_PREFIX: &str = "🎤 ";

/// What a surface is asked to render
#[derive(Clone, Debug, PartialEq)]
pub enum SurfaceUpdate {
    /// A user turn, already tagged for display
    UserMessage { text: String, source: MessageSource },
    AiMessage(String),
    /// Informational; surfaces may filter these out
    Status(String),
    /// AI-attributed error bubble
    ErrorMessage(String),
    /// Latest render of a streamed answer
    Stream(RenderedMessage),
}

/// Input the bridge hands back for the dispatcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub text: String,
    pub source: MessageSource,
}

/// Decision for one message
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// Show on the surfaces, optionally queue for the AI
    Display {
        update: SurfaceUpdate,
        enqueue: Option<EnqueueRequest>,
    },
    /// Feed the stream aggregator
    Stream {
        id: MessageId,
        channel: StreamChannel,
        text: String,
        is_complete: bool,
    },
}

/// Apply the routing table to `message`
///
/// A missing source on a user input counts as typed input. Only the
/// `source` field decides whether an input is queued.
pub fn route(message: &Message) -> Result<Route, BridgeError> {
    match message.message_type {
        MessageType::UserInput => route_user_input(message),
        MessageType::AiResponse => Ok(Route::Display {
            update: SurfaceUpdate::AiMessage(non_empty(message)?.to_string()),
            enqueue: None,
        }),
        MessageType::SystemStatus => Ok(Route::Display {
            update: SurfaceUpdate::Status(non_empty(message)?.to_string()),
            enqueue: None,
        }),
        MessageType::Error => Ok(Route::Display {
            update: SurfaceUpdate::ErrorMessage(non_empty(message)?.to_string()),
            enqueue: None,
        }),
        streamed => {
            let channel = streamed.stream_channel().ok_or_else(|| {
                BridgeError::MalformedMessage(format!("{} has no stream channel", streamed))
            })?;
            let info = message.stream.as_ref().ok_or_else(|| {
                BridgeError::MalformedMessage(format!("{} without messageId", streamed))
            })?;
            let (text, is_complete) = if streamed.is_marker() {
                (String::new(), streamed.is_end())
            } else {
                (message.payload.clone(), info.is_complete)
            };
            Ok(Route::Stream {
                id: info.id.clone(),
                channel,
                text,
                is_complete,
            })
        }
    }
}

fn route_user_input(message: &Message) -> Result<Route, BridgeError> {
    let text = non_empty(message)?.trim().to_string();
    let source = message.source.unwrap_or(MessageSource::TypedInput);

    let route = match source {
        MessageSource::TypedInput => Route::Display {
            update: SurfaceUpdate::UserMessage {
                text: text.clone(),
                source,
            },
            enqueue: Some(EnqueueRequest { text, source }),
        },
        MessageSource::VoiceSurfaceSpeech => Route::Display {
            update: SurfaceUpdate::UserMessage {
                text: format!("{}{}", VOICE_PREFIX, text),
                source,
            },
            enqueue: Some(EnqueueRequest { text, source }),
        },
        // Already answered upstream
        MessageSource::Hotword | MessageSource::System => Route::Display {
            update: SurfaceUpdate::UserMessage { text, source },
            enqueue: None,
        },
    };
    Ok(route)
}

fn non_empty(message: &Message) -> Result<&str, BridgeError> {
    if message.payload.trim().is_empty() {
        return Err(BridgeError::MalformedMessage(format!(
            "{} with empty message",
            message.message_type
        )));
    }
    Ok(&message.payload)
}
