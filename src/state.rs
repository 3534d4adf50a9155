//! Interaction state and its transition rules
//!
//! `InteractionState` is owned by the orchestrator thread, the only place
//! that mutates it. Everything else reads it through `SharedInteractionState`.

use crate::config::BackendKind;
use crate::messages::MessageId;
use parking_lot::RwLock;
use std::sync::Arc;

/// Phase of the interaction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Standby,
    Listening,
    Thinking,
    Speaking,
    Error,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Standby,
        Phase::Listening,
        Phase::Thinking,
        Phase::Speaking,
        Phase::Error,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Standby => write!(f, "standby"),
            Phase::Listening => write!(f, "listening"),
            Phase::Thinking => write!(f, "thinking"),
            Phase::Speaking => write!(f, "speaking"),
            Phase::Error => write!(f, "error"),
        }
    }
}

/// What happened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// User asked to listen
    Activate,
    /// An input was handed to the dispatcher
    InputQueued,
    RecognitionFailed,
    /// An answer is ready to be spoken
    ResponseReady,
    /// The answer was shown (and spoken, if enabled)
    TurnFinished,
    /// The AI failed with no fallback to show
    DispatchFailed,
    SpeechFailed,
    /// The error display delay elapsed
    ErrorCleared,
    /// Stop request or safety timeout
    Abort,
}

/// Inputs to a transition besides the trigger
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// Re-enter listening after each answer
    pub continuous: bool,
    /// The dispatcher still has queued or in-flight requests
    pub work_pending: bool,
}

/// Next phase for `trigger` in `phase`, or `None` if it does not apply
pub fn next_phase(phase: Phase, trigger: Trigger, ctx: TransitionContext) -> Option<Phase> {
    use Phase::*;
    use Trigger::*;

    let after_turn = if ctx.work_pending {
        Thinking
    } else if ctx.continuous {
        Listening
    } else {
        Standby
    };

    match (phase, trigger) {
        (_, Abort) => Some(Standby),

        (Standby | Error | Speaking, Activate) => Some(Listening),

        (Standby | Listening | Error, InputQueued) => Some(Thinking),
        (Listening, RecognitionFailed) => Some(Error),

        (Thinking, ResponseReady) => Some(Speaking),
        (Thinking | Speaking, TurnFinished) => Some(after_turn),
        (Thinking, DispatchFailed) => Some(Error),

        // Spoken output failed: end the turn, do not loop back into listening
        (Speaking, SpeechFailed) => Some(if ctx.work_pending { Thinking } else { Standby }),

        (Error, ErrorCleared) => Some(if ctx.work_pending { Thinking } else { Standby }),

        _ => None,
    }
}

/// Process-wide interaction state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InteractionState {
    pub phase: Phase,
    pub active_backend: BackendKind,
    pub current_streaming_message_id: Option<MessageId>,
}

impl InteractionState {
    pub fn new(active_backend: BackendKind) -> Self {
        Self {
            active_backend,
            ..Self::default()
        }
    }

    /// Apply `trigger`; returns the new phase if it changed
    pub fn apply(&mut self, trigger: Trigger, ctx: TransitionContext) -> Option<Phase> {
        let next = next_phase(self.phase, trigger, ctx)?;
        if next == self.phase {
            return None;
        }
        self.phase = next;
        if matches!(next, Phase::Standby | Phase::Listening) {
            self.current_streaming_message_id = None;
        }
        Some(next)
    }
}

/// Read-only view of the interaction state
#[derive(Clone, Debug, Default)]
pub struct SharedInteractionState {
    inner: Arc<RwLock<InteractionState>>,
}

impl SharedInteractionState {
    pub fn new(state: InteractionState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn snapshot(&self) -> InteractionState {
        self.inner.read().clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.read().phase
    }

    pub(crate) fn store(&self, state: &InteractionState) {
        *self.inner.write() = state.clone();
    }
}

/// Consumer of the visual signals (LEDs, level meters)
pub trait VisualSink: Send {
    fn phase_changed(&mut self, phase: Phase);

    /// Input level in dBFS while listening
    fn amplitude(&mut self, db: f32);
}
