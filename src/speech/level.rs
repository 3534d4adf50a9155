//! Audio level metering and silence-based end-of-utterance detection

use std::time::Duration;

/// Level reported for digital silence
pub const MIN_DB: f32 = -100.0;

/// RMS level of `samples` in dBFS, floored at `MIN_DB`
pub fn amplitude_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return MIN_DB;
    }

    let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
    let rms = (sum_squares / samples.len() as f32).sqrt();

    if rms <= 0.0 || rms.is_nan() {
        return MIN_DB;
    }

    (20.0 * rms.log10()).max(MIN_DB)
}

/// Duration of `len` samples at `sample_rate`
pub fn frame_duration(len: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(len as f64 / sample_rate as f64)
}

/// What a level update changed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelTransition {
    None,
    /// First frame above the threshold
    SpeechStarted,
    /// Enough trailing silence after speech
    UtteranceEnded,
}

/// Tracks speech/silence from per-frame levels
///
/// Silence before any speech never ends the utterance; that case is left to
/// the capture timeout.
#[derive(Clone, Debug)]
pub struct SilenceDetector {
    threshold_db: f32,
    silence_duration: Duration,
    speech_started: bool,
    trailing_silence: Duration,
    ended: bool,
}

impl SilenceDetector {
    pub fn new(threshold_db: f32, silence_duration: Duration) -> Self {
        Self {
            threshold_db,
            silence_duration,
            speech_started: false,
            trailing_silence: Duration::ZERO,
            ended: false,
        }
    }

    /// Feed one frame's level and duration
    pub fn update(&mut self, level_db: f32, frame: Duration) -> LevelTransition {
        if self.ended {
            return LevelTransition::None;
        }

        if level_db >= self.threshold_db {
            self.trailing_silence = Duration::ZERO;
            if !self.speech_started {
                self.speech_started = true;
                return LevelTransition::SpeechStarted;
            }
            return LevelTransition::None;
        }

        if self.speech_started {
            self.trailing_silence += frame;
            if self.trailing_silence >= self.silence_duration {
                self.ended = true;
                return LevelTransition::UtteranceEnded;
            }
        }
        LevelTransition::None
    }

    pub fn speech_started(&self) -> bool {
        self.speech_started
    }

    pub fn reset(&mut self) {
        self.speech_started = false;
        self.trailing_silence = Duration::ZERO;
        self.ended = false;
    }
}
