//! Single-flight spoken output
//!
//! `TextToSpeech` runs the speech engine on a worker thread. Each `speak`
//! supersedes whatever is playing or waiting: the previous utterance is
//! cancelled through its `CancelToken` and reported as `Cancelled`, never
//! queued behind the new one.

use crate::error::SpeechOutputError;
use crate::persona::{Language, Persona};
use crate::{ColloquyError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Identifier of one `speak` request
pub type UtteranceId = u64;

/// A voice offered by the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    /// BCP-47 language tag, e.g. `en-GB`
    pub language: String,
}

impl VoiceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            language: language.into(),
        }
    }
}

/// How a persona wants to sound
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceSelector {
    /// Preferred voice name fragments, best first (case-insensitive)
    pub keywords: Vec<String>,
    pub rate: f32,
    pub pitch: f32,
}

impl VoiceSelector {
    pub fn new(keywords: &[&str], rate: f32, pitch: f32) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            rate,
            pitch,
        }
    }
}

/// Resolved output settings for one persona
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceSettings {
    /// `None` lets the engine use its default voice
    pub voice: Option<VoiceInfo>,
    pub rate: f32,
    pub pitch: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 1.0,
            pitch: 1.0,
        }
    }
}

/// Persona to voice lookup, resolved once from the engine's voice list
#[derive(Clone, Debug, Default)]
pub struct VoiceTable {
    settings: HashMap<Persona, VoiceSettings>,
}

impl VoiceTable {
    /// Built-in selectors for every persona
    pub fn default_selectors() -> HashMap<Persona, VoiceSelector> {
        HashMap::from([
            (Persona::Neutral, VoiceSelector::new(&["samantha", "google", "female"], 1.0, 1.0)),
            (Persona::Friendly, VoiceSelector::new(&["karen", "moira", "female"], 1.05, 1.1)),
            (Persona::Butler, VoiceSelector::new(&["daniel", "arthur", "male"], 0.95, 0.9)),
            (Persona::Robot, VoiceSelector::new(&["fred", "zarvox", "robot"], 0.9, 0.7)),
        ])
    }

    /// Pick a voice per persona
    ///
    /// Candidates are the voices for `language` (all voices if none match);
    /// the first keyword hit wins, else the first candidate.
    pub fn resolve(
        selectors: &HashMap<Persona, VoiceSelector>,
        voices: &[VoiceInfo],
        language: Language,
    ) -> Self {
        let in_language: Vec<&VoiceInfo> = voices
            .iter()
            .filter(|v| Language::from_tag(&v.language) == Some(language))
            .collect();
        let candidates: Vec<&VoiceInfo> = if in_language.is_empty() {
            voices.iter().collect()
        } else {
            in_language
        };

        let settings = selectors
            .iter()
            .map(|(persona, selector)| {
                let voice = selector
                    .keywords
                    .iter()
                    .find_map(|keyword| {
                        candidates
                            .iter()
                            .find(|v| v.name.to_lowercase().contains(keyword.as_str()))
                    })
                    .or_else(|| candidates.first())
                    .map(|v| (*v).clone());
                (
                    *persona,
                    VoiceSettings {
                        voice,
                        rate: selector.rate,
                        pitch: selector.pitch,
                    },
                )
            })
            .collect();

        Self { settings }
    }

    /// Settings for `persona`, or engine defaults if it has no entry
    pub fn settings(&self, persona: Persona) -> VoiceSettings {
        self.settings.get(&persona).cloned().unwrap_or_default()
    }
}

/// Cancellation signal handed to the engine for one utterance
#[derive(Clone, Debug)]
pub struct CancelToken {
    id: UtteranceId,
    latest: Arc<AtomicU64>,
}

impl CancelToken {
    /// True once a newer `speak` or a `cancel` was issued
    pub fn is_cancelled(&self) -> bool {
        self.latest.load(Ordering::SeqCst) != self.id
    }

    pub fn id(&self) -> UtteranceId {
        self.id
    }
}

/// The platform speech engine
pub trait SpeechEngine: Send {
    /// Voices available right now
    fn voices(&self) -> Vec<VoiceInfo>;

    /// Speak `text`, returning when playback ends
    ///
    /// Must return promptly once `cancel.is_cancelled()`.
    fn speak(
        &mut self,
        text: &str,
        settings: &VoiceSettings,
        cancel: &CancelToken,
    ) -> std::result::Result<(), SpeechOutputError>;
}

/// Configuration for the TTS worker
#[derive(Clone, Debug)]
pub struct TtsConfig {
    pub persona: Persona,
    pub language: Language,
    /// Rewrite text for speech before it reaches the engine
    pub normalize: bool,
    pub selectors: HashMap<Persona, VoiceSelector>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            persona: Persona::default(),
            language: Language::default(),
            normalize: true,
            selectors: VoiceTable::default_selectors(),
        }
    }
}

impl TtsConfig {
    pub fn with_persona(mut self, persona: Persona, language: Language) -> Self {
        self.persona = persona;
        self.language = language;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }
}

/// Commands sent to the TTS worker
#[derive(Clone, Debug)]
pub enum TtsCommand {
    Speak { id: UtteranceId, text: String },
    /// Switch the persona used for following utterances
    SetPersona(Persona),
    Shutdown,
}

/// Events emitted by the TTS worker
#[derive(Clone, Debug, PartialEq)]
pub enum TtsEvent {
    Started(UtteranceId),
    Done(UtteranceId),
    Error {
        id: UtteranceId,
        error: SpeechOutputError,
    },
    /// Superseded or cancelled before finishing
    Cancelled(UtteranceId),
    Shutdown,
}

impl TtsEvent {
    /// Utterance the event refers to
    pub fn utterance(&self) -> Option<UtteranceId> {
        match self {
            TtsEvent::Started(id)
            | TtsEvent::Done(id)
            | TtsEvent::Cancelled(id)
            | TtsEvent::Error { id, .. } => Some(*id),
            TtsEvent::Shutdown => None,
        }
    }
}

/// Handle for a running TTS worker
pub struct TtsHandle {
    command_tx: Sender<TtsCommand>,
    event_rx: Receiver<TtsEvent>,
    next_id: Arc<AtomicU64>,
    latest: Arc<AtomicU64>,
    worker_handle: Option<JoinHandle<()>>,
}

impl TtsHandle {
    /// Speak `text`, cancelling whatever is active
    pub fn speak(&self, text: &str) -> Result<UtteranceId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.store(id, Ordering::SeqCst);
        self.command_tx
            .send(TtsCommand::Speak {
                id,
                text: text.to_string(),
            })
            .map_err(|e| ColloquyError::ChannelError(format!("Failed to send speak command: {}", e)))?;
        Ok(id)
    }

    /// Cancel the active utterance, if any
    pub fn cancel(&self) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.store(id, Ordering::SeqCst);
    }

    /// Switch persona for following utterances
    pub fn set_persona(&self, persona: Persona) -> Result<()> {
        self.command_tx
            .send(TtsCommand::SetPersona(persona))
            .map_err(|e| ColloquyError::ChannelError(format!("Failed to send command: {}", e)))
    }

    pub fn event_receiver(&self) -> Receiver<TtsEvent> {
        self.event_rx.clone()
    }

    pub fn try_recv_event(&self) -> Option<TtsEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<TtsEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Cancel, stop the worker and wait for it
    pub fn shutdown(mut self) -> Result<()> {
        self.cancel();
        let _ = self.command_tx.send(TtsCommand::Shutdown);
        if let Some(handle) = self.worker_handle.take() {
            handle
                .join()
                .map_err(|_| ColloquyError::ChannelError("TTS thread panicked".into()))?;
        }
        Ok(())
    }
}

/// Spawns the TTS worker
pub struct TextToSpeech {
    config: TtsConfig,
    engine: Box<dyn SpeechEngine>,
}

impl TextToSpeech {
    pub fn new(config: TtsConfig, engine: Box<dyn SpeechEngine>) -> Self {
        Self { config, engine }
    }

    /// Start the worker thread
    pub fn start(self) -> Result<TtsHandle> {
        // Neither side may block: the orchestrator sends speak/cancel from the
        // same loop that drains these events
        let (command_tx, command_rx) = unbounded::<TtsCommand>();
        let (event_tx, event_rx) = unbounded::<TtsEvent>();
        let next_id = Arc::new(AtomicU64::new(0));
        let latest = Arc::new(AtomicU64::new(0));

        let config = self.config;
        let mut engine = self.engine;
        let worker_latest = latest.clone();

        let worker_handle = std::thread::Builder::new()
            .name("tts".into())
            .spawn(move || {
                let table = VoiceTable::resolve(&config.selectors, &engine.voices(), config.language);
                let mut persona = config.persona;
                info!(
                    "TTS worker ready ({} / {:?}, voice {:?})",
                    persona,
                    config.language,
                    table.settings(persona).voice.map(|v| v.name)
                );

                loop {
                    let command = match command_rx.recv() {
                        Ok(cmd) => cmd,
                        Err(_) => break,
                    };

                    match command {
                        TtsCommand::Speak { id, text } => {
                            let token = CancelToken {
                                id,
                                latest: worker_latest.clone(),
                            };
                            let event = speak_one(
                                engine.as_mut(),
                                &table.settings(persona),
                                &text,
                                config.normalize,
                                &token,
                                &event_tx,
                            );
                            if event_tx.send(event).is_err() {
                                error!("Event channel closed");
                                break;
                            }
                        }
                        TtsCommand::SetPersona(p) => {
                            debug!("TTS persona set to {}", p);
                            persona = p;
                        }
                        TtsCommand::Shutdown => {
                            info!("TTS worker shutting down");
                            break;
                        }
                    }
                }

                let _ = event_tx.send(TtsEvent::Shutdown);
            })
            .map_err(|e| ColloquyError::IOError(format!("Failed to spawn TTS worker: {}", e)))?;

        Ok(TtsHandle {
            command_tx,
            event_rx,
            next_id,
            latest,
            worker_handle: Some(worker_handle),
        })
    }
}

/// Speak one utterance; returns its closing event
fn speak_one(
    engine: &mut dyn SpeechEngine,
    settings: &VoiceSettings,
    text: &str,
    normalize: bool,
    token: &CancelToken,
    event_tx: &Sender<TtsEvent>,
) -> TtsEvent {
    let id = token.id();
    if token.is_cancelled() {
        debug!("Utterance {} superseded before start", id);
        return TtsEvent::Cancelled(id);
    }

    let spoken = if normalize {
        normalize_text_for_tts(text)
    } else {
        text.trim().to_string()
    };

    let _ = event_tx.send(TtsEvent::Started(id));
    if spoken.is_empty() {
        return TtsEvent::Done(id);
    }

    match engine.speak(&spoken, settings, token) {
        _ if token.is_cancelled() => TtsEvent::Cancelled(id),
        Ok(()) => TtsEvent::Done(id),
        Err(error) => {
            warn!("Utterance {} failed: {}", id, error);
            TtsEvent::Error { id, error }
        }
    }
}

/// Rewrite text so it reads well aloud
///
/// Strips markdown, expands common abbreviations, symbols, ordinals and
/// clock times, and drops characters speech engines tend to spell out.
pub fn normalize_text_for_tts(text: &str) -> String {
    let plain = strip_markup(text);
    let expanded: Vec<String> = plain.split_whitespace().map(expand_token).collect();

    expanded
        .join(" ")
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || ".,!?;:'-\"".contains(*c))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const ABBREVIATIONS: [(&str, &str); 16] = [
    ("mr.", "Mister"),
    ("mrs.", "Misses"),
    ("ms.", "Miss"),
    ("dr.", "Doctor"),
    ("prof.", "Professor"),
    ("jr.", "Junior"),
    ("sr.", "Senior"),
    ("vs.", "versus"),
    ("etc.", "etcetera"),
    ("e.g.", "for example"),
    ("i.e.", "that is"),
    ("approx.", "approximately"),
    ("min.", "minutes"),
    ("hrs.", "hours"),
    ("km", "kilometers"),
    ("kg", "kilograms"),
];

/// Remove markdown emphasis, code, headings, quotes, bullets and link targets
fn strip_markup(text: &str) -> String {
    let mut lines = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let trimmed = trimmed.trim_start_matches(['#', '>']).trim_start();
        let trimmed = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
            .unwrap_or(trimmed);
        lines.push(strip_links(trimmed));
    }

    lines
        .join(" ")
        .chars()
        .filter(|c| !matches!(c, '*' | '`' | '~' | '_'))
        .collect()
}

/// `[label](target)` becomes `label`
fn strip_links(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find("](").map(|i| open + i) else {
            break;
        };
        let Some(end) = rest[close..].find(')').map(|i| close + i) else {
            break;
        };
        out.push_str(&rest[..open]);
        out.push_str(&rest[open + 1..close]);
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Expand one whitespace-separated token
fn expand_token(token: &str) -> String {
    let core = token.trim_end_matches([',', ';', '!', '?', ':']);
    let tail = &token[core.len()..];

    let lower = core.to_lowercase();
    if let Some((_, expansion)) = ABBREVIATIONS.iter().find(|(abbr, _)| *abbr == lower) {
        return format!("{}{}", expansion, tail);
    }

    // Sentence-final period stays attached to the expansion
    let (body, period) = match core.strip_suffix('.') {
        Some(body) => (body, "."),
        None => (core, ""),
    };

    let expanded = expand_symbols(body);
    let expanded = expand_ordinal(&expanded).unwrap_or(expanded);
    let expanded = expand_time(&expanded).unwrap_or(expanded);
    format!("{}{}{}", expanded, period, tail)
}

fn expand_symbols(word: &str) -> String {
    let mut out = String::new();
    let mut currency: Option<&str> = None;
    let mut chars = word.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '&' => out.push_str(" and "),
            '%' => out.push_str(" percent"),
            '@' => out.push_str(" at "),
            '+' => out.push_str(" plus "),
            '=' => out.push_str(" equals "),
            '#' if chars.peek().is_some_and(|n| n.is_ascii_digit()) => out.push_str("number "),
            '$' => currency = Some("dollars"),
            '€' => currency = Some("euros"),
            '£' => currency = Some("pounds"),
            _ => out.push(c),
        }
    }

    match currency {
        Some(name) if out.trim().is_empty() => name.to_string(),
        Some(name) => format!("{} {}", out.trim(), name),
        None => out,
    }
}

fn expand_ordinal(word: &str) -> Option<String> {
    let lower = word.to_lowercase();
    let split = lower.find(|c: char| !c.is_ascii_digit())?;
    let (digits, suffix) = lower.split_at(split);
    if digits.is_empty() || !matches!(suffix, "st" | "nd" | "rd" | "th") {
        return None;
    }
    let n: u32 = digits.parse().ok()?;
    ordinal_words(n)
}

fn ordinal_words(n: u32) -> Option<String> {
    let cardinal = number_to_words(n)?;
    let (head, last) = match cardinal.rfind(['-', ' ']) {
        Some(i) => cardinal.split_at(i + 1),
        None => ("", cardinal.as_str()),
    };
    let last = match last {
        "one" => "first".to_string(),
        "two" => "second".to_string(),
        "three" => "third".to_string(),
        "five" => "fifth".to_string(),
        "eight" => "eighth".to_string(),
        "nine" => "ninth".to_string(),
        "twelve" => "twelfth".to_string(),
        w if w.ends_with('y') => format!("{}ieth", &w[..w.len() - 1]),
        w => format!("{}th", w),
    };
    Some(format!("{}{}", head, last))
}

/// `3:30` becomes `three thirty`, `7:00` becomes `seven o'clock`
fn expand_time(word: &str) -> Option<String> {
    let (hours, minutes) = word.split_once(':')?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return None;
    }
    let h: u32 = hours.parse().ok()?;
    let m: u32 = minutes.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    let hour = number_to_words(h)?;
    Some(match m {
        0 => format!("{} o'clock", hour),
        1..=9 => format!("{} oh {}", hour, number_to_words(m)?),
        _ => format!("{} {}", hour, number_to_words(m)?),
    })
}

/// Spell out 0..=9999; larger numbers are left as digits
fn number_to_words(n: u32) -> Option<String> {
    const ONES: [&str; 20] = [
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
        "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
        "nineteen",
    ];
    const TENS: [&str; 10] = [
        "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
    ];

    let words = match n {
        0..=19 => ONES[n as usize].to_string(),
        20..=99 => match n % 10 {
            0 => TENS[(n / 10) as usize].to_string(),
            o => format!("{}-{}", TENS[(n / 10) as usize], ONES[o as usize]),
        },
        100..=999 => match n % 100 {
            0 => format!("{} hundred", ONES[(n / 100) as usize]),
            rem => format!("{} hundred {}", ONES[(n / 100) as usize], number_to_words(rem)?),
        },
        1000..=9999 => match n % 1000 {
            0 => format!("{} thousand", ONES[(n / 1000) as usize]),
            rem => format!("{} thousand {}", ONES[(n / 1000) as usize], number_to_words(rem)?),
        },
        _ => return None,
    };
    Some(words)
}
