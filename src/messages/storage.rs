//! Completed-turn records and the history collaborator
//!
//! Persisting and exporting history belongs to another subsystem; the
//! orchestrator only hands it finished turns through `HistoryStore`.

use super::types::MessageSource;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One user input and the AI output it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub user_text: String,
    pub assistant_text: String,
    pub origin: MessageSource,
    /// The assistant text is a generated fallback
    pub fallback: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(
        id: Uuid,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        origin: MessageSource,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            origin,
            fallback: false,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }
}

/// Filter for `HistoryStore::query`
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub origin: Option<MessageSource>,
    pub since: Option<DateTime<Utc>>,
    /// Case-insensitive substring of either side of the turn
    pub contains: Option<String>,
    /// Keep only the most recent N matches
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn matches(&self, turn: &Turn) -> bool {
        if let Some(origin) = self.origin {
            if turn.origin != origin {
                return false;
            }
        }
        if let Some(since) = self.since {
            if turn.completed_at < since {
                return false;
            }
        }
        if let Some(needle) = &self.contains {
            let needle = needle.to_lowercase();
            if !turn.user_text.to_lowercase().contains(&needle)
                && !turn.assistant_text.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}

/// History collaborator
pub trait HistoryStore: Send + Sync {
    fn store(&self, turn: Turn);
    fn query(&self, filter: &HistoryFilter) -> Vec<Turn>;
}

/// In-memory history, newest last
#[derive(Debug, Clone)]
pub struct MessageStorage {
    turns: Arc<RwLock<Vec<Turn>>>,
}

impl MessageStorage {
    pub fn new() -> Self {
        Self {
            turns: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn get_all(&self) -> Vec<Turn> {
        self.turns.read().clone()
    }

    pub fn clear(&self) {
        self.turns.write().clear();
    }

    pub fn len(&self) -> usize {
        self.turns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.read().is_empty()
    }
}

impl Default for MessageStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore for MessageStorage {
    fn store(&self, turn: Turn) {
        self.turns.write().push(turn);
    }

    fn query(&self, filter: &HistoryFilter) -> Vec<Turn> {
        let turns = self.turns.read();
        let mut matched: Vec<Turn> = turns.iter().filter(|t| filter.matches(t)).cloned().collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }
}
