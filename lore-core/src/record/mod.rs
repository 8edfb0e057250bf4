//! Narrative records and their textual log format.
//!
//! A record is one logical event in an entity's history. Records are stored
//! as lines inside a tagged raw section of an entry body, after any summary
//! blocks produced by compaction.

pub mod append;
pub mod codec;

pub use append::append;
pub use codec::{
    clean_prose_content, estimate_tokens, parse, render, render_section, render_summaries,
    split_summaries, strip_summary_tags, ParsedLog, SummaryBlock, DEFAULT_USER_PLACEHOLDER,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    /// The viewpoint character (the player's voice).
    User,
    /// Any other named voice: a character, a narrator, a ledger.
    Named(String),
}

impl Sender {
    /// Create a named sender.
    pub fn named(name: impl Into<String>) -> Self {
        Sender::Named(name.into())
    }

    /// Whether this is the user voice.
    pub fn is_user(&self) -> bool {
        matches!(self, Sender::User)
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::User => f.write_str("user"),
            Sender::Named(name) => f.write_str(name),
        }
    }
}

/// One logical event in a narrative log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeRecord {
    /// In-game time, display only.
    pub game_time: String,
    /// Who said or did this.
    pub sender: Sender,
    /// Free text, possibly multi-line.
    pub content: String,
    /// Monotonic ordering key. Records parsed from text get their ordinal.
    pub timestamp: i64,
}

impl NarrativeRecord {
    /// Create a record stamped with the current wall-clock millis.
    pub fn new(game_time: impl Into<String>, sender: Sender, content: impl Into<String>) -> Self {
        Self {
            game_time: game_time.into(),
            sender,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// A record spoken by the user voice.
    pub fn from_user(game_time: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(game_time, Sender::User, content)
    }

    /// Override the ordering key.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether two records describe the same event, ignoring the ordering key.
    pub fn same_event(&self, other: &NarrativeRecord) -> bool {
        self.game_time == other.game_time
            && self.sender == other.sender
            && self.content == other.content
    }
}
