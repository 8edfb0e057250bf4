//! Configuration for the lorebook adapter, record managers and compaction.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! [lorebook]
//! collection = "goblin-lair-archive"
//! user_placeholder = "{{user}}"
//! player_character_ids = ["player-1"]
//!
//! [compaction]
//! min_call_interval_ms = 1000
//! min_pending_tokens = 0
//! ```

use crate::record::DEFAULT_USER_PLACEHOLDER;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where records live and how voices are rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LorebookConfig {
    /// Name of the collection holding the story archive.
    pub collection: String,

    /// Token written in place of the user voice.
    pub user_placeholder: String,

    /// Character ids that are the player and never get a history entry.
    pub player_character_ids: Vec<String>,

    /// Character names that are the player.
    pub player_character_names: Vec<String>,
}

impl Default for LorebookConfig {
    fn default() -> Self {
        Self {
            collection: "story-archive".to_string(),
            user_placeholder: DEFAULT_USER_PLACEHOLDER.to_string(),
            player_character_ids: vec!["player-1".to_string()],
            player_character_names: Vec::new(),
        }
    }
}

impl LorebookConfig {
    /// Create a config for the given collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Set the user placeholder token.
    pub fn with_user_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.user_placeholder = placeholder.into();
        self
    }

    /// Add a player character id.
    pub fn with_player_id(mut self, id: impl Into<String>) -> Self {
        self.player_character_ids.push(id.into());
        self
    }

    /// Add a player character name.
    pub fn with_player_name(mut self, name: impl Into<String>) -> Self {
        self.player_character_names.push(name.into());
        self
    }

    /// Whether the given character is the player.
    pub fn is_player(&self, character_id: &str, character_name: &str) -> bool {
        self.player_character_ids.iter().any(|id| id == character_id)
            || self.player_character_names.iter().any(|n| n == character_name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.trim().is_empty() {
            return Err(ConfigError::Invalid("collection name is empty".into()));
        }
        if self.user_placeholder.trim().is_empty() || self.user_placeholder.contains(": ") {
            return Err(ConfigError::Invalid(format!(
                "user placeholder {:?} cannot be used as a sender",
                self.user_placeholder
            )));
        }
        Ok(())
    }
}

/// Compaction tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Minimum delay between two summarizer calls, in milliseconds.
    pub min_call_interval_ms: u64,

    /// Entries with less pending raw text than this (estimated tokens) are skipped.
    pub min_pending_tokens: usize,

    /// Upper bound on tokens the summarizer may produce per entry.
    pub max_summary_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_call_interval_ms: 1_000,
            min_pending_tokens: 0,
            max_summary_tokens: 4_096,
        }
    }
}

impl CompactionConfig {
    /// Set the delay between summarizer calls.
    pub fn with_min_call_interval(mut self, interval: Duration) -> Self {
        self.min_call_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the minimum pending size for an entry to be selected.
    pub fn with_min_pending_tokens(mut self, tokens: usize) -> Self {
        self.min_pending_tokens = tokens;
        self
    }

    /// Set the summarizer output budget.
    pub fn with_max_summary_tokens(mut self, tokens: usize) -> Self {
        self.max_summary_tokens = tokens;
        self
    }

    /// Delay between summarizer calls.
    pub fn min_call_interval(&self) -> Duration {
        Duration::from_millis(self.min_call_interval_ms)
    }
}

/// The full configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoreConfig {
    pub lorebook: LorebookConfig,
    pub compaction: CompactionConfig,
}

impl LoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.lorebook.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }
}
