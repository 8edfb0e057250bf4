//! Per-character story history: training log, pre-battle dialogue and battle summaries.

use super::{append_to_entry, read_records, ManagerError};
use crate::config::LorebookConfig;
use crate::entry::{allocate_uid, Entry, EntryKind, EntryType, EntryUid};
use crate::record::NarrativeRecord;
use crate::store::Lorebook;
use std::sync::Arc;

/// Insertion order of history entries.
const HISTORY_ORDER: i32 = 160;

/// Status value marking the player character.
const PLAYER_STATUS: &str = "player";

/// A raw section of a character history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistorySection {
    Training,
    PreBattleDialogue,
    BattleSummary,
}

impl HistorySection {
    pub const ALL: [HistorySection; 3] = [
        HistorySection::Training,
        HistorySection::PreBattleDialogue,
        HistorySection::BattleSummary,
    ];

    /// Wrapper tag of the section.
    pub fn tag(&self) -> &'static str {
        match self {
            HistorySection::Training => "training_history",
            HistorySection::PreBattleDialogue => "pre_battle_dialogue",
            HistorySection::BattleSummary => "battle_summary",
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            HistorySection::Training => "Training Log",
            HistorySection::PreBattleDialogue => "Pre-battle Dialogue",
            HistorySection::BattleSummary => "Battle Summary",
        }
    }
}

/// The character a history belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterRef {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
}

impl CharacterRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// Manages `character_story_history` entries, one per character.
pub struct CharacterHistoryManager {
    lorebook: Arc<Lorebook>,
    config: LorebookConfig,
}

impl CharacterHistoryManager {
    pub fn new(lorebook: Arc<Lorebook>, config: LorebookConfig) -> Self {
        Self { lorebook, config }
    }

    fn is_player(&self, character: &CharacterRef) -> bool {
        character.status.as_deref() == Some(PLAYER_STATUS)
            || self.config.is_player(&character.id, &character.name)
    }

    /// Append records to one section of a character's history.
    ///
    /// The entry is created on first use. Nothing is written for the player
    /// character or for an empty record list; both return `Ok(None)`.
    pub async fn append_records(
        &self,
        character: &CharacterRef,
        section: HistorySection,
        records: &[NarrativeRecord],
    ) -> Result<Option<EntryUid>, ManagerError> {
        if character.id.trim().is_empty() {
            return Err(ManagerError::InvalidId("character id is empty".into()));
        }
        if self.is_player(character) {
            tracing::debug!(character = %character.name, "not recording history for the player");
            return Ok(None);
        }
        if records.is_empty() {
            return Ok(None);
        }

        let uid = append_to_entry(
            &self.lorebook,
            &self.config,
            section.tag(),
            records,
            |e| is_history_of(e, &character.id),
            |existing| new_history_entry(character, existing),
        )
        .await?;

        tracing::debug!(
            character = %character.name,
            section = section.tag(),
            records = records.len(),
            "appended history records"
        );
        Ok(Some(uid))
    }

    /// Records of one section of a character's history, oldest first.
    pub async fn records(
        &self,
        character_id: &str,
        section: HistorySection,
    ) -> Result<Vec<NarrativeRecord>, ManagerError> {
        read_records(&self.lorebook, &self.config, section.tag(), |e| {
            is_history_of(e, character_id)
        })
        .await
    }

    /// The history entry of a character, if any.
    pub async fn entry(&self, character_id: &str) -> Result<Option<Entry>, ManagerError> {
        Ok(self
            .lorebook
            .find(&self.config.collection, |e| is_history_of(e, character_id))
            .await?)
    }

    /// Remove a character's history entry. Returns whether one existed.
    pub async fn delete_history(&self, character_id: &str) -> Result<bool, ManagerError> {
        let removed = self
            .lorebook
            .modify(&self.config.collection, |entries| {
                let before = entries.len();
                entries.retain(|e| !is_history_of(e, character_id));
                Ok::<_, ManagerError>(entries.len() != before)
            })
            .await?;

        if removed {
            tracing::info!(character_id, "deleted character history");
        }
        Ok(removed)
    }

    /// Every character that has a history entry.
    pub async fn characters_with_history(&self) -> Result<Vec<CharacterRef>, ManagerError> {
        let entries = self.lorebook.list(&self.config.collection).await?;
        Ok(entries
            .iter()
            .filter_map(|e| match e.kind() {
                EntryKind::CharacterStoryHistory {
                    character_id,
                    character_name,
                } => Some(CharacterRef::new(character_id, character_name)),
                _ => None,
            })
            .collect())
    }
}

fn is_history_of(entry: &Entry, character_id: &str) -> bool {
    matches!(
        entry.kind(),
        EntryKind::CharacterStoryHistory { character_id: id, .. } if id == character_id
    )
}

fn new_history_entry(character: &CharacterRef, existing: &[Entry]) -> Entry {
    let kind = EntryKind::CharacterStoryHistory {
        character_id: character.id.clone(),
        character_name: character.name.clone(),
    };
    let mut keys = vec![character.name.clone()];
    keys.extend(HistorySection::ALL.iter().map(|s| s.keyword().to_string()));
    keys.push("Story History".to_string());

    Entry::new(
        allocate_uid(EntryType::CharacterStoryHistory.uid_policy(), &character.id, existing),
        format!("{} - Story History", character.name),
        &kind,
        "",
    )
    .with_keys(keys)
    .with_order(HISTORY_ORDER)
}
