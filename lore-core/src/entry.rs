//! Lorebook entries and their typed discriminators.
//!
//! The host store keeps a flat list of entries per collection. Each entry
//! carries an opaque `extra` bag; the fields this crate cares about are read
//! through [`EntryKind`] so callers match on a closed set of variants instead
//! of probing optional keys.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Metadata key holding the entry discriminator.
pub const ENTRY_TYPE_KEY: &str = "entry_type";

const CHARACTER_ID_KEY: &str = "character_id";
const CHARACTER_NAME_KEY: &str = "character_name";
const EVENT_ID_KEY: &str = "event_id";
const EVENT_NAME_KEY: &str = "event_name";
const CREATED_AT_KEY: &str = "created_at";
const UPDATED_AT_KEY: &str = "updated_at";
const HAS_SUMMARY_KEY: &str = "has_summary";
const SUMMARY_UPDATED_AT_KEY: &str = "summary_updated_at";
const ORIGINAL_DATA_REMOVED_KEY: &str = "original_data_removed";
const ORIGINAL_DATA_REMOVED_AT_KEY: &str = "original_data_removed_at";

/// Upper bound (exclusive) of deterministic uids.
const DETERMINISTIC_UID_MODULUS: i64 = 2_147_483_647;

/// Key of an entry, unique within one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryUid(pub u64);

impl fmt::Display for EntryUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry types owned by a record manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Per-character story history (training log, dialogue, battles).
    CharacterStoryHistory,
    /// The singleton ledger of conquered locations.
    ConquestRecords,
    /// One ledger per world event.
    GameEventStory,
}

impl EntryType {
    /// All managed entry types.
    pub const ALL: [EntryType; 3] = [
        EntryType::CharacterStoryHistory,
        EntryType::ConquestRecords,
        EntryType::GameEventStory,
    ];

    /// The persisted discriminator string.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::CharacterStoryHistory => "character_story_history",
            EntryType::ConquestRecords => "conquest_records",
            EntryType::GameEventStory => "game_event_story",
        }
    }

    /// Parse a persisted discriminator string.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// How entries of this type get their uid.
    pub fn uid_policy(&self) -> UidPolicy {
        match self {
            EntryType::CharacterStoryHistory => UidPolicy::Deterministic,
            EntryType::ConquestRecords | EntryType::GameEventStory => UidPolicy::AllocationTime,
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            EntryType::CharacterStoryHistory => "Character story history",
            EntryType::ConquestRecords => "Conquest records",
            EntryType::GameEventStory => "World event story",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view over an entry's discriminator and foreign keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    CharacterStoryHistory {
        character_id: String,
        character_name: String,
    },
    ConquestRecords,
    GameEventStory {
        event_id: String,
        event_name: String,
    },
    /// Anything not owned by a record manager (character sheets, resources, ...).
    Foreign { entry_type: Option<String> },
}

impl EntryKind {
    /// The managed entry type, if any.
    pub fn entry_type(&self) -> Option<EntryType> {
        match self {
            EntryKind::CharacterStoryHistory { .. } => Some(EntryType::CharacterStoryHistory),
            EntryKind::ConquestRecords => Some(EntryType::ConquestRecords),
            EntryKind::GameEventStory { .. } => Some(EntryType::GameEventStory),
            EntryKind::Foreign { .. } => None,
        }
    }

    fn read_from(extra: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            extra
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let raw_type = extra.get(ENTRY_TYPE_KEY).and_then(Value::as_str);
        match raw_type.and_then(EntryType::parse) {
            Some(EntryType::CharacterStoryHistory) => EntryKind::CharacterStoryHistory {
                character_id: text(CHARACTER_ID_KEY),
                character_name: text(CHARACTER_NAME_KEY),
            },
            Some(EntryType::ConquestRecords) => EntryKind::ConquestRecords,
            Some(EntryType::GameEventStory) => EntryKind::GameEventStory {
                event_id: text(EVENT_ID_KEY),
                event_name: text(EVENT_NAME_KEY),
            },
            None => EntryKind::Foreign {
                entry_type: raw_type.map(str::to_string),
            },
        }
    }

    fn write_into(&self, extra: &mut Map<String, Value>) {
        match self {
            EntryKind::CharacterStoryHistory {
                character_id,
                character_name,
            } => {
                extra.insert(ENTRY_TYPE_KEY.into(), EntryType::CharacterStoryHistory.as_str().into());
                extra.insert(CHARACTER_ID_KEY.into(), character_id.as_str().into());
                extra.insert(CHARACTER_NAME_KEY.into(), character_name.as_str().into());
            }
            EntryKind::ConquestRecords => {
                extra.insert(ENTRY_TYPE_KEY.into(), EntryType::ConquestRecords.as_str().into());
            }
            EntryKind::GameEventStory {
                event_id,
                event_name,
            } => {
                extra.insert(ENTRY_TYPE_KEY.into(), EntryType::GameEventStory.as_str().into());
                extra.insert(EVENT_ID_KEY.into(), event_id.as_str().into());
                extra.insert(EVENT_NAME_KEY.into(), event_name.as_str().into());
            }
            EntryKind::Foreign { entry_type } => {
                if let Some(entry_type) = entry_type {
                    extra.insert(ENTRY_TYPE_KEY.into(), entry_type.as_str().into());
                }
            }
        }
    }
}

/// How a record manager allocates uids for the entries it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidPolicy {
    /// Stable hash of a domain id; re-resolving the same object yields the same uid.
    Deterministic,
    /// Current wall-clock millis, bumped until unique in the collection.
    AllocationTime,
}

/// Deterministic uid for a character's story history entry.
///
/// Matches the hash used by existing saves: a 32-bit `h * 31 + unit` over the
/// UTF-16 code units of `story_history_{id}`, folded to a positive value.
pub fn story_history_uid(character_id: &str) -> EntryUid {
    let key = format!("story_history_{character_id}");
    let hash = key.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(i32::from(unit))
    });
    EntryUid((i64::from(hash).abs() % DETERMINISTIC_UID_MODULUS) as u64)
}

/// Allocation-time uid that does not collide with any existing entry.
pub fn allocation_time_uid(existing: &[Entry]) -> EntryUid {
    let mut candidate = Utc::now().timestamp_millis().max(0) as u64;
    while existing.iter().any(|e| e.uid.0 == candidate) {
        candidate += 1;
    }
    EntryUid(candidate)
}

/// Allocate a uid for a new entry under `policy`.
///
/// `domain_id` feeds the deterministic hash and is ignored otherwise.
pub fn allocate_uid(policy: UidPolicy, domain_id: &str, existing: &[Entry]) -> EntryUid {
    match policy {
        UidPolicy::Deterministic => story_history_uid(domain_id),
        UidPolicy::AllocationTime => allocation_time_uid(existing),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// A unit of the host lorebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub uid: EntryUid,
    pub name: String,
    pub enabled: bool,
    /// The textual log. Persisted as `content` for host compatibility.
    #[serde(rename = "content", default)]
    pub body: String,
    /// Activation keywords used by the host.
    #[serde(default)]
    pub keys: Vec<String>,
    /// Always-on activation.
    #[serde(default)]
    pub constant: bool,
    /// Insertion order hint.
    #[serde(default)]
    pub order: i32,
    /// Opaque metadata bag, persisted verbatim.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Entry {
    /// Create an enabled entry of the given kind.
    pub fn new(uid: EntryUid, name: impl Into<String>, kind: &EntryKind, body: impl Into<String>) -> Self {
        let mut extra = Map::new();
        kind.write_into(&mut extra);
        let now = now_rfc3339();
        extra.insert(CREATED_AT_KEY.into(), now.clone().into());
        extra.insert(UPDATED_AT_KEY.into(), now.into());

        Self {
            uid,
            name: name.into(),
            enabled: true,
            body: body.into(),
            keys: Vec::new(),
            constant: false,
            order: 100,
            extra,
        }
    }

    /// Set activation keywords.
    pub fn with_keys(mut self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Mark as always-on.
    pub fn with_constant(mut self, constant: bool) -> Self {
        self.constant = constant;
        self
    }

    /// Set the insertion order hint.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Typed view of the discriminator fields.
    pub fn kind(&self) -> EntryKind {
        EntryKind::read_from(&self.extra)
    }

    /// The managed entry type, if any.
    pub fn entry_type(&self) -> Option<EntryType> {
        self.kind().entry_type()
    }

    /// Read a string metadata field.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// Whether a compaction has ever been committed for this entry.
    pub fn has_summary(&self) -> bool {
        self.extra
            .get(HAS_SUMMARY_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Stamp `updated_at`.
    pub fn touch(&mut self) {
        self.extra.insert(UPDATED_AT_KEY.into(), now_rfc3339().into());
    }

    /// Stamp the informational flags set after a committed compaction.
    pub fn mark_summarized(&mut self) {
        let now = now_rfc3339();
        self.extra.insert(HAS_SUMMARY_KEY.into(), true.into());
        self.extra.insert(SUMMARY_UPDATED_AT_KEY.into(), now.clone().into());
        self.extra.insert(ORIGINAL_DATA_REMOVED_KEY.into(), true.into());
        self.extra.insert(ORIGINAL_DATA_REMOVED_AT_KEY.into(), now.clone().into());
        self.extra.insert(UPDATED_AT_KEY.into(), now.into());
    }
}
