//! World event ledgers, one entry per event.

use super::{append_to_entry, read_records, ManagerError};
use crate::config::LorebookConfig;
use crate::entry::{allocate_uid, Entry, EntryKind, EntryType, EntryUid};
use crate::record::{NarrativeRecord, Sender};
use crate::store::Lorebook;
use std::sync::Arc;

/// Raw section tag of an event ledger.
pub const EVENT_SECTION_TAG: &str = "event_story";

/// Sender of every event record.
pub const EVENT_SENDER: &str = "Event Record";

const EVENT_ORDER: i32 = 120;

/// Manages `game_event_story` entries.
pub struct WorldEventManager {
    lorebook: Arc<Lorebook>,
    config: LorebookConfig,
}

impl WorldEventManager {
    pub fn new(lorebook: Arc<Lorebook>, config: LorebookConfig) -> Self {
        Self { lorebook, config }
    }

    /// Add a passage to an event's ledger, creating it on first use.
    pub async fn record_event(
        &self,
        event_id: &str,
        event_name: &str,
        content: &str,
        game_time: &str,
    ) -> Result<EntryUid, ManagerError> {
        if event_id.trim().is_empty() {
            return Err(ManagerError::InvalidId("event id is empty".into()));
        }

        let record = NarrativeRecord::new(game_time, Sender::named(EVENT_SENDER), content);
        let kind = EntryKind::GameEventStory {
            event_id: event_id.to_string(),
            event_name: event_name.to_string(),
        };
        let uid = append_to_entry(
            &self.lorebook,
            &self.config,
            EVENT_SECTION_TAG,
            std::slice::from_ref(&record),
            |e| is_event(e, event_id),
            |existing| {
                let uid = allocate_uid(EntryType::GameEventStory.uid_policy(), event_id, existing);
                Entry::new(uid, format!("{event_name} - Event Story"), &kind, "")
                    .with_constant(true)
                    .with_order(EVENT_ORDER)
            },
        )
        .await?;

        tracing::debug!(event_id, "recorded event passage");
        Ok(uid)
    }

    /// Raw passages of an event, oldest first.
    pub async fn records(&self, event_id: &str) -> Result<Vec<NarrativeRecord>, ManagerError> {
        read_records(&self.lorebook, &self.config, EVENT_SECTION_TAG, |e| {
            is_event(e, event_id)
        })
        .await
    }
}

fn is_event(entry: &Entry, event_id: &str) -> bool {
    matches!(
        entry.kind(),
        EntryKind::GameEventStory { event_id: id, .. } if id == event_id
    )
}
