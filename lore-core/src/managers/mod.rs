//! Record managers: one per entry type.
//!
//! A manager knows how to find its entry in the collection, how to allocate
//! a uid for a new one, and which raw section its records go into. Bodies
//! are only ever changed through [`record::append`](crate::record::append)
//! and read through the codec.

mod character_history;
mod conquest;
mod world_event;

pub use character_history::{CharacterHistoryManager, CharacterRef, HistorySection};
pub use conquest::{location_type_label, ConqueredLocation, ConquestLedgerManager, Hero, CONQUEST_SECTION_TAG};
pub use world_event::{WorldEventManager, EVENT_SECTION_TAG, EVENT_SENDER};

use crate::config::LorebookConfig;
use crate::entry::{Entry, EntryType, EntryUid};
use crate::record::{self, NarrativeRecord};
use crate::store::{Lorebook, StoreError};
use std::sync::Arc;
use thiserror::Error;

/// Errors from record managers.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid id: {0}")]
    InvalidId(String),
}

/// All record managers, sharing one lorebook and configuration.
pub struct RecordManagerRegistry {
    lorebook: Arc<Lorebook>,
    pub character_history: CharacterHistoryManager,
    pub conquest: ConquestLedgerManager,
    pub world_events: WorldEventManager,
}

impl RecordManagerRegistry {
    pub fn new(lorebook: Arc<Lorebook>, config: LorebookConfig) -> Self {
        Self {
            character_history: CharacterHistoryManager::new(lorebook.clone(), config.clone()),
            conquest: ConquestLedgerManager::new(lorebook.clone(), config.clone()),
            world_events: WorldEventManager::new(lorebook.clone(), config),
            lorebook,
        }
    }

    /// The shared lorebook.
    pub fn lorebook(&self) -> &Arc<Lorebook> {
        &self.lorebook
    }

    /// Raw section tags used by an entry type.
    pub fn raw_section_tags(entry_type: EntryType) -> Vec<&'static str> {
        match entry_type {
            EntryType::CharacterStoryHistory => HistorySection::ALL.iter().map(|s| s.tag()).collect(),
            EntryType::ConquestRecords => vec![CONQUEST_SECTION_TAG],
            EntryType::GameEventStory => vec![EVENT_SECTION_TAG],
        }
    }
}

/// Append records to the entry matched by `find`, creating it with `create`
/// if there is none. Returns the entry's uid.
pub(crate) async fn append_to_entry<F, C>(
    lorebook: &Lorebook,
    config: &LorebookConfig,
    tag: &str,
    records: &[NarrativeRecord],
    find: F,
    create: C,
) -> Result<EntryUid, ManagerError>
where
    F: Fn(&Entry) -> bool,
    C: FnOnce(&[Entry]) -> Entry,
{
    lorebook
        .modify(&config.collection, |entries| {
            let position = match entries.iter().position(|e| find(e)) {
                Some(position) => position,
                None => {
                    let entry = create(entries);
                    tracing::info!(uid = %entry.uid, name = %entry.name, "creating entry");
                    entries.push(entry);
                    entries.len() - 1
                }
            };

            let entry = &mut entries[position];
            entry.body = record::append(&entry.body, tag, records, &config.user_placeholder);
            entry.touch();
            Ok::<_, ManagerError>(entry.uid)
        })
        .await
}

/// Parse the records of `tag` in the entry matched by `find`.
pub(crate) async fn read_records<F>(
    lorebook: &Lorebook,
    config: &LorebookConfig,
    tag: &str,
    find: F,
) -> Result<Vec<NarrativeRecord>, ManagerError>
where
    F: Fn(&Entry) -> bool,
{
    let entry = lorebook.find(&config.collection, find).await?;
    Ok(entry
        .map(|e| record::parse(&e.body, tag, &config.user_placeholder).raw_records)
        .unwrap_or_default())
}
