//! Narrative log engine for lorebook-backed story simulations.
//!
//! This crate provides:
//! - A record codec for tagged, append-only narrative logs
//! - An append engine that splices records in without re-parsing
//! - Two-phase compaction of raw logs into AI-written summaries
//! - Record managers for character histories, conquests and world events
//!
//! # Quick Start
//!
//! ```ignore
//! use lore_core::{
//!     CharacterHistoryManager, CharacterRef, ClaudeSummarizer, CompactionEngine,
//!     CompactionFilter, HistorySection, InMemoryStore, LorebookConfig, Lorebook,
//!     NarrativeRecord, ReviewDecision, Sender,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LorebookConfig::new("goblin-lair-archive");
//!     let lorebook = Arc::new(Lorebook::new(InMemoryStore::new()));
//!
//!     let histories = CharacterHistoryManager::new(lorebook.clone(), config.clone());
//!     let mira = CharacterRef::new("c-7", "Mira");
//!     histories
//!         .append_records(
//!             &mira,
//!             HistorySection::Training,
//!             &[NarrativeRecord::new("Day 1", Sender::named("Mira"), "I will not kneel.")],
//!         )
//!         .await?;
//!
//!     let engine = CompactionEngine::new(lorebook, ClaudeSummarizer::from_env()?, config);
//!     let outcome = engine
//!         .compact(&CompactionFilter::all(), |_batch| ReviewDecision::Accept)
//!         .await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod compaction;
pub mod config;
pub mod entry;
pub mod managers;
pub mod record;
pub mod store;
pub mod summarizer;
pub mod testing;

// Primary public API
pub use compaction::{
    BatchId, BatchOutcome, CommitReport, CompactionEngine, CompactionError, CompactionFilter,
    CompactionJob, CompactionMode, GeneratedBatch, GeneratedSummary, GenerationFailure,
    ReviewDecision, RollbackReport, Selection, StagedBatch, StagingState,
};
pub use config::{CompactionConfig, ConfigError, LoreConfig, LorebookConfig};
pub use entry::{Entry, EntryKind, EntryType, EntryUid, UidPolicy};
pub use managers::{
    CharacterHistoryManager, CharacterRef, ConqueredLocation, ConquestLedgerManager,
    HistorySection, Hero, ManagerError, RecordManagerRegistry, WorldEventManager,
};
pub use record::{NarrativeRecord, ParsedLog, Sender, SummaryBlock};
pub use store::{EntryStore, InMemoryStore, JsonFileStore, Lorebook, StoreError};
pub use summarizer::{ClaudeSummarizer, Summarizer, SummarizerError};
pub use testing::{MockReply, MockSummarizer};
