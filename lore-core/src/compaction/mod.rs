//! Two-phase compaction of raw logs into summary blocks.
//!
//! A batch moves through select, stage, generate, review and then either
//! commit or rollback:
//!
//! 1. [`CompactionEngine::select`] finds entries with pending raw text.
//! 2. [`CompactionEngine::stage`] disables them and persists, so their raw
//!    text stops feeding live generation while a summary is pending.
//! 3. [`CompactionEngine::generate`] calls the summarizer once per entry,
//!    sequentially and throttled. Failures are isolated per entry.
//! 4. The caller reviews the [`GeneratedBatch`] and drops what it rejects.
//! 5. [`CompactionEngine::commit`] writes the accepted summaries, or
//!    [`CompactionEngine::rollback`] re-enables everything untouched.
//!
//! Staging state lives in the engine, never in entry metadata. Entries
//! staged by a batch that ends partially committed stay disabled until
//! [`CompactionEngine::restore`]. Once that engine is gone,
//! [`CompactionEngine::restore_orphaned`] re-enables them from a new one.

mod prompt;

pub use prompt::{base_prompt, build_prompt};

use crate::config::{CompactionConfig, LorebookConfig};
use crate::entry::{Entry, EntryKind, EntryType, EntryUid};
use crate::record::{estimate_tokens, render_summaries, split_summaries, strip_summary_tags, SummaryBlock};
use crate::store::{Lorebook, StoreError};
use crate::summarizer::{Summarizer, SummarizerError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::Instrument;
use uuid::Uuid;

// ============================================================================
// Errors
// ============================================================================

/// Errors from the compaction protocol.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Entry {0} has a result but is not staged")]
    NotStaged(EntryUid),

    #[error("Entry {0} is already staged by another batch")]
    AlreadyStaged(EntryUid),

    #[error("Batch {0} has no staged entries")]
    UnknownBatch(BatchId),
}

// ============================================================================
// Selection
// ============================================================================

/// Which entries a compaction run looks at.
///
/// With no types listed every managed type is eligible. Foreign entries are
/// only eligible when their type is named with [`with_foreign_type`](Self::with_foreign_type).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionFilter {
    pub entry_types: Vec<EntryType>,
    pub foreign_types: Vec<String>,
    /// Restricts character story histories only.
    pub character_ids: Vec<String>,
}

impl CompactionFilter {
    /// Every managed entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to a managed entry type.
    pub fn with_entry_type(mut self, entry_type: EntryType) -> Self {
        self.entry_types.push(entry_type);
        self
    }

    /// Also select entries of a foreign type; they get the generic prompt.
    pub fn with_foreign_type(mut self, entry_type: impl Into<String>) -> Self {
        self.foreign_types.push(entry_type.into());
        self
    }

    /// Restrict character histories to the given character.
    pub fn with_character(mut self, character_id: impl Into<String>) -> Self {
        self.character_ids.push(character_id.into());
        self
    }

    /// Whether an entry of this kind passes the filter.
    pub fn matches(&self, kind: &EntryKind) -> bool {
        match kind {
            EntryKind::Foreign {
                entry_type: Some(entry_type),
            } => self.foreign_types.contains(entry_type),
            EntryKind::Foreign { entry_type: None } => false,
            EntryKind::CharacterStoryHistory { character_id, .. } => {
                self.allows(EntryType::CharacterStoryHistory)
                    && (self.character_ids.is_empty() || self.character_ids.contains(character_id))
            }
            EntryKind::ConquestRecords => self.allows(EntryType::ConquestRecords),
            EntryKind::GameEventStory { .. } => self.allows(EntryType::GameEventStory),
        }
    }

    fn allows(&self, entry_type: EntryType) -> bool {
        if self.entry_types.is_empty() && self.foreign_types.is_empty() {
            return true;
        }
        self.entry_types.contains(&entry_type)
    }
}

/// Whether an entry is being summarized for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionMode {
    FirstTime,
    Incremental,
}

/// One entry's pending work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionJob {
    pub entry_uid: EntryUid,
    pub entry_name: String,
    /// `None` for a foreign entry selected by type name.
    pub entry_type: Option<EntryType>,
    pub mode: CompactionMode,
    /// The body with every summary block removed, trimmed.
    pub raw_text: String,
    /// Existing summaries, background for incremental prompts.
    pub context_summaries: Vec<SummaryBlock>,
    pub estimated_tokens: usize,
}

impl CompactionJob {
    /// Build the job for an entry, or `None` when it has nothing pending.
    pub fn for_entry(entry: &Entry) -> Option<Self> {
        let (summaries, raw_text) = split_summaries(&entry.body);
        if raw_text.is_empty() {
            return None;
        }
        let mode = if summaries.is_empty() {
            CompactionMode::FirstTime
        } else {
            CompactionMode::Incremental
        };
        Some(Self {
            entry_uid: entry.uid,
            entry_name: entry.name.clone(),
            entry_type: entry.entry_type(),
            mode,
            estimated_tokens: estimate_tokens(&raw_text),
            raw_text,
            context_summaries: summaries,
        })
    }
}

/// Entries that need compaction, split by mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub first_time: Vec<CompactionJob>,
    pub incremental: Vec<CompactionJob>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.first_time.is_empty() && self.incremental.is_empty()
    }

    pub fn len(&self) -> usize {
        self.first_time.len() + self.incremental.len()
    }

    /// All jobs, first-time ones first.
    pub fn jobs(&self) -> impl Iterator<Item = &CompactionJob> {
        self.first_time.iter().chain(self.incremental.iter())
    }

    /// Estimated input size of the whole selection.
    pub fn estimated_tokens(&self) -> usize {
        self.jobs().map(|job| job.estimated_tokens).sum()
    }

    fn into_jobs(self) -> Vec<CompactionJob> {
        let mut jobs = self.first_time;
        jobs.extend(self.incremental);
        jobs
    }
}

// ============================================================================
// Batches
// ============================================================================

/// Identifier of one compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Staging status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingState {
    Clean,
    Staged { original_enabled: bool },
}

#[derive(Debug, Clone, Copy)]
struct StagedSlot {
    batch: BatchId,
    original_enabled: bool,
}

type StagingKey = (String, EntryUid);

/// Entries disabled and awaiting generation.
#[derive(Debug, Clone)]
pub struct StagedBatch {
    pub id: BatchId,
    pub collection: String,
    pub jobs: Vec<CompactionJob>,
}

impl StagedBatch {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn entry_uids(&self) -> Vec<EntryUid> {
        self.jobs.iter().map(|job| job.entry_uid).collect()
    }
}

/// A summary produced for one entry, not yet written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSummary {
    pub entry_name: String,
    pub mode: CompactionMode,
    /// Generated prose with summary tags stripped.
    pub text: String,
    /// The raw text the summary was generated from.
    pub source_raw_text: String,
}

/// An entry whose generation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailure {
    pub entry_uid: EntryUid,
    pub entry_name: String,
    pub reason: String,
}

/// Results of the generate step, handed to the reviewer.
#[derive(Debug, Clone)]
pub struct GeneratedBatch {
    pub id: BatchId,
    pub collection: String,
    /// Every entry staged by the batch.
    pub staged: Vec<EntryUid>,
    pub results: BTreeMap<EntryUid, GeneratedSummary>,
    pub failures: Vec<GenerationFailure>,
}

impl GeneratedBatch {
    /// Keep only the results the reviewer accepts.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(EntryUid, &GeneratedSummary) -> bool,
    {
        self.results.retain(|uid, summary| keep(*uid, summary));
    }

    /// Drop one result.
    pub fn reject(&mut self, uid: EntryUid) -> Option<GeneratedSummary> {
        self.results.remove(&uid)
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// The reviewer's verdict on a whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Accept,
    Cancel,
}

/// What a commit did, per entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub batch: Option<BatchId>,
    pub committed: Vec<EntryUid>,
    /// Staged without an accepted result; still disabled.
    pub pending: Vec<EntryUid>,
    /// Raw text changed since staging; left staged and untouched.
    pub conflicted: Vec<EntryUid>,
    /// Deleted while staged.
    pub missing: Vec<EntryUid>,
}

impl CommitReport {
    /// Whether every staged entry was either committed or is gone.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.conflicted.is_empty()
    }
}

/// What a rollback or restore did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub restored: Vec<EntryUid>,
    pub missing: Vec<EntryUid>,
}

/// Terminal state of a one-shot run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    NothingToDo,
    Committed(CommitReport),
    PartiallyCommitted(CommitReport),
    RolledBack(RollbackReport),
}

// ============================================================================
// Engine
// ============================================================================

/// Runs compaction batches against one collection.
pub struct CompactionEngine<S: Summarizer> {
    lorebook: Arc<Lorebook>,
    summarizer: S,
    lorebook_config: LorebookConfig,
    config: CompactionConfig,
    staging: Mutex<HashMap<StagingKey, StagedSlot>>,
}

impl<S: Summarizer> CompactionEngine<S> {
    pub fn new(lorebook: Arc<Lorebook>, summarizer: S, lorebook_config: LorebookConfig) -> Self {
        Self {
            lorebook,
            summarizer,
            lorebook_config,
            config: CompactionConfig::default(),
            staging: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the tuning parameters.
    pub fn with_config(mut self, config: CompactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn summarizer(&self) -> &S {
        &self.summarizer
    }

    fn collection(&self) -> &str {
        &self.lorebook_config.collection
    }

    fn key(&self, uid: EntryUid) -> StagingKey {
        (self.collection().to_string(), uid)
    }

    /// Staging status of an entry in this engine's collection.
    pub async fn staging_state(&self, uid: EntryUid) -> StagingState {
        match self.staging.lock().await.get(&self.key(uid)) {
            Some(slot) => StagingState::Staged {
                original_enabled: slot.original_enabled,
            },
            None => StagingState::Clean,
        }
    }

    /// Entries currently staged in this engine's collection.
    pub async fn staged_entries(&self) -> Vec<EntryUid> {
        let collection = self.collection();
        let mut uids: Vec<_> = self
            .staging
            .lock()
            .await
            .keys()
            .filter(|key| key.0 == collection)
            .map(|key| key.1)
            .collect();
        uids.sort();
        uids
    }

    /// Find entries with pending raw text.
    ///
    /// Entries that are fully compacted, already staged, or below the
    /// configured minimum size are left out, so selecting twice without new
    /// appends yields the same result.
    pub async fn select(&self, filter: &CompactionFilter) -> Result<Selection, CompactionError> {
        let entries = self.lorebook.list(self.collection()).await?;
        let staging = self.staging.lock().await;
        let mut selection = Selection::default();

        for entry in &entries {
            if !filter.matches(&entry.kind()) {
                continue;
            }
            if staging.contains_key(&self.key(entry.uid)) {
                tracing::debug!(uid = %entry.uid, "skipping staged entry");
                continue;
            }
            let Some(job) = CompactionJob::for_entry(entry) else {
                continue;
            };
            if job.estimated_tokens < self.config.min_pending_tokens {
                tracing::debug!(
                    uid = %entry.uid,
                    tokens = job.estimated_tokens,
                    "pending text below threshold"
                );
                continue;
            }
            match job.mode {
                CompactionMode::FirstTime => selection.first_time.push(job),
                CompactionMode::Incremental => selection.incremental.push(job),
            }
        }

        tracing::info!(
            first_time = selection.first_time.len(),
            incremental = selection.incremental.len(),
            "selected entries for compaction"
        );
        Ok(selection)
    }

    /// Disable every selected entry and persist.
    ///
    /// Fails with [`CompactionError::AlreadyStaged`] before writing if any
    /// entry belongs to another batch. Entries deleted since selection are
    /// dropped from the batch.
    pub async fn stage(&self, selection: Selection) -> Result<StagedBatch, CompactionError> {
        let id = BatchId::new();
        let mut staging = self.staging.lock().await;

        let jobs = selection.into_jobs();
        if let Some(job) = jobs
            .iter()
            .find(|job| staging.contains_key(&self.key(job.entry_uid)))
        {
            return Err(CompactionError::AlreadyStaged(job.entry_uid));
        }
        if jobs.is_empty() {
            return Ok(StagedBatch {
                id,
                collection: self.collection().to_string(),
                jobs,
            });
        }

        let originals = self
            .lorebook
            .modify(self.collection(), |entries| {
                let mut originals = HashMap::new();
                for job in &jobs {
                    if let Some(entry) = entries.iter_mut().find(|e| e.uid == job.entry_uid) {
                        originals.insert(entry.uid, entry.enabled);
                        entry.enabled = false;
                    }
                }
                Ok::<_, CompactionError>(originals)
            })
            .await?;

        let jobs: Vec<_> = jobs
            .into_iter()
            .filter(|job| {
                let present = originals.contains_key(&job.entry_uid);
                if !present {
                    tracing::warn!(uid = %job.entry_uid, "entry vanished before staging");
                }
                present
            })
            .collect();

        for (uid, original_enabled) in originals {
            staging.insert(
                self.key(uid),
                StagedSlot {
                    batch: id,
                    original_enabled,
                },
            );
        }

        tracing::info!(batch = %id, entries = jobs.len(), "staged compaction batch");
        Ok(StagedBatch {
            id,
            collection: self.collection().to_string(),
            jobs,
        })
    }

    /// Summarize every staged entry, one call at a time.
    pub async fn generate(&self, batch: &StagedBatch) -> Result<GeneratedBatch, CompactionError> {
        if !batch.is_empty() && !self.owns_batch(batch.id).await {
            return Err(CompactionError::UnknownBatch(batch.id));
        }

        let span = tracing::info_span!("compaction", batch = %batch.id);
        async {
            let mut generated = GeneratedBatch {
                id: batch.id,
                collection: batch.collection.clone(),
                staged: batch.entry_uids(),
                results: BTreeMap::new(),
                failures: Vec::new(),
            };

            for (i, job) in batch.jobs.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(self.config.min_call_interval()).await;
                }
                tracing::debug!(
                    uid = %job.entry_uid,
                    position = i + 1,
                    total = batch.jobs.len(),
                    "summarizing entry"
                );

                match self.summarize(job).await {
                    Ok(text) => {
                        generated.results.insert(
                            job.entry_uid,
                            GeneratedSummary {
                                entry_name: job.entry_name.clone(),
                                mode: job.mode,
                                text,
                                source_raw_text: job.raw_text.clone(),
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!(uid = %job.entry_uid, error = %e, "summary generation failed");
                        generated.failures.push(GenerationFailure {
                            entry_uid: job.entry_uid,
                            entry_name: job.entry_name.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            tracing::info!(
                succeeded = generated.results.len(),
                failed = generated.failures.len(),
                "generation finished"
            );
            Ok::<_, CompactionError>(generated)
        }
        .instrument(span)
        .await
    }

    async fn summarize(&self, job: &CompactionJob) -> Result<String, SummarizerError> {
        let output = self.summarizer.generate(&build_prompt(job)).await?;
        strip_summary_tags(&output).ok_or(SummarizerError::Empty)
    }

    async fn owns_batch(&self, id: BatchId) -> bool {
        self.staging
            .lock()
            .await
            .values()
            .any(|slot| slot.batch == id)
    }

    /// Write the accepted summaries.
    ///
    /// Each accepted entry gets a new summary block numbered after its
    /// highest existing one, loses its raw text and is re-enabled. Staged
    /// entries without a result stay disabled.
    pub async fn commit(&self, batch: GeneratedBatch) -> Result<CommitReport, CompactionError> {
        let mut staging = self.staging.lock().await;
        let owned: Vec<EntryUid> = batch
            .staged
            .iter()
            .copied()
            .filter(|uid| {
                staging
                    .get(&(batch.collection.clone(), *uid))
                    .is_some_and(|slot| slot.batch == batch.id)
            })
            .collect();

        if owned.is_empty() && !batch.results.is_empty() {
            return Err(CompactionError::UnknownBatch(batch.id));
        }
        if let Some(uid) = batch.results.keys().find(|uid| !owned.contains(uid)) {
            return Err(CompactionError::NotStaged(*uid));
        }

        let report = self
            .lorebook
            .modify(&batch.collection, |entries| {
                let mut report = CommitReport {
                    batch: Some(batch.id),
                    ..CommitReport::default()
                };
                for uid in &owned {
                    let Some(entry) = entries.iter_mut().find(|e| e.uid == *uid) else {
                        report.missing.push(*uid);
                        continue;
                    };
                    let Some(summary) = batch.results.get(uid) else {
                        report.pending.push(*uid);
                        continue;
                    };
                    if commit_summary(entry, summary) {
                        report.committed.push(*uid);
                    } else {
                        tracing::warn!(uid = %uid, "raw text changed since staging, not committing");
                        report.conflicted.push(*uid);
                    }
                }
                Ok::<_, CompactionError>(report)
            })
            .await?;

        for uid in report.committed.iter().chain(report.missing.iter()) {
            staging.remove(&(batch.collection.clone(), *uid));
        }

        tracing::info!(
            batch = %batch.id,
            committed = report.committed.len(),
            pending = report.pending.len(),
            conflicted = report.conflicted.len(),
            missing = report.missing.len(),
            "committed compaction batch"
        );
        Ok(report)
    }

    /// Re-enable every entry staged by a batch, discarding generated text.
    pub async fn rollback(&self, id: BatchId) -> Result<RollbackReport, CompactionError> {
        let report = self.restore_where(|slot| slot.batch == id).await?;
        tracing::info!(batch = %id, restored = report.restored.len(), "rolled back compaction batch");
        Ok(report)
    }

    /// Cancel a reviewed batch.
    pub async fn cancel(&self, batch: GeneratedBatch) -> Result<RollbackReport, CompactionError> {
        self.rollback(batch.id).await
    }

    /// Re-enable every staged entry of the collection, whatever its batch.
    pub async fn restore(&self) -> Result<RollbackReport, CompactionError> {
        let report = self.restore_where(|_| true).await?;
        tracing::info!(restored = report.restored.len(), "restored staged entries");
        Ok(report)
    }

    /// Re-enable disabled entries matching `filter` that this engine has not staged.
    ///
    /// Only staging disables managed entries, so a disabled entry unknown to
    /// the side table was left behind by an engine that no longer exists.
    /// Entries staged here are left to [`rollback`](Self::rollback) and
    /// [`restore`](Self::restore).
    pub async fn restore_orphaned(&self, filter: &CompactionFilter) -> Result<RollbackReport, CompactionError> {
        let staging = self.staging.lock().await;
        let collection = self.collection().to_string();

        let report = self
            .lorebook
            .modify(&collection, |entries| {
                let mut report = RollbackReport::default();
                for entry in entries.iter_mut() {
                    if entry.enabled
                        || !filter.matches(&entry.kind())
                        || staging.contains_key(&(collection.clone(), entry.uid))
                    {
                        continue;
                    }
                    entry.enabled = true;
                    report.restored.push(entry.uid);
                }
                Ok::<_, CompactionError>(report)
            })
            .await?;

        if !report.restored.is_empty() {
            tracing::warn!(restored = report.restored.len(), "re-enabled orphaned staged entries");
        }
        Ok(report)
    }

    async fn restore_where<P>(&self, predicate: P) -> Result<RollbackReport, CompactionError>
    where
        P: Fn(&StagedSlot) -> bool,
    {
        let mut staging = self.staging.lock().await;
        let collection = self.collection().to_string();
        let targets: BTreeMap<EntryUid, bool> = staging
            .iter()
            .filter(|&(key, slot)| key.0 == collection && predicate(slot))
            .map(|(key, slot)| (key.1, slot.original_enabled))
            .collect();
        if targets.is_empty() {
            return Ok(RollbackReport::default());
        }

        let report = self
            .lorebook
            .modify(&collection, |entries| {
                let mut report = RollbackReport::default();
                for (uid, original_enabled) in &targets {
                    match entries.iter_mut().find(|e| e.uid == *uid) {
                        Some(entry) => {
                            entry.enabled = *original_enabled;
                            report.restored.push(*uid);
                        }
                        None => report.missing.push(*uid),
                    }
                }
                Ok::<_, CompactionError>(report)
            })
            .await?;

        for uid in targets.keys() {
            staging.remove(&(collection.clone(), *uid));
        }
        Ok(report)
    }

    /// Run a whole batch: select, stage, generate, review, then commit or roll back.
    ///
    /// The reviewer may drop individual results before accepting. If
    /// generation cannot run, staged entries are rolled back before the
    /// error is returned.
    pub async fn compact<R>(&self, filter: &CompactionFilter, review: R) -> Result<BatchOutcome, CompactionError>
    where
        R: FnOnce(&mut GeneratedBatch) -> ReviewDecision,
    {
        let selection = self.select(filter).await?;
        if selection.is_empty() {
            return Ok(BatchOutcome::NothingToDo);
        }

        let staged = self.stage(selection).await?;
        if staged.is_empty() {
            return Ok(BatchOutcome::NothingToDo);
        }

        let mut generated = match self.generate(&staged).await {
            Ok(generated) => generated,
            Err(e) => {
                self.rollback(staged.id).await?;
                return Err(e);
            }
        };

        match review(&mut generated) {
            ReviewDecision::Cancel => Ok(BatchOutcome::RolledBack(self.cancel(generated).await?)),
            ReviewDecision::Accept => {
                let report = self.commit(generated).await?;
                if report.is_complete() {
                    Ok(BatchOutcome::Committed(report))
                } else {
                    Ok(BatchOutcome::PartiallyCommitted(report))
                }
            }
        }
    }
}

/// Apply one summary to an entry. Returns false when the entry's raw text no
/// longer matches what was summarized.
fn commit_summary(entry: &mut Entry, summary: &GeneratedSummary) -> bool {
    let (existing, raw_text) = split_summaries(&entry.body);
    if raw_text != summary.source_raw_text {
        return false;
    }

    let next_index = existing.iter().map(|block| block.index).max().unwrap_or(0) + 1;
    let mut blocks: Vec<SummaryBlock> = existing
        .into_iter()
        .filter(|block| !block.text.is_empty())
        .collect();
    blocks.push(SummaryBlock::new(next_index, summary.text.clone()));

    entry.body = render_summaries(&blocks);
    entry.enabled = true;
    entry.mark_summarized();
    true
}
