//! Scenario tests for the compaction protocol.
//!
//! Every test runs against an in-memory lorebook and a scripted summarizer.
//! Run with: `cargo test -p lore-core --test compaction_protocol`

use lore_core::compaction::{CompactionJob, GeneratedSummary};
use lore_core::testing::{archive_with, said};
use lore_core::{
    BatchOutcome, CompactionConfig, CompactionEngine, CompactionError, CompactionFilter,
    CompactionMode, Entry, EntryKind, EntryType, EntryUid, LorebookConfig, MockReply,
    MockSummarizer, ReviewDecision, StagingState,
};
use std::sync::Arc;
use std::time::Duration;

const ARCHIVE: &str = "archive";
const TAG: &str = "training_history";

fn history(uid: u64, character_id: &str, body: &str) -> Entry {
    let kind = EntryKind::CharacterStoryHistory {
        character_id: character_id.into(),
        character_name: character_id.into(),
    };
    Entry::new(EntryUid(uid), format!("{character_id} - Story History"), &kind, body)
}

fn raw_section(lines: &[&str]) -> String {
    format!("<{TAG}>\n{}\n</{TAG}>", lines.join("\n"))
}

fn engine(
    lorebook: Arc<lore_core::Lorebook>,
    summarizer: MockSummarizer,
) -> CompactionEngine<MockSummarizer> {
    CompactionEngine::new(lorebook, summarizer, LorebookConfig::new(ARCHIVE))
        .with_config(CompactionConfig::default().with_min_call_interval(Duration::ZERO))
}

async fn entry(lorebook: &lore_core::Lorebook, uid: u64) -> Entry {
    lorebook
        .find(ARCHIVE, |e| e.uid == EntryUid(uid))
        .await
        .expect("store read failed")
        .expect("entry missing")
}

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn test_first_time_compaction() {
    let body = raw_section(&["[Day 1] Mira: I will not kneel.", "[Day 1] {{user}}: We shall see."]);
    let (_store, lorebook) = archive_with(ARCHIVE, vec![history(1, "mira", &body)]);
    let engine = engine(lorebook.clone(), MockSummarizer::with_texts(["Mira defied the king."]));

    let outcome = engine
        .compact(&CompactionFilter::all(), |_| ReviewDecision::Accept)
        .await
        .unwrap();

    let BatchOutcome::Committed(report) = outcome else {
        panic!("expected a full commit, got {outcome:?}");
    };
    assert_eq!(report.committed, vec![EntryUid(1)]);

    let after = entry(&lorebook, 1).await;
    assert_eq!(after.body, "<summary_1>\nMira defied the king.\n</summary_1>");
    assert!(after.enabled);
    assert!(after.has_summary());
    assert_eq!(after.extra["original_data_removed"], true);

    let prompts = engine.summarizer().prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("[Day 1] Mira: I will not kneel."));
    assert!(!prompts[0].contains("background only"));
}

#[tokio::test]
async fn test_incremental_compaction_uses_context() {
    let body = format!(
        "<summary_1>\nThey met at the gate.\n</summary_1>\n\n{}",
        raw_section(&["[Day 4] Mira: Again?"])
    );
    let (_store, lorebook) = archive_with(ARCHIVE, vec![history(1, "mira", &body)]);
    let engine = engine(lorebook.clone(), MockSummarizer::with_texts(["They sparred again."]));

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    assert!(selection.first_time.is_empty());
    assert_eq!(selection.incremental.len(), 1);
    assert_eq!(selection.incremental[0].mode, CompactionMode::Incremental);

    let outcome = engine
        .compact(&CompactionFilter::all(), |_| ReviewDecision::Accept)
        .await
        .unwrap();
    assert!(matches!(outcome, BatchOutcome::Committed(_)));

    let prompt = &engine.summarizer().prompts()[0];
    let context_at = prompt.find("They met at the gate.").expect("context missing");
    let raw_at = prompt.find("[Day 4] Mira: Again?").expect("raw text missing");
    assert!(context_at < raw_at);

    assert_eq!(
        entry(&lorebook, 1).await.body,
        "<summary_1>\nThey met at the gate.\n</summary_1>\n\n<summary_2>\nThey sparred again.\n</summary_2>"
    );
}

#[tokio::test]
async fn test_summary_indices_are_monotonic() {
    let (_store, lorebook) = archive_with(ARCHIVE, vec![history(1, "mira", "")]);
    let engine = engine(
        lorebook.clone(),
        MockSummarizer::with_texts(["S1", "S2", "S3", "S4"]),
    );

    for round in 1..=4 {
        lorebook
            .modify(ARCHIVE, |entries| {
                let entry = &mut entries[0];
                entry.body = lore_core::record::append(
                    &entry.body,
                    TAG,
                    &[said(&format!("Day {round}"), "Mira", "Another day.")],
                    "{{user}}",
                );
                Ok::<_, lore_core::StoreError>(())
            })
            .await
            .unwrap();

        engine
            .compact(&CompactionFilter::all(), |_| ReviewDecision::Accept)
            .await
            .unwrap();
    }

    let (blocks, raw) = lore_core::record::split_summaries(&entry(&lorebook, 1).await.body);
    assert!(raw.is_empty());
    let indices: Vec<u32> = blocks.iter().map(|b| b.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    let texts: Vec<&str> = blocks.iter().map(|b| b.text.as_str()).collect();
    assert_eq!(texts, vec!["S1", "S2", "S3", "S4"]);
}

#[tokio::test]
async fn test_cancel_restores_entries_exactly() {
    let mut disabled = history(2, "ash", &raw_section(&["[t] Ash: quiet"]));
    disabled.enabled = false;
    let entries = vec![
        history(1, "mira", &raw_section(&["[t] Mira: loud"])),
        disabled,
        Entry::new(EntryUid(3), "Sheet", &EntryKind::Foreign { entry_type: Some("sheet".into()) }, "hp: 3"),
    ];
    let (_store, lorebook) = archive_with(ARCHIVE, entries.clone());
    let engine = engine(lorebook.clone(), MockSummarizer::with_texts(["a", "b"]));

    let outcome = engine
        .compact(&CompactionFilter::all(), |batch| {
            assert_eq!(batch.results.len(), 2);
            ReviewDecision::Cancel
        })
        .await
        .unwrap();

    let BatchOutcome::RolledBack(report) = outcome else {
        panic!("expected a rollback, got {outcome:?}");
    };
    assert_eq!(report.restored, vec![EntryUid(1), EntryUid(2)]);
    assert_eq!(lorebook.get(ARCHIVE).await.unwrap(), entries);
    assert!(engine.staged_entries().await.is_empty());
}

#[tokio::test]
async fn test_failures_are_isolated() {
    let entries = vec![
        history(1, "a", &raw_section(&["[t] A: one"])),
        history(2, "b", &raw_section(&["[t] B: two"])),
        history(3, "c", &raw_section(&["[t] C: three"])),
    ];
    let (_store, lorebook) = archive_with(ARCHIVE, entries.clone());
    let summarizer = MockSummarizer::new(vec![
        MockReply::text("first"),
        MockReply::fail("rate limited"),
        MockReply::text("third"),
    ]);
    let engine = engine(lorebook.clone(), summarizer);

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    let staged = engine.stage(selection).await.unwrap();
    for uid in [1, 2, 3] {
        assert!(!entry(&lorebook, uid).await.enabled);
    }

    let generated = engine.generate(&staged).await.unwrap();
    assert_eq!(generated.results.len(), 2);
    assert_eq!(generated.failures.len(), 1);
    assert_eq!(generated.failures[0].entry_uid, EntryUid(2));
    assert!(generated.failures[0].reason.contains("rate limited"));

    let report = engine.commit(generated).await.unwrap();
    assert_eq!(report.committed, vec![EntryUid(1), EntryUid(3)]);
    assert_eq!(report.pending, vec![EntryUid(2)]);
    assert!(!report.is_complete());

    let failed = entry(&lorebook, 2).await;
    assert!(!failed.enabled);
    assert_eq!(failed.body, entries[1].body);
    assert_eq!(
        engine.staging_state(EntryUid(2)).await,
        StagingState::Staged { original_enabled: true }
    );
    assert_eq!(entry(&lorebook, 3).await.body, "<summary_1>\nthird\n</summary_1>");

    let restored = engine.restore().await.unwrap();
    assert_eq!(restored.restored, vec![EntryUid(2)]);
    assert!(entry(&lorebook, 2).await.enabled);
    assert_eq!(engine.staging_state(EntryUid(2)).await, StagingState::Clean);
}

#[tokio::test]
async fn test_partial_commit_outcome_after_rejection() {
    let entries = vec![
        history(1, "a", &raw_section(&["[t] A: one"])),
        history(2, "b", &raw_section(&["[t] B: two"])),
    ];
    let (_store, lorebook) = archive_with(ARCHIVE, entries);
    let engine = engine(lorebook.clone(), MockSummarizer::with_texts(["x", "y"]));

    let outcome = engine
        .compact(&CompactionFilter::all(), |batch| {
            batch.retain(|uid, _| uid == EntryUid(1));
            ReviewDecision::Accept
        })
        .await
        .unwrap();

    let BatchOutcome::PartiallyCommitted(report) = outcome else {
        panic!("expected a partial commit, got {outcome:?}");
    };
    assert_eq!(report.committed, vec![EntryUid(1)]);
    assert_eq!(report.pending, vec![EntryUid(2)]);
    assert!(!entry(&lorebook, 2).await.enabled);
}

#[tokio::test]
async fn test_restore_after_engine_is_dropped() {
    let entries = vec![
        history(1, "a", &raw_section(&["[t] A: one"])),
        history(2, "b", &raw_section(&["[t] B: two"])),
    ];
    let (_store, lorebook) = archive_with(ARCHIVE, entries.clone());

    {
        let first = engine(
            lorebook.clone(),
            MockSummarizer::new(vec![MockReply::fail("timeout"), MockReply::text("b summary")]),
        );
        let outcome = first
            .compact(&CompactionFilter::all(), |_| ReviewDecision::Accept)
            .await
            .unwrap();
        let BatchOutcome::PartiallyCommitted(report) = outcome else {
            panic!("expected a partial commit, got {outcome:?}");
        };
        assert_eq!(report.pending, vec![EntryUid(1)]);
    }
    assert!(!entry(&lorebook, 1).await.enabled);

    let second = engine(lorebook.clone(), MockSummarizer::with_texts(["unused"]));
    assert!(second.restore().await.unwrap().restored.is_empty());

    let report = second.restore_orphaned(&CompactionFilter::all()).await.unwrap();
    assert_eq!(report.restored, vec![EntryUid(1)]);

    let recovered = entry(&lorebook, 1).await;
    assert!(recovered.enabled);
    assert_eq!(recovered.body, entries[0].body);
    assert!(entry(&lorebook, 2).await.enabled);

    // Nothing left to recover; entries staged by the live engine are not touched.
    let selection = second.select(&CompactionFilter::all()).await.unwrap();
    let staged = second.stage(selection).await.unwrap();
    assert_eq!(staged.entry_uids(), vec![EntryUid(1)]);
    let report = second.restore_orphaned(&CompactionFilter::all()).await.unwrap();
    assert!(report.restored.is_empty());
    assert!(!entry(&lorebook, 1).await.enabled);

    second.rollback(staged.id).await.unwrap();
    assert!(entry(&lorebook, 1).await.enabled);
}

// =============================================================================
// Generation output handling
// =============================================================================

#[tokio::test]
async fn test_echoed_summary_tags_are_stripped() {
    let entries = vec![
        history(1, "a", &raw_section(&["[t] A: one"])),
        history(2, "b", &raw_section(&["[t] B: two"])),
    ];
    let (_store, lorebook) = archive_with(ARCHIVE, entries);
    let summarizer = MockSummarizer::with_texts([
        "<summary_3>\n<summary>Inner prose.</summary>\n</summary_3>",
        "<summary_1>\n\n</summary_1>",
    ]);
    let engine = engine(lorebook.clone(), summarizer);

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    let staged = engine.stage(selection).await.unwrap();
    let generated = engine.generate(&staged).await.unwrap();

    assert_eq!(generated.results[&EntryUid(1)].text, "Inner prose.");
    assert_eq!(generated.failures.len(), 1);
    assert_eq!(generated.failures[0].entry_uid, EntryUid(2));

    engine.commit(generated).await.unwrap();
    assert_eq!(entry(&lorebook, 1).await.body, "<summary_1>\nInner prose.\n</summary_1>");
}

#[tokio::test]
async fn test_foreign_type_uses_generic_prompt() {
    let foreign = Entry::new(
        EntryUid(9),
        "Notes",
        &EntryKind::Foreign { entry_type: Some("notes".into()) },
        "The well is poisoned.",
    );
    let (_store, lorebook) = archive_with(ARCHIVE, vec![foreign]);
    let engine = engine(lorebook.clone(), MockSummarizer::with_texts(["Poisoned well."]));

    assert!(engine.select(&CompactionFilter::all()).await.unwrap().is_empty());

    let filter = CompactionFilter::default().with_foreign_type("notes");
    let outcome = engine.compact(&filter, |_| ReviewDecision::Accept).await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Committed(_)));
    assert!(engine.summarizer().prompts()[0].starts_with("Summarize the following content."));
}

#[tokio::test(start_paused = true)]
async fn test_calls_are_throttled() {
    let entries = (1..=3)
        .map(|i| history(i, &format!("c{i}"), &raw_section(&["[t] X: y"])))
        .collect();
    let (_store, lorebook) = archive_with(ARCHIVE, entries);
    let engine = CompactionEngine::new(lorebook, MockSummarizer::default(), LorebookConfig::new(ARCHIVE));

    engine
        .compact(&CompactionFilter::all(), |_| ReviewDecision::Accept)
        .await
        .unwrap();

    let times = engine.summarizer().call_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(1));
    }
}

// =============================================================================
// Selection
// =============================================================================

#[tokio::test]
async fn test_selection_is_idempotent_on_compacted_entries() {
    let entries = vec![
        history(1, "a", "<summary_1>\nDone.\n</summary_1>"),
        history(2, "b", ""),
    ];
    let (store, lorebook) = archive_with(ARCHIVE, entries);
    let engine = engine(lorebook, MockSummarizer::default());

    for _ in 0..2 {
        assert!(engine.select(&CompactionFilter::all()).await.unwrap().is_empty());
        let outcome = engine
            .compact(&CompactionFilter::all(), |_| ReviewDecision::Accept)
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::NothingToDo);
    }
    assert_eq!(store.replace_count(), 0);
    assert_eq!(engine.summarizer().call_count(), 0);
}

#[tokio::test]
async fn test_selection_filters() {
    let conquest = Entry::new(
        EntryUid(5),
        "Conquest Records",
        &EntryKind::ConquestRecords,
        "<ConquestRecords>\n[Day 1] North/Pass: Orc-Fort\n</ConquestRecords>",
    );
    let entries = vec![
        history(1, "a", &raw_section(&["[t] A: one"])),
        history(2, "b", &raw_section(&["[t] B: two"])),
        conquest,
    ];
    let (_store, lorebook) = archive_with(ARCHIVE, entries);
    let engine = engine(lorebook, MockSummarizer::default());

    let uids = |jobs: Vec<&CompactionJob>| jobs.iter().map(|j| j.entry_uid.0).collect::<Vec<_>>();

    let by_character = engine
        .select(&CompactionFilter::all().with_character("b"))
        .await
        .unwrap();
    assert_eq!(uids(by_character.jobs().collect()), vec![2, 5]);

    let by_type = engine
        .select(&CompactionFilter::all().with_entry_type(EntryType::ConquestRecords))
        .await
        .unwrap();
    assert_eq!(uids(by_type.jobs().collect()), vec![5]);
}

#[tokio::test]
async fn test_min_pending_tokens_threshold() {
    let long_line = format!("[t] A: {}", "word ".repeat(40));
    let entries = vec![
        history(1, "a", &raw_section(&["[t] A: hi"])),
        history(2, "b", &raw_section(&[long_line.as_str()])),
    ];
    let (_store, lorebook) = archive_with(ARCHIVE, entries);
    let engine = engine(lorebook, MockSummarizer::default())
        .with_config(CompactionConfig::default().with_min_pending_tokens(50));

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    assert_eq!(selection.len(), 1);
    assert_eq!(selection.first_time[0].entry_uid, EntryUid(2));
    assert!(selection.estimated_tokens() >= 50);
}

// =============================================================================
// Protocol violations and races
// =============================================================================

#[tokio::test]
async fn test_staging_twice_is_refused() {
    let (store, lorebook) = archive_with(ARCHIVE, vec![history(1, "a", &raw_section(&["[t] A: one"]))]);
    let engine = engine(lorebook, MockSummarizer::default());

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    engine.stage(selection.clone()).await.unwrap();
    let writes = store.replace_count();

    let err = engine.stage(selection).await.unwrap_err();
    assert!(matches!(err, CompactionError::AlreadyStaged(EntryUid(1))));
    assert_eq!(store.replace_count(), writes);

    assert!(engine.select(&CompactionFilter::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_commit_of_unstaged_result_is_refused() {
    let (store, lorebook) = archive_with(ARCHIVE, vec![history(1, "a", &raw_section(&["[t] A: one"]))]);
    let engine = engine(lorebook.clone(), MockSummarizer::default());

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    let staged = engine.stage(selection).await.unwrap();
    let mut generated = engine.generate(&staged).await.unwrap();
    generated.results.insert(
        EntryUid(77),
        GeneratedSummary {
            entry_name: "stray".into(),
            mode: CompactionMode::FirstTime,
            text: "stray".into(),
            source_raw_text: String::new(),
        },
    );
    let writes = store.replace_count();

    let err = engine.commit(generated).await.unwrap_err();
    assert!(matches!(err, CompactionError::NotStaged(EntryUid(77))));
    assert_eq!(store.replace_count(), writes);
    assert!(!entry(&lorebook, 1).await.enabled);
}

#[tokio::test]
async fn test_commit_after_restore_is_unknown_batch() {
    let (_store, lorebook) = archive_with(ARCHIVE, vec![history(1, "a", &raw_section(&["[t] A: one"]))]);
    let engine = engine(lorebook, MockSummarizer::default());

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    let staged = engine.stage(selection).await.unwrap();
    let generated = engine.generate(&staged).await.unwrap();
    engine.restore().await.unwrap();

    assert!(matches!(
        engine.commit(generated).await,
        Err(CompactionError::UnknownBatch(_))
    ));
    assert!(matches!(
        engine.generate(&staged).await,
        Err(CompactionError::UnknownBatch(_))
    ));
}

#[tokio::test]
async fn test_records_appended_while_staged_are_not_lost() {
    let (_store, lorebook) = archive_with(ARCHIVE, vec![history(1, "a", &raw_section(&["[t] A: one"]))]);
    let engine = engine(lorebook.clone(), MockSummarizer::default());

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    let staged = engine.stage(selection).await.unwrap();
    let generated = engine.generate(&staged).await.unwrap();

    lorebook
        .modify(ARCHIVE, |entries| {
            let entry = &mut entries[0];
            entry.body = lore_core::record::append(&entry.body, TAG, &[said("t2", "A", "two")], "{{user}}");
            Ok::<_, lore_core::StoreError>(())
        })
        .await
        .unwrap();

    let report = engine.commit(generated).await.unwrap();
    assert_eq!(report.conflicted, vec![EntryUid(1)]);
    assert!(report.committed.is_empty());

    let after = entry(&lorebook, 1).await;
    assert_eq!(after.body, raw_section(&["[t] A: one", "[t2] A: two"]));
    assert!(!after.enabled);

    engine.restore().await.unwrap();
    assert!(entry(&lorebook, 1).await.enabled);
}

#[tokio::test]
async fn test_deleted_entries_are_reported_missing() {
    let entries = vec![
        history(1, "a", &raw_section(&["[t] A: one"])),
        history(2, "b", &raw_section(&["[t] B: two"])),
    ];
    let (_store, lorebook) = archive_with(ARCHIVE, entries);
    let engine = engine(lorebook.clone(), MockSummarizer::default());

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    let staged = engine.stage(selection).await.unwrap();
    let generated = engine.generate(&staged).await.unwrap();

    lorebook
        .modify(ARCHIVE, |entries| {
            entries.retain(|e| e.uid != EntryUid(2));
            Ok::<_, lore_core::StoreError>(())
        })
        .await
        .unwrap();

    let report = engine.commit(generated).await.unwrap();
    assert_eq!(report.committed, vec![EntryUid(1)]);
    assert_eq!(report.missing, vec![EntryUid(2)]);
    assert!(report.is_complete());
    assert!(engine.staged_entries().await.is_empty());
}

#[tokio::test]
async fn test_failed_stage_persist_changes_nothing() {
    let entries = vec![history(1, "a", &raw_section(&["[t] A: one"]))];
    let (store, lorebook) = archive_with(ARCHIVE, entries.clone());
    let engine = engine(lorebook.clone(), MockSummarizer::default());

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    store.fail_next_writes(1);

    let err = engine.stage(selection).await.unwrap_err();
    assert!(matches!(err, CompactionError::Store(_)));
    assert_eq!(lorebook.get(ARCHIVE).await.unwrap(), entries);
    assert_eq!(engine.staging_state(EntryUid(1)).await, StagingState::Clean);
}

#[tokio::test]
async fn test_failed_commit_keeps_batch_staged() {
    let (store, lorebook) = archive_with(ARCHIVE, vec![history(1, "a", &raw_section(&["[t] A: one"]))]);
    let engine = engine(lorebook.clone(), MockSummarizer::default());

    let selection = engine.select(&CompactionFilter::all()).await.unwrap();
    let staged = engine.stage(selection).await.unwrap();
    let generated = engine.generate(&staged).await.unwrap();

    store.fail_next_writes(1);
    assert!(engine.commit(generated.clone()).await.is_err());
    assert!(matches!(
        engine.staging_state(EntryUid(1)).await,
        StagingState::Staged { .. }
    ));

    let report = engine.commit(generated).await.unwrap();
    assert_eq!(report.committed, vec![EntryUid(1)]);
}
