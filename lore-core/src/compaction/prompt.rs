//! Prompt templates for summarizer calls.

use super::{CompactionJob, CompactionMode};
use crate::entry::EntryType;
use crate::record::SummaryBlock;

/// Build the full prompt for a job.
///
/// Incremental jobs get their existing summaries as read-only background
/// ahead of the per-type instructions. Without any non-blank summary there
/// is no background and the base prompt is used as is.
pub fn build_prompt(job: &CompactionJob) -> String {
    let base = base_prompt(job.entry_type, &job.raw_text);
    match job.mode {
        CompactionMode::FirstTime => base,
        CompactionMode::Incremental => match background(&job.context_summaries) {
            Some(background) => wrap_incremental(&background, &base),
            None => base,
        },
    }
}

/// Per-type instructions around the raw text.
pub fn base_prompt(entry_type: Option<EntryType>, raw_text: &str) -> String {
    match entry_type {
        Some(EntryType::ConquestRecords) => conquest_prompt(raw_text),
        Some(EntryType::GameEventStory) => event_prompt(raw_text),
        Some(EntryType::CharacterStoryHistory) => character_prompt(raw_text),
        None => generic_prompt(raw_text),
    }
}

fn background(context: &[SummaryBlock]) -> Option<String> {
    let texts: Vec<&str> = context
        .iter()
        .map(|block| block.text.trim())
        .filter(|text| !text.is_empty())
        .collect();
    (!texts.is_empty()).then(|| texts.join("\n\n"))
}

fn wrap_incremental(background: &str, base: &str) -> String {
    format!(
        "The following is the existing summary of this record. It is background \
only; do not summarize it again:\n\n{background}\n\n---\n\n\
Now summarize only the new material below. Do not repeat the history above, \
but keep the story continuous with it.\n\n{base}"
    )
}

fn conquest_prompt(raw_text: &str) -> String {
    format!(
        r#"Below are the conquest records of the lair's expansion. Merge these scattered entries into one coherent history of the conquest.

## Records
{raw_text}

## Instructions
- Follow the order of events and the geography of the campaign.
- Give prominence to the largest and hardest locations taken.
- Name the notable figures captured and what is known about them.
- Show how the conquest spread and grew in scale.
- Write in a neutral, chronicle-like voice and keep location names, regions and types.

## Output
Write connected paragraphs with no numbering or tags. Output only the summary, with no analysis or commentary."#
    )
}

fn event_prompt(raw_text: &str) -> String {
    format!(
        r#"Below are the records of a world event. Merge these scattered passages into one coherent narrative.

## Records
{raw_text}

## Instructions
- Use a third-person narrator, neutral like a chronicle but vivid.
- Keep the timeline and the causes and effects between passages.
- Describe the impact on factions, peoples and regions, and the reactions it provoked.
- Keep the key people, places and plot details.

## Output
Write 400 to 800 words of connected paragraphs, scaled to how much happened. No numbering or lists. Output only the narrative, with no analysis or commentary."#
    )
}

fn character_prompt(raw_text: &str) -> String {
    format!(
        r#"Below is the detailed interaction log of one character: conversations, training, battles and everything else on record.
Extract the core events as a structured history of at least 10 events.

## Records
{raw_text}

## Instructions
- Split the log, in order, into 10 or more separate events. Each event covers one action or change.
- For each event note, only where the log gives evidence: time, location, the characters involved, and relationships that matter to it.
- Describe each event objectively and in full. Keep key lines of dialogue.
- Show how the character's relationships, temperament and allegiance change.

## Output
One event per line, formatted as:
N: (Time | Location | Characters) description
Omit any context field the log does not support. Output only the formatted lines, with no analysis or commentary."#
    )
}

fn generic_prompt(raw_text: &str) -> String {
    format!(
        "Summarize the following content. Extract the key information and keep important details:\n\n{raw_text}"
    )
}
