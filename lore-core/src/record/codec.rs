//! Conversion between narrative records and entry body text.
//!
//! An entry body is zero or more summary blocks followed by tagged raw
//! sections:
//!
//! ```text
//! <summary_1>
//! prose...
//! </summary_1>
//!
//! <summary_2>
//! prose...
//! </summary_2>
//!
//! <training_history>
//! [Day 3, dusk] Mira: We leave at dawn.
//! [Day 3, night] {{user}}: Agreed.
//! </training_history>
//! ```
//!
//! Parsing is tolerant: missing tags, summary-only bodies and stray summary
//! tags are recovered locally and never surface as errors.

use super::{NarrativeRecord, Sender};
use regex::Regex;
use std::ops::Range;

/// Placeholder used for the user voice in rendered logs.
pub const DEFAULT_USER_PLACEHOLDER: &str = "{{user}}";

/// Rendered in place of an empty game time.
const UNKNOWN_TIME: &str = "Unknown time";

/// Rendered in place of an empty sender name.
const UNKNOWN_SENDER: &str = "Unknown";

lazy_static::lazy_static! {
    /// Opening tag of an indexed (`<summary_3>`) or legacy (`<summary>`) block.
    static ref SUMMARY_OPEN: Regex =
        Regex::new(r"<summary(?:_(\d+))?>").expect("summary open pattern is valid");

    /// Any summary tag, opening or closing.
    static ref SUMMARY_TAG: Regex =
        Regex::new(r"</?summary(?:_\d+)?>").expect("summary tag pattern is valid");

    /// `[time] sender: content`
    static ref RECORD_LINE: Regex =
        Regex::new(r"^\[(.+?)\] (.+?): (.*)$").expect("record line pattern is valid");
}

/// An immutable prose compaction of an earlier raw section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryBlock {
    /// Position in the entry's summary sequence. `0` marks a legacy unindexed block.
    pub index: u32,
    /// The prose, trimmed.
    pub text: String,
}

impl SummaryBlock {
    pub fn new(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }

    /// Render as persisted markup.
    pub fn render(&self) -> String {
        if self.index == 0 {
            format!("<summary>\n{}\n</summary>", self.text)
        } else {
            format!("<summary_{0}>\n{1}\n</summary_{0}>", self.index, self.text)
        }
    }
}

/// Result of parsing one raw section out of a body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLog {
    pub summaries: Vec<SummaryBlock>,
    pub raw_records: Vec<NarrativeRecord>,
}

impl ParsedLog {
    /// A body made only of summaries: everything has been compacted.
    pub fn is_fully_compacted(&self) -> bool {
        !self.summaries.is_empty() && self.raw_records.is_empty()
    }

    /// Highest summary index present (0 when none).
    pub fn max_summary_index(&self) -> u32 {
        self.summaries.iter().map(|s| s.index).max().unwrap_or(0)
    }
}

/// Byte ranges of the well-formed summary blocks in `body`, with their content.
///
/// Opening tags without a matching closing tag are not blocks.
pub(crate) fn summary_spans(body: &str) -> Vec<(Range<usize>, SummaryBlock)> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(open) = SUMMARY_OPEN.captures_at(body, cursor) {
        let whole = open.get(0).map(|m| (m.start(), m.end()));
        let Some((start, inner_start)) = whole else {
            break;
        };
        let number = open.get(1).map(|m| m.as_str());
        let index = number.and_then(|n| n.parse::<u32>().ok()).unwrap_or(0);
        let close_tag = match number {
            Some(n) => format!("</summary_{n}>"),
            None => "</summary>".to_string(),
        };

        match body[inner_start..].find(&close_tag) {
            Some(rel) => {
                let inner_end = inner_start + rel;
                let end = inner_end + close_tag.len();
                spans.push((start..end, SummaryBlock::new(index, body[inner_start..inner_end].trim())));
                cursor = end;
            }
            None => {
                tracing::debug!(index, "unclosed summary tag left in raw text");
                cursor = inner_start;
            }
        }
    }
    spans
}

/// Split a body into its summary blocks and the trimmed remainder.
///
/// The remainder is every byte outside a well-formed summary block, i.e. the
/// text that has not been compacted yet. Opening tags without a matching
/// closing tag are left in the remainder.
pub fn split_summaries(body: &str) -> (Vec<SummaryBlock>, String) {
    let mut summaries = Vec::new();
    let mut remainder = String::new();
    let mut cursor = 0;

    for (range, block) in summary_spans(body) {
        remainder.push_str(&body[cursor..range.start]);
        summaries.push(block);
        cursor = range.end;
    }
    remainder.push_str(&body[cursor..]);

    (summaries, remainder.trim().to_string())
}

/// Parse the summaries and the records of the raw section named `tag`.
///
/// When the section appears more than once the last one is read, matching
/// where [`append`](super::append) inserts.
pub fn parse(body: &str, tag: &str, user_placeholder: &str) -> ParsedLog {
    let (summaries, remainder) = split_summaries(body);

    let Some(section) = raw_section(&remainder, tag) else {
        if remainder.is_empty() && !summaries.is_empty() {
            tracing::debug!(tag, "body is fully compacted");
        } else if !remainder.is_empty() {
            tracing::debug!(tag, "raw section tag not present");
        }
        return ParsedLog {
            summaries,
            raw_records: Vec::new(),
        };
    };

    ParsedLog {
        summaries,
        raw_records: parse_records(section, user_placeholder),
    }
}

fn raw_section<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let close_at = text.rfind(&close)?;
    let open_at = text[..close_at].rfind(&open)?;
    Some(&text[open_at + open.len()..close_at])
}

/// Parse record lines. Lines that do not start a record continue the previous one.
fn parse_records(section: &str, user_placeholder: &str) -> Vec<NarrativeRecord> {
    let mut records: Vec<NarrativeRecord> = Vec::new();

    for line in section.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(caps) = RECORD_LINE.captures(line) {
            let time = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let sender = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let content = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            let sender = if sender == user_placeholder {
                Sender::User
            } else {
                Sender::Named(sender.to_string())
            };
            records.push(NarrativeRecord {
                game_time: time.to_string(),
                sender,
                content: content.trim().to_string(),
                timestamp: records.len() as i64,
            });
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match records.last_mut() {
            Some(current) if current.content.is_empty() => current.content = trimmed.to_string(),
            Some(current) => {
                current.content.push('\n');
                current.content.push_str(trimmed);
            }
            None => tracing::debug!(line = trimmed, "text before first record ignored"),
        }
    }

    for record in &mut records {
        if !record.sender.is_user() && !record.content.is_empty() {
            record.content = clean_prose_content(&record.content);
        }
    }
    records
}

/// Normalize AI-authored prose: trim lines, drop blank ones, separate
/// paragraphs with one blank line.
pub fn clean_prose_content(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_line(record: &NarrativeRecord, user_placeholder: &str) -> String {
    let time = if record.game_time.trim().is_empty() {
        UNKNOWN_TIME
    } else {
        record.game_time.as_str()
    };
    let sender = match &record.sender {
        Sender::User => user_placeholder,
        Sender::Named(name) if name.trim().is_empty() => UNKNOWN_SENDER,
        Sender::Named(name) => name.as_str(),
    };
    format!("[{time}] {sender}: {}", record.content)
}

/// Render records one per line, without a trailing newline.
pub fn render(records: &[NarrativeRecord], user_placeholder: &str) -> String {
    records
        .iter()
        .map(|r| render_line(r, user_placeholder))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a complete raw section wrapped in `tag`.
pub fn render_section(tag: &str, records: &[NarrativeRecord], user_placeholder: &str) -> String {
    if records.is_empty() {
        return format!("<{tag}>\n</{tag}>");
    }
    format!("<{tag}>\n{}\n</{tag}>", render(records, user_placeholder))
}

/// Render summary blocks in the given order, separated by a blank line.
pub fn render_summaries(blocks: &[SummaryBlock]) -> String {
    blocks
        .iter()
        .map(SummaryBlock::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Remove every summary tag a generator may have echoed back.
///
/// Tags are removed repeatedly, since removing one can join the halves of
/// another. Returns `None` when nothing but whitespace is left.
pub fn strip_summary_tags(text: &str) -> Option<String> {
    let mut current = text.to_string();
    loop {
        let next = SUMMARY_TAG.replace_all(&current, "").into_owned();
        if next == current {
            break;
        }
        current = next;
    }

    let trimmed = current.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Rough token estimate: CJK ideographs count 2, everything else 0.5.
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if ('\u{4e00}'..='\u{9fa5}').contains(&c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    (4 * cjk + other).div_ceil(2)
}
