//! Append records to an entry body without re-parsing it.
//!
//! Bodies grow for the whole play session, so appends splice the rendered
//! records in front of the raw section's closing tag instead of parsing and
//! re-rendering everything. Summary blocks and foreign sections are carried
//! over byte for byte.

use super::codec::{render, render_section, summary_spans};
use super::NarrativeRecord;

/// Append `records` to the raw section named `tag`.
///
/// If the section does not exist yet a new one is created after the existing
/// content, separated by a blank line. Appending nothing returns the body
/// unchanged.
pub fn append(body: &str, tag: &str, records: &[NarrativeRecord], user_placeholder: &str) -> String {
    if records.is_empty() {
        return body.to_string();
    }

    let Some(close_at) = locate_closing_tag(body, tag) else {
        tracing::debug!(tag, records = records.len(), "creating raw section");
        let section = render_section(tag, records, user_placeholder);
        let existing = body.trim_end();
        return if existing.is_empty() {
            section
        } else {
            format!("{existing}\n\n{section}")
        };
    };

    let rendered = render(records, user_placeholder);
    let (before, after) = body.split_at(close_at);

    let mut out = String::with_capacity(body.len() + rendered.len() + 2);
    out.push_str(before);
    if !before.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&rendered);
    out.push('\n');
    out.push_str(after);

    tracing::debug!(tag, records = records.len(), "spliced records into raw section");
    out
}

/// Byte offset of the raw section's closing tag.
///
/// Tags echoed inside summary prose are skipped, so this finds the same
/// section [`parse`](super::parse) reads.
fn locate_closing_tag(body: &str, tag: &str) -> Option<usize> {
    let spans: Vec<_> = summary_spans(body).into_iter().map(|(range, _)| range).collect();
    let outside = |at: usize| !spans.iter().any(|span| span.contains(&at));

    let close_at = body
        .rmatch_indices(&format!("</{tag}>"))
        .map(|(at, _)| at)
        .find(|&at| outside(at))?;
    body[..close_at]
        .rmatch_indices(&format!("<{tag}>"))
        .map(|(at, _)| at)
        .find(|&at| outside(at))?;
    Some(close_at)
}
