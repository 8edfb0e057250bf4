//! Testing utilities.
//!
//! - `MockSummarizer` for deterministic compaction runs without API calls
//! - `archive_with` to seed an in-memory lorebook
//! - Record builders for scripted logs

use crate::entry::Entry;
use crate::record::{NarrativeRecord, Sender};
use crate::store::{InMemoryStore, Lorebook};
use crate::summarizer::{Summarizer, SummarizerError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// A scripted reply from the mock summarizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Return this text.
    Text(String),
    /// Fail with a backend error.
    Fail(String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        MockReply::Fail(reason.into())
    }
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    prompts: Vec<String>,
    call_times: Vec<Instant>,
}

/// A summarizer that returns scripted replies in order.
///
/// Every prompt is recorded, along with the (tokio) time of the call, so
/// tests can check prompt content and throttling. Once the script runs out
/// each call echoes a fixed summary.
#[derive(Debug, Default)]
pub struct MockSummarizer {
    state: Mutex<MockState>,
}

impl MockSummarizer {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            state: Mutex::new(MockState {
                replies: replies.into(),
                ..MockState::default()
            }),
        }
    }

    /// A summarizer that answers every call with the given texts, in order.
    pub fn with_texts<I, T>(texts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| MockReply::Text(t.into())).collect())
    }

    /// Add a reply to the end of the script.
    pub fn queue(&self, reply: MockReply) {
        self.lock().replies.push_back(reply);
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.lock().prompts.clone()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.lock().prompts.len()
    }

    /// Tokio time of each call.
    pub fn call_times(&self) -> Vec<Instant> {
        self.lock().call_times.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread poisons the lock; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn generate(&self, prompt: &str) -> Result<String, SummarizerError> {
        let reply = {
            let mut state = self.lock();
            state.prompts.push(prompt.to_string());
            state.call_times.push(Instant::now());
            state.replies.pop_front()
        };

        match reply {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(reason)) => Err(SummarizerError::Backend(reason)),
            None => Ok("The story continued without incident.".to_string()),
        }
    }
}

/// An in-memory store holding one collection, and a lorebook over it.
pub fn archive_with(collection: &str, entries: Vec<Entry>) -> (Arc<InMemoryStore>, Arc<Lorebook>) {
    let store = Arc::new(InMemoryStore::new().with_collection(collection, entries));
    let lorebook = Arc::new(Lorebook::from_shared(store.clone()));
    (store, lorebook)
}

/// A record spoken by a named character.
pub fn said(game_time: &str, sender: &str, content: &str) -> NarrativeRecord {
    NarrativeRecord::new(game_time, Sender::named(sender), content)
}
