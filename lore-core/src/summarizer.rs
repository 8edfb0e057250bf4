//! The external text generator used by compaction.
//!
//! Compaction only needs "prompt in, prose out". The engine is written
//! against [`Summarizer`]; [`ClaudeSummarizer`] is the production backend and
//! [`MockSummarizer`](crate::testing::MockSummarizer) the scripted one.

use crate::config::CompactionConfig;
use async_trait::async_trait;
use claude::{Claude, Message, Request, StopReason};
use std::sync::Arc;
use thiserror::Error;

/// Errors from a summarizer call.
#[derive(Debug, Error)]
pub enum SummarizerError {
    #[error("Generation failed: {0}")]
    Backend(String),

    #[error("Generated text was empty")]
    Empty,
}

impl From<claude::Error> for SummarizerError {
    fn from(e: claude::Error) -> Self {
        SummarizerError::Backend(e.to_string())
    }
}

/// Turns a prompt into generated prose.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Generate text for `prompt`. No retries are expected.
    async fn generate(&self, prompt: &str) -> Result<String, SummarizerError>;
}

#[async_trait]
impl<S: Summarizer + ?Sized> Summarizer for Arc<S> {
    async fn generate(&self, prompt: &str) -> Result<String, SummarizerError> {
        (**self).generate(prompt).await
    }
}

/// Summarizer backed by the Claude Messages API.
#[derive(Clone)]
pub struct ClaudeSummarizer {
    client: Claude,
    system: Option<String>,
    max_tokens: usize,
    temperature: Option<f32>,
}

impl ClaudeSummarizer {
    /// Wrap a configured client.
    pub fn new(client: Claude) -> Self {
        Self {
            client,
            system: Some(
                "You are the chronicler of a long-running story. You condense raw logs \
                 into faithful prose without inventing events."
                    .to_string(),
            ),
            max_tokens: 4096,
            temperature: Some(0.3),
        }
    }

    /// Build from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env() -> Result<Self, SummarizerError> {
        Ok(Self::new(Claude::from_env()?))
    }

    /// Wrap a client, taking the output budget from compaction settings.
    pub fn with_config(client: Claude, config: &CompactionConfig) -> Self {
        Self::new(client).with_max_tokens(config.max_summary_tokens)
    }

    /// Replace the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set the output token budget.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn build_request(&self, prompt: &str) -> Request {
        let mut request =
            Request::new(vec![Message::user(prompt)]).with_max_tokens(self.max_tokens);
        if let Some(system) = &self.system {
            request = request.with_system(system.clone());
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }
}

#[async_trait]
impl Summarizer for ClaudeSummarizer {
    async fn generate(&self, prompt: &str) -> Result<String, SummarizerError> {
        let response = self.client.complete(self.build_request(prompt)).await?;
        if response.stop_reason == StopReason::MaxTokens {
            tracing::warn!(
                output_tokens = response.usage.output_tokens,
                "summary hit the token limit and may be truncated"
            );
        }
        if response.text.trim().is_empty() {
            return Err(SummarizerError::Empty);
        }
        Ok(response.text)
    }
}
