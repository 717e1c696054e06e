//! Text-generation capability used for persona replies and judge calls.
//!
//! The engine only sees the [`TextGenerator`] trait. [`ClaudeGenerator`]
//! backs it with the Claude API; tests use `testing::MockGenerator`.

use crate::config::EngineConfig;
use crate::model::LogRole;
use async_trait::async_trait;
use claude::{Claude, Message, Request};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Errors from a generation or judge call.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Claude API error: {0}")]
    Api(#[from] claude::Error),

    #[error("Generation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Empty response from model")]
    Empty,
}

impl GenerationError {
    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Api(e) => e.is_transient(),
            GenerationError::Timeout(_) | GenerationError::Empty => true,
        }
    }
}

/// One prior line of the conversation handed to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: LogRole,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: LogRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A capability that produces text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Reply in character to `user_message`, given the conversation so far.
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        user_message: &str,
    ) -> Result<String, GenerationError>;

    /// Answer a self-contained judgment prompt.
    async fn judge(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Placeholder that opens a conversation whose first line is the persona's.
const CONVERSATION_START: &str = "(The conversation begins.)";

/// Claude-backed generator with separate reply and judge models.
#[derive(Clone)]
pub struct ClaudeGenerator {
    client: Claude,
    reply_model: String,
    judge_model: String,
    reply_max_tokens: usize,
    judge_max_tokens: usize,
    temperature: Option<f32>,
}

impl ClaudeGenerator {
    pub fn new(client: Claude, config: &EngineConfig) -> Self {
        Self {
            client,
            reply_model: config.reply_model.clone(),
            judge_model: config.judge_model.clone(),
            reply_max_tokens: config.reply_max_tokens,
            judge_max_tokens: config.judge_max_tokens,
            temperature: config.temperature,
        }
    }

    /// Create from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env(config: &EngineConfig) -> Result<Self, GenerationError> {
        Ok(Self::new(Claude::from_env()?, config))
    }
}

/// Convert history into an alternating message list starting with a user turn.
///
/// Consecutive lines from the same role are merged, which the Messages API
/// requires.
fn build_messages(history: &[ChatTurn], user_message: &str) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::with_capacity(history.len() + 2);

    let lines = history
        .iter()
        .map(|t| (t.role, t.content.as_str()))
        .chain(std::iter::once((LogRole::User, user_message)));

    for (role, content) in lines {
        let role = match role {
            LogRole::User => claude::Role::User,
            LogRole::Assistant => claude::Role::Assistant,
        };
        if messages.is_empty() && role == claude::Role::Assistant {
            messages.push(Message::user(CONVERSATION_START));
        }
        match messages.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(content);
            }
            _ => messages.push(Message {
                role,
                content: content.to_string(),
            }),
        }
    }

    messages
}

#[async_trait]
impl TextGenerator for ClaudeGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        user_message: &str,
    ) -> Result<String, GenerationError> {
        let mut request = Request::new(build_messages(history, user_message))
            .with_system(system_prompt)
            .with_model(&self.reply_model)
            .with_max_tokens(self.reply_max_tokens);

        if let Some(temp) = self.temperature {
            request = request.with_temperature(temp);
        }

        let text = self.client.complete(request).await?.text();
        if text.trim().is_empty() {
            return Err(GenerationError::Empty);
        }
        Ok(text.trim().to_string())
    }

    async fn judge(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = Request::new(vec![Message::user(prompt)])
            .with_model(&self.judge_model)
            .with_max_tokens(self.judge_max_tokens)
            .with_temperature(0.0); // Deterministic for judgments

        let text = self.client.complete(request).await?.text();
        Ok(text.trim().to_string())
    }
}

/// Bounds every call of an inner generator by a fixed deadline.
pub struct TimeoutGenerator {
    inner: Arc<dyn TextGenerator>,
    limit: Duration,
}

impl TimeoutGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    fn expired(&self) -> GenerationError {
        GenerationError::Timeout(self.limit.as_secs())
    }
}

#[async_trait]
impl TextGenerator for TimeoutGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        user_message: &str,
    ) -> Result<String, GenerationError> {
        timeout(self.limit, self.inner.generate(system_prompt, history, user_message))
            .await
            .map_err(|_| self.expired())?
    }

    async fn judge(&self, prompt: &str) -> Result<String, GenerationError> {
        timeout(self.limit, self.inner.judge(prompt))
            .await
            .map_err(|_| self.expired())?
    }
}
