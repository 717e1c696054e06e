//! Engine configuration.

use std::time::Duration;

/// Default model for persona replies.
const DEFAULT_REPLY_MODEL: &str = "claude-sonnet-4-20250514";

/// Default model for judge calls (fast and cheap).
const DEFAULT_JUDGE_MODEL: &str = "claude-3-5-haiku-20241022";

/// Configuration for the dialogue engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model used for in-character replies.
    pub reply_model: String,

    /// Model used for relevance, pass and consolidation judgments.
    pub judge_model: String,

    /// Maximum tokens for a reply.
    pub reply_max_tokens: usize,

    /// Maximum tokens for a judgment.
    pub judge_max_tokens: usize,

    /// Temperature for reply generation.
    pub temperature: Option<f32>,

    /// Lower bound on the hot-tier consolidation target.
    pub min_hot_capacity: usize,

    /// Deadline for any single generation or judge call.
    pub call_timeout: Duration,

    /// Attempts at a conditional session write before giving up.
    pub persist_attempts: u32,

    /// Backoff before the first retry; doubled on each further retry.
    pub persist_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reply_model: DEFAULT_REPLY_MODEL.to_string(),
            judge_model: DEFAULT_JUDGE_MODEL.to_string(),
            reply_max_tokens: 1024,
            judge_max_tokens: 512,
            temperature: Some(0.7),
            min_hot_capacity: 3,
            call_timeout: Duration::from_secs(60),
            persist_attempts: 5,
            persist_backoff: Duration::from_millis(20),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `ROLEPLAY_*` environment variables.
    ///
    /// Unset or malformed values keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(model) = std::env::var("ROLEPLAY_REPLY_MODEL") {
            if !model.trim().is_empty() {
                config.reply_model = model;
            }
        }
        if let Ok(model) = std::env::var("ROLEPLAY_JUDGE_MODEL") {
            if !model.trim().is_empty() {
                config.judge_model = model;
            }
        }
        if let Some(secs) = std::env::var("ROLEPLAY_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.call_timeout = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_reply_model(mut self, model: impl Into<String>) -> Self {
        self.reply_model = model.into();
        self
    }

    pub fn with_judge_model(mut self, model: impl Into<String>) -> Self {
        self.judge_model = model.into();
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_min_hot_capacity(mut self, capacity: usize) -> Self {
        self.min_hot_capacity = capacity;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_persist_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_attempts = attempts.max(1);
        self.persist_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.min_hot_capacity, 3);
        assert_eq!(config.persist_attempts, 5);
        assert_eq!(config.judge_model, DEFAULT_JUDGE_MODEL);
    }

    #[test]
    fn test_persist_retries_never_zero() {
        let config = EngineConfig::new().with_persist_retries(0, Duration::ZERO);
        assert_eq!(config.persist_attempts, 1);
    }
}
