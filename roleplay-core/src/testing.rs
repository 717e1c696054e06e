//! Testing utilities for the dialogue engine.
//!
//! This module provides tools for integration testing:
//! - `MockGenerator` for deterministic replies and judgments without API calls
//! - `TestHarness` for scripted course runs against in-memory stores
//! - Assertion helpers for verifying session state

use crate::catalog::{Activity, Agent, Course, InMemoryCatalog, PassCondition, Unit};
use crate::config::EngineConfig;
use crate::engine::{ChatResponse, DialogueEngine, EngineError};
use crate::llm::{ChatTurn, GenerationError, TextGenerator};
use crate::memory::{InMemoryMemoryRepository, MemoryEntry, MemoryTier};
use crate::model::{Session, SessionKey, UnitStatus};
use crate::persist::InMemoryDocumentStore;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Reply used once scripted replies run out.
pub const DEFAULT_REPLY: &str = "I see. Please go on.";

/// Judgment used once scripted judgments run out; every judge parser reads
/// it as "nothing" or "not passed".
pub const DEFAULT_JUDGMENT: &str = "none";

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<String>,
    judgments: VecDeque<String>,
    judge_rules: Vec<(String, String)>,
    fail_generate: bool,
    fail_judge: bool,
    generate_calls: usize,
    judge_calls: usize,
    system_prompts: Vec<String>,
    histories: Vec<Vec<ChatTurn>>,
    judge_prompts: Vec<String>,
}

/// A text generator that returns scripted responses.
///
/// Judge prompts are answered by the first rule whose needle appears in the
/// prompt, then by the scripted queue, then by [`DEFAULT_JUDGMENT`].
#[derive(Debug, Default)]
pub struct MockGenerator {
    state: Mutex<MockState>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue replies returned by `generate`, in order.
    pub fn with_replies<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().replies.extend(replies.into_iter().map(Into::into));
        self
    }

    /// Queue answers returned by `judge`, in order.
    pub fn with_judgments<I, S>(self, judgments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().judgments.extend(judgments.into_iter().map(Into::into));
        self
    }

    /// Answer every judge prompt containing `needle` with `answer`.
    pub fn with_judge_rule(self, needle: impl Into<String>, answer: impl Into<String>) -> Self {
        self.state().judge_rules.push((needle.into(), answer.into()));
        self
    }

    pub fn failing_generate(self) -> Self {
        self.set_generate_failure(true);
        self
    }

    pub fn failing_judge(self) -> Self {
        self.set_judge_failure(true);
        self
    }

    pub fn queue_reply(&self, reply: impl Into<String>) {
        self.state().replies.push_back(reply.into());
    }

    pub fn queue_judgment(&self, judgment: impl Into<String>) {
        self.state().judgments.push_back(judgment.into());
    }

    pub fn set_generate_failure(&self, fail: bool) {
        self.state().fail_generate = fail;
    }

    pub fn set_judge_failure(&self, fail: bool) {
        self.state().fail_judge = fail;
    }

    pub fn generate_calls(&self) -> usize {
        self.state().generate_calls
    }

    pub fn judge_calls(&self) -> usize {
        self.state().judge_calls
    }

    /// System prompts seen by `generate`, oldest first.
    pub fn system_prompts(&self) -> Vec<String> {
        self.state().system_prompts.clone()
    }

    /// History passed to each `generate` call, oldest first.
    pub fn histories(&self) -> Vec<Vec<ChatTurn>> {
        self.state().histories.clone()
    }

    /// Prompts seen by `judge`, oldest first.
    pub fn judge_prompts(&self) -> Vec<String> {
        self.state().judge_prompts.clone()
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        _user_message: &str,
    ) -> Result<String, GenerationError> {
        let mut state = self.state();
        state.generate_calls += 1;
        state.system_prompts.push(system_prompt.to_string());
        state.histories.push(history.to_vec());

        if state.fail_generate {
            return Err(GenerationError::Api(claude::Error::Network("scripted generation failure".into())));
        }
        Ok(state
            .replies
            .pop_front()
            .unwrap_or_else(|| DEFAULT_REPLY.to_string()))
    }

    async fn judge(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut state = self.state();
        state.judge_calls += 1;
        state.judge_prompts.push(prompt.to_string());

        if state.fail_judge {
            return Err(GenerationError::Api(claude::Error::Network("scripted judge failure".into())));
        }
        if let Some((_, answer)) = state.judge_rules.iter().find(|(needle, _)| prompt.contains(needle.as_str())) {
            return Ok(answer.clone());
        }
        Ok(state
            .judgments
            .pop_front()
            .unwrap_or_else(|| DEFAULT_JUDGMENT.to_string()))
    }
}

// ============================================================================
// Sample content
// ============================================================================

pub const SAMPLE_ACTIVITY: &str = "refund-desk";
pub const SAMPLE_AGENT: &str = "mrs-tanaka";
pub const SAMPLE_COURSE: &str = "complaints-101";
pub const SAMPLE_USER: &str = "learner-1";
pub const SAMPLE_SESSION: &str = "S1";

/// Two-unit course: a keyword-gated greeting, then a judged apology.
pub fn sample_course() -> Course {
    Course {
        id: SAMPLE_COURSE.into(),
        name: "Handling complaints".into(),
        description: "Calm an unhappy customer and resolve the issue.".into(),
        units: vec![
            Unit {
                id: "greeting".into(),
                title: "First contact".into(),
                order: 1,
                intro_message: Some("Excuse me, is anyone working here?".into()),
                outro_message: Some("Well, at least you're polite.".into()),
                max_turns: 3,
                pass_condition: PassCondition::Keyword(vec!["thanks".into()]),
                behavior_prompt: "Be impatient until the learner thanks you for waiting.".into(),
                agent_role: "Customer with a broken kettle".into(),
                user_role: "Shop clerk".into(),
            },
            Unit {
                id: "apology".into(),
                title: "The complaint".into(),
                order: 2,
                intro_message: Some("This kettle broke after two days!".into()),
                outro_message: None,
                max_turns: 2,
                pass_condition: PassCondition::Llm(vec!["The learner apologises sincerely".into()]),
                behavior_prompt: "Stay upset until the learner apologises.".into(),
                agent_role: "Customer with a broken kettle".into(),
                user_role: "Shop clerk".into(),
            },
        ],
    }
}

/// Persona with two hot and one cold baseline memory.
pub fn sample_agent() -> Agent {
    Agent {
        id: SAMPLE_AGENT.into(),
        name: "Mrs. Tanaka".into(),
        tone: "curt but fair".into(),
        background: "Retired schoolteacher who buys appliances locally.".into(),
        voice: "Short sentences.".into(),
        memories: vec![
            MemoryEntry::baseline(SAMPLE_AGENT, MemoryTier::Hot, "Bought a kettle here two days ago"),
            MemoryEntry::baseline(SAMPLE_AGENT, MemoryTier::Hot, "Values politeness above all"),
            MemoryEntry::baseline(SAMPLE_AGENT, MemoryTier::Cold, "Has a receipt in her handbag"),
        ],
    }
}

pub fn sample_activity() -> Activity {
    Activity {
        id: SAMPLE_ACTIVITY.into(),
        name: "Refund desk".into(),
        description: "A customer returns a faulty kettle.".into(),
        agent_id: SAMPLE_AGENT.into(),
        course_id: SAMPLE_COURSE.into(),
        memories: Vec::new(),
    }
}

pub fn sample_catalog() -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_agent(sample_agent())
        .with_activity(sample_activity())
        .with_course(sample_course())
}

// ============================================================================
// Harness
// ============================================================================

/// Engine wired to a [`MockGenerator`], the sample catalog and in-memory stores.
pub struct TestHarness {
    pub engine: Arc<DialogueEngine>,
    pub generator: Arc<MockGenerator>,
    pub memories: Arc<InMemoryMemoryRepository>,
    pub documents: Arc<InMemoryDocumentStore>,
    pub session_code: String,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(MockGenerator::new(), sample_catalog(), EngineConfig::default())
    }

    pub fn with_generator(generator: MockGenerator) -> Self {
        Self::build(generator, sample_catalog(), EngineConfig::default())
    }

    pub fn build(generator: MockGenerator, catalog: InMemoryCatalog, config: EngineConfig) -> Self {
        let generator = Arc::new(generator);
        let memories = Arc::new(InMemoryMemoryRepository::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let engine = DialogueEngine::new(
            Arc::new(catalog),
            generator.clone(),
            memories.clone(),
            documents.clone(),
            config,
        );

        Self {
            engine: Arc::new(engine),
            generator,
            memories,
            documents,
            session_code: SAMPLE_SESSION.into(),
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(SAMPLE_ACTIVITY, SAMPLE_USER, &self.session_code)
    }

    pub async fn initialize(&self) -> Result<Session, EngineError> {
        self.engine
            .initialize(SAMPLE_ACTIVITY, &self.session_code, SAMPLE_USER, "Ken")
            .await
    }

    /// Send a learner message on the sample session.
    pub async fn say(&self, message: &str) -> Result<ChatResponse, EngineError> {
        self.engine
            .chat(SAMPLE_ACTIVITY, &self.session_code, SAMPLE_USER, message)
            .await
    }

    /// Current stored session; panics if it does not exist.
    pub async fn session(&self) -> Session {
        self.engine
            .session(SAMPLE_ACTIVITY, &self.session_code, SAMPLE_USER)
            .await
            .expect("session lookup failed")
            .expect("session not initialized")
    }

    /// Stored dynamic entries of the sample scope.
    pub async fn dynamic_memories(&self) -> Vec<MemoryEntry> {
        self.memories.all().await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert that `unit_id` exists in the session with the given status.
#[track_caller]
pub fn assert_unit_status(session: &Session, unit_id: &str, status: UnitStatus) {
    let unit = session
        .unit(unit_id)
        .unwrap_or_else(|| panic!("Expected unit '{unit_id}' in session"));
    assert_eq!(
        unit.status, status,
        "Expected unit '{unit_id}' to be {}, got {}",
        status.name(),
        unit.status.name()
    );
}

/// Assert the turn count of `unit_id`.
#[track_caller]
pub fn assert_turns(session: &Session, unit_id: &str, turns: u32) {
    let actual = session.turn_count(unit_id);
    assert_eq!(actual, turns, "Expected {turns} turns in '{unit_id}', got {actual}");
}

/// Assert the number of log lines in `unit_id`.
#[track_caller]
pub fn assert_log_count(session: &Session, unit_id: &str, count: usize) {
    let actual = session.unit(unit_id).map(|u| u.conversation_logs.len()).unwrap_or(0);
    assert_eq!(actual, count, "Expected {count} log lines in '{unit_id}', got {actual}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_generator_scripts_then_defaults() {
        let mock = MockGenerator::new()
            .with_replies(["Response 1", "Response 2"])
            .with_judgments(["1"]);

        assert_eq!(mock.generate("sys", &[], "a").await.unwrap(), "Response 1");
        assert_eq!(mock.generate("sys", &[], "b").await.unwrap(), "Response 2");
        assert_eq!(mock.generate("sys", &[], "c").await.unwrap(), DEFAULT_REPLY);
        assert_eq!(mock.judge("pick").await.unwrap(), "1");
        assert_eq!(mock.judge("pick").await.unwrap(), DEFAULT_JUDGMENT);

        assert_eq!(mock.generate_calls(), 3);
        assert_eq!(mock.judge_calls(), 2);
    }

    #[tokio::test]
    async fn test_judge_rules_take_precedence() {
        let mock = MockGenerator::new()
            .with_judgments(["queued"])
            .with_judge_rule("Pass Criteria", "YES");

        assert_eq!(mock.judge("## Pass Criteria\n...").await.unwrap(), "YES");
        assert_eq!(mock.judge("other").await.unwrap(), "queued");
    }

    #[tokio::test]
    async fn test_failures_can_be_toggled() {
        let mock = MockGenerator::new().failing_generate();
        assert!(mock.generate("sys", &[], "a").await.is_err());

        mock.set_generate_failure(false);
        assert!(mock.generate("sys", &[], "a").await.is_ok());
        assert_eq!(mock.generate_calls(), 2);
    }

    #[test]
    fn test_sample_course_is_ordered() {
        let course = sample_course();
        let ids: Vec<_> = course.ordered_units().iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["greeting", "apology"]);
    }
}
