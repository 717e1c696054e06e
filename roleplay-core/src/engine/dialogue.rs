//! The dialogue engine.
//!
//! `DialogueEngine` advances a learner through a course one message at a
//! time. Every external call of a turn (relevance, reply, consolidation and
//! pass judgments) happens before anything is written, so a failed call
//! leaves both stores untouched and the learner can simply retry. The
//! exchange's memory pair carries ids fixed by `(scope, unit, turn)`, so a
//! turn retried after a failed session write stores it only once.

use super::evaluate::PassEvaluator;
use super::locks::SessionLocks;
use crate::catalog::{Activity, Agent, CatalogError, Course, CourseCatalog, PassCondition, Unit};
use crate::config::EngineConfig;
use crate::llm::{ChatTurn, GenerationError, TextGenerator, TimeoutGenerator};
use crate::memory::{
    MemoryConsolidator, MemoryEntry, MemoryError, MemoryRepository, MemoryScope, MemoryStore,
    RelevancePromoter, WorkingMemory,
};
use crate::model::{ConversationLog, Session, SessionKey, SessionUpdate, UnitResult, UnitStatus};
use crate::persist::{merge_session, DocumentStore, SessionStore, StoreError};
use crate::prompt::PromptBuilder;
use chrono::{Duration as TimeDelta, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown {kind} '{id}'")]
    NotFound { kind: &'static str, id: String },

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Session {key} could not be saved after {attempts} conflicting writes")]
    PersistenceConflict { key: SessionKey, attempts: u32 },

    #[error("Session storage error: {0}")]
    Storage(#[source] StoreError),

    #[error("Memory storage error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Course already completed for session {0}")]
    CourseCompleted(SessionKey),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConflictsExhausted { key, attempts } => {
                EngineError::PersistenceConflict { key, attempts }
            }
            other => EngineError::Storage(other),
        }
    }
}

impl EngineError {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Generation(e) => e.is_transient(),
            EngineError::PersistenceConflict { .. } => true,
            _ => false,
        }
    }

    /// Text safe to show a learner. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Validation(_) => self.to_string(),
            EngineError::NotFound { kind, .. } => format!("That {kind} is not available."),
            EngineError::CourseCompleted(_) => "This course is already complete.".to_string(),
            _ => "Something went wrong on our side. Please try again.".to_string(),
        }
    }
}

/// Result of one learner message.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub assistant_reply: String,
    /// The session as stored after this turn.
    pub session: Session,
    /// The current unit closed and the next one became current.
    pub transitioned: bool,
    /// The last unit closed; the session now carries its summary.
    pub course_completed: bool,
    /// The unit was already out of turns. `assistant_reply` is an engine
    /// notice and the message was not logged.
    pub limit_reached: bool,
}

/// What closing (or not closing) the current unit led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Advance {
    Stay,
    Transitioned,
    Completed,
}

/// Catalog content a request runs against.
struct CourseContext {
    activity: Activity,
    agent: Agent,
    course: Course,
}

impl CourseContext {
    /// Persona memories followed by activity memories.
    fn baseline(&self) -> Vec<MemoryEntry> {
        self.agent
            .memories
            .iter()
            .chain(self.activity.memories.iter())
            .cloned()
            .collect()
    }

    fn scope(&self, key: &SessionKey) -> MemoryScope {
        MemoryScope::new(&self.agent.id, &key.user_id, &key.activity_id, &key.session_code)
    }

    fn prompts<'a>(&'a self, learner_name: &'a str) -> PromptBuilder<'a> {
        PromptBuilder::new(&self.agent, &self.activity, &self.course).with_learner_name(learner_name)
    }

    fn current_unit(&self, session: &Session) -> Result<&Unit, EngineError> {
        session
            .current_unit_id(&self.course)
            .and_then(|id| self.course.unit(id))
            .ok_or_else(|| EngineError::NotFound {
                kind: "unit",
                id: format!("first unit of course {}", self.course.id),
            })
    }
}

fn require(field: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        Err(EngineError::Validation(format!("{field} is required")))
    } else {
        Ok(())
    }
}

/// Orchestrates memory, generation, evaluation and persistence per message.
pub struct DialogueEngine {
    catalog: Arc<dyn CourseCatalog>,
    generator: Arc<dyn TextGenerator>,
    memory: MemoryStore,
    sessions: SessionStore,
    config: EngineConfig,
    locks: SessionLocks,
}

impl DialogueEngine {
    /// Create an engine. Every call to `generator` is bounded by
    /// `config.call_timeout`.
    pub fn new(
        catalog: Arc<dyn CourseCatalog>,
        generator: Arc<dyn TextGenerator>,
        memories: Arc<dyn MemoryRepository>,
        documents: Arc<dyn DocumentStore>,
        config: EngineConfig,
    ) -> Self {
        let generator: Arc<dyn TextGenerator> =
            Arc::new(TimeoutGenerator::new(generator, config.call_timeout));
        let sessions = SessionStore::new(documents)
            .with_retries(config.persist_attempts, config.persist_backoff);

        Self {
            catalog,
            generator,
            memory: MemoryStore::new(memories),
            sessions,
            config,
            locks: SessionLocks::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    async fn resolve(&self, activity_id: &str) -> Result<CourseContext, EngineError> {
        let activity = self
            .catalog
            .activity(activity_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "activity",
                id: activity_id.to_string(),
            })?;
        let agent = self
            .catalog
            .agent(&activity.agent_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "agent",
                id: activity.agent_id.clone(),
            })?;
        let course = self
            .catalog
            .course(&activity.course_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "course",
                id: activity.course_id.clone(),
            })?;

        Ok(CourseContext {
            activity,
            agent,
            course,
        })
    }

    /// Read-only view of a stored session.
    pub async fn session(
        &self,
        activity_id: &str,
        session_code: &str,
        user_id: &str,
    ) -> Result<Option<Session>, EngineError> {
        require("activity_id", activity_id)?;
        require("session_id", session_code)?;
        require("user_id", user_id)?;

        let key = SessionKey::new(activity_id, user_id, session_code);
        Ok(self.sessions.find(&key).await?)
    }

    /// Create the session if needed and seed the current unit's intro.
    ///
    /// Calling it again on a seeded session changes nothing.
    pub async fn initialize(
        &self,
        activity_id: &str,
        session_code: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<Session, EngineError> {
        require("activity_id", activity_id)?;
        require("session_id", session_code)?;
        require("user_id", user_id)?;

        let ctx = self.resolve(activity_id).await?;
        let key = SessionKey::new(activity_id, user_id, session_code);
        let _guard = self.locks.acquire(&key).await;

        let existing = self.sessions.find(&key).await?;
        let session = existing
            .clone()
            .unwrap_or_else(|| Session::new(&key, user_name));
        let unit = ctx.current_unit(&session)?;

        let mut update = SessionUpdate::new();
        if !user_name.trim().is_empty() && session.user_name != user_name {
            update.user_name = Some(user_name.to_string());
        }

        let seeded = session.unit(&unit.id).map(UnitResult::has_logs).unwrap_or(false);
        if session.unit(&unit.id).is_none() {
            update.unit(&unit.id);
        }
        if let (Some(intro), false) = (&unit.intro_message, seeded) {
            let learner = if user_name.trim().is_empty() { session.user_name.as_str() } else { user_name };
            let working = self.memory.working_set(ctx.baseline(), &ctx.scope(&key)).await?;
            let system_prompt = ctx.prompts(learner).build(unit, working.hot());
            update.unit(&unit.id).conversation_logs.push(
                ConversationLog::assistant(intro, Utc::now())
                    .with_system_prompt(system_prompt)
                    .with_snapshot(working.snapshot()),
            );
        }

        if let Some(existing) = existing {
            if update.is_empty() {
                debug!(session = %key, "session already initialized");
                return Ok(existing);
            }
        }

        let session = self.sessions.upsert(key.clone(), &update).await?;
        info!(session = %key, unit = %unit.id, "session initialized");
        Ok(session)
    }

    /// Handle one learner message on the session's current unit.
    pub async fn chat(
        &self,
        activity_id: &str,
        session_code: &str,
        user_id: &str,
        message: &str,
    ) -> Result<ChatResponse, EngineError> {
        require("activity_id", activity_id)?;
        require("session_id", session_code)?;
        require("user_id", user_id)?;
        require("message", message)?;

        let ctx = self.resolve(activity_id).await?;
        let key = SessionKey::new(activity_id, user_id, session_code);
        let _guard = self.locks.acquire(&key).await;

        let result = self.run_turn(&ctx, &key, message).await;
        if let Err(e) = &result {
            warn!(session = %key, error = %e, "turn aborted");
        }
        result
    }

    async fn run_turn(
        &self,
        ctx: &CourseContext,
        key: &SessionKey,
        message: &str,
    ) -> Result<ChatResponse, EngineError> {
        let session = self
            .sessions
            .find(key)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "session",
                id: key.to_string(),
            })?;
        if session.is_completed() {
            return Err(EngineError::CourseCompleted(key.clone()));
        }

        let unit = ctx.current_unit(&session)?;
        let state = session
            .unit(&unit.id)
            .cloned()
            .unwrap_or_else(|| UnitResult::new(&unit.id));
        let scope = ctx.scope(key);
        let prompts = ctx.prompts(&session.user_name);

        if state.status.is_closed() || state.turn_count >= unit.max_turns {
            let working = self.memory.working_set(ctx.baseline(), &scope).await?;
            let status = if state.status.is_closed() { state.status } else { UnitStatus::Failed };

            let mut update = SessionUpdate::new();
            let advance = self.close_unit(ctx, &prompts, &session, &mut update, unit, status, &working);
            let session = self.sessions.upsert(key.clone(), &update).await?;

            info!(session = %key, unit = %unit.id, turns = state.turn_count, "turn limit reached, unit closed");
            return Ok(ChatResponse {
                assistant_reply: turn_limit_notice(unit, advance),
                session,
                transitioned: advance == Advance::Transitioned,
                course_completed: advance == Advance::Completed,
                limit_reached: true,
            });
        }

        let generator = self.generator.as_ref();
        let received_at = Utc::now();

        // External calls; nothing is written until all of them succeed.
        let mut working = self.memory.working_set(ctx.baseline(), &scope).await?;
        RelevancePromoter::new(generator)
            .promote(&mut working, message)
            .await?;

        let system_prompt = prompts.build(unit, working.hot());
        let history: Vec<ChatTurn> = state
            .conversation_logs
            .iter()
            .map(|log| ChatTurn::new(log.role, &log.content))
            .collect();
        let reply = generator.generate(&system_prompt, &history, message).await?;
        let replied_at = Utc::now().max(received_at + TimeDelta::milliseconds(1));

        let turns = state.turn_count + 1;
        let snapshot = working.snapshot();
        let pair = MemoryEntry::exchange_pair(&scope, &unit.id, turns, message, &reply);
        for entry in &pair {
            working.record(entry.clone());
        }
        let plan = MemoryConsolidator::new(generator, self.config.min_hot_capacity)
            .plan(&working, &scope)
            .await?;

        let transcript = match state.user_transcript() {
            earlier if earlier.is_empty() => message.to_string(),
            earlier => format!("{earlier}\n{message}"),
        };
        let evaluation = PassEvaluator::new(generator)
            .evaluate(&unit.pass_condition, &transcript, &reply)
            .await?;

        // Writes.
        let fresh = self.memory.record_exchange(pair).await?;
        if !fresh {
            debug!(session = %key, unit = %unit.id, turns, "exchange already recorded by an earlier attempt");
        }
        if let Some(plan) = plan.as_ref().filter(|_| fresh) {
            let demoted = self.memory.commit_consolidation(&scope, plan).await?;
            working.apply_consolidation(plan.summaries.clone());
            info!(
                session = %key,
                target = plan.target,
                summaries = plan.summaries.len(),
                demoted,
                "hot memories consolidated"
            );
        }

        let mut update = SessionUpdate::new();
        {
            let entry = update.unit(&unit.id);
            entry
                .conversation_logs
                .push(ConversationLog::user(message, received_at).with_snapshot(snapshot.clone()));
            entry.conversation_logs.push(
                ConversationLog::assistant(&reply, replied_at)
                    .with_system_prompt(system_prompt)
                    .with_snapshot(snapshot),
            );
            entry.turn_count = Some(turns);
            match &unit.pass_condition {
                PassCondition::Keyword(keywords) => entry.important_keywords = keywords.clone(),
                PassCondition::Llm(rules) => entry.standard_pass_rules = rules.clone(),
            }
            entry.evaluation_results.extend(evaluation.justification.clone());
        }

        let advance = if evaluation.passed {
            if let Some(outro) = &unit.outro_message {
                update.unit(&unit.id).conversation_logs.push(ConversationLog::assistant(
                    outro,
                    replied_at + TimeDelta::milliseconds(1),
                ));
            }
            info!(session = %key, unit = %unit.id, turns, "unit passed");
            self.close_unit(ctx, &prompts, &session, &mut update, unit, UnitStatus::Passed, &working)
        } else if turns >= unit.max_turns {
            info!(session = %key, unit = %unit.id, turns, "unit failed on turn limit");
            self.close_unit(ctx, &prompts, &session, &mut update, unit, UnitStatus::Failed, &working)
        } else {
            debug!(session = %key, unit = %unit.id, turns, "unit still active");
            Advance::Stay
        };

        let session = self.sessions.upsert(key.clone(), &update).await?;
        if advance == Advance::Completed {
            info!(session = %key, "course completed");
        }

        Ok(ChatResponse {
            assistant_reply: reply,
            session,
            transitioned: advance == Advance::Transitioned,
            course_completed: advance == Advance::Completed,
            limit_reached: false,
        })
    }

    /// Record `status` for `unit` and move on within the same update.
    ///
    /// The next unit in course order gets an Active result and, if it has
    /// never been seeded, its intro. Without a next unit the course summary
    /// is written instead.
    #[allow(clippy::too_many_arguments)]
    fn close_unit(
        &self,
        ctx: &CourseContext,
        prompts: &PromptBuilder<'_>,
        session: &Session,
        update: &mut SessionUpdate,
        unit: &Unit,
        status: UnitStatus,
        working: &WorkingMemory,
    ) -> Advance {
        update.unit(&unit.id).status = Some(status);

        let Some(next) = ctx.course.next_unit(&unit.id) else {
            let preview = merge_session(Some(session.clone()), &session.key(), update, Utc::now());
            update.summary = Some(completion_summary(&ctx.course, &preview));
            return Advance::Completed;
        };

        let seeded = session.unit(&next.id).map(UnitResult::has_logs).unwrap_or(false);
        let entry = update.unit(&next.id);
        if let (Some(intro), false) = (&next.intro_message, seeded) {
            entry.conversation_logs.push(
                ConversationLog::assistant(intro, Utc::now())
                    .with_system_prompt(prompts.build(next, working.hot()))
                    .with_snapshot(working.snapshot()),
            );
        }
        debug!(from = %unit.id, to = %next.id, status = status.name(), "unit transition");
        Advance::Transitioned
    }
}

fn display_title(unit: &Unit) -> &str {
    if unit.title.is_empty() {
        &unit.id
    } else {
        &unit.title
    }
}

fn turns(n: u32) -> String {
    if n == 1 {
        "1 turn".to_string()
    } else {
        format!("{n} turns")
    }
}

fn turn_limit_notice(unit: &Unit, advance: Advance) -> String {
    let head = format!(
        "You've used all {} for \"{}\".",
        turns(unit.max_turns),
        display_title(unit)
    );
    match advance {
        Advance::Completed => format!("{head} That was the final scene, so the course is now complete."),
        _ => format!("{head} Let's move on to the next scene."),
    }
}

/// Outcome line per unit, in course order.
pub fn completion_summary(course: &Course, session: &Session) -> String {
    let mut summary = format!("Completed \"{}\".\n", course.name);
    for unit in course.ordered_units() {
        let line = match session.unit(&unit.id) {
            Some(result) => match result.status {
                UnitStatus::Passed => format!("passed in {}", turns(result.turn_count)),
                UnitStatus::Failed => format!("not passed after {}", turns(result.turn_count)),
                UnitStatus::Active => format!("unfinished after {}", turns(result.turn_count)),
            },
            None => "not reached".to_string(),
        };
        summary.push_str(&format!("- {}: {line}\n", display_title(unit)));
    }
    summary.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_course, MockGenerator, TestHarness};

    #[test]
    fn test_completion_summary_lists_every_unit() {
        let course = sample_course();
        let key = SessionKey::new("act", "u", "S1");
        let mut session = Session::new(&key, "Ken");
        let mut greeting = UnitResult::new("greeting");
        greeting.status = UnitStatus::Passed;
        greeting.turn_count = 1;
        session.unit_results.push(greeting);

        let summary = completion_summary(&course, &session);
        assert!(summary.starts_with("Completed \"Handling complaints\"."));
        assert!(summary.contains("- First contact: passed in 1 turn"));
        assert!(summary.contains("- The complaint: not reached"));
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = EngineError::Generation(GenerationError::Timeout(60));
        assert!(err.is_retryable());
        assert!(!err.user_message().contains("60"));

        let err = EngineError::Generation(GenerationError::Api(claude::Error::NoApiKey));
        assert!(!err.is_retryable());

        let err = EngineError::Validation("message is required".into());
        assert_eq!(err.user_message(), "Invalid request: message is required");
    }

    #[tokio::test]
    async fn test_validation_rejects_blank_fields() {
        let harness = TestHarness::new();
        let result = harness.engine.chat("refund-desk", "S1", "learner-1", "   ").await;

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(harness.generator.generate_calls(), 0);
        assert!(harness.documents.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_activity_is_not_found() {
        let harness = TestHarness::new();
        let result = harness.engine.initialize("nope", "S1", "learner-1", "Ken").await;

        assert!(matches!(result, Err(EngineError::NotFound { kind: "activity", .. })));
    }

    #[tokio::test]
    async fn test_chat_requires_initialized_session() {
        let harness = TestHarness::with_generator(MockGenerator::new());
        let result = harness.say("hello").await;

        assert!(matches!(result, Err(EngineError::NotFound { kind: "session", .. })));
    }
}
