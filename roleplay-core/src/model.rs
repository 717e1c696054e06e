//! Session records for a learner's run through a course.
//!
//! A [`Session`] is one document per `(activity, user, session code)`. It
//! holds one [`UnitResult`] per unit the learner has reached, each carrying
//! the unit's conversation log and evaluation trail.

use crate::catalog::Course;
use crate::memory::MemoryEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque document identifier for a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Natural key of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub activity_id: String,
    pub user_id: String,
    /// Human-readable session code chosen by the learner or facilitator.
    pub session_code: String,
}

impl SessionKey {
    pub fn new(
        activity_id: impl Into<String>,
        user_id: impl Into<String>,
        session_code: impl Into<String>,
    ) -> Self {
        Self {
            activity_id: activity_id.into(),
            user_id: user_id.into(),
            session_code: session_code.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.activity_id, self.user_id, self.session_code)
    }
}

/// Outcome of a unit so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Still accepting turns.
    #[default]
    Active,
    Passed,
    Failed,
}

impl UnitStatus {
    pub fn is_closed(self) -> bool {
        !matches!(self, UnitStatus::Active)
    }

    pub fn name(self) -> &'static str {
        match self {
            UnitStatus::Active => "active",
            UnitStatus::Passed => "passed",
            UnitStatus::Failed => "failed",
        }
    }
}

/// Who produced a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRole {
    User,
    Assistant,
}

impl LogRole {
    pub fn as_str(self) -> &'static str {
        match self {
            LogRole::User => "user",
            LogRole::Assistant => "assistant",
        }
    }
}

/// One line of dialogue within a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLog {
    pub role: LogRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// System prompt in effect when the line was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Hot and cold memories visible at that instant, for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_snapshot: Option<Vec<MemoryEntry>>,
}

impl ConversationLog {
    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(LogRole::User, content, timestamp)
    }

    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(LogRole::Assistant, content, timestamp)
    }

    fn new(role: LogRole, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
            system_prompt: None,
            memory_snapshot: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: Vec<MemoryEntry>) -> Self {
        self.memory_snapshot = Some(snapshot);
        self
    }

    /// Identity used to recognise a replayed log line.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.role.as_str(),
            self.content,
            self.timestamp.to_rfc3339()
        )
    }
}

/// Progress and history for one unit within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_id: String,
    #[serde(default)]
    pub status: UnitStatus,
    #[serde(default)]
    pub turn_count: u32,
    #[serde(default)]
    pub important_keywords: Vec<String>,
    #[serde(default)]
    pub standard_pass_rules: Vec<String>,
    #[serde(default)]
    pub evaluation_results: Vec<String>,
    #[serde(default)]
    pub conversation_logs: Vec<ConversationLog>,
}

impl UnitResult {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            status: UnitStatus::Active,
            turn_count: 0,
            important_keywords: Vec::new(),
            standard_pass_rules: Vec::new(),
            evaluation_results: Vec::new(),
            conversation_logs: Vec::new(),
        }
    }

    /// All learner messages of this unit joined by newlines, oldest first.
    pub fn user_transcript(&self) -> String {
        self.conversation_logs
            .iter()
            .filter(|l| l.role == LogRole::User)
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_logs(&self) -> bool {
        !self.conversation_logs.is_empty()
    }
}

/// A learner's persisted run through a course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub activity_id: String,
    pub user_id: String,
    pub session_code: String,
    #[serde(default)]
    pub user_name: String,
    /// Completion summary; empty until the course ends.
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub unit_results: Vec<UnitResult>,
    pub generated_at: DateTime<Utc>,
    /// Bumped on every write; used for conditional updates.
    #[serde(default)]
    pub version: u64,
}

impl Session {
    pub fn new(key: &SessionKey, user_name: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            activity_id: key.activity_id.clone(),
            user_id: key.user_id.clone(),
            session_code: key.session_code.clone(),
            user_name: user_name.into(),
            summary: String::new(),
            unit_results: Vec::new(),
            generated_at: Utc::now(),
            version: 0,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.activity_id, &self.user_id, &self.session_code)
    }

    pub fn unit(&self, unit_id: &str) -> Option<&UnitResult> {
        self.unit_results.iter().find(|u| u.unit_id == unit_id)
    }

    pub fn unit_mut(&mut self, unit_id: &str) -> Option<&mut UnitResult> {
        self.unit_results.iter_mut().find(|u| u.unit_id == unit_id)
    }

    pub fn is_completed(&self) -> bool {
        !self.summary.is_empty()
    }

    pub fn turn_count(&self, unit_id: &str) -> u32 {
        self.unit(unit_id).map(|u| u.turn_count).unwrap_or(0)
    }

    /// The unit a new message belongs to.
    ///
    /// Last unit in course order that has logs or is still active; the
    /// course's first unit when no such result exists.
    pub fn current_unit_id<'c>(&self, course: &'c Course) -> Option<&'c str> {
        course
            .ordered_units()
            .into_iter()
            .rev()
            .find(|unit| {
                self.unit(&unit.id)
                    .map(|r| r.has_logs() || r.status == UnitStatus::Active)
                    .unwrap_or(false)
            })
            .or_else(|| course.first_unit())
            .map(|unit| unit.id.as_str())
    }
}

/// Partial update for one unit, merged into the stored session.
///
/// `None` scalars leave the stored value untouched; collections are unioned
/// or appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitUpdate {
    pub unit_id: String,
    #[serde(default)]
    pub status: Option<UnitStatus>,
    #[serde(default)]
    pub turn_count: Option<u32>,
    #[serde(default)]
    pub important_keywords: Vec<String>,
    #[serde(default)]
    pub standard_pass_rules: Vec<String>,
    #[serde(default)]
    pub evaluation_results: Vec<String>,
    #[serde(default)]
    pub conversation_logs: Vec<ConversationLog>,
}

impl UnitUpdate {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            ..Default::default()
        }
    }
}

impl From<UnitResult> for UnitUpdate {
    fn from(result: UnitResult) -> Self {
        Self {
            unit_id: result.unit_id,
            status: Some(result.status),
            turn_count: Some(result.turn_count),
            important_keywords: result.important_keywords,
            standard_pass_rules: result.standard_pass_rules,
            evaluation_results: result.evaluation_results,
            conversation_logs: result.conversation_logs,
        }
    }
}

/// Everything a single write carries into the session store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub units: Vec<UnitUpdate>,
}

impl SessionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update entry for `unit_id`, created on first use so each unit appears once.
    pub fn unit(&mut self, unit_id: &str) -> &mut UnitUpdate {
        let index = match self.units.iter().position(|u| u.unit_id == unit_id) {
            Some(index) => index,
            None => {
                self.units.push(UnitUpdate::new(unit_id));
                self.units.len() - 1
            }
        };
        &mut self.units[index]
    }

    pub fn is_empty(&self) -> bool {
        self.user_name.is_none() && self.summary.is_none() && self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dedup_key_includes_role_content_and_time() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let user = ConversationLog::user("hello", at);
        let assistant = ConversationLog::assistant("hello", at);

        assert_eq!(user.dedup_key(), "user|hello|2024-05-01T09:30:00+00:00");
        assert_ne!(user.dedup_key(), assistant.dedup_key());
    }

    #[test]
    fn test_user_transcript_skips_assistant_lines() {
        let at = Utc::now();
        let mut unit = UnitResult::new("u1");
        unit.conversation_logs.push(ConversationLog::assistant("Welcome", at));
        unit.conversation_logs.push(ConversationLog::user("hello", at));
        unit.conversation_logs.push(ConversationLog::assistant("Hi", at));
        unit.conversation_logs.push(ConversationLog::user("ok thanks", at));

        assert_eq!(unit.user_transcript(), "hello\nok thanks");
    }

    #[test]
    fn test_session_update_unit_is_unique() {
        let mut update = SessionUpdate::new();
        update.unit("u1").turn_count = Some(1);
        update.unit("u1").status = Some(UnitStatus::Passed);
        update.unit("u2");

        assert_eq!(update.units.len(), 2);
        assert_eq!(update.units[0].turn_count, Some(1));
        assert_eq!(update.units[0].status, Some(UnitStatus::Passed));
    }

    #[test]
    fn test_session_roundtrips_without_optional_fields() {
        let raw = r#"{
            "id": "7d3f6f0e-8a55-4f0c-9c7e-3c0f7a1b2c3d",
            "activity_id": "act",
            "user_id": "u",
            "session_code": "ABC",
            "generated_at": "2024-05-01T09:30:00Z",
            "unit_results": [{"unit_id": "u1"}]
        }"#;
        let session: Session = serde_json::from_str(raw).unwrap();

        assert_eq!(session.version, 0);
        assert!(!session.is_completed());
        assert_eq!(session.unit_results[0].status, UnitStatus::Active);
        assert_eq!(session.turn_count("u1"), 0);
    }

    #[test]
    fn test_current_unit_follows_course_order() {
        let course = crate::testing::sample_course();
        let key = SessionKey::new("act", "u", "S1");
        let mut session = Session::new(&key, "Ken");
        assert_eq!(session.current_unit_id(&course), Some("greeting"));

        let mut greeting = UnitResult::new("greeting");
        greeting.status = UnitStatus::Passed;
        greeting.conversation_logs.push(ConversationLog::user("thanks", Utc::now()));
        session.unit_results.push(greeting);
        assert_eq!(session.current_unit_id(&course), Some("greeting"));

        session.unit_results.push(UnitResult::new("apology"));
        assert_eq!(session.current_unit_id(&course), Some("apology"));
    }
}
