//! Memory entries and their tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tokens must be longer than this to become a tag.
const MIN_TAG_CHARS: usize = 3;

/// Maximum tags extracted from one memory.
const MAX_TAGS: usize = 5;

/// Unique identifier for a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(Uuid);

impl MemoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Stable id for one tier of the exchange recorded on `turn` of `unit_id`.
    ///
    /// Recording the same turn twice yields the same ids.
    pub fn for_exchange(scope: &MemoryScope, unit_id: &str, turn: u32, tier: MemoryTier) -> Self {
        let name = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{:?}",
            scope.agent_id, scope.user_id, scope.activity_id, scope.session_code, unit_id, turn, tier
        );
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a memory is injected into the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTier {
    /// Always part of the generation prompt.
    Hot,
    /// Retained, but only used when promoted for a turn.
    Cold,
}

/// The learner run a dynamic memory belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryScope {
    pub agent_id: String,
    pub user_id: String,
    pub activity_id: String,
    pub session_code: String,
}

impl MemoryScope {
    pub fn new(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        activity_id: impl Into<String>,
        session_code: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            activity_id: activity_id.into(),
            session_code: session_code.into(),
        }
    }
}

/// A single remembered piece of context for a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: MemoryId,
    pub agent_id: String,
    /// Set only on dynamic (session-scoped) entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    /// Set only on dynamic (session-scoped) entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_code: Option<String>,
    pub tier: MemoryTier,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_by_user_id: String,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// A persona- or activity-level entry, shared by every session.
    pub fn baseline(agent_id: impl Into<String>, tier: MemoryTier, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: MemoryId::new(),
            agent_id: agent_id.into(),
            activity_id: None,
            session_code: None,
            tier,
            tags: extract_tags(&content),
            content,
            created_by_user_id: String::new(),
            created_at: Utc::now(),
        }
    }

    /// An entry created during play, owned by one learner run.
    pub fn dynamic(scope: &MemoryScope, tier: MemoryTier, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: MemoryId::new(),
            agent_id: scope.agent_id.clone(),
            activity_id: Some(scope.activity_id.clone()),
            session_code: Some(scope.session_code.clone()),
            tier,
            tags: extract_tags(&content),
            content,
            created_by_user_id: scope.user_id.clone(),
            created_at: Utc::now(),
        }
    }

    /// The Hot and Cold copies recorded after a successful exchange.
    ///
    /// Both carry the same content and tags; only the tier differs. Ids are
    /// derived from `(scope, unit_id, turn)`.
    pub fn exchange_pair(
        scope: &MemoryScope,
        unit_id: &str,
        turn: u32,
        user_message: &str,
        assistant_reply: &str,
    ) -> [Self; 2] {
        let content = exchange_summary(user_message, assistant_reply);
        [MemoryTier::Hot, MemoryTier::Cold].map(|tier| {
            Self::dynamic(scope, tier, content.clone())
                .with_id(MemoryId::for_exchange(scope, unit_id, turn, tier))
        })
    }

    pub fn with_id(mut self, id: MemoryId) -> Self {
        self.id = id;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.activity_id.is_some() && self.session_code.is_some()
    }

    pub fn is_hot(&self) -> bool {
        self.tier == MemoryTier::Hot
    }

    /// Whether this entry is a dynamic entry owned by `scope`.
    pub fn belongs_to(&self, scope: &MemoryScope) -> bool {
        self.agent_id == scope.agent_id
            && self.created_by_user_id == scope.user_id
            && self.activity_id.as_deref() == Some(scope.activity_id.as_str())
            && self.session_code.as_deref() == Some(scope.session_code.as_str())
    }
}

/// Lexical keyword extraction: lowercase, whitespace split, long tokens only.
pub fn extract_tags(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|token| token.chars().count() > MIN_TAG_CHARS)
        .take(MAX_TAGS)
        .map(str::to_string)
        .collect()
}

/// Content recorded for one user/assistant exchange.
pub fn exchange_summary(user_message: &str, assistant_reply: &str) -> String {
    format!("User said: {user_message}\nAssistant replied: {assistant_reply}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tags() {
        let tags = extract_tags("I want a REFUND for the broken kettle please today");
        assert_eq!(tags, vec!["want", "refund", "broken", "kettle", "please"]);
    }

    #[test]
    fn test_extract_tags_counts_chars_not_bytes() {
        // Three multi-byte characters are still only three characters.
        assert!(extract_tags("ありが").is_empty());
        assert_eq!(extract_tags("ありがとう"), vec!["ありがとう"]);
    }

    #[test]
    fn test_exchange_pair_differs_only_in_tier() {
        let scope = MemoryScope::new("agent", "user", "act", "S1");
        let [hot, cold] =
            MemoryEntry::exchange_pair(&scope, "greeting", 1, "My kettle broke", "I'm sorry to hear that");

        assert_eq!(hot.tier, MemoryTier::Hot);
        assert_eq!(cold.tier, MemoryTier::Cold);
        assert_eq!(hot.content, cold.content);
        assert_eq!(hot.tags, cold.tags);
        assert_ne!(hot.id, cold.id);
        assert!(hot.content.starts_with("User said: My kettle broke"));
        assert!(hot.tags.len() <= MAX_TAGS);
    }

    #[test]
    fn test_exchange_ids_are_stable_per_turn() {
        let scope = MemoryScope::new("agent", "user", "act", "S1");
        let [first, _] = MemoryEntry::exchange_pair(&scope, "greeting", 2, "hello", "hmph");
        let [again, _] = MemoryEntry::exchange_pair(&scope, "greeting", 2, "hello there", "what?");
        assert_eq!(first.id, again.id);

        let [next_turn, _] = MemoryEntry::exchange_pair(&scope, "greeting", 3, "hello", "hmph");
        let [other_unit, _] = MemoryEntry::exchange_pair(&scope, "apology", 2, "hello", "hmph");
        let other_session = MemoryScope::new("agent", "user", "act", "S2");
        let [other_scope, _] = MemoryEntry::exchange_pair(&other_session, "greeting", 2, "hello", "hmph");
        assert_ne!(first.id, next_turn.id);
        assert_ne!(first.id, other_unit.id);
        assert_ne!(first.id, other_scope.id);
    }

    #[test]
    fn test_dynamic_entry_scope() {
        let scope = MemoryScope::new("agent", "user", "act", "S1");
        let entry = MemoryEntry::dynamic(&scope, MemoryTier::Hot, "User said: hi");

        assert!(entry.is_dynamic());
        assert!(entry.belongs_to(&scope));
        assert!(!entry.belongs_to(&MemoryScope::new("agent", "user", "act", "S2")));

        let baseline = MemoryEntry::baseline("agent", MemoryTier::Cold, "Dislikes rain");
        assert!(!baseline.is_dynamic());
        assert!(!baseline.belongs_to(&scope));
    }
}
