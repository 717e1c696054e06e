//! Read-only course content: units, courses, personas and activities.
//!
//! Authoring lives elsewhere; the engine only reads through
//! [`CourseCatalog`]. [`InMemoryCatalog`] serves tests and the terminal
//! driver, loading from a JSON [`CatalogDocument`].

use crate::memory::{MemoryEntry, MemoryTier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// Errors from catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid catalog: {0}")]
    Invalid(String),
}

/// How a unit decides it has been passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PassCondition {
    /// Every keyword must appear somewhere in the learner's messages.
    Keyword(Vec<String>),
    /// A judge decides against these rules.
    Llm(Vec<String>),
}

/// A single lesson scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub order: u32,
    #[serde(default)]
    pub intro_message: Option<String>,
    #[serde(default)]
    pub outro_message: Option<String>,
    pub max_turns: u32,
    pub pass_condition: PassCondition,
    /// How the persona should behave in this scene.
    #[serde(default)]
    pub behavior_prompt: String,
    #[serde(default)]
    pub agent_role: String,
    #[serde(default)]
    pub user_role: String,
}

/// An ordered sequence of units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub units: Vec<Unit>,
}

impl Course {
    /// Units sorted by `order`; ties keep their listed order.
    pub fn ordered_units(&self) -> Vec<&Unit> {
        let mut units: Vec<&Unit> = self.units.iter().collect();
        units.sort_by_key(|u| u.order);
        units
    }

    pub fn first_unit(&self) -> Option<&Unit> {
        self.ordered_units().into_iter().next()
    }

    pub fn unit(&self, unit_id: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == unit_id)
    }

    /// The unit after `unit_id` in catalog order, if any.
    pub fn next_unit(&self, unit_id: &str) -> Option<&Unit> {
        let ordered = self.ordered_units();
        let position = ordered.iter().position(|u| u.id == unit_id)?;
        ordered.get(position + 1).copied()
    }
}

/// The AI persona a learner talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub voice: String,
    /// Baseline memories shared by every session with this persona.
    #[serde(default)]
    pub memories: Vec<MemoryEntry>,
}

/// A course played against a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agent_id: String,
    pub course_id: String,
    /// Baseline memories specific to this activity.
    #[serde(default)]
    pub memories: Vec<MemoryEntry>,
}

/// Read access to course content.
#[async_trait]
pub trait CourseCatalog: Send + Sync {
    async fn activity(&self, activity_id: &str) -> Result<Option<Activity>, CatalogError>;
    async fn agent(&self, agent_id: &str) -> Result<Option<Agent>, CatalogError>;
    async fn course(&self, course_id: &str) -> Result<Option<Course>, CatalogError>;
}

// ============================================================================
// JSON document
// ============================================================================

/// An authored memory line before it becomes a [`MemoryEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySeed {
    pub tier: MemoryTier,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDocument {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub voice: String,
    #[serde(default)]
    pub memories: Vec<MemorySeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityDocument {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agent_id: String,
    pub course_id: String,
    #[serde(default)]
    pub memories: Vec<MemorySeed>,
}

/// On-disk catalog format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub agents: Vec<AgentDocument>,
    #[serde(default)]
    pub activities: Vec<ActivityDocument>,
    #[serde(default)]
    pub courses: Vec<Course>,
}

fn seed_entries(agent_id: &str, seeds: Vec<MemorySeed>) -> Vec<MemoryEntry> {
    seeds
        .into_iter()
        .map(|seed| {
            let entry = MemoryEntry::baseline(agent_id, seed.tier, seed.content);
            if seed.tags.is_empty() {
                entry
            } else {
                entry.with_tags(seed.tags)
            }
        })
        .collect()
}

// ============================================================================
// In-memory catalog
// ============================================================================

/// Catalog held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    activities: HashMap<String, Activity>,
    agents: HashMap<String, Agent>,
    courses: HashMap<String, Course>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agents.insert(agent.id.clone(), agent);
        self
    }

    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activities.insert(activity.id.clone(), activity);
        self
    }

    pub fn with_course(mut self, course: Course) -> Self {
        self.courses.insert(course.id.clone(), course);
        self
    }

    /// Build from a parsed document, checking cross references.
    pub fn from_document(doc: CatalogDocument) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();

        for agent in doc.agents {
            let memories = seed_entries(&agent.id, agent.memories);
            catalog = catalog.with_agent(Agent {
                id: agent.id,
                name: agent.name,
                tone: agent.tone,
                background: agent.background,
                voice: agent.voice,
                memories,
            });
        }

        for course in doc.courses {
            if course.units.is_empty() {
                return Err(CatalogError::Invalid(format!("course '{}' has no units", course.id)));
            }
            catalog = catalog.with_course(course);
        }

        for activity in doc.activities {
            if !catalog.agents.contains_key(&activity.agent_id) {
                return Err(CatalogError::Invalid(format!(
                    "activity '{}' references unknown agent '{}'",
                    activity.id, activity.agent_id
                )));
            }
            if !catalog.courses.contains_key(&activity.course_id) {
                return Err(CatalogError::Invalid(format!(
                    "activity '{}' references unknown course '{}'",
                    activity.id, activity.course_id
                )));
            }
            let memories = seed_entries(&activity.agent_id, activity.memories);
            catalog = catalog.with_activity(Activity {
                id: activity.id,
                name: activity.name,
                description: activity.description,
                agent_id: activity.agent_id,
                course_id: activity.course_id,
                memories,
            });
        }

        Ok(catalog)
    }

    /// Load a catalog from a JSON file.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path).await?;
        let doc: CatalogDocument = serde_json::from_str(&content)?;
        Self::from_document(doc)
    }
}

#[async_trait]
impl CourseCatalog for InMemoryCatalog {
    async fn activity(&self, activity_id: &str) -> Result<Option<Activity>, CatalogError> {
        Ok(self.activities.get(activity_id).cloned())
    }

    async fn agent(&self, agent_id: &str) -> Result<Option<Agent>, CatalogError> {
        Ok(self.agents.get(agent_id).cloned())
    }

    async fn course(&self, course_id: &str) -> Result<Option<Course>, CatalogError> {
        Ok(self.courses.get(course_id).cloned())
    }
}
