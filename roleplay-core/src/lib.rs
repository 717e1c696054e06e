//! Dialogue engine for roleplay training courses.
//!
//! This crate provides:
//! - A per-session dialogue engine that walks a learner through ordered units
//! - Tiered Hot/Cold persona memory with relevance promotion and consolidation
//! - Merge-upsert session persistence with versioned conditional writes
//! - A Claude-backed text generator and a scripted mock for tests
//!
//! # Quick Start
//!
//! ```ignore
//! use roleplay_core::{
//!     ClaudeGenerator, DialogueEngine, EngineConfig, InMemoryCatalog,
//!     JsonDirDocumentStore, JsonFileMemoryRepository,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env();
//!     let engine = DialogueEngine::new(
//!         Arc::new(InMemoryCatalog::from_json_file("catalog.json").await?),
//!         Arc::new(ClaudeGenerator::from_env(&config)?),
//!         Arc::new(JsonFileMemoryRepository::new("data/memories.json")),
//!         Arc::new(JsonDirDocumentStore::new("data/sessions")),
//!         config,
//!     );
//!
//!     engine.initialize("refund-desk", "S1", "learner-1", "Ken").await?;
//!     let response = engine.chat("refund-desk", "S1", "learner-1", "Hello, how can I help?").await?;
//!     println!("{}", response.assistant_reply);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod model;
pub mod parse;
pub mod persist;
pub mod prompt;
pub mod testing;

// Primary public API
pub use catalog::{
    Activity, Agent, CatalogDocument, CatalogError, Course, CourseCatalog, InMemoryCatalog,
    PassCondition, Unit,
};
pub use config::EngineConfig;
pub use engine::{ChatResponse, DialogueEngine, EngineError};
pub use llm::{ChatTurn, ClaudeGenerator, GenerationError, TextGenerator, TimeoutGenerator};
pub use memory::{
    InMemoryMemoryRepository, JsonFileMemoryRepository, MemoryEntry, MemoryRepository,
    MemoryScope, MemoryTier,
};
pub use model::{ConversationLog, LogRole, Session, SessionId, SessionKey, UnitResult, UnitStatus};
pub use persist::{
    DocumentStore, InMemoryDocumentStore, JsonDirDocumentStore, SessionLookup, SessionStore,
    StoreError,
};
pub use prompt::PromptBuilder;
pub use testing::{MockGenerator, TestHarness};
