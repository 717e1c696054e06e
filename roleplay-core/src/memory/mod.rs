//! Tiered persona memory.
//!
//! Memories are either Hot (always in the prompt) or Cold (recalled only
//! when judged relevant). Baseline memories come from the persona and the
//! activity; dynamic memories are written during play and are the only ones
//! the engine ever demotes.
//!
//! ```text
//!   baseline (catalog) ──┐
//!                        ├─> WorkingMemory ──promote──> prompt
//!   dynamic (store) ─────┘        │
//!                                 └─ record exchange ─> consolidate ─> store
//! ```

mod consolidate;
mod entry;
mod relevance;
mod store;
mod working;

pub use consolidate::{ConsolidationPlan, MemoryConsolidator};
pub use entry::{exchange_summary, extract_tags, MemoryEntry, MemoryId, MemoryScope, MemoryTier};
pub use relevance::RelevancePromoter;
pub use store::{
    InMemoryMemoryRepository, JsonFileMemoryRepository, MemoryError, MemoryRepository, MemoryStore,
};
pub use working::WorkingMemory;
