//! Course progression for learner sessions.
//!
//! One `chat` call runs this pipeline under the session's lock:
//!
//! ```text
//! message ─▶ load session + current unit
//!            │
//!            ├─ turn limit already reached ─▶ close unit, seed next ─▶ notice
//!            │
//!            ▼
//!        promote cold memories ─▶ build prompt ─▶ generate reply
//!            │
//!            ▼
//!        plan consolidation ─▶ evaluate pass condition
//!            │
//!            ▼
//!        write memories ─▶ merge session (logs, turn, transition) ─▶ reply
//! ```

mod dialogue;
mod evaluate;
mod locks;

pub use dialogue::{completion_summary, ChatResponse, DialogueEngine, EngineError};
pub use evaluate::{keywords_present, Evaluation, PassEvaluator};
pub use locks::SessionLocks;
