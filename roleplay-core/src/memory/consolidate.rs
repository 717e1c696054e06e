//! Summarization-based compaction of the hot tier.
//!
//! When the working hot set grows past its target, a judge merges it into
//! exactly `target` summaries. The summaries replace every dynamic hot entry
//! of the scope, and the replaced entries are kept as cold memories.

use super::entry::{MemoryEntry, MemoryScope, MemoryTier};
use super::working::WorkingMemory;
use crate::llm::{GenerationError, TextGenerator};
use crate::parse::parse_labeled_entries;
use tracing::{debug, warn};

/// Summaries ready to replace the scope's dynamic hot entries.
#[derive(Debug, Clone)]
pub struct ConsolidationPlan {
    pub target: usize,
    /// Parsed summaries as new dynamic Hot entries; may be fewer than `target`.
    pub summaries: Vec<MemoryEntry>,
}

impl ConsolidationPlan {
    pub fn is_degraded(&self) -> bool {
        self.summaries.len() < self.target
    }
}

/// Decides whether and how the hot tier is compacted.
pub struct MemoryConsolidator<'a> {
    summarizer: &'a dyn TextGenerator,
    min_capacity: usize,
}

impl<'a> MemoryConsolidator<'a> {
    pub fn new(summarizer: &'a dyn TextGenerator, min_capacity: usize) -> Self {
        Self {
            summarizer,
            min_capacity,
        }
    }

    /// Ask for a compacted hot set if `working` is over capacity.
    ///
    /// Returns `None` when no compaction is needed or when nothing in the
    /// summarizer's reply could be parsed.
    pub async fn plan(
        &self,
        working: &WorkingMemory,
        scope: &MemoryScope,
    ) -> Result<Option<ConsolidationPlan>, GenerationError> {
        let target = working.target(self.min_capacity);
        if !working.needs_consolidation(target) {
            return Ok(None);
        }

        let prompt = build_consolidation_prompt(working, target);
        let reply = self.summarizer.judge(&prompt).await?;

        let parsed = parse_labeled_entries(&reply, target);
        if parsed.is_empty() {
            warn!(target, hot = working.hot().len(), "no consolidated entries parsed, keeping hot set");
            return Ok(None);
        }
        if parsed.len() < target {
            warn!(target, parsed = parsed.len(), "consolidation returned fewer entries than requested");
        }

        let summaries = parsed
            .into_iter()
            .map(|content| MemoryEntry::dynamic(scope, MemoryTier::Hot, content))
            .collect::<Vec<_>>();

        debug!(target, hot = working.hot().len(), summaries = summaries.len(), "consolidation planned");
        Ok(Some(ConsolidationPlan { target, summaries }))
    }
}

fn build_consolidation_prompt(working: &WorkingMemory, target: usize) -> String {
    let memories = working
        .hot()
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {}", i + 1, e.content))
        .collect::<Vec<_>>()
        .join("\n");

    let format_lines = (1..=target)
        .map(|k| format!("entry {k}: <summary>"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You maintain the working memory of a roleplay character.

## Current Memories
{memories}

## Instructions
Merge these memories into exactly {target} concise summaries. Keep names,
commitments and facts the character must stay consistent with. Drop chit-chat.

Respond with ONLY these lines:
{format_lines}"#
    )
}
