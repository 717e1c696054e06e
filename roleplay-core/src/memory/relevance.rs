//! Relevance-based promotion of cold memories.
//!
//! Before each reply, a judge sees the numbered cold set and the learner's
//! message and picks the entries worth recalling. Picked entries join the
//! working hot set for this turn only.

use super::working::WorkingMemory;
use crate::llm::{GenerationError, TextGenerator};
use crate::parse::parse_index_selection;
use tracing::{debug, warn};

/// Picks cold memories relevant to the current message.
pub struct RelevancePromoter<'a> {
    judge: &'a dyn TextGenerator,
}

impl<'a> RelevancePromoter<'a> {
    pub fn new(judge: &'a dyn TextGenerator) -> Self {
        Self { judge }
    }

    /// Promote relevant cold entries in `working` and return how many moved.
    ///
    /// An empty cold set skips the judge call. Unparsable judge output
    /// promotes nothing; only a failed call is an error.
    pub async fn promote(
        &self,
        working: &mut WorkingMemory,
        user_message: &str,
    ) -> Result<usize, GenerationError> {
        if working.cold().is_empty() {
            return Ok(0);
        }

        let prompt = build_relevance_prompt(working, user_message);
        let reply = self.judge.judge(&prompt).await?;

        let Some(positions) = parse_index_selection(&reply, working.cold().len()) else {
            warn!(reply = %reply, "unparsable relevance selection, promoting nothing");
            return Ok(0);
        };

        let promoted = working.promote(&positions);
        debug!(promoted, cold = working.cold().len(), "cold memories promoted");
        Ok(promoted)
    }
}

fn build_relevance_prompt(working: &WorkingMemory, user_message: &str) -> String {
    let memories = working
        .cold()
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {}", i + 1, e.content))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are selecting background memories that a roleplay character should recall.

## Learner Message
"{user_message}"

## Stored Memories
{memories}

## Instructions
Pick the memories that are relevant to answering the learner's message.
Respond with ONLY the memory numbers separated by commas (for example: 1, 3).
If no memory is relevant, respond with exactly: none"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEntry, MemoryTier};
    use crate::testing::MockGenerator;

    fn working() -> WorkingMemory {
        WorkingMemory::assemble(
            vec![
                MemoryEntry::baseline("agent", MemoryTier::Hot, "Runs the refund desk"),
                MemoryEntry::baseline("agent", MemoryTier::Cold, "Bought a kettle last week"),
                MemoryEntry::baseline("agent", MemoryTier::Cold, "Has a cat named Mochi"),
            ],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_promotes_selected_entries() {
        let judge = MockGenerator::new().with_judgments(["1"]);
        let mut memory = working();

        let promoted = RelevancePromoter::new(&judge)
            .promote(&mut memory, "Is my kettle covered?")
            .await
            .unwrap();

        assert_eq!(promoted, 1);
        assert_eq!(memory.hot().len(), 2);
        assert_eq!(memory.hot()[1].content, "Bought a kettle last week");
        let prompt = &judge.judge_prompts()[0];
        assert!(prompt.contains("1. Bought a kettle last week"));
        assert!(prompt.contains("2. Has a cat named Mochi"));
    }

    #[tokio::test]
    async fn test_unparsable_reply_fails_closed() {
        let judge = MockGenerator::new().with_judgments(["Memory one, I think"]);
        let mut memory = working();

        let promoted = RelevancePromoter::new(&judge)
            .promote(&mut memory, "hello")
            .await
            .unwrap();

        assert_eq!(promoted, 0);
        assert_eq!(memory.hot().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_cold_set_skips_judge() {
        let judge = MockGenerator::new();
        let mut memory = WorkingMemory::assemble(
            vec![MemoryEntry::baseline("agent", MemoryTier::Hot, "x")],
            Vec::new(),
        );

        let promoted = RelevancePromoter::new(&judge)
            .promote(&mut memory, "hello")
            .await
            .unwrap();

        assert_eq!(promoted, 0);
        assert_eq!(judge.judge_calls(), 0);
    }

    #[tokio::test]
    async fn test_judge_failure_is_an_error() {
        let judge = MockGenerator::new().failing_judge();
        let mut memory = working();

        let result = RelevancePromoter::new(&judge).promote(&mut memory, "hello").await;

        assert!(result.is_err());
        assert_eq!(memory.cold().len(), 2);
    }
}
