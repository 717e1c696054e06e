//! Unit pass conditions.

use crate::catalog::PassCondition;
use crate::llm::{GenerationError, TextGenerator};
use crate::parse::parse_verdict;
use tracing::warn;

/// Result of checking a unit's pass condition after a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub passed: bool,
    /// Judge explanation, recorded in the unit's evaluation trail.
    pub justification: Option<String>,
}

impl Evaluation {
    fn plain(passed: bool) -> Self {
        Self {
            passed,
            justification: None,
        }
    }
}

/// Whether every keyword occurs in `transcript`, ignoring case.
///
/// Order does not matter and an empty keyword list is satisfied.
pub fn keywords_present(keywords: &[String], transcript: &str) -> bool {
    let haystack = transcript.to_lowercase();
    keywords
        .iter()
        .all(|k| haystack.contains(&k.to_lowercase()))
}

/// Applies a unit's [`PassCondition`] to the learner's messages.
pub struct PassEvaluator<'a> {
    judge: &'a dyn TextGenerator,
}

impl<'a> PassEvaluator<'a> {
    pub fn new(judge: &'a dyn TextGenerator) -> Self {
        Self { judge }
    }

    /// Evaluate `condition` against every learner message of the unit.
    ///
    /// `transcript` is the learner's messages joined by newlines and
    /// `last_reply` the persona's latest answer, shown to the judge as context.
    pub async fn evaluate(
        &self,
        condition: &PassCondition,
        transcript: &str,
        last_reply: &str,
    ) -> Result<Evaluation, GenerationError> {
        match condition {
            PassCondition::Keyword(keywords) => Ok(Evaluation::plain(keywords_present(keywords, transcript))),
            PassCondition::Llm(rules) if rules.is_empty() => Ok(Evaluation::plain(true)),
            PassCondition::Llm(rules) => {
                let prompt = build_pass_prompt(rules, transcript, last_reply);
                let reply = self.judge.judge(&prompt).await?;

                match parse_verdict(&reply) {
                    Some(verdict) => Ok(Evaluation {
                        passed: verdict.passed,
                        justification: Some(verdict.justification),
                    }),
                    None => {
                        warn!(reply = %reply, "unparsable pass verdict, treating as not passed");
                        Ok(Evaluation {
                            passed: false,
                            justification: Some(format!("UNPARSED: {}", reply.trim())),
                        })
                    }
                }
            }
        }
    }
}

fn build_pass_prompt(rules: &[String], transcript: &str, last_reply: &str) -> String {
    let criteria = rules
        .iter()
        .map(|r| format!("- {r}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are grading a learner in a roleplay training exercise.

## Pass Criteria
{criteria}

## Learner Messages
{transcript}

## Character's Latest Reply
{last_reply}

## Instructions
Decide whether the learner's messages satisfy ALL of the criteria.
Start your answer with YES or NO, then give a one-sentence justification."#
    )
}
