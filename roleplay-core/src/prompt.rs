//! System prompt composition for persona replies.

use crate::catalog::{Activity, Agent, Course, Unit};
use crate::memory::MemoryEntry;

/// Composes the system prompt from persona, course, unit and hot memories.
pub struct PromptBuilder<'a> {
    agent: &'a Agent,
    activity: &'a Activity,
    course: &'a Course,
    learner_name: Option<&'a str>,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(agent: &'a Agent, activity: &'a Activity, course: &'a Course) -> Self {
        Self {
            agent,
            activity,
            course,
            learner_name: None,
        }
    }

    pub fn with_learner_name(mut self, name: &'a str) -> Self {
        if !name.trim().is_empty() {
            self.learner_name = Some(name);
        }
        self
    }

    /// Build the prompt for `unit` with the given hot memories.
    pub fn build(&self, unit: &Unit, hot: &[MemoryEntry]) -> String {
        let mut prompt = String::new();
        let agent = self.agent;

        prompt.push_str(&format!(
            "You are {}, a character in a roleplay training exercise. Stay in character at all times and never mention that this is an exercise.\n",
            agent.name
        ));

        // Persona
        prompt.push_str("\n## Persona\n");
        if !agent.background.is_empty() {
            prompt.push_str(&format!("**Background:** {}\n", agent.background));
        }
        if !agent.tone.is_empty() {
            prompt.push_str(&format!("**Tone:** {}\n", agent.tone));
        }
        if !agent.voice.is_empty() {
            prompt.push_str(&format!("**Voice:** {}\n", agent.voice));
        }

        // Course context
        prompt.push_str(&format!("\n## Exercise: {}\n", self.activity.name));
        if !self.activity.description.is_empty() {
            prompt.push_str(&self.activity.description);
            prompt.push('\n');
        }
        prompt.push_str(&format!("Course: {}\n", self.course.name));
        if !self.course.description.is_empty() {
            prompt.push_str(&self.course.description);
            prompt.push('\n');
        }

        // Current scene
        prompt.push_str("\n## Current Scene");
        if !unit.title.is_empty() {
            prompt.push_str(&format!(": {}", unit.title));
        }
        prompt.push('\n');
        if !unit.agent_role.is_empty() {
            prompt.push_str(&format!("**Your role:** {}\n", unit.agent_role));
        }
        match (unit.user_role.is_empty(), self.learner_name) {
            (false, Some(name)) => {
                prompt.push_str(&format!("**The learner ({name}) plays:** {}\n", unit.user_role))
            }
            (false, None) => prompt.push_str(&format!("**The learner plays:** {}\n", unit.user_role)),
            (true, Some(name)) => prompt.push_str(&format!("**Learner:** {name}\n")),
            (true, None) => {}
        }
        if !unit.behavior_prompt.is_empty() {
            prompt.push_str(&format!("\n### How to behave\n{}\n", unit.behavior_prompt));
        }

        // Memories
        if !hot.is_empty() {
            prompt.push_str("\n## What You Remember\n");
            for entry in hot {
                prompt.push_str(&format!("- {}\n", entry.content.replace('\n', " / ")));
            }
        }

        prompt
    }
}
