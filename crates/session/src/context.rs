//! Builds the model context a participant sees at the start of a run.
//!
//! Layout:
//! 1. one system message: persona, roster, available tools
//! 2. session history, from this participant's point of view
//! 3. an optional closing prompt (flow-lock nudges)
//!
//! The participant's own turns become assistant messages. Everyone else's
//! turns become user messages prefixed with the author's display name.

use conclave_core::message::{Context, Message};
use conclave_core::participant::{Participant, ParticipantRole};
use conclave_core::tool::ToolDefinition;
use conclave_core::turn::Turn;
use conclave_tools::directive;

/// Display name used for turns written by the human.
pub const USER_DISPLAY_NAME: &str = "User";

pub struct ContextBuilder<'a> {
    participant: &'a Participant,
    roster: &'a [Participant],
    history: &'a [Turn],
    tools: &'a [ToolDefinition],
    prompt: Option<&'a str>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(participant: &'a Participant, roster: &'a [Participant]) -> Self {
        Self {
            participant,
            roster,
            history: &[],
            tools: &[],
            prompt: None,
        }
    }

    pub fn history(mut self, history: &'a [Turn]) -> Self {
        self.history = history;
        self
    }

    pub fn tools(mut self, tools: &'a [ToolDefinition]) -> Self {
        self.tools = tools;
        self
    }

    pub fn prompt(mut self, prompt: Option<&'a str>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn build(self) -> Context {
        let mut context = Context::new();
        context.push(Message::system(self.system_prompt()));

        for turn in self.history {
            // Failure notices are for people, not for models
            if turn.is_failure() || turn.content.trim().is_empty() {
                continue;
            }
            if turn.author_id == self.participant.id {
                context.push(Message::assistant(&turn.content));
            } else {
                context.push(Message::user(format!(
                    "{}: {}",
                    self.display_name(&turn.author_id),
                    turn.content
                )));
            }
        }

        if let Some(prompt) = self.prompt.filter(|p| !p.trim().is_empty()) {
            context.push(Message::user(prompt));
        }

        context
    }

    fn system_prompt(&self) -> String {
        let me = self.participant;
        let mut out = match &me.system_prompt {
            Some(prompt) if !prompt.trim().is_empty() => prompt.trim().to_string(),
            _ => format!(
                "You are {}, taking part in a group conversation.",
                me.display_name
            ),
        };

        let others: Vec<String> = self
            .roster
            .iter()
            .filter(|p| p.id != me.id)
            .map(|p| format!("- {} (@{}, {})", p.display_name, p.id, role_label(p.role)))
            .collect();
        if !others.is_empty() {
            out.push_str("\n\nOther participants:\n");
            out.push_str(&others.join("\n"));
        }
        out.push_str(&format!(
            "\n\nMessages from others are prefixed with the speaker's name. \
             Reply as {} only, without a name prefix.",
            me.display_name
        ));

        let guide = directive::usage_guide(self.tools);
        if !guide.is_empty() {
            out.push_str("\n\n");
            out.push_str(&guide);
        }
        out
    }

    fn display_name<'b>(&'b self, author_id: &'b str) -> &'b str {
        if author_id == conclave_core::turn::USER_AUTHOR {
            return USER_DISPLAY_NAME;
        }
        self.roster
            .iter()
            .find(|p| p.id == author_id)
            .map(|p| p.display_name.as_str())
            .unwrap_or(author_id)
    }
}

fn role_label(role: ParticipantRole) -> &'static str {
    match role {
        ParticipantRole::Host => "host",
        ParticipantRole::Participant => "participant",
        ParticipantRole::Observer => "observer",
        ParticipantRole::Expert => "expert",
        ParticipantRole::Moderator => "moderator",
    }
}
