//! Conversation history: the ordered user/assistant transcript.
//!
//! Insertion order is chronological order is the order the reply generator
//! sees. History is cleared only when the conversation ends; it is never
//! truncated mid-conversation. An optional context bound limits how many
//! recent turns are *sent* to the generator without touching the transcript.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One utterance in the conversation.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Wire-format chat message for the reply generator.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Ordered transcript of one conversation.
#[derive(Debug, Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Role::User, text.into());
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(Role::Assistant, text.into());
    }

    fn push(&mut self, role: Role, text: String) {
        self.turns.push(Turn {
            role,
            text,
            timestamp: Utc::now(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Cleared only when the conversation ends.
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Assemble the generator context: the system prompt followed by the
    /// transcript in chronological order. `context_turns` bounds how many of
    /// the most recent turns are included (None = all of them).
    pub fn as_messages(&self, system_prompt: &str, context_turns: Option<usize>) -> Vec<ChatMessage> {
        let skip = match context_turns {
            Some(max) if self.turns.len() > max => self.turns.len() - max,
            _ => 0,
        };
        let mut messages = Vec::with_capacity(self.turns.len() - skip + 1);
        messages.push(ChatMessage::new("system", system_prompt));
        for turn in &self.turns[skip..] {
            messages.push(ChatMessage::new(turn.role.as_str(), turn.text.clone()));
        }
        messages
    }
}
