//! Conversation history: the ordered turns sent to the language model.
//!
//! Turns are append-only and never change once appended. The system turn is set
//! once, first, and can never be replaced; later appends are crate-private so that
//! only the session state machine writes history.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the system turn.
    ///
    /// ## Returns:
    /// - **true**: the prompt became the first turn
    /// - **false**: history already has turns; nothing changed
    pub(crate) fn set_system(&mut self, prompt: impl Into<String>) -> bool {
        if !self.turns.is_empty() {
            return false;
        }
        self.turns.push(Turn::new(Role::System, prompt));
        true
    }

    pub fn has_system(&self) -> bool {
        matches!(self.turns.first(), Some(turn) if turn.role == Role::System)
    }

    pub(crate) fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::new(Role::User, text));
    }

    pub(crate) fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::new(Role::Assistant, text));
    }

    /// Drop everything. Only used when the session closes.
    pub(crate) fn clear(&mut self) {
        self.turns.clear();
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

    pub fn count(&self, role: Role) -> usize {
        self.turns.iter().filter(|turn| turn.role == role).count()
    }
}
