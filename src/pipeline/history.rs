//! Bounded conversation history

use crate::providers::{Message, Role};

/// Default maximum number of retained messages
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Messages exchanged so far in one conversation
///
/// When the limit is exceeded the oldest messages are dropped, but a leading
/// system message and the newest message are always kept.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: Vec<Message>,
    limit: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ConversationHistory {
    /// Empty history holding at most `limit` messages
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// History seeded with a system prompt
    #[must_use]
    pub fn with_system_prompt(prompt: impl Into<String>, limit: usize) -> Self {
        let mut history = Self::new(limit);
        history.messages.push(Message::system(prompt));
        history
    }

    /// Append a message, trimming the oldest entries past the limit
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        if self.messages.len() <= self.limit {
            return;
        }

        // A leading system prompt never counts against the newest message
        let start = usize::from(self.messages.first().is_some_and(|m| m.role == Role::System));
        let limit = self.limit.max(start + 1);
        let excess = self.messages.len().saturating_sub(limit);
        self.messages.drain(start..start + excess);
    }

    /// Drop all messages, optionally keeping the leading system prompt
    pub fn clear(&mut self, keep_system: bool) {
        let system = self
            .messages
            .first()
            .filter(|m| keep_system && m.role == Role::System)
            .cloned();
        self.messages.clear();
        self.messages.extend(system);
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
