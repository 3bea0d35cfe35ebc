//! In-memory message log of one session.

use crate::llm::{Message, MessageRole};

/// Ordered, role-tagged message log.
///
/// Pure data: no locking and no I/O. The orchestrator is its only writer
/// while a turn runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a stored log.
    #[must_use]
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, role: MessageRole, content: impl Into<String>) {
        self.messages.push(Message::new(role, content));
    }

    /// Replace the newest message if it has `role`. Returns whether it did.
    pub fn replace_last_if(&mut self, role: MessageRole, content: impl Into<String>) -> bool {
        match self.messages.len().checked_sub(1) {
            Some(last) => self.replace_if(last, role, content),
            None => false,
        }
    }

    /// Replace the message at `index` if it has `role`.
    pub fn replace_if(&mut self, index: usize, role: MessageRole, content: impl Into<String>) -> bool {
        match self.messages.get_mut(index) {
            Some(message) if message.role == role => {
                message.content = content.into();
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages appended at or after `checkpoint`.
    #[must_use]
    pub fn since(&self, checkpoint: usize) -> &[Message] {
        self.messages.get(checkpoint..).unwrap_or_default()
    }

    /// Roll back to `len` messages.
    pub fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_last_only_on_matching_role() {
        let mut conv = Conversation::new();
        conv.append(MessageRole::User, "hi");
        assert!(!conv.replace_last_if(MessageRole::Assistant, "nope"));
        conv.append(MessageRole::Assistant, "");
        assert!(conv.replace_last_if(MessageRole::Assistant, "hello"));
        assert_eq!(conv.messages()[1], Message::assistant("hello"));
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn test_snapshot_reflects_latest_append() {
        let mut conv = Conversation::new();
        conv.append(MessageRole::User, "a");
        let first = conv.snapshot();
        conv.append(MessageRole::Assistant, "b");
        assert_eq!(first.len(), 1);
        assert_eq!(conv.snapshot().len(), 2);
    }

    #[test]
    fn test_truncate_and_since() {
        let mut conv = Conversation::from_messages(vec![Message::user("a"), Message::assistant("b")]);
        let checkpoint = conv.len();
        conv.append(MessageRole::User, "c");
        assert_eq!(conv.since(checkpoint), &[Message::user("c")]);
        assert!(conv.since(10).is_empty());
        conv.truncate(checkpoint);
        assert_eq!(conv.len(), 2);
        conv.clear();
        assert!(conv.is_empty());
    }

    #[test]
    fn test_replace_at_index() {
        let mut conv = Conversation::from_messages(vec![
            Message::user("q"),
            Message::assistant("draft"),
            Message::user("r"),
        ]);
        assert!(!conv.replace_if(0, MessageRole::Assistant, "x"));
        assert!(!conv.replace_if(9, MessageRole::Assistant, "x"));
        assert!(conv.replace_if(1, MessageRole::Assistant, "kept"));
        assert_eq!(conv.messages()[1], Message::assistant("kept"));
    }
}
