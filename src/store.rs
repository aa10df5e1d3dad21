use std::collections::HashMap;

use crate::events::Turn;

/// Per-persona conversation history for one user session.
///
/// Holds only finished turns; streaming fragments never land here.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    conversations: HashMap<String, Vec<Turn>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns of `persona` in conversation order, creating an empty
    /// conversation on first reference.
    pub fn get(&mut self, persona: &str) -> &[Turn] {
        self.conversations.entry(persona.to_string()).or_default()
    }

    /// Read-only view that does not create a conversation.
    pub fn peek(&self, persona: &str) -> &[Turn] {
        self.conversations
            .get(persona)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn append(&mut self, persona: &str, turn: Turn) {
        self.conversations
            .entry(persona.to_string())
            .or_default()
            .push(turn);
    }

    /// Empty the conversation but keep the persona known.
    pub fn reset(&mut self, persona: &str) {
        self.conversations
            .entry(persona.to_string())
            .or_default()
            .clear();
    }

    pub fn len(&self, persona: &str) -> usize {
        self.peek(persona).len()
    }

    pub fn is_empty(&self, persona: &str) -> bool {
        self.peek(persona).is_empty()
    }

    /// Personas that have been referenced in this session
    pub fn personas(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.conversations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Role;

    #[test]
    fn unseen_persona_is_empty_and_initialized() {
        let mut store = ConversationStore::new();
        assert!(store.peek("monk").is_empty());
        assert!(store.personas().is_empty());

        assert!(store.get("monk").is_empty());
        assert_eq!(store.personas(), vec!["monk"]);
    }

    #[test]
    fn appends_keep_order_and_duplicates() {
        let mut store = ConversationStore::new();
        let contents = ["why?", "why?", "because", "ok"];
        for (i, content) in contents.iter().enumerate() {
            let turn = if i % 2 == 0 {
                Turn::user(*content)
            } else {
                Turn::assistant(*content)
            };
            store.append("monk", turn);
        }

        let turns = store.get("monk");
        assert_eq!(turns.len(), contents.len());
        let got: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(got, contents);
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[test]
    fn personas_are_isolated() {
        let mut store = ConversationStore::new();
        store.append("a", Turn::user("for a"));
        store.append("b", Turn::user("for b"));
        store.append("b", Turn::assistant("reply b"));

        assert_eq!(store.len("a"), 1);
        assert_eq!(store.len("b"), 2);
        assert_eq!(store.get("a")[0].content, "for a");
    }

    #[test]
    fn reset_clears_only_that_persona() {
        let mut store = ConversationStore::new();
        store.append("a", Turn::user("one"));
        store.append("b", Turn::user("two"));

        store.reset("a");
        assert!(store.get("a").is_empty());
        assert!(store.is_empty("a"));
        assert_eq!(store.len("b"), 1);
        assert_eq!(store.personas(), vec!["a", "b"]);
    }
}
