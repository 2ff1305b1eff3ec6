//! Conversation memory: the ordered store of past turns used to condition
//! future model calls. Mode-agnostic; switching chains never touches it.

use std::collections::VecDeque;

use crate::llm::types::{ChatMessage, PromptMessage, Sender};

pub const DEFAULT_MEMORY_TURNS: usize = 40;

/// One completed exchange: user input paired with the assistant output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTurn {
    pub input: String,
    pub output: String,
}

#[derive(Debug)]
pub struct ConversationMemory {
    turns: VecDeque<MemoryTurn>,
    max_turns: usize,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_TURNS)
    }
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &MemoryTurn> {
        self.turns.iter()
    }

    /// Append a completed exchange, evicting the oldest turn past the cap.
    pub fn append_turn(&mut self, input: impl Into<String>, output: impl Into<String>) {
        if self.turns.len() == self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(MemoryTurn {
            input: input.into(),
            output: output.into(),
        });
    }

    /// Replace the memory contents with a loaded transcript.
    ///
    /// The transcript is replayed two entries at a time; a pair is written
    /// only when it reads user-then-assistant. Malformed pairs (missing
    /// partner, wrong attribution) are skipped.
    pub fn load_messages(&mut self, messages: &[ChatMessage]) {
        self.clear();
        for pair in messages.chunks(2) {
            let [first, second] = pair else {
                continue;
            };
            if first.sender == Sender::User && second.sender == Sender::Ai {
                self.append_turn(first.message.clone(), second.message.clone());
            }
        }
    }

    /// Render the stored turns as alternating user/assistant messages.
    pub fn to_prompt_messages(&self) -> Vec<PromptMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2);
        for turn in &self.turns {
            messages.push(PromptMessage::user(&turn.input));
            messages.push(PromptMessage::assistant(&turn.output));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;

    #[test]
    fn paired_messages_replay_into_one_turn() {
        let mut memory = ConversationMemory::default();
        memory.load_messages(&[ChatMessage::user("hi"), ChatMessage::ai("hello", vec![])]);

        assert_eq!(memory.len(), 1);
        let turn = memory.turns().next().expect("one turn");
        assert_eq!(turn.input, "hi");
        assert_eq!(turn.output, "hello");
    }

    #[test]
    fn unpaired_message_is_skipped() {
        let mut memory = ConversationMemory::default();
        memory.load_messages(&[ChatMessage::user("hi")]);
        assert!(memory.is_empty());
    }

    #[test]
    fn wrongly_attributed_pair_is_skipped() {
        let mut memory = ConversationMemory::default();
        memory.load_messages(&[
            ChatMessage::ai("hello", vec![]),
            ChatMessage::user("hi"),
            ChatMessage::user("are you there?"),
            ChatMessage::ai("yes", vec![]),
        ]);

        assert_eq!(memory.len(), 1);
        let turn = memory.turns().next().expect("one turn");
        assert_eq!(turn.input, "are you there?");
    }

    #[test]
    fn loading_clears_previous_contents() {
        let mut memory = ConversationMemory::default();
        memory.append_turn("old", "turn");
        memory.load_messages(&[]);
        assert!(memory.is_empty());
    }

    #[test]
    fn append_evicts_past_the_cap() {
        let mut memory = ConversationMemory::new(2);
        memory.append_turn("a", "1");
        memory.append_turn("b", "2");
        memory.append_turn("c", "3");

        assert_eq!(memory.len(), 2);
        assert_eq!(memory.turns().next().map(|t| t.input.as_str()), Some("b"));
    }

    #[test]
    fn prompt_rendering_alternates_roles() {
        let mut memory = ConversationMemory::default();
        memory.append_turn("question", "answer");
        let messages = memory.to_prompt_messages();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "question");
        assert_eq!(messages[1].content, "answer");
    }
}
