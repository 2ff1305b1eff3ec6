use crate::llm::registry::CustomModel;
use crate::llm::types::PromptMessage;
use crate::memory::ConversationMemory;

/// How the standing system prompt is presented to the active model.
///
/// Some reasoning-only model variants reject the system role outright; for
/// those the system content is re-homed as a leading assistant message so
/// the instructions still reach the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptAdaptation {
    #[default]
    SystemRole,
    AssistantPreamble,
    Omit,
}

impl PromptAdaptation {
    /// Pick the adaptation for the given model spec.
    ///
    /// An explicit caller request to drop the system prompt wins over the
    /// model-derived choice.
    pub fn for_model(model: Option<&CustomModel>, suppress_system: bool) -> Self {
        if suppress_system {
            return PromptAdaptation::Omit;
        }
        match model {
            Some(spec) if spec.capabilities.reasoning_only => PromptAdaptation::AssistantPreamble,
            _ => PromptAdaptation::SystemRole,
        }
    }
}

/// Builds the structured message template used by every pipeline:
/// system prompt, history placeholder, user turn.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    adaptation: PromptAdaptation,
}

impl PromptBuilder {
    pub fn new(system_prompt: impl Into<String>, adaptation: PromptAdaptation) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            adaptation,
        }
    }

    pub fn adaptation(&self) -> PromptAdaptation {
        self.adaptation
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Copy of this builder with a different adaptation.
    pub fn adapted(&self, adaptation: PromptAdaptation) -> Self {
        Self {
            system_prompt: self.system_prompt.clone(),
            adaptation,
        }
    }

    pub fn build(&self, memory: &ConversationMemory, user_input: &str) -> Vec<PromptMessage> {
        let mut messages = Vec::with_capacity(memory.len() * 2 + 2);
        self.push_preamble(&mut messages);
        messages.extend(memory.to_prompt_messages());
        messages.push(PromptMessage::user(user_input));
        messages
    }

    fn push_preamble(&self, messages: &mut Vec<PromptMessage>) {
        let prompt = self.system_prompt.trim();
        if prompt.is_empty() {
            return;
        }
        match self.adaptation {
            PromptAdaptation::SystemRole => messages.push(PromptMessage::system(prompt)),
            PromptAdaptation::AssistantPreamble => messages.push(PromptMessage::assistant(prompt)),
            PromptAdaptation::Omit => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::PromptRole;

    fn roles(messages: &[PromptMessage]) -> Vec<PromptRole> {
        messages.iter().map(|m| m.role).collect()
    }

    #[test]
    fn default_prompt_leads_with_system_role() {
        let builder = PromptBuilder::new("You are helpful.", PromptAdaptation::SystemRole);
        let memory = ConversationMemory::default();
        let messages = builder.build(&memory, "hi");

        assert_eq!(roles(&messages), vec![PromptRole::System, PromptRole::User]);
    }

    #[test]
    fn reasoning_model_gets_assistant_preamble_instead_of_system() {
        let mut model = CustomModel::new("o1", "openai");
        model.capabilities.reasoning_only = true;
        let adaptation = PromptAdaptation::for_model(Some(&model), false);
        assert_eq!(adaptation, PromptAdaptation::AssistantPreamble);

        let builder = PromptBuilder::new("You are helpful.", adaptation);
        let messages = builder.build(&ConversationMemory::default(), "hi");

        assert_eq!(
            roles(&messages),
            vec![PromptRole::Assistant, PromptRole::User]
        );
        assert_eq!(messages[0].content, "You are helpful.");
    }

    #[test]
    fn caller_suppression_drops_the_preamble_entirely() {
        let adaptation = PromptAdaptation::for_model(None, true);
        assert_eq!(adaptation, PromptAdaptation::Omit);

        let builder = PromptBuilder::new("You are helpful.", adaptation);
        let messages = builder.build(&ConversationMemory::default(), "hi");
        assert_eq!(roles(&messages), vec![PromptRole::User]);
    }

    #[test]
    fn empty_system_prompt_adds_nothing() {
        let builder = PromptBuilder::new("  ", PromptAdaptation::SystemRole);
        let messages = builder.build(&ConversationMemory::default(), "hi");
        assert_eq!(roles(&messages), vec![PromptRole::User]);
    }

    #[test]
    fn history_sits_between_preamble_and_user_turn() {
        let builder = PromptBuilder::new("sys", PromptAdaptation::SystemRole);
        let mut memory = ConversationMemory::default();
        memory.append_turn("earlier question", "earlier answer");
        let messages = builder.build(&memory, "now");

        assert_eq!(
            roles(&messages),
            vec![
                PromptRole::System,
                PromptRole::User,
                PromptRole::Assistant,
                PromptRole::User,
            ]
        );
        assert_eq!(messages[3].content, "now");
    }
}
