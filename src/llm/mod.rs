pub mod provider;
pub mod registry;
pub mod types;

pub use provider::ChatModel;
pub use registry::{find_custom_model, CustomModel, ModelCapabilities, ModelRegistry};
pub use types::{ChatMessage, PromptMessage, PromptRole, Sender, SourceRef};
