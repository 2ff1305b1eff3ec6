use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation requested by the model during an agentic turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Host-side tool execution for agentic turns.
///
/// The core never executes tools itself; it forwards requests here and
/// feeds the result back into the conversation.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Tool names the agent may request this turn.
    fn available_tools(&self) -> Vec<String>;

    async fn invoke(&self, call: &ToolCall) -> anyhow::Result<Value>;
}
