use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::PromptMessage;
use crate::errors::CoreError;

/// Handle to a provider-backed chat model.
///
/// Implementations live in the host's vendor adapters; the core only
/// streams completions through this interface.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Stable identifier, typically `name|provider`.
    fn id(&self) -> &str;

    /// Cheap usability probe (credentials present, endpoint reachable).
    async fn validate(&self) -> bool;

    /// Stream a completion for the given prompt.
    ///
    /// Chunks arrive on the returned receiver; the channel closes after the
    /// last chunk. Triggering `cancel` aborts the in-flight provider call.
    async fn stream_chat(
        &self,
        messages: Vec<PromptMessage>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<String, CoreError>>, CoreError>;
}
