use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no usable chat model configured")]
    NoChatModel,
    #[error("unknown model: {0}")]
    ModelNotFound(String),
    #[error("model key matches more than one configured model: {0}")]
    DuplicateModel(String),
    #[error("unsupported chain type: {0}")]
    UnsupportedChainType(String),
    #[error("vault index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("embeddings API unavailable")]
    EmbeddingsUnavailable,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("turn cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        CoreError::Internal(err.to_string())
    }
}
