//! Collaborator contracts for the local vault index and embeddings.
//!
//! The index implementation itself (vector store, chunking, persistence)
//! lives in the host; the core only searches through these interfaces.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// A note chunk stored in the vault index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub content: String,
    pub title: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A scored hit from a vector search. Higher score is closer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub chunk: IndexedChunk,
    pub score: f32,
}

/// Search interface over the initialized index.
#[async_trait]
pub trait VaultIndex: Send + Sync {
    async fn search_by_vector(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>, CoreError>;
}

/// Lazily-initialized accessor for the local vault index.
#[async_trait]
pub trait IndexAccessor: Send + Sync {
    /// Handle to the index if it has already been initialized.
    async fn get_db(&self) -> Option<Arc<dyn VaultIndex>>;

    /// Initialize the index, creating the backing store on first use.
    async fn initialize_db(&self) -> Result<Arc<dyn VaultIndex>, CoreError>;

    /// Rebuild the index from the full vault contents.
    async fn index_vault_to_store(&self) -> Result<(), CoreError>;
}

/// Produces query embeddings for retrieval.
#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CoreError>;
}

/// Host hook resolving the configured embeddings backend, if any.
pub trait EmbeddingsSource: Send + Sync {
    fn embeddings_api(&self) -> Option<Arc<dyn EmbeddingsProvider>>;
}
