//! Hybrid retrieval over the vault index.
//!
//! Fuses vector similarity with two auxiliary signals:
//! - salient-term keyword matches against note titles and bodies
//! - caller-supplied graph relations (backlinks, tags)
//!
//! The fused ranking is bounded by `max_k`; ties keep the original vector
//! order. Missing auxiliary signal degrades to a pure vector ranking.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::CoreError;
use crate::index::{EmbeddingsProvider, VaultIndex, VectorHit};

/// Weight of the salient-term signal relative to vector similarity.
const TERM_WEIGHT: f32 = 0.3;
/// Scale applied to graph-relation boosts.
const GRAPH_WEIGHT: f32 = 0.2;
/// Oversampling factor for the vector search so fusion has candidates to
/// promote beyond the final cut.
const CANDIDATE_FACTOR: usize = 4;

/// Knobs for one retrieval call. `salient_terms` is per-query input, not
/// global configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOptions {
    pub min_similarity_score: f32,
    pub max_k: usize,
    #[serde(default)]
    pub salient_terms: Vec<String>,
}

/// A document produced by a retrieval call, in fused-rank order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    pub title: String,
    pub path: String,
    pub score: f32,
}

/// Caller-supplied auxiliary relevance signal (backlink graph, tags).
#[async_trait]
pub trait GraphSignal: Send + Sync {
    /// Note paths related to the query subject, each with a boost weight.
    async fn related_paths(&self, query: &str) -> Result<Vec<(String, f32)>, CoreError>;
}

/// Combines vector search with keyword and graph signals.
///
/// Constructed with its index and embeddings handles up front; when
/// embeddings are unavailable the pipeline rebuild fails, not the query.
pub struct HybridRetriever {
    index: Arc<dyn VaultIndex>,
    embeddings: Arc<dyn EmbeddingsProvider>,
    graph: Option<Arc<dyn GraphSignal>>,
    options: RetrievalOptions,
    debug: bool,
}

struct FusedCandidate {
    hit: VectorHit,
    vector_rank: usize,
    combined: f32,
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn VaultIndex>,
        embeddings: Arc<dyn EmbeddingsProvider>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            index,
            embeddings,
            graph: None,
            options,
            debug: false,
        }
    }

    pub fn with_graph_signal(mut self, signal: Arc<dyn GraphSignal>) -> Self {
        self.graph = Some(signal);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    /// Retrieve at most `max_k` documents for `query`.
    ///
    /// `salient_terms` overrides the configured terms for this call when
    /// non-empty.
    pub async fn retrieve(
        &self,
        query: &str,
        salient_terms: &[String],
    ) -> Result<Vec<RetrievedDocument>, CoreError> {
        let terms: &[String] = if salient_terms.is_empty() {
            self.options.salient_terms.as_slice()
        } else {
            salient_terms
        };

        let query_embedding = self.embeddings.embed_query(query).await?;
        let candidate_limit = self
            .options
            .max_k
            .saturating_mul(CANDIDATE_FACTOR)
            .max(self.options.max_k);
        let hits = self
            .index
            .search_by_vector(&query_embedding, candidate_limit)
            .await?;

        let related = self.related_paths(query).await;
        let matchers = build_term_matchers(terms);

        let mut fused: Vec<FusedCandidate> = Vec::with_capacity(hits.len());
        for (vector_rank, hit) in hits.into_iter().enumerate() {
            if hit.score < self.options.min_similarity_score {
                continue;
            }
            let term_score = score_terms(&matchers, &hit.chunk.title, &hit.chunk.content);
            let graph_boost =
                related.get(&hit.chunk.path).copied().unwrap_or(0.0) * GRAPH_WEIGHT;
            let combined = hit.score + TERM_WEIGHT * term_score + graph_boost;
            fused.push(FusedCandidate {
                hit,
                vector_rank,
                combined,
            });
        }

        fused.sort_by(|left, right| {
            right
                .combined
                .partial_cmp(&left.combined)
                .unwrap_or(Ordering::Equal)
                .then_with(|| left.vector_rank.cmp(&right.vector_rank))
        });
        fused.truncate(self.options.max_k);

        if self.debug {
            for candidate in &fused {
                tracing::debug!(
                    "retrieval candidate path={} vector={:.4} combined={:.4}",
                    candidate.hit.chunk.path,
                    candidate.hit.score,
                    candidate.combined
                );
            }
        }

        Ok(fused
            .into_iter()
            .map(|candidate| RetrievedDocument {
                content: candidate.hit.chunk.content,
                title: candidate.hit.chunk.title,
                path: candidate.hit.chunk.path,
                score: candidate.combined,
            })
            .collect())
    }

    async fn related_paths(&self, query: &str) -> HashMap<String, f32> {
        let Some(signal) = &self.graph else {
            return HashMap::new();
        };
        match signal.related_paths(query).await {
            Ok(paths) => paths.into_iter().collect(),
            Err(err) => {
                tracing::warn!("graph signal failed, falling back to vector ranking: {err}");
                HashMap::new()
            }
        }
    }
}

fn build_term_matchers(terms: &[String]) -> Vec<Regex> {
    terms
        .iter()
        .filter_map(|term| {
            let trimmed = term.trim();
            if trimmed.is_empty() {
                return None;
            }
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(trimmed))).ok()
        })
        .collect()
}

/// Fraction of salient terms present in the document; a title match counts
/// double a body match.
fn score_terms(matchers: &[Regex], title: &str, content: &str) -> f32 {
    if matchers.is_empty() {
        return 0.0;
    }
    let mut total = 0.0f32;
    for matcher in matchers {
        if matcher.is_match(title) {
            total += 2.0;
        } else if matcher.is_match(content) {
            total += 1.0;
        }
    }
    total / (matchers.len() as f32 * 2.0)
}
