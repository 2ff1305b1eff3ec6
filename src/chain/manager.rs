//! The orchestration hub: owns the active pipelines, reacts to
//! configuration changes, and dispatches user turns to the runner for the
//! current mode.
//!
//! Pipeline swaps are atomic: callers observe either the old chain or the
//! fully rebuilt one, never a partially updated state. Failures during a
//! rebuild leave the previous pipeline queryable.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::factory::{
    build_conversational_chain, build_retrieval_chain, ConversationalChain,
    ConversationalChainArgs, DocumentsCallback, RetrievalChain, RetrievalChainArgs,
};
use super::runner::{
    AgenticRunner, PlainChatRunner, TurnContext, TurnRunner, TurnSink, VaultQaRunner,
};
use super::ChainType;
use crate::errors::CoreError;
use crate::index::{EmbeddingsSource, IndexAccessor, VaultIndex};
use crate::llm::provider::ChatModel;
use crate::llm::registry::{find_custom_model, CustomModel, ModelRegistry};
use crate::llm::types::ChatMessage;
use crate::memory::ConversationMemory;
use crate::notice::NoticeSink;
use crate::prompt::{PromptAdaptation, PromptBuilder};
use crate::retriever::{GraphSignal, HybridRetriever, RetrievalOptions, RetrievedDocument};
use crate::settings::{ReindexStrategy, SettingsEvent, SettingsProvider};
use crate::tools::ToolInvoker;

/// Similarity floor applied to every vault-QA retrieval.
const QA_MIN_SIMILARITY: f32 = 0.01;

#[derive(Debug, Clone, Default)]
pub struct SetChainOptions {
    /// Force a full reindex before the retrieval pipeline is rebuilt.
    pub refresh_index: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Build this turn's prompt without a system message.
    pub no_system_prompt: bool,
    /// Query keywords forwarded to the hybrid retriever.
    pub salient_terms: Vec<String>,
}

/// Collaborators injected at construction.
pub struct ChainManagerDeps {
    pub settings: Arc<dyn SettingsProvider>,
    pub registry: Arc<dyn ModelRegistry>,
    pub index: Arc<dyn IndexAccessor>,
    pub embeddings: Arc<dyn EmbeddingsSource>,
    pub notices: Arc<dyn NoticeSink>,
    pub tools: Option<Arc<dyn ToolInvoker>>,
    pub graph: Option<Arc<dyn GraphSignal>>,
}

struct ActiveChains {
    chain_type: ChainType,
    conversational: Option<Arc<ConversationalChain>>,
    retrieval: Option<Arc<RetrievalChain>>,
}

pub struct ChainManager {
    settings: Arc<dyn SettingsProvider>,
    registry: Arc<dyn ModelRegistry>,
    index: Arc<dyn IndexAccessor>,
    embeddings: Arc<dyn EmbeddingsSource>,
    notices: Arc<dyn NoticeSink>,
    tools: Option<Arc<dyn ToolInvoker>>,
    graph: Option<Arc<dyn GraphSignal>>,
    memory: Arc<Mutex<ConversationMemory>>,
    active: Mutex<ActiveChains>,
    cached_documents: Arc<Mutex<Vec<RetrievedDocument>>>,
    shutdown: CancellationToken,
}

impl ChainManager {
    pub fn new(deps: ChainManagerDeps) -> Self {
        let chain_type = deps.settings.chain_type();
        Self {
            settings: deps.settings,
            registry: deps.registry,
            index: deps.index,
            embeddings: deps.embeddings,
            notices: deps.notices,
            tools: deps.tools,
            graph: deps.graph,
            memory: Arc::new(Mutex::new(ConversationMemory::default())),
            active: Mutex::new(ActiveChains {
                chain_type,
                conversational: None,
                retrieval: None,
            }),
            cached_documents: Arc::new(Mutex::new(Vec::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn current_chain_type(&self) -> ChainType {
        self.lock_active().chain_type
    }

    pub fn get_chain(&self) -> Option<Arc<ConversationalChain>> {
        self.lock_active().conversational.clone()
    }

    pub fn get_retrieval_chain(&self) -> Option<Arc<RetrievalChain>> {
        self.lock_active().retrieval.clone()
    }

    /// Documents cached by the most recent retrieval, for the rendering
    /// pass (citation display). Overwritten on every new retrieval.
    pub fn cached_documents(&self) -> Vec<RetrievedDocument> {
        self.cached_documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Shared conversation memory. Mode-agnostic.
    pub fn memory(&self) -> Arc<Mutex<ConversationMemory>> {
        Arc::clone(&self.memory)
    }

    /// Rebuild the active pipeline for the requested mode.
    ///
    /// On failure the previously installed pipelines stay queryable; only
    /// a successful rebuild swaps the slot.
    pub async fn set_chain(
        &self,
        chain_type: ChainType,
        options: SetChainOptions,
    ) -> Result<(), CoreError> {
        let model = match self.usable_chat_model().await {
            Ok(model) => model,
            Err(err) => {
                self.notices
                    .notify("No usable chat model is configured. Pick a model in settings.");
                return Err(err);
            }
        };

        match chain_type {
            ChainType::PlainChat => {
                let chain = Arc::new(self.build_conversational(model));
                let mut active = self.lock_active();
                active.conversational = Some(chain);
                active.chain_type = chain_type;
            }
            ChainType::VaultQa => {
                let db = self.ensure_index_ready(options.refresh_index).await?;
                let retriever = self.build_retriever(db)?;
                let chain = Arc::new(self.build_retrieval(model, retriever));
                let mut active = self.lock_active();
                active.retrieval = Some(chain);
                active.chain_type = chain_type;
            }
            ChainType::Agentic => {
                // Eager index readiness so the agent can retrieve on demand.
                self.ensure_index_ready(options.refresh_index).await?;
                let chain = Arc::new(self.build_conversational(model));
                let mut active = self.lock_active();
                active.conversational = Some(chain);
                active.chain_type = chain_type;
            }
        }

        tracing::info!("active chain set to {chain_type}");
        Ok(())
    }

    /// Re-resolve the active model key and rebuild the current mode.
    ///
    /// An unresolvable key falls back to the built-in default model; the
    /// substitution is logged, never silent. Errors are logged and
    /// swallowed so a bad model config cannot crash the host.
    pub async fn create_chain_with_new_model(&self) {
        let key = self.settings.active_model_key();
        let models = self.settings.custom_models();

        let spec = match find_custom_model(&key, &models) {
            Ok(Some(found)) => found.clone(),
            Ok(None) => {
                let fallback = CustomModel::builtin_default();
                tracing::warn!(
                    "model key '{key}' does not resolve to a configured model, substituting {}",
                    fallback.key()
                );
                fallback
            }
            Err(err) => {
                tracing::error!("model lookup failed: {err}");
                self.notices
                    .notify(&format!("Model configuration problem: {err}"));
                return;
            }
        };

        if let Err(err) = self.registry.set_chat_model(&spec).await {
            tracing::error!("failed to install model {}: {err}", spec.key());
            self.notices
                .notify(&format!("Could not switch to model {}: {err}", spec.key()));
            return;
        }

        let chain_type = self.settings.chain_type();
        if let Err(err) = self.set_chain(chain_type, SetChainOptions::default()).await {
            tracing::error!("failed to rebuild {chain_type} after model change: {err}");
        }
    }

    /// Execute one conversational turn against the active pipeline.
    ///
    /// Partial output streams through `sink`; the committed message is
    /// returned on success. A pipeline that no longer matches the current
    /// mode or model is silently rebuilt first.
    pub async fn run_chain(
        &self,
        user_message: &str,
        cancel: CancellationToken,
        sink: TurnSink,
        options: TurnOptions,
    ) -> Result<ChatMessage, CoreError> {
        let model = match self.usable_chat_model().await {
            Ok(model) => model,
            Err(err) => {
                self.notices
                    .notify("No usable chat model is configured. Pick a model in settings.");
                return Err(err);
            }
        };

        let chain_type = self.current_chain_type();
        if !self.pipeline_matches(chain_type, &model) {
            tracing::debug!("active pipeline out of date for {chain_type}, rebuilding");
            self.set_chain(chain_type, SetChainOptions::default())
                .await?;
        }

        let adaptation =
            PromptAdaptation::for_model(self.registry.active_model().as_ref(), options.no_system_prompt);
        let runner = self.runner_for(chain_type)?;
        let ctx = TurnContext {
            cancel,
            sink,
            adaptation,
            salient_terms: options.salient_terms,
        };
        runner.run(user_message, ctx).await
    }

    /// Replace memory with a loaded transcript (see
    /// [`ConversationMemory::load_messages`] for the pairing rules).
    pub fn update_memory_with_loaded_messages(&self, messages: &[ChatMessage]) {
        let mut memory = self
            .memory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        memory.load_messages(messages);
    }

    /// Listen for settings events until shutdown. Registered once by the
    /// host after construction.
    pub fn spawn_settings_listener(self: Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.settings.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => self.handle_settings_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("settings listener lagged, skipped {skipped} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Deregister the settings listener and stop reacting to events.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn handle_settings_event(&self, event: SettingsEvent) {
        match event {
            SettingsEvent::ModelChanged => self.create_chain_with_new_model().await,
            SettingsEvent::ChainTypeChanged(chain_type) => {
                if let Err(err) = self.set_chain(chain_type, SetChainOptions::default()).await {
                    tracing::error!("failed to switch chain to {chain_type}: {err}");
                }
            }
            SettingsEvent::SettingsChanged => {
                let chain_type = self.current_chain_type();
                if let Err(err) = self.set_chain(chain_type, SetChainOptions::default()).await {
                    tracing::error!("failed to rebuild {chain_type} after settings change: {err}");
                }
            }
        }
    }

    async fn usable_chat_model(&self) -> Result<Arc<dyn ChatModel>, CoreError> {
        let model = self.registry.get_chat_model().ok_or(CoreError::NoChatModel)?;
        if !self.registry.validate_chat_model(model.as_ref()).await {
            return Err(CoreError::NoChatModel);
        }
        Ok(model)
    }

    fn build_conversational(&self, model: Arc<dyn ChatModel>) -> ConversationalChain {
        let adaptation =
            PromptAdaptation::for_model(self.registry.active_model().as_ref(), false);
        let prompt = PromptBuilder::new(self.settings.system_prompt(), adaptation);
        build_conversational_chain(ConversationalChainArgs {
            model,
            memory: Arc::clone(&self.memory),
            prompt,
        })
    }

    async fn ensure_index_ready(&self, refresh: bool) -> Result<Arc<dyn VaultIndex>, CoreError> {
        let db = match self.index.get_db().await {
            Some(db) => db,
            None => self.index.initialize_db().await?,
        };
        if refresh || self.settings.reindex_strategy() == ReindexStrategy::OnModeSwitch {
            self.index.index_vault_to_store().await?;
        }
        Ok(db)
    }

    fn build_retriever(&self, db: Arc<dyn VaultIndex>) -> Result<HybridRetriever, CoreError> {
        let embeddings = self
            .embeddings
            .embeddings_api()
            .ok_or(CoreError::EmbeddingsUnavailable)?;
        let options = RetrievalOptions {
            min_similarity_score: QA_MIN_SIMILARITY,
            max_k: self.settings.max_source_chunks(),
            salient_terms: Vec::new(),
        };
        let mut retriever =
            HybridRetriever::new(db, embeddings, options).with_debug(self.settings.debug());
        if let Some(graph) = &self.graph {
            retriever = retriever.with_graph_signal(Arc::clone(graph));
        }
        Ok(retriever)
    }

    fn build_retrieval(
        &self,
        model: Arc<dyn ChatModel>,
        retriever: HybridRetriever,
    ) -> RetrievalChain {
        let cached = Arc::clone(&self.cached_documents);
        let on_documents: DocumentsCallback = Arc::new(move |documents| {
            if let Ok(mut slot) = cached.lock() {
                *slot = documents;
            }
        });
        build_retrieval_chain(
            RetrievalChainArgs {
                model,
                retriever,
                system_message: qa_system_message(&self.settings.system_prompt()),
            },
            on_documents,
            self.settings.debug(),
        )
    }

    /// Whether the installed pipeline for `chain_type` embeds the model the
    /// registry currently reports active.
    fn pipeline_matches(&self, chain_type: ChainType, model: &Arc<dyn ChatModel>) -> bool {
        let active = self.lock_active();
        match chain_type {
            ChainType::PlainChat | ChainType::Agentic => active
                .conversational
                .as_ref()
                .is_some_and(|chain| Arc::ptr_eq(chain.model(), model)),
            ChainType::VaultQa => active
                .retrieval
                .as_ref()
                .is_some_and(|chain| Arc::ptr_eq(chain.model(), model)),
        }
    }

    fn runner_for(&self, chain_type: ChainType) -> Result<TurnRunner, CoreError> {
        let active = self.lock_active();
        match chain_type {
            ChainType::PlainChat => {
                let chain = active
                    .conversational
                    .clone()
                    .ok_or_else(|| CoreError::Internal("conversational pipeline missing".into()))?;
                Ok(TurnRunner::PlainChat(PlainChatRunner {
                    chain,
                    memory: Arc::clone(&self.memory),
                }))
            }
            ChainType::VaultQa => {
                let chain = active
                    .retrieval
                    .clone()
                    .ok_or_else(|| CoreError::Internal("retrieval pipeline missing".into()))?;
                Ok(TurnRunner::VaultQa(VaultQaRunner {
                    chain,
                    memory: Arc::clone(&self.memory),
                    cached_documents: Arc::clone(&self.cached_documents),
                }))
            }
            ChainType::Agentic => {
                let chain = active
                    .conversational
                    .clone()
                    .ok_or_else(|| CoreError::Internal("conversational pipeline missing".into()))?;
                Ok(TurnRunner::Agentic(AgenticRunner {
                    chain,
                    memory: Arc::clone(&self.memory),
                    tools: self.tools.clone(),
                }))
            }
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, ActiveChains> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn qa_system_message(system_prompt: &str) -> String {
    let grounding =
        "Answer using only the provided notes. Cite the note titles you relied on.";
    let prompt = system_prompt.trim();
    if prompt.is_empty() {
        grounding.to_string()
    } else {
        format!("{prompt}\n\n{grounding}")
    }
}
