//! Pure construction of runnable pipelines.
//!
//! Every call produces a fresh, independently usable chain value; the
//! manager swaps whole values in and out, never mutates one in place. An
//! in-flight turn keeps its own reference and is unaffected by a swap.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::CoreError;
use crate::llm::provider::ChatModel;
use crate::llm::types::PromptMessage;
use crate::memory::ConversationMemory;
use crate::prompt::{PromptAdaptation, PromptBuilder};
use crate::retriever::{HybridRetriever, RetrievedDocument};

/// Side channel through which a retrieval chain publishes the documents
/// backing the current answer. Fires exactly once per query.
pub type DocumentsCallback = Arc<dyn Fn(Vec<RetrievedDocument>) + Send + Sync>;

/// Conversational pipeline: prompt template + shared memory + model.
pub struct ConversationalChain {
    model: Arc<dyn ChatModel>,
    memory: Arc<Mutex<ConversationMemory>>,
    prompt: PromptBuilder,
}

pub struct ConversationalChainArgs {
    pub model: Arc<dyn ChatModel>,
    pub memory: Arc<Mutex<ConversationMemory>>,
    pub prompt: PromptBuilder,
}

pub fn build_conversational_chain(args: ConversationalChainArgs) -> ConversationalChain {
    ConversationalChain {
        model: args.model,
        memory: args.memory,
        prompt: args.prompt,
    }
}

impl ConversationalChain {
    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub fn prompt(&self) -> &PromptBuilder {
        &self.prompt
    }

    /// Prompt messages for one turn, with a per-turn adaptation override.
    pub fn build_messages(
        &self,
        user_input: &str,
        adaptation: PromptAdaptation,
    ) -> Result<Vec<PromptMessage>, CoreError> {
        let builder = if adaptation == self.prompt.adaptation() {
            self.prompt.clone()
        } else {
            self.prompt.adapted(adaptation)
        };
        let memory = self.memory.lock().map_err(CoreError::internal)?;
        Ok(builder.build(&memory, user_input))
    }

    pub async fn stream_turn(
        &self,
        messages: Vec<PromptMessage>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<String, CoreError>>, CoreError> {
        self.model.stream_chat(messages, cancel).await
    }
}

/// Retrieval pipeline: hybrid retriever + model + grounding instructions.
pub struct RetrievalChain {
    model: Arc<dyn ChatModel>,
    retriever: Arc<HybridRetriever>,
    system_message: String,
    on_documents: DocumentsCallback,
    debug: bool,
}

pub struct RetrievalChainArgs {
    pub model: Arc<dyn ChatModel>,
    pub retriever: HybridRetriever,
    pub system_message: String,
}

pub fn build_retrieval_chain(
    args: RetrievalChainArgs,
    on_documents: DocumentsCallback,
    debug: bool,
) -> RetrievalChain {
    RetrievalChain {
        model: args.model,
        retriever: Arc::new(args.retriever),
        system_message: args.system_message,
        on_documents,
        debug,
    }
}

impl RetrievalChain {
    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub fn retriever(&self) -> &HybridRetriever {
        &self.retriever
    }

    /// Retrieve supporting notes and stream the grounded answer.
    pub async fn stream_turn(
        &self,
        question: &str,
        salient_terms: &[String],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<String, CoreError>>, CoreError> {
        let documents = self.retriever.retrieve(question, salient_terms).await?;
        if self.debug {
            tracing::debug!("retrieved {} documents for question", documents.len());
        }
        let messages = self.build_messages(&documents, question);
        (self.on_documents)(documents);
        self.model.stream_chat(messages, cancel).await
    }

    fn build_messages(
        &self,
        documents: &[RetrievedDocument],
        question: &str,
    ) -> Vec<PromptMessage> {
        vec![
            PromptMessage::system(format!(
                "{}\n\n{}",
                self.system_message,
                format_context(documents)
            )),
            PromptMessage::user(question),
        ]
    }
}

fn format_context(documents: &[RetrievedDocument]) -> String {
    if documents.is_empty() {
        return "No matching notes were found in the vault.".to_string();
    }
    let blocks: Vec<String> = documents
        .iter()
        .map(|doc| format!("Note: {}\nPath: {}\n{}", doc.title, doc.path, doc.content))
        .collect();
    format!("Context from the vault:\n{}", blocks.join("\n---\n"))
}
