//! Per-mode turn execution.
//!
//! A runner drives one conversational turn end to end: it formats the
//! request through the pipeline for its mode, streams partial output,
//! honors cooperative cancellation, and commits the exchange to memory
//! only on success. Cancellation discards the partial transcript.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::factory::{ConversationalChain, RetrievalChain};
use crate::errors::CoreError;
use crate::llm::types::{ChatMessage, PromptMessage, SourceRef};
use crate::memory::ConversationMemory;
use crate::prompt::PromptAdaptation;
use crate::retriever::RetrievedDocument;
use crate::tools::{ToolCall, ToolInvoker};

/// Upper bound on tool rounds within one agentic turn.
const MAX_TOOL_STEPS: usize = 4;

/// Incremental output of one conversational turn.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A streamed fragment of the assistant reply.
    Token(String),
    /// Citations for the reply; emitted once, before `Done`, on
    /// retrieval-backed modes.
    Sources(Vec<SourceRef>),
    /// The agent decided to invoke a tool.
    ToolCall { name: String },
    /// Terminal event carrying the committed message.
    Done(ChatMessage),
    /// Terminal diagnostic; the turn was not committed.
    Error(String),
}

pub type TurnSink = mpsc::Sender<TurnEvent>;

pub(crate) struct TurnContext {
    pub cancel: CancellationToken,
    pub sink: TurnSink,
    pub adaptation: PromptAdaptation,
    pub salient_terms: Vec<String>,
}

pub(crate) enum TurnRunner {
    PlainChat(PlainChatRunner),
    VaultQa(VaultQaRunner),
    Agentic(AgenticRunner),
}

impl TurnRunner {
    pub(crate) async fn run(
        &self,
        user_message: &str,
        ctx: TurnContext,
    ) -> Result<ChatMessage, CoreError> {
        let result = match self {
            TurnRunner::PlainChat(runner) => runner.run(user_message, &ctx).await,
            TurnRunner::VaultQa(runner) => runner.run(user_message, &ctx).await,
            TurnRunner::Agentic(runner) => runner.run(user_message, &ctx).await,
        };
        match result {
            Ok(message) => {
                let _ = ctx.sink.send(TurnEvent::Done(message.clone())).await;
                Ok(message)
            }
            // No further callbacks after cancellation.
            Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
            Err(err) => {
                let _ = ctx.sink.send(TurnEvent::Error(err.to_string())).await;
                Err(err)
            }
        }
    }
}

pub(crate) struct PlainChatRunner {
    pub chain: Arc<ConversationalChain>,
    pub memory: Arc<Mutex<ConversationMemory>>,
}

impl PlainChatRunner {
    async fn run(&self, user_message: &str, ctx: &TurnContext) -> Result<ChatMessage, CoreError> {
        let messages = self.chain.build_messages(user_message, ctx.adaptation)?;
        let rx = self.chain.stream_turn(messages, ctx.cancel.clone()).await?;
        let reply = drain_stream(rx, &ctx.cancel, &ctx.sink).await?;
        commit_turn(&self.memory, user_message, &reply)?;
        Ok(ChatMessage::ai(reply, Vec::new()))
    }
}

pub(crate) struct VaultQaRunner {
    pub chain: Arc<RetrievalChain>,
    pub memory: Arc<Mutex<ConversationMemory>>,
    pub cached_documents: Arc<Mutex<Vec<RetrievedDocument>>>,
}

impl VaultQaRunner {
    async fn run(&self, user_message: &str, ctx: &TurnContext) -> Result<ChatMessage, CoreError> {
        let rx = self
            .chain
            .stream_turn(user_message, &ctx.salient_terms, ctx.cancel.clone())
            .await?;
        let reply = drain_stream(rx, &ctx.cancel, &ctx.sink).await?;

        let sources = collect_sources(&self.cached_documents)?;
        if !sources.is_empty() {
            let _ = ctx.sink.send(TurnEvent::Sources(sources.clone())).await;
        }

        commit_turn(&self.memory, user_message, &reply)?;
        Ok(ChatMessage::ai(reply, sources))
    }
}

pub(crate) struct AgenticRunner {
    pub chain: Arc<ConversationalChain>,
    pub memory: Arc<Mutex<ConversationMemory>>,
    pub tools: Option<Arc<dyn ToolInvoker>>,
}

impl AgenticRunner {
    async fn run(&self, user_message: &str, ctx: &TurnContext) -> Result<ChatMessage, CoreError> {
        let mut messages = self.chain.build_messages(user_message, ctx.adaptation)?;

        let tool_names = self
            .tools
            .as_ref()
            .map(|invoker| invoker.available_tools())
            .unwrap_or_default();
        if !tool_names.is_empty() {
            let instructions = build_tool_instructions(&tool_names);
            let at = messages.len().saturating_sub(1);
            messages.insert(at, instruction_message(ctx.adaptation, instructions));
        }

        let mut reply = String::new();
        for _step in 0..MAX_TOOL_STEPS {
            let rx = self
                .chain
                .stream_turn(messages.clone(), ctx.cancel.clone())
                .await?;
            let response = drain_buffered(rx, &ctx.cancel).await?;

            match parse_agent_decision(&response) {
                AgentDecision::Final(text) => {
                    reply = text;
                    break;
                }
                AgentDecision::ToolCall { name, args } => {
                    let Some(invoker) = &self.tools else {
                        messages.push(PromptMessage::assistant(response));
                        messages.push(instruction_message(
                            ctx.adaptation,
                            "Tool use is unavailable. Answer directly.".to_string(),
                        ));
                        continue;
                    };
                    let _ = ctx
                        .sink
                        .send(TurnEvent::ToolCall { name: name.clone() })
                        .await;
                    let call = ToolCall {
                        name: name.clone(),
                        arguments: args,
                    };
                    let observation = match invoker.invoke(&call).await {
                        Ok(value) => value.to_string(),
                        Err(err) => {
                            tracing::warn!("tool '{name}' failed: {err}");
                            format!("Tool '{name}' failed: {err}")
                        }
                    };
                    messages.push(PromptMessage::assistant(response));
                    messages.push(instruction_message(
                        ctx.adaptation,
                        format!("Result of '{name}':\n{observation}"),
                    ));
                }
            }
        }

        if reply.is_empty() {
            reply = "I ran out of tool steps before reaching an answer. Please retry or narrow the request.".to_string();
        }
        let _ = ctx.sink.send(TurnEvent::Token(reply.clone())).await;

        commit_turn(&self.memory, user_message, &reply)?;
        Ok(ChatMessage::ai(reply, Vec::new()))
    }
}

/// What the model asked for in an agentic step.
#[derive(Debug, Clone)]
enum AgentDecision {
    Final(String),
    ToolCall { name: String, args: Value },
}

fn parse_agent_decision(text: &str) -> AgentDecision {
    if let Some(value) = parse_json_block(text) {
        if let Some(decision) = decision_from_value(&value) {
            return decision;
        }
    }
    AgentDecision::Final(text.trim().to_string())
}

fn parse_json_block(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}

fn decision_from_value(value: &Value) -> Option<AgentDecision> {
    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match kind {
        "tool_call" => {
            let name = value
                .get("tool")
                .or_else(|| value.get("name"))
                .and_then(|v| v.as_str())?;
            let args = value
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            Some(AgentDecision::ToolCall {
                name: name.to_string(),
                args,
            })
        }
        "final" => {
            let content = value
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Some(AgentDecision::Final(content))
        }
        _ => None,
    }
}

fn build_tool_instructions(tool_names: &[String]) -> String {
    format!(
        "You may use the following tools: {}.\n\
         To invoke a tool, respond ONLY with JSON in this format:\n\
         {{\"type\":\"tool_call\",\"tool\":\"<name>\",\"arguments\":{{...}}}}\n\
         When you have the final answer, respond ONLY with:\n\
         {{\"type\":\"final\",\"content\":\"...\"}}",
        tool_names.join(", ")
    )
}

/// Instructions follow the active prompt adaptation so models that reject
/// the system role still receive them.
fn instruction_message(adaptation: PromptAdaptation, content: String) -> PromptMessage {
    match adaptation {
        PromptAdaptation::AssistantPreamble => PromptMessage::assistant(content),
        _ => PromptMessage::system(content),
    }
}

/// Forward stream chunks to the sink until the channel closes.
async fn drain_stream(
    mut rx: mpsc::Receiver<Result<String, CoreError>>,
    cancel: &CancellationToken,
    sink: &TurnSink,
) -> Result<String, CoreError> {
    let mut reply = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            chunk = rx.recv() => match chunk {
                None => break,
                Some(Ok(token)) => {
                    if token.is_empty() {
                        continue;
                    }
                    reply.push_str(&token);
                    let _ = sink.send(TurnEvent::Token(token)).await;
                }
                Some(Err(err)) => return Err(err),
            }
        }
    }
    Ok(reply)
}

/// Collect the full response without emitting partials (agentic decision
/// passes must not leak raw protocol JSON to the caller).
async fn drain_buffered(
    mut rx: mpsc::Receiver<Result<String, CoreError>>,
    cancel: &CancellationToken,
) -> Result<String, CoreError> {
    let mut response = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            chunk = rx.recv() => match chunk {
                None => break,
                Some(Ok(token)) => response.push_str(&token),
                Some(Err(err)) => return Err(err),
            }
        }
    }
    Ok(response)
}

fn commit_turn(
    memory: &Arc<Mutex<ConversationMemory>>,
    input: &str,
    output: &str,
) -> Result<(), CoreError> {
    let mut memory = memory.lock().map_err(CoreError::internal)?;
    memory.append_turn(input, output);
    Ok(())
}

/// Citation list for the most recent retrieval, deduplicated by path in
/// retrieval-rank order.
fn collect_sources(
    cached: &Arc<Mutex<Vec<RetrievedDocument>>>,
) -> Result<Vec<SourceRef>, CoreError> {
    let documents = cached.lock().map_err(CoreError::internal)?;
    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for doc in documents.iter() {
        if seen.insert(doc.path.clone()) {
            sources.push(SourceRef {
                title: doc.title.clone(),
                path: doc.path.clone(),
            });
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_parses_as_final_answer() {
        let decision = parse_agent_decision("The answer is 42.");
        assert!(matches!(decision, AgentDecision::Final(text) if text == "The answer is 42."));
    }

    #[test]
    fn tool_call_json_is_recognized() {
        let decision = parse_agent_decision(
            r#"{"type":"tool_call","tool":"vault_search","arguments":{"query":"rust"}}"#,
        );
        match decision {
            AgentDecision::ToolCall { name, args } => {
                assert_eq!(name, "vault_search");
                assert_eq!(args["query"], "rust");
            }
            AgentDecision::Final(_) => panic!("expected tool call"),
        }
    }

    #[test]
    fn embedded_json_block_is_extracted() {
        let decision =
            parse_agent_decision("Sure, let me check.\n{\"type\":\"final\",\"content\":\"done\"}");
        assert!(matches!(decision, AgentDecision::Final(text) if text == "done"));
    }

    #[test]
    fn malformed_tool_call_falls_back_to_final_text() {
        let raw = r#"{"type":"tool_call"}"#;
        let decision = parse_agent_decision(raw);
        assert!(matches!(decision, AgentDecision::Final(text) if text == raw));
    }

    #[test]
    fn sources_deduplicate_by_path_keeping_rank_order() {
        let cached = Arc::new(Mutex::new(vec![
            RetrievedDocument {
                content: "a".into(),
                title: "Alpha".into(),
                path: "alpha.md".into(),
                score: 0.9,
            },
            RetrievedDocument {
                content: "a2".into(),
                title: "Alpha".into(),
                path: "alpha.md".into(),
                score: 0.8,
            },
            RetrievedDocument {
                content: "b".into(),
                title: "Beta".into(),
                path: "beta.md".into(),
                score: 0.7,
            },
        ]));
        let sources = collect_sources(&cached).expect("sources");

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].path, "alpha.md");
        assert_eq!(sources[1].path, "beta.md");
    }
}
