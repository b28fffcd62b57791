//! LLM-backed Agent Runtime
//!
//! [`LlmAgent`] runs the turn loop for one agent: stream a completion, execute any tool
//! calls it requested, fold in steered messages and go again until the model stops asking
//! for tools. Steered messages are queued and drained all at once at each turn boundary,
//! never in the middle of a streamed completion.

use crate::{
    agent::{AgentError, AgentEvent, AgentRuntime},
    llm_client::{LLMClient, LLMStreamEvent, to_request_messages},
    message::{ContentBlock, Message, StopReason, now_millis},
};
use anyhow::Result;
use async_openai::types::{ChatCompletionTool, ChatCompletionToolArgs, FunctionObjectArgs};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;
const DEFAULT_MAX_ROUNDS: usize = 16;
const ABORTED_TOOL_RESULT: &str = "Aborted before the tool finished.";

/// A tool the model may call.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    fn to_openai(&self) -> Result<ChatCompletionTool> {
        Ok(ChatCompletionToolArgs::default()
            .function(
                FunctionObjectArgs::default()
                    .name(self.name.clone())
                    .description(self.description.clone())
                    .parameters(self.parameters.clone())
                    .build()?,
            )
            .build()?)
    }
}

/// The text handed back to the model for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Executes the tools an agent is allowed to call.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Runs a tool. Failures are reported to the model, not raised.
    async fn call(&self, name: &str, arguments: Value) -> ToolOutput;
}

#[derive(Default)]
struct ConversationState {
    system_prompt: String,
    messages: Vec<Message>,
    steering: Vec<Message>,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

enum RoundEnd {
    Done,
    Again,
}

/// An [`AgentRuntime`] backed by an OpenAI-compatible chat completion API.
pub struct LlmAgent {
    label: String,
    client: Arc<dyn LLMClient>,
    tools: Option<Arc<dyn ToolHandler>>,
    state: Mutex<ConversationState>,
    events: broadcast::Sender<AgentEvent>,
    turn_lock: tokio::sync::Mutex<()>,
    abort_epoch: watch::Sender<u64>,
    max_rounds: usize,
}

impl LlmAgent {
    /// Creates an agent. `label` only appears in logs.
    pub fn new(label: impl Into<String>, client: Arc<dyn LLMClient>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (abort_epoch, _) = watch::channel(0);
        Self {
            label: label.into(),
            client,
            tools: None,
            state: Mutex::new(ConversationState::default()),
            events,
            turn_lock: tokio::sync::Mutex::new(()),
            abort_epoch,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolHandler>) -> Self {
        self.tools = Some(tools);
        self
    }

    fn state(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn append(&self, message: Message) {
        self.state().messages.push(message.clone());
        self.emit(AgentEvent::MessageEnd(message));
    }

    /// Moves every queued steering message into the conversation.
    fn drain_steering(&self) -> usize {
        let drained: Vec<Message> = {
            let mut state = self.state();
            let drained = std::mem::take(&mut state.steering);
            state.messages.extend(drained.iter().cloned());
            drained
        };
        let count = drained.len();
        for message in drained {
            self.emit(AgentEvent::MessageEnd(message));
        }
        count
    }

    fn end_turn(&self, stop_reason: StopReason) {
        self.emit(AgentEvent::TurnEnd { stop_reason });
    }

    async fn run_turn(&self, initial: Option<Message>) -> Result<(), AgentError> {
        // Subscribe before waiting for the previous turn so an abort issued meanwhile counts.
        let mut abort = self.abort_epoch.subscribe();
        abort.borrow_and_update();
        let _turn = self.turn_lock.lock().await;
        if abort.has_changed().unwrap_or(false) {
            debug!(agent = %self.label, "Turn aborted before it started");
            return Err(AgentError::Aborted);
        }

        {
            let state = self.state();
            if initial.is_none() && state.messages.is_empty() && state.steering.is_empty() {
                return Err(AgentError::EmptyConversation);
            }
        }

        self.emit(AgentEvent::TurnStart);
        if let Some(message) = initial {
            self.append(message);
        }
        self.drain_steering();

        for round in 0..self.max_rounds {
            match self.run_round(&mut abort).await {
                Ok(RoundEnd::Done) => {
                    self.end_turn(StopReason::Stop);
                    return Ok(());
                }
                Ok(RoundEnd::Again) => {
                    debug!(agent = %self.label, round, "Continuing turn");
                }
                Err(AgentError::Aborted) => {
                    self.end_turn(StopReason::Aborted);
                    return Err(AgentError::Aborted);
                }
                Err(e) => {
                    self.append(Message::Assistant {
                        content: vec![],
                        stop_reason: StopReason::Error,
                        error_message: Some(e.to_string()),
                        timestamp: now_millis(),
                    });
                    self.end_turn(StopReason::Error);
                    return Err(e);
                }
            }
        }

        warn!(agent = %self.label, max_rounds = self.max_rounds, "Turn hit the round limit");
        self.end_turn(StopReason::Stop);
        Ok(())
    }

    /// One completion plus the tool calls it requested.
    async fn run_round(&self, abort: &mut watch::Receiver<u64>) -> Result<RoundEnd, AgentError> {
        let (system_prompt, history) = {
            let state = self.state();
            (state.system_prompt.clone(), state.messages.clone())
        };
        let request = to_request_messages(&system_prompt, &history)
            .map_err(|e| AgentError::Inference(e.to_string()))?;
        let tools = match &self.tools {
            Some(handler) => handler
                .definitions()
                .iter()
                .map(ToolDefinition::to_openai)
                .collect::<Result<Vec<_>>>()
                .map_err(|e| AgentError::Inference(e.to_string()))?,
            None => vec![],
        };

        let mut stream = tokio::select! {
            stream = self.client.stream_chat(request, tools) => {
                stream.map_err(|e| AgentError::Inference(e.to_string()))?
            }
            _ = abort.changed() => return Err(AgentError::Aborted),
        };

        let mut text = String::new();
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = abort.changed() => {
                    self.record_partial(text);
                    return Err(AgentError::Aborted);
                }
            };
            match item {
                None => break,
                Some(Ok(LLMStreamEvent::TextChunk(chunk))) => {
                    text.push_str(&chunk);
                    self.emit(AgentEvent::TextDelta(chunk));
                }
                Some(Ok(LLMStreamEvent::ToolCallChunk {
                    index,
                    id,
                    name,
                    arguments,
                })) => {
                    let call = pending.entry(index).or_default();
                    if let Some(id) = id {
                        call.id = id;
                    }
                    if let Some(name) = name {
                        call.name.push_str(&name);
                    }
                    call.arguments.push_str(&arguments);
                }
                Some(Err(e)) => {
                    self.record_partial(text);
                    return Err(AgentError::Inference(e.to_string()));
                }
            }
        }

        let calls: Vec<(String, String, Value)> = pending
            .into_values()
            .map(|call| {
                let arguments = if call.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.arguments)
                        .unwrap_or(Value::String(call.arguments))
                };
                (call.id, call.name, arguments)
            })
            .collect();

        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
        content.extend(calls.iter().map(|(id, name, arguments)| ContentBlock::ToolCall {
            id: id.clone(),
            name: name.clone(),
            arguments: arguments.clone(),
        }));
        self.append(Message::Assistant {
            content,
            stop_reason: if calls.is_empty() {
                StopReason::Stop
            } else {
                StopReason::ToolUse
            },
            error_message: None,
            timestamp: now_millis(),
        });

        for (index, (id, name, arguments)) in calls.iter().enumerate() {
            let output = tokio::select! {
                output = self.execute_tool(name, arguments.clone()) => output,
                _ = abort.changed() => {
                    self.close_unanswered(&calls[index..]);
                    return Err(AgentError::Aborted);
                }
            };
            self.emit(AgentEvent::ToolCallEnd {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
                result: output.text.clone(),
                is_error: output.is_error,
            });
            self.append(Message::tool_result(
                id.clone(),
                name.clone(),
                output.text,
                output.is_error,
            ));
        }

        let steered = self.drain_steering();
        if !calls.is_empty() || steered > 0 {
            Ok(RoundEnd::Again)
        } else {
            Ok(RoundEnd::Done)
        }
    }

    async fn execute_tool(&self, name: &str, arguments: Value) -> ToolOutput {
        match &self.tools {
            Some(handler) => handler.call(name, arguments).await,
            None => ToolOutput::error(format!("No tool named '{name}' is available")),
        }
    }

    /// Answers every call in `calls` with an error result so no tool call is left unpaired.
    fn close_unanswered(&self, calls: &[(String, String, Value)]) {
        for (id, name, _) in calls {
            self.append(Message::tool_result(
                id.clone(),
                name.clone(),
                ABORTED_TOOL_RESULT,
                true,
            ));
        }
    }

    /// Keeps text streamed before an abort or error in the conversation.
    fn record_partial(&self, text: String) {
        if text.is_empty() {
            return;
        }
        self.append(Message::Assistant {
            content: vec![ContentBlock::Text { text }],
            stop_reason: StopReason::Aborted,
            error_message: None,
            timestamp: now_millis(),
        });
    }
}

#[async_trait]
impl AgentRuntime for LlmAgent {
    async fn prompt(&self, text: String) -> Result<(), AgentError> {
        self.run_turn(Some(Message::user(text))).await
    }

    async fn continue_turn(&self) -> Result<(), AgentError> {
        self.run_turn(None).await
    }

    fn abort(&self) {
        self.abort_epoch.send_modify(|epoch| *epoch += 1);
    }

    fn reset(&self) {
        self.abort();
        let mut state = self.state();
        state.messages.clear();
        state.steering.clear();
        info!(agent = %self.label, "Conversation reset");
    }

    fn steer(&self, message: Message) {
        self.state().steering.push(message);
    }

    fn set_system_prompt(&self, prompt: String) {
        self.state().system_prompt = prompt;
    }

    fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }
}
