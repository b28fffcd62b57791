//! Agent Runtime Interface
//!
//! The coordination layer never talks to an inference backend directly. It drives each
//! agent through [`AgentRuntime`], an opaque conversational state machine, and observes it
//! through a broadcast stream of [`AgentEvent`]s.

use crate::message::{Message, StopReason};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::warn;

// --- Roles ---

/// The two personas sharing one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    /// Talks to the user; its speakable output is voiced.
    Speech,
    /// Acts in the world through tools.
    Action,
}

impl AgentRole {
    pub const ALL: [AgentRole; 2] = [AgentRole::Speech, AgentRole::Action];

    pub fn counterpart(self) -> Self {
        match self {
            AgentRole::Speech => AgentRole::Action,
            AgentRole::Action => AgentRole::Speech,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Speech => "speech",
            AgentRole::Action => "action",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Errors ---

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The turn was cut short by `abort`. Not a failure.
    #[error("turn aborted")]
    Aborted,
    #[error("cannot continue an empty conversation")]
    EmptyConversation,
    #[error("inference failed: {0}")]
    Inference(String),
}

// --- Events ---

/// Everything an agent reports while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TurnStart,
    TextDelta(String),
    ToolCallEnd {
        id: String,
        name: String,
        arguments: Value,
        result: String,
        is_error: bool,
    },
    /// A message was appended to the conversation.
    MessageEnd(Message),
    TurnEnd {
        stop_reason: StopReason,
    },
}

/// Per-variant event handling. Every method defaults to doing nothing.
pub trait AgentEventHandler: Send {
    fn on_turn_start(&mut self) {}
    fn on_text_delta(&mut self, _delta: &str) {}
    fn on_tool_call_end(&mut self, _name: &str, _arguments: &Value, _result: &str, _is_error: bool) {
    }
    fn on_message_end(&mut self, _message: &Message) {}
    fn on_turn_end(&mut self, _stop_reason: StopReason) {}
}

impl AgentEvent {
    pub fn dispatch<H: AgentEventHandler + ?Sized>(&self, handler: &mut H) {
        match self {
            AgentEvent::TurnStart => handler.on_turn_start(),
            AgentEvent::TextDelta(delta) => handler.on_text_delta(delta),
            AgentEvent::ToolCallEnd {
                name,
                arguments,
                result,
                is_error,
                ..
            } => handler.on_tool_call_end(name, arguments, result, *is_error),
            AgentEvent::MessageEnd(message) => handler.on_message_end(message),
            AgentEvent::TurnEnd { stop_reason } => handler.on_turn_end(*stop_reason),
        }
    }
}

/// Feeds every event from `events` to `handler` until the sender side closes.
///
/// A lagging receiver skips the events it missed and keeps going.
pub async fn run_listener<H: AgentEventHandler + ?Sized>(
    mut events: broadcast::Receiver<AgentEvent>,
    handler: &mut H,
) {
    loop {
        match events.recv().await {
            Ok(event) => event.dispatch(handler),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Agent event listener lagged; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// --- Runtime ---

/// An opaque conversational process.
///
/// `prompt` and `continue_turn` run one whole turn and resolve when it ends. `steer`
/// appends a message that the agent sees at its next turn boundary, whether or not a turn
/// is running. `abort` stops the running turn and is a no-op when idle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn prompt(&self, text: String) -> Result<(), AgentError>;

    async fn continue_turn(&self) -> Result<(), AgentError>;

    fn abort(&self);

    /// Clears the conversation and any queued steering messages.
    fn reset(&self);

    fn steer(&self, message: Message);

    fn set_system_prompt(&self, prompt: String);

    fn messages(&self) -> Vec<Message>;

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;
}
