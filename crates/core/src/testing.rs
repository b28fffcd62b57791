//! Test doubles for code that drives agents.
//!
//! [`ScriptedAgent`] is a real concurrent [`AgentRuntime`]: turns can be held open until
//! released, so tests can observe an agent mid-turn, and replies are scripted in order.

use crate::{
    agent::{AgentError, AgentEvent, AgentRuntime},
    message::{ContentBlock, Message, StopReason, now_millis},
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Semaphore, broadcast, watch};

/// What the next turn of a [`ScriptedAgent`] does.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream these deltas and finish normally.
    Text(Vec<String>),
    /// Fail with an inference error.
    Fail(String),
}

impl ScriptedReply {
    pub fn text(deltas: &[&str]) -> Self {
        ScriptedReply::Text(deltas.iter().map(|d| d.to_string()).collect())
    }
}

#[derive(Default)]
struct Script {
    messages: Vec<Message>,
    steering: Vec<Message>,
    replies: VecDeque<ScriptedReply>,
    calls: Vec<String>,
    system_prompt: String,
}

pub struct ScriptedAgent {
    script: Mutex<Script>,
    events: broadcast::Sender<AgentEvent>,
    held: AtomicBool,
    gate: Semaphore,
    abort_epoch: watch::Sender<u64>,
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAgent {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let (abort_epoch, _) = watch::channel(0);
        Self {
            script: Mutex::new(Script::default()),
            events,
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            abort_epoch,
        }
    }

    /// Starts with an existing conversation.
    pub fn with_history(messages: Vec<Message>) -> Self {
        let agent = Self::new();
        agent.script().messages = messages;
        agent
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every following turn wait for [`release`](Self::release) before replying.
    pub fn hold_turns(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Lets one held turn proceed.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        self.script().replies.push_back(reply);
    }

    /// Every runtime call so far, e.g. `prompt:hi`, `continue`, `abort`, `reset`.
    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    /// Steered messages not yet folded into the conversation.
    pub fn steered(&self) -> Vec<Message> {
        self.script().steering.clone()
    }

    pub fn system_prompt(&self) -> String {
        self.script().system_prompt.clone()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    fn drain_steering(&self) {
        let mut script = self.script();
        let drained = std::mem::take(&mut script.steering);
        script.messages.extend(drained);
    }

    async fn run_turn(&self, call: String, initial: Option<Message>) -> Result<(), AgentError> {
        let mut abort = self.abort_epoch.subscribe();
        abort.borrow_and_update();
        {
            let mut script = self.script();
            script.calls.push(call);
            if initial.is_none() && script.messages.is_empty() && script.steering.is_empty() {
                return Err(AgentError::EmptyConversation);
            }
            script.messages.extend(initial);
        }
        self.emit(AgentEvent::TurnStart);
        self.drain_steering();

        if self.held.load(Ordering::SeqCst) {
            tokio::select! {
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = abort.changed() => {
                    self.emit(AgentEvent::TurnEnd { stop_reason: StopReason::Aborted });
                    return Err(AgentError::Aborted);
                }
            }
        }

        let reply = self
            .script()
            .replies
            .pop_front()
            .unwrap_or(ScriptedReply::Text(vec![]));
        match reply {
            ScriptedReply::Text(deltas) => {
                for delta in &deltas {
                    self.emit(AgentEvent::TextDelta(delta.clone()));
                }
                let message = Message::Assistant {
                    content: vec![ContentBlock::Text {
                        text: deltas.concat(),
                    }],
                    stop_reason: StopReason::Stop,
                    error_message: None,
                    timestamp: now_millis(),
                };
                self.script().messages.push(message.clone());
                self.emit(AgentEvent::MessageEnd(message));
                self.drain_steering();
                self.emit(AgentEvent::TurnEnd {
                    stop_reason: StopReason::Stop,
                });
                Ok(())
            }
            ScriptedReply::Fail(reason) => {
                self.emit(AgentEvent::TurnEnd {
                    stop_reason: StopReason::Error,
                });
                Err(AgentError::Inference(reason))
            }
        }
    }
}

#[async_trait]
impl AgentRuntime for ScriptedAgent {
    async fn prompt(&self, text: String) -> Result<(), AgentError> {
        self.run_turn(format!("prompt:{text}"), Some(Message::user(text)))
            .await
    }

    async fn continue_turn(&self) -> Result<(), AgentError> {
        self.run_turn("continue".to_string(), None).await
    }

    fn abort(&self) {
        self.script().calls.push("abort".to_string());
        self.abort_epoch.send_modify(|epoch| *epoch += 1);
    }

    fn reset(&self) {
        let mut script = self.script();
        script.calls.push("reset".to_string());
        script.messages.clear();
        script.steering.clear();
    }

    fn steer(&self, message: Message) {
        self.script().steering.push(message);
    }

    fn set_system_prompt(&self, prompt: String) {
        self.script().system_prompt = prompt;
    }

    fn messages(&self) -> Vec<Message> {
        self.script().messages.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
