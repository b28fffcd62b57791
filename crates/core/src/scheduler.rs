//! Turn Scheduler
//!
//! Owns the busy flag of each agent and is the only path through which turns start.
//! Each agent runs at most one turn at a time; anything else that wants its attention
//! while it runs goes in through steering. Cross-agent material (activities, intents) is
//! counted per target so that when one agent goes idle the scheduler can wake the other.
//!
//! Injection, reset and the busy flag of an agent share one lock, so a reset can never land
//! between the two halves of a synthetic tool pair.

use crate::{
    agent::{AgentError, AgentRole, AgentRuntime},
    bridge::{EventBridge, SteeredPair},
    diff::Diff,
    message::Message,
    tags::Activity,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Instrument, debug, error, info, info_span};

/// How a turn is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Prompt(String),
    Continue,
}

/// Who asked for a turn. Only affects how a rejection is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    User,
    Timer,
    CrossAgent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Aborted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("{0} agent is still processing")]
    Busy(AgentRole),
    #[error("{0} agent has no history yet; prompt it first")]
    NoHistory(AgentRole),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Running,
}

/// A point-in-time view of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStatus {
    pub state: TurnState,
    /// Cross-agent items injected since the agent last started a turn.
    pub pending: usize,
    pub messages: usize,
}

#[derive(Debug, Default)]
struct SlotState {
    running: bool,
    generation: u64,
    pending: usize,
}

struct Slot {
    runtime: Arc<dyn AgentRuntime>,
    state: Mutex<SlotState>,
    /// Mirrors `SlotState::generation` for turns waiting to notice they were superseded.
    generation: watch::Sender<u64>,
}

impl Slot {
    fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            runtime,
            state: Mutex::new(SlotState::default()),
            generation: watch::channel(0).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ends the current turn's claim on the agent. Caller holds the state lock.
    fn supersede(&self, state: &mut SlotState) {
        state.running = false;
        state.generation += 1;
        self.generation.send_replace(state.generation);
        self.runtime.abort();
    }
}

/// Resolves once the slot has moved past `generation`.
async fn superseded(mut generation_rx: watch::Receiver<u64>, generation: u64) {
    let closed = generation_rx
        .wait_for(|current| *current != generation)
        .await
        .is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

struct Inner {
    speech: Slot,
    action: Slot,
    bridge: EventBridge,
}

/// Gates every agent invocation. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TurnScheduler {
    inner: Arc<Inner>,
}

impl TurnScheduler {
    pub fn new(
        speech: Arc<dyn AgentRuntime>,
        action: Arc<dyn AgentRuntime>,
        bridge: EventBridge,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                speech: Slot::new(speech),
                action: Slot::new(action),
                bridge,
            }),
        }
    }

    fn slot(&self, role: AgentRole) -> &Slot {
        match role {
            AgentRole::Speech => &self.inner.speech,
            AgentRole::Action => &self.inner.action,
        }
    }

    pub fn runtime(&self, role: AgentRole) -> Arc<dyn AgentRuntime> {
        self.slot(role).runtime.clone()
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.inner.bridge
    }

    pub fn is_running(&self, role: AgentRole) -> bool {
        self.slot(role).lock().running
    }

    pub fn status(&self, role: AgentRole) -> AgentStatus {
        let slot = self.slot(role);
        let (running, pending) = {
            let state = slot.lock();
            (state.running, state.pending)
        };
        AgentStatus {
            state: if running {
                TurnState::Running
            } else {
                TurnState::Idle
            },
            pending,
            messages: slot.runtime.messages().len(),
        }
    }

    /// Starts a turn if the agent is idle.
    ///
    /// The returned handle resolves when the turn ends. Rejections are not errors of the
    /// agent; callers decide whether to surface them.
    pub fn request(
        &self,
        role: AgentRole,
        invocation: Invocation,
        trigger: Trigger,
    ) -> Result<JoinHandle<TurnOutcome>, ScheduleError> {
        let slot = self.slot(role);
        let generation = {
            let mut state = slot.lock();
            if state.running {
                match trigger {
                    Trigger::Timer => debug!(agent = %role, "Agent busy; skipping timer tick"),
                    _ => debug!(agent = %role, ?trigger, "Agent busy; request rejected"),
                }
                return Err(ScheduleError::Busy(role));
            }
            if invocation == Invocation::Continue && slot.runtime.messages().is_empty() {
                return Err(ScheduleError::NoHistory(role));
            }
            state.running = true;
            state.pending = 0;
            state.generation += 1;
            slot.generation.send_replace(state.generation);
            state.generation
        };
        let generation_rx = slot.generation.subscribe();

        let span = info_span!("turn", agent = %role, ?trigger, generation);
        let runtime = slot.runtime.clone();
        let scheduler = self.clone();
        let handle = tokio::spawn(
            async move {
                let stale = scheduler.slot(role).lock().generation != generation;
                if stale {
                    info!("Turn aborted before it started");
                    return TurnOutcome::Aborted;
                }
                info!("Turn started");
                let agent = runtime.clone();
                let turn = async move {
                    match invocation {
                        Invocation::Prompt(text) => agent.prompt(text).await,
                        Invocation::Continue => agent.continue_turn().await,
                    }
                };
                tokio::pin!(turn);
                let result = tokio::select! {
                    biased;
                    result = &mut turn => result,
                    _ = superseded(generation_rx, generation) => {
                        // The abort may have reached the runtime before this turn subscribed.
                        runtime.abort();
                        turn.await
                    }
                };
                let outcome = match result {
                    Ok(()) => TurnOutcome::Completed,
                    Err(AgentError::Aborted) => TurnOutcome::Aborted,
                    Err(e) => TurnOutcome::Failed(e.to_string()),
                };
                scheduler.finish(role, generation, &outcome);
                outcome
            }
            .instrument(span),
        );
        Ok(handle)
    }

    fn finish(&self, role: AgentRole, generation: u64, outcome: &TurnOutcome) {
        let cleared = {
            let mut state = self.slot(role).lock();
            if state.running && state.generation == generation {
                state.running = false;
                true
            } else {
                false
            }
        };
        match outcome {
            TurnOutcome::Completed => info!("Turn completed"),
            TurnOutcome::Aborted => info!("Turn aborted"),
            TurnOutcome::Failed(reason) => error!(error = %reason, "Turn failed"),
        }
        if cleared {
            self.on_idle(role);
        }
    }

    /// Wakes the counterpart when it has unseen cross-agent material.
    fn on_idle(&self, role: AgentRole) {
        let other = role.counterpart();
        if self.slot(other).lock().pending == 0 {
            return;
        }
        match self.request(other, Invocation::Continue, Trigger::CrossAgent) {
            Ok(_) => debug!(agent = %other, from = %role, "Continuing with pending material"),
            Err(e) => debug!(agent = %other, reason = %e, "Pending material left for later"),
        }
    }

    /// Stops the running turn and marks the agent idle at once.
    ///
    /// Returns `false` and does nothing when the agent was already idle.
    pub fn abort(&self, role: AgentRole) -> bool {
        let slot = self.slot(role);
        {
            let mut state = slot.lock();
            if !state.running {
                return false;
            }
            slot.supersede(&mut state);
        }
        info!(agent = %role, "Abort requested");
        self.on_idle(role);
        true
    }

    /// Clears the agent's conversation and its pending cross-agent material together.
    pub fn reset(&self, role: AgentRole) {
        let slot = self.slot(role);
        let mut state = slot.lock();
        if state.running {
            slot.supersede(&mut state);
        }
        state.pending = 0;
        slot.runtime.reset();
        info!(agent = %role, "Agent reset");
    }

    /// Appends a message without starting a turn.
    pub fn steer(&self, target: AgentRole, message: Message) {
        let slot = self.slot(target);
        let _state = slot.lock();
        slot.runtime.steer(message);
    }

    /// Steers a prebuilt call/result pair as one unit.
    pub fn inject_pair(&self, target: AgentRole, pair: SteeredPair) {
        let slot = self.slot(target);
        let _state = slot.lock();
        pair.steer_into(&*slot.runtime);
    }

    /// Reports a world diff to `target`. Returns whether anything was injected.
    pub fn inject_observation(&self, target: AgentRole, diff: &Diff) -> bool {
        let slot = self.slot(target);
        let _state = slot.lock();
        self.inner.bridge.inject_observation(&*slot.runtime, diff)
    }

    pub fn inject_activity(&self, target: AgentRole, activities: &[Activity]) -> usize {
        let slot = self.slot(target);
        let mut state = slot.lock();
        let count = self.inner.bridge.inject_activity(&*slot.runtime, activities);
        state.pending += count;
        count
    }

    pub fn inject_intent(&self, target: AgentRole, intents: &[String]) -> usize {
        let slot = self.slot(target);
        let mut state = slot.lock();
        let count = self.inner.bridge.inject_intent(&*slot.runtime, intents);
        state.pending += count;
        count
    }
}
