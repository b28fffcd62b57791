//! Session Wiring
//!
//! A [`Session`] connects the two agents to each other, to the world and to the voice:
//! - each agent's streamed text is scanned for tagged segments; speakable text from the
//!   speech agent goes to the [`Speaker`], activities and intents go to the other agent;
//! - the world is polled on a fixed interval and every diff is reported to the speech agent;
//! - after each message the agent's conversation is handed to the store.

use crate::{
    persistence::ConversationStore,
    world::{World, WorldError},
};
use async_trait::async_trait;
use elevenlabs_realtime::AudioStreamPlayer;
use serde_json::Value;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tandem_core::{
    AgentEventHandler, AgentRole, DiffOptions, Invocation, Message, ObservationDiffer, Segment,
    SegmentScanner, StopReason, Trigger, TurnScheduler, agent::run_listener,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{Instrument, debug, info, info_span, warn};

/// Where speakable text goes.
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Queues text for playback. Returns `false` if it was dropped.
    fn speak(&self, text: &str) -> bool;

    fn status(&self) -> String;

    async fn close(&self);
}

#[async_trait]
impl Speaker for AudioStreamPlayer {
    fn speak(&self, text: &str) -> bool {
        self.enqueue(text)
    }

    fn status(&self) -> String {
        format!("{:?}, {} queued", self.state(), self.pending())
    }

    async fn close(&self) {
        AudioStreamPlayer::close(self).await;
    }
}

/// Summary of one world poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub tick: u64,
    /// Whether anything was steered into the speech agent.
    pub injected: bool,
    pub finished: bool,
}

pub struct Session {
    scheduler: TurnScheduler,
    world: Arc<dyn World>,
    differ: tokio::sync::Mutex<ObservationDiffer>,
    speaker: Option<Arc<dyn Speaker>>,
    store: Mutex<Option<Arc<ConversationStore>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    transcript: mpsc::UnboundedSender<String>,
    stop: watch::Sender<bool>,
}

impl Session {
    /// Creates the session and starts listening to both agents.
    ///
    /// The receiver yields human-readable transcript lines.
    pub fn start(
        scheduler: TurnScheduler,
        world: Arc<dyn World>,
        diff_options: DiffOptions,
        speaker: Option<Arc<dyn Speaker>>,
        store: Option<ConversationStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (transcript, transcript_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let session = Arc::new(Self {
            scheduler,
            world,
            differ: tokio::sync::Mutex::new(ObservationDiffer::new(diff_options)),
            speaker,
            store: Mutex::new(store.map(Arc::new)),
            listeners: Mutex::new(Vec::new()),
            transcript,
            stop,
        });
        let handles = AgentRole::ALL
            .into_iter()
            .map(|role| session.spawn_listener(role))
            .collect();
        *session.listeners.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        (session, transcript_rx)
    }

    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    pub fn speaker(&self) -> Option<&Arc<dyn Speaker>> {
        self.speaker.as_ref()
    }

    fn spawn_listener(&self, role: AgentRole) -> JoinHandle<()> {
        // Subscribe before spawning so no event of an already-requested turn is missed.
        let rx = self.scheduler.runtime(role).subscribe();
        let mut listener = AgentListener {
            role,
            scanner: match role {
                AgentRole::Speech => SegmentScanner::speech(),
                AgentRole::Action => SegmentScanner::action(),
            },
            scheduler: self.scheduler.clone(),
            speaker: match role {
                AgentRole::Speech => self.speaker.clone(),
                AgentRole::Action => None,
            },
            store: self.store.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            transcript: self.transcript.clone(),
        };
        tokio::spawn(
            async move { run_listener(rx, &mut listener).await }
                .instrument(info_span!("listener", agent = %role)),
        )
    }

    /// Observes the world once and reports the diff to the speech agent.
    ///
    /// Polls are serialized, so diffs reach the agent in tick order.
    pub async fn poll_world(&self) -> Result<Option<PollReport>, WorldError> {
        let mut differ = self.differ.lock().await;
        let observation = self.world.observe().await?;
        let finished = observation.is_finished();
        let Some(diff) = differ.next(observation) else {
            return Ok(None);
        };
        let injected = self.scheduler.inject_observation(AgentRole::Speech, &diff);
        drop(differ);

        if injected {
            match self
                .scheduler
                .request(AgentRole::Speech, Invocation::Continue, Trigger::Timer)
            {
                Ok(_) => debug!(tick = diff.tick(), "Speech agent continuing with observation"),
                Err(e) => debug!(tick = diff.tick(), reason = %e, "Observation queued"),
            }
        }
        Ok(Some(PollReport {
            tick: diff.tick(),
            injected,
            finished,
        }))
    }

    /// Polls the world every `every` until the game ends or the session shuts down.
    pub fn spawn_world_loop(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let session = self.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = ticker.tick() => match session.poll_world().await {
                            Ok(Some(report)) if report.finished => {
                                info!(tick = report.tick, "Game finished; world polling stopped");
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "World poll failed"),
                        },
                    }
                }
            }
            .instrument(info_span!("world_loop")),
        )
    }

    /// Stops polling and listeners, flushes conversations and closes the speaker.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        for role in AgentRole::ALL {
            self.scheduler.abort(role);
        }

        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in listeners {
            handle.abort();
            let _ = handle.await;
        }

        let store = self.store.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(store) = store {
            match Arc::try_unwrap(store) {
                Ok(store) => store.close().await,
                Err(_) => warn!("Conversation store still in use; skipping final flush"),
            }
        }

        if let Some(speaker) = &self.speaker {
            speaker.close().await;
        }
        info!("Session shut down");
    }
}

struct AgentListener {
    role: AgentRole,
    scanner: SegmentScanner,
    scheduler: TurnScheduler,
    speaker: Option<Arc<dyn Speaker>>,
    store: Option<Arc<ConversationStore>>,
    transcript: mpsc::UnboundedSender<String>,
}

impl AgentListener {
    fn say(&self, line: String) {
        let _ = self.transcript.send(line);
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            store.save(self.role, self.scheduler.runtime(self.role).messages());
        }
    }

    fn forward(&self, segments: Vec<Segment>) {
        let mut activities = Vec::new();
        let mut intents = Vec::new();
        for segment in segments {
            match segment {
                Segment::Speak(text) => {
                    self.say(format!("{}> {}", self.role, text));
                    if let Some(speaker) = &self.speaker {
                        if !speaker.speak(&text) {
                            debug!("Speaker dropped utterance");
                        }
                    }
                }
                Segment::Activity(activity) => {
                    self.say(format!("{}> [{}] {}", self.role, activity.action, activity.observation));
                    activities.push(activity);
                }
                Segment::Intent(intent) => {
                    self.say(format!("{}> (intent) {}", self.role, intent));
                    intents.push(intent);
                }
            }
        }

        let target = self.role.counterpart();
        let mut injected = 0;
        if !activities.is_empty() {
            injected += self.scheduler.inject_activity(target, &activities);
        }
        if !intents.is_empty() {
            injected += self.scheduler.inject_intent(target, &intents);
        }
        // The source turn may already have ended before this delta was processed,
        // in which case its idle hook saw nothing pending.
        if injected > 0 && !self.scheduler.is_running(self.role) {
            if let Err(e) = self
                .scheduler
                .request(target, Invocation::Continue, Trigger::CrossAgent)
            {
                debug!(agent = %target, reason = %e, "Cross-agent material left pending");
            }
        }
    }
}

impl AgentEventHandler for AgentListener {
    fn on_turn_start(&mut self) {
        self.scanner.reset();
    }

    fn on_text_delta(&mut self, delta: &str) {
        let segments = self.scanner.push(delta);
        if !segments.is_empty() {
            self.forward(segments);
        }
    }

    fn on_tool_call_end(&mut self, name: &str, arguments: &Value, result: &str, is_error: bool) {
        if is_error {
            warn!(tool = %name, %arguments, result, "Tool call failed");
        } else {
            info!(tool = %name, %arguments, "Tool call finished");
        }
        self.say(format!("{}> [{}] {}", self.role, name, arguments));
    }

    fn on_message_end(&mut self, _message: &Message) {
        self.persist();
    }

    fn on_turn_end(&mut self, stop_reason: StopReason) {
        debug!(?stop_reason, "Turn ended");
        self.persist();
    }
}
