//! Event Bridge
//!
//! Turns world observations and the other agent's activity into synthetic conversation
//! turns. Facts are reported as a [`SteeredPair`]: a tool call the agent never made,
//! followed by its result, so the target reads them exactly like the output of its own
//! world tool. Intents are steering advice and go in as plain user messages.
//!
//! Everything is appended with the target's `steer`, so injection never starts a turn and
//! never lands mid-generation.

use crate::{
    agent::AgentRuntime,
    diff::Diff,
    message::Message,
    tags::Activity,
};
use serde_json::{Value, json};
use tracing::{debug, trace};
use uuid::Uuid;

/// Name of the world tool the synthetic calls pretend to invoke.
pub const WORLD_TOOL: &str = "act_in_world";

/// What to do with diffs that only carry the heartbeat fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeartbeatPolicy {
    /// Inject every diff, keeping the tick visible to the agent.
    #[default]
    Always,
    /// Drop diffs whose only content is `tick`, `game_status` and empty `events`.
    SkipHeartbeatOnly,
}

/// A synthetic tool call and its matching result.
///
/// The result is never steered without the call before it.
#[derive(Debug, Clone, PartialEq)]
pub struct SteeredPair {
    pub id: String,
    pub call: Message,
    pub result: Message,
}

impl SteeredPair {
    pub fn new(tool_name: &str, arguments: Value, result: Value) -> Self {
        let id = format!("bridge_{}", Uuid::new_v4().simple());
        Self {
            call: Message::tool_call(id.clone(), tool_name, arguments),
            result: Message::tool_result(id.clone(), tool_name, result.to_string(), false),
            id,
        }
    }

    /// Steers the call and then the result into `target`.
    pub fn steer_into(self, target: &dyn AgentRuntime) {
        trace!(id = %self.id, "Steering synthetic tool pair");
        target.steer(self.call);
        target.steer(self.result);
    }
}

#[derive(Debug, Clone)]
pub struct EventBridge {
    tool_name: String,
    heartbeat: HeartbeatPolicy,
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new(HeartbeatPolicy::default())
    }
}

impl EventBridge {
    pub fn new(heartbeat: HeartbeatPolicy) -> Self {
        Self {
            tool_name: WORLD_TOOL.to_string(),
            heartbeat,
        }
    }

    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = tool_name.into();
        self
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        self.heartbeat
    }

    /// The pair reporting `diff`, or `None` when the heartbeat policy skips it.
    pub fn observation_pair(&self, diff: &Diff) -> Option<SteeredPair> {
        if self.heartbeat == HeartbeatPolicy::SkipHeartbeatOnly && diff.is_heartbeat_only() {
            debug!(tick = diff.tick(), "Skipping heartbeat-only diff");
            return None;
        }
        Some(SteeredPair::new(
            &self.tool_name,
            json!({ "action": { "type": "Observe" } }),
            json!({ "ok": true, "observation": diff.to_value() }),
        ))
    }

    pub fn activity_pairs(&self, activities: &[Activity]) -> Vec<SteeredPair> {
        activities
            .iter()
            .map(|activity| {
                SteeredPair::new(
                    &self.tool_name,
                    json!({ "action": activity.action }),
                    json!({ "ok": true, "observation": activity.observation }),
                )
            })
            .collect()
    }

    pub fn intent_messages(&self, intents: &[String]) -> Vec<Message> {
        intents
            .iter()
            .filter(|intent| !intent.trim().is_empty())
            .map(|intent| Message::user(intent.trim()))
            .collect()
    }

    /// Reports a diff to `target`. Returns whether anything was injected.
    pub fn inject_observation(&self, target: &dyn AgentRuntime, diff: &Diff) -> bool {
        match self.observation_pair(diff) {
            Some(pair) => {
                pair.steer_into(target);
                true
            }
            None => false,
        }
    }

    /// Reports each activity to `target`. Returns the number of pairs injected.
    pub fn inject_activity(&self, target: &dyn AgentRuntime, activities: &[Activity]) -> usize {
        let pairs = self.activity_pairs(activities);
        let count = pairs.len();
        pairs.into_iter().for_each(|pair| pair.steer_into(target));
        count
    }

    /// Steers each non-empty intent into `target`. Returns the number injected.
    pub fn inject_intent(&self, target: &dyn AgentRuntime, intents: &[String]) -> usize {
        let messages = self.intent_messages(intents);
        let count = messages.len();
        messages.into_iter().for_each(|m| target.steer(m));
        count
    }
}
