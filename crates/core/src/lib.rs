//! Coordination core for a pair of agents sharing one world: a speech agent that talks to
//! the user and an action agent that acts through tools.

pub mod agent;
pub mod bridge;
pub mod diff;
pub mod llm_client;
pub mod message;
pub mod observation;
pub mod runtime;
pub mod scheduler;
pub mod tags;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::{AgentError, AgentEvent, AgentEventHandler, AgentRole, AgentRuntime};
pub use bridge::{EventBridge, HeartbeatPolicy, SteeredPair, WORLD_TOOL};
pub use diff::{Diff, DiffOptions, ObservationDiffer};
pub use message::{ContentBlock, Message, StopReason};
pub use observation::{Entity, Observation};
pub use scheduler::{Invocation, ScheduleError, Trigger, TurnOutcome, TurnScheduler};
pub use tags::{Activity, Segment, SegmentScanner, TagScanner};
