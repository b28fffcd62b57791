//! The action agent's only tool: act in the world and see what changed.

use crate::world::World;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tandem_core::{
    DiffOptions, ObservationDiffer, WORLD_TOOL,
    runtime::{ToolDefinition, ToolHandler, ToolOutput},
};
use tracing::{debug, warn};

pub struct WorldTool {
    world: Arc<dyn World>,
    differ: Mutex<ObservationDiffer>,
}

impl WorldTool {
    pub fn new(world: Arc<dyn World>, options: DiffOptions) -> Self {
        Self {
            world,
            differ: Mutex::new(ObservationDiffer::new(options)),
        }
    }

    /// Accepts `{"action": {...}}` or a bare action object; both need a `type`.
    fn action_from(arguments: &Value) -> Result<Value, String> {
        let action = arguments.get("action").unwrap_or(arguments);
        match action {
            Value::Object(map) if map.get("type").is_some_and(Value::is_string) => {
                Ok(action.clone())
            }
            Value::Object(_) => Err(format!("Action is missing required field 'type': {}", action)),
            _ => Err(format!("Action must be a JSON object: {}", action)),
        }
    }

    async fn run(&self, arguments: Value) -> Result<Value, String> {
        let action = Self::action_from(&arguments)?;
        let reply = self.world.act(action).await.map_err(|e| e.to_string())?;
        let observation = self.world.observe().await.map_err(|e| e.to_string())?;
        let diff = self
            .differ
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next(observation);
        let observation = match diff {
            Some(diff) => diff.to_value(),
            None => {
                debug!("Observation after action was stale");
                Value::Null
            }
        };
        Ok(json!({ "ok": true, "result": reply, "observation": observation }))
    }
}

#[async_trait]
impl ToolHandler for WorldTool {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: WORLD_TOOL.to_string(),
            description: "Perform one action in the game world and receive what changed since your last action."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "object",
                        "description": "The action to perform, e.g. {\"type\":\"Move\",\"data\":{\"x\":1,\"z\":0}}.",
                        "properties": {
                            "type": { "type": "string" },
                            "data": { "type": "object" }
                        },
                        "required": ["type"]
                    }
                },
                "required": ["action"]
            }),
        }]
    }

    async fn call(&self, name: &str, arguments: Value) -> ToolOutput {
        if name != WORLD_TOOL {
            return ToolOutput::error(format!("Unknown tool: {}", name));
        }
        match self.run(arguments).await {
            Ok(result) => ToolOutput::ok(result.to_string()),
            Err(message) => {
                warn!(error = %message, "World action failed");
                ToolOutput::error(json!({ "ok": false, "error": message }).to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{MockWorld, WorldError};
    use tandem_core::Observation;

    fn observation(tick: u64, hp: i64) -> Observation {
        serde_json::from_value(json!({
            "tick": tick,
            "game_status": "active",
            "player": {"hp": hp},
            "world": {"entities": []},
            "events": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_action_then_diff_against_previous_call() {
        let mut world = MockWorld::new();
        world
            .expect_act()
            .withf(|action| action["type"] == "Move")
            .times(2)
            .returning(|_| Ok(json!({"accepted": true})));
        let mut ticks = vec![observation(2, 90), observation(1, 100)];
        world
            .expect_observe()
            .times(2)
            .returning(move || Ok(ticks.pop().unwrap()));
        let tool = WorldTool::new(Arc::new(world), DiffOptions::default());

        let first = tool
            .call(WORLD_TOOL, json!({"action": {"type": "Move", "data": {"x": 1}}}))
            .await;
        assert!(!first.is_error);
        let first: Value = serde_json::from_str(&first.text).unwrap();
        assert_eq!(first["ok"], true);
        assert_eq!(first["result"]["accepted"], true);
        assert_eq!(first["observation"]["player"]["hp"], 100);

        let second = tool.call(WORLD_TOOL, json!({"type": "Move"})).await;
        let second: Value = serde_json::from_str(&second.text).unwrap();
        assert_eq!(second["observation"]["tick"], 2);
        assert_eq!(second["observation"]["player"]["hp"], 90);
    }

    #[tokio::test]
    async fn test_invalid_action_is_reported_without_calling_world() {
        let tool = WorldTool::new(Arc::new(MockWorld::new()), DiffOptions::default());
        let output = tool.call(WORLD_TOOL, json!({"action": {"data": {}}})).await;
        assert!(output.is_error);
        assert!(output.text.contains("type"));

        let output = tool.call(WORLD_TOOL, json!({"action": "jump"})).await;
        assert!(output.is_error);
    }

    #[tokio::test]
    async fn test_world_failure_becomes_tool_error() {
        let mut world = MockWorld::new();
        world
            .expect_act()
            .returning(|_| Err(WorldError::NotJoined));
        let tool = WorldTool::new(Arc::new(world), DiffOptions::default());
        let output = tool.call(WORLD_TOOL, json!({"action": {"type": "Jump"}})).await;
        assert!(output.is_error);
        let body: Value = serde_json::from_str(&output.text).unwrap();
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let tool = WorldTool::new(Arc::new(MockWorld::new()), DiffOptions::default());
        let output = tool.call("bash", json!({})).await;
        assert!(output.is_error);
        assert_eq!(tool.definitions()[0].name, WORLD_TOOL);
    }
}
