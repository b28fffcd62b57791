//! World Observation Types
//!
//! Snapshots produced by the world simulation. Fields the core does not interpret
//! (`player`, `other_players`, `world`) stay as raw JSON so that diffs can be computed
//! structurally without losing anything the world chose to send.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of an entity within a single observation.
pub type EntityId = i64;

/// Attribute keys that only describe the client camera or renderer.
pub const RENDER_ATTRIBUTES: &[&str] = &[
    "ViewOriginX",
    "ViewOriginY",
    "ViewOriginZ",
    "ViewForwardX",
    "ViewForwardY",
    "ViewForwardZ",
    "ViewFovDeg",
    "RenderRole",
    "ModelUrl",
];

/// A snapshot of world state at a given tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub tick: u64,
    #[serde(default)]
    pub game_status: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub player: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub other_players: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub world: Value,
    #[serde(default)]
    pub events: Vec<Value>,
    /// Top-level fields not covered above, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single object in the world, matched across observations by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub position: [f64; 3],
    #[serde(default)]
    pub size: [f64; 3],
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Observation {
    /// Parses `world.entities` into typed entities.
    ///
    /// Returns `None` when the world has no entity list or when any entry fails to
    /// parse; callers fall back to plain structural diffing in that case.
    pub fn entities(&self) -> Option<Vec<Entity>> {
        let raw = self.world.get("entities")?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// Whether the world reports a status other than an in-progress game.
    pub fn is_finished(&self) -> bool {
        let status = self.game_status.to_lowercase();
        !status.is_empty() && !matches!(status.as_str(), "active" | "running" | "in_progress")
    }

    /// Removes the given attribute keys from the player, other players and entities.
    pub fn strip_attributes(&mut self, keys: &[&str]) {
        strip_attributes_of(&mut self.player, keys);
        if let Some(players) = self.other_players.as_array_mut() {
            players
                .iter_mut()
                .for_each(|p| strip_attributes_of(p, keys));
        }
        if let Some(entities) = self
            .world
            .get_mut("entities")
            .and_then(Value::as_array_mut)
        {
            entities
                .iter_mut()
                .for_each(|e| strip_attributes_of(e, keys));
        }
    }
}

fn strip_attributes_of(object: &mut Value, keys: &[&str]) {
    if let Some(attributes) = object
        .get_mut("attributes")
        .and_then(Value::as_object_mut)
    {
        for key in keys {
            attributes.remove(*key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Observation {
        serde_json::from_value(json!({
            "tick": 7,
            "game_status": "active",
            "player": { "id": "abc", "position": [0, 2.5, 0], "attributes": { "ViewFovDeg": 70, "Team": "red" } },
            "other_players": [{ "id": "p2", "attributes": { "RenderRole": "x" } }],
            "world": { "entities": [
                { "id": 5, "name": "Ground", "position": [0, -0.5, 0], "size": [100, 1, 100], "color": [0.3, 0.9, 0.7] }
            ] },
            "events": [],
            "round": 2
        }))
        .unwrap()
    }

    #[test]
    fn test_unknown_fields_are_preserved() {
        let obs = sample();
        assert_eq!(obs.extra.get("round"), Some(&json!(2)));
        let entities = obs.entities().unwrap();
        assert_eq!(entities[0].extra.get("color"), Some(&json!([0.3, 0.9, 0.7])));
    }

    #[test]
    fn test_missing_world_has_no_entities() {
        let obs: Observation = serde_json::from_value(json!({ "tick": 1 })).unwrap();
        assert!(obs.entities().is_none());
        assert!(obs.world.is_null());
    }

    #[test]
    fn test_absent_fields_are_not_written_back() {
        let raw = json!({ "tick": 3, "game_status": "active", "events": [] });
        let obs: Observation = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&obs).unwrap(), raw);
    }

    #[test]
    fn test_strip_render_attributes() {
        let mut obs = sample();
        obs.strip_attributes(RENDER_ATTRIBUTES);
        assert_eq!(obs.player["attributes"], json!({ "Team": "red" }));
        assert_eq!(obs.other_players[0]["attributes"], json!({}));
    }

    #[test]
    fn test_is_finished() {
        let mut obs = sample();
        assert!(!obs.is_finished());
        obs.game_status = "Finished".into();
        assert!(obs.is_finished());
        obs.game_status = String::new();
        assert!(!obs.is_finished());
    }
}
