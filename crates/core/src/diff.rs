//! Observation Diff Engine
//!
//! Compresses successive world snapshots into minimal deltas. The first observation is
//! passed through whole; afterwards only fields whose structural value changed are sent,
//! with `world.entities` matched by id into `changed` / `added` / `removed` buckets.
//! `tick`, `game_status` and `events` are always carried so the receiver sees an
//! unambiguous sequence marker and never misses an event.

use crate::observation::{Entity, EntityId, Observation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Tuning for structural comparison.
#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Numeric leaves within this distance of each other compare equal.
    /// `0.0` means exact equality.
    pub epsilon: f64,
    /// Attribute keys removed from every observation before diffing.
    pub ignored_attributes: Vec<String>,
}

/// The result of diffing two observations.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Diff {
    /// No previous observation: the full snapshot.
    Snapshot(Observation),
    /// Only what changed since the previous observation.
    Delta(ObservationDelta),
}

/// A partial observation. Absent optional fields mean "no change", not "empty".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationDelta {
    pub tick: u64,
    pub game_status: String,
    pub events: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_players: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<WorldDelta>,
    /// Changed top-level fields outside the known set.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Change to the `world` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorldDelta {
    /// Both sides carried an entity list.
    Entities(EntityWorldDelta),
    /// Fallback when either side has no parseable entity list.
    Structural(Value),
}

/// World change with entities diffed by id and any other world keys structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWorldDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<EntityDelta>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Entity changes between two observations. Empty buckets are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<EntityId>,
}

impl EntityDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

impl WorldDelta {
    /// The entity buckets, when the world was diffed by id.
    pub fn entities(&self) -> Option<&EntityDelta> {
        match self {
            WorldDelta::Entities(world) => world.entities.as_ref(),
            WorldDelta::Structural(_) => None,
        }
    }
}

impl Diff {
    pub fn tick(&self) -> u64 {
        match self {
            Diff::Snapshot(obs) => obs.tick,
            Diff::Delta(delta) => delta.tick,
        }
    }

    /// True when nothing but the heartbeat fields would be reported.
    pub fn is_heartbeat_only(&self) -> bool {
        match self {
            Diff::Snapshot(_) => false,
            Diff::Delta(delta) => {
                delta.events.is_empty()
                    && delta.player.is_none()
                    && delta.other_players.is_none()
                    && delta.world.is_none()
                    && delta.extra.is_empty()
            }
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Diffs `current` against `previous` with exact equality.
pub fn diff(previous: Option<&Observation>, current: &Observation) -> Diff {
    diff_with(previous, current, &DiffOptions::default())
}

/// Diffs `current` against `previous` using the given options.
///
/// `ignored_attributes` is not applied here; [`ObservationDiffer`] strips them before
/// observations reach this function.
pub fn diff_with(previous: Option<&Observation>, current: &Observation, options: &DiffOptions) -> Diff {
    let Some(previous) = previous else {
        return Diff::Snapshot(current.clone());
    };
    let eps = options.epsilon;

    let world = match (previous.entities(), current.entities()) {
        (Some(prev_entities), Some(curr_entities)) => {
            let entities = diff_entities(&prev_entities, &curr_entities, eps);
            let other = deep_diff(&without_entities(&previous.world), &without_entities(&current.world), eps)
                .and_then(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .unwrap_or_default();
            if entities.is_none() && other.is_empty() {
                None
            } else {
                Some(WorldDelta::Entities(EntityWorldDelta { entities, other }))
            }
        }
        _ => deep_diff(&previous.world, &current.world, eps).map(WorldDelta::Structural),
    };

    let prev_extra = Value::Object(previous.extra.clone());
    let curr_extra = Value::Object(current.extra.clone());
    let extra = match deep_diff(&prev_extra, &curr_extra, eps) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    Diff::Delta(ObservationDelta {
        tick: current.tick,
        game_status: current.game_status.clone(),
        events: current.events.clone(),
        player: deep_diff(&previous.player, &current.player, eps),
        other_players: deep_diff(&previous.other_players, &current.other_players, eps),
        world,
        extra,
    })
}

fn without_entities(world: &Value) -> Value {
    match world {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove("entities");
            Value::Object(map)
        }
        other => other.clone(),
    }
}

/// Recursive structural diff.
///
/// Objects keep only differing keys, with keys missing from `curr` reported as `null`.
/// Anything else (scalars, arrays, type changes) is replaced wholesale by `curr`.
pub fn deep_diff(prev: &Value, curr: &Value, eps: f64) -> Option<Value> {
    if structurally_equal(prev, curr, eps) {
        return None;
    }
    match (prev, curr) {
        (Value::Object(prev_map), Value::Object(curr_map)) => {
            let mut out = Map::new();
            for (key, prev_value) in prev_map {
                match curr_map.get(key) {
                    None => {
                        out.insert(key.clone(), Value::Null);
                    }
                    Some(curr_value) => {
                        if let Some(d) = deep_diff(prev_value, curr_value, eps) {
                            out.insert(key.clone(), d);
                        }
                    }
                }
            }
            for (key, curr_value) in curr_map {
                if !prev_map.contains_key(key) {
                    out.insert(key.clone(), curr_value.clone());
                }
            }
            (!out.is_empty()).then_some(Value::Object(out))
        }
        _ => Some(curr.clone()),
    }
}

/// Order-sensitive structural equality; numbers compare by value within `eps`.
pub fn structurally_equal(a: &Value, b: &Value, eps: f64) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) if eps > 0.0 => (x - y).abs() <= eps,
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|(x, y)| structurally_equal(x, y, eps))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| structurally_equal(x, y, eps)))
        }
        _ => a == b,
    }
}

/// Matches entities by id. Returns `None` when nothing changed.
pub fn diff_entities(prev: &[Entity], curr: &[Entity], eps: f64) -> Option<EntityDelta> {
    let prev_by_id: HashMap<EntityId, Value> = prev
        .iter()
        .map(|e| (e.id, serde_json::to_value(e).unwrap_or(Value::Null)))
        .collect();
    let curr_ids: std::collections::HashSet<EntityId> = curr.iter().map(|e| e.id).collect();

    let mut delta = EntityDelta::default();
    for entity in curr {
        match prev_by_id.get(&entity.id) {
            None => delta.added.push(entity.clone()),
            Some(prev_value) => {
                let curr_value = serde_json::to_value(entity).unwrap_or(Value::Null);
                if !structurally_equal(prev_value, &curr_value, eps) {
                    delta.changed.push(entity.clone());
                }
            }
        }
    }
    for entity in prev {
        if !curr_ids.contains(&entity.id) && !delta.removed.contains(&entity.id) {
            delta.removed.push(entity.id);
        }
    }

    (!delta.is_empty()).then_some(delta)
}

/// Recursive counterpart of [`deep_diff`]: whatever `deep_diff` would report comes from
/// `curr`, everything it would suppress keeps the value from `prev`.
fn settle(prev: &Value, curr: &Value, eps: f64) -> Value {
    if structurally_equal(prev, curr, eps) {
        return prev.clone();
    }
    match (prev, curr) {
        (Value::Object(prev_map), Value::Object(curr_map)) => Value::Object(
            curr_map
                .iter()
                .map(|(key, curr_value)| {
                    let value = match prev_map.get(key) {
                        Some(prev_value) => settle(prev_value, curr_value, eps),
                        None => curr_value.clone(),
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        _ => curr.clone(),
    }
}

/// Entities within `eps` of their previous state keep that state; the rest are taken as is.
fn settle_entities(prev: &Value, curr: &Value, eps: f64) -> Value {
    let (Some(prev), Some(curr)) = (prev.as_array(), curr.as_array()) else {
        return curr.clone();
    };
    let prev_by_id: HashMap<EntityId, &Value> = prev
        .iter()
        .filter_map(|e| Some((e.get("id")?.as_i64()?, e)))
        .collect();
    Value::Array(
        curr.iter()
            .map(|entity| {
                let known = entity
                    .get("id")
                    .and_then(Value::as_i64)
                    .and_then(|id| prev_by_id.get(&id));
                match known {
                    Some(prev_entity) if structurally_equal(prev_entity, entity, eps) => {
                        (*prev_entity).clone()
                    }
                    _ => entity.clone(),
                }
            })
            .collect(),
    )
}

/// The observation as a receiver of every diff so far knows it.
///
/// With a non-zero epsilon, suppressed changes must not move the baseline, otherwise a
/// value drifting by less than epsilon per tick would never be reported.
fn reported_state(previous: &Observation, current: &Observation, eps: f64) -> Observation {
    let world = match (previous.entities(), current.entities()) {
        (Some(_), Some(_)) => {
            let mut world = settle(
                &without_entities(&previous.world),
                &without_entities(&current.world),
                eps,
            );
            let entities = settle_entities(&previous.world["entities"], &current.world["entities"], eps);
            if let Value::Object(map) = &mut world {
                map.insert("entities".to_string(), entities);
            }
            world
        }
        _ => settle(&previous.world, &current.world, eps),
    };
    let extra = match settle(
        &Value::Object(previous.extra.clone()),
        &Value::Object(current.extra.clone()),
        eps,
    ) {
        Value::Object(map) => map,
        _ => current.extra.clone(),
    };

    Observation {
        tick: current.tick,
        game_status: current.game_status.clone(),
        player: settle(&previous.player, &current.player, eps),
        other_players: settle(&previous.other_players, &current.other_players, eps),
        world,
        events: current.events.clone(),
        extra,
    }
}

/// Remembers the last reported state and diffs each new observation against it.
#[derive(Debug, Default)]
pub struct ObservationDiffer {
    previous: Option<Observation>,
    options: DiffOptions,
}

impl ObservationDiffer {
    pub fn new(options: DiffOptions) -> Self {
        Self {
            previous: None,
            options,
        }
    }

    /// Diffs the observation against the previous one and remembers it.
    ///
    /// Observations older than the last accepted tick are discarded and yield `None`,
    /// so a late response can never be injected after a newer one.
    pub fn next(&mut self, mut observation: Observation) -> Option<Diff> {
        if let Some(previous) = &self.previous {
            if observation.tick < previous.tick {
                warn!(
                    tick = observation.tick,
                    last_tick = previous.tick,
                    "Discarding stale observation"
                );
                return None;
            }
        }

        if !self.options.ignored_attributes.is_empty() {
            let keys: Vec<&str> = self
                .options
                .ignored_attributes
                .iter()
                .map(String::as_str)
                .collect();
            observation.strip_attributes(&keys);
        }

        let diff = diff_with(self.previous.as_ref(), &observation, &self.options);
        if tracing::enabled!(tracing::Level::DEBUG) {
            let full = serde_json::to_string(&observation).map(|s| s.len()).unwrap_or(0);
            let sent = serde_json::to_string(&diff).map(|s| s.len()).unwrap_or(0);
            debug!(tick = diff.tick(), full_bytes = full, diff_bytes = sent, "Observation diffed");
        }
        let baseline = match &self.previous {
            Some(previous) if self.options.epsilon > 0.0 => {
                reported_state(previous, &observation, self.options.epsilon)
            }
            _ => observation,
        };
        self.previous = Some(baseline);
        Some(diff)
    }

    /// Forgets the previous observation; the next call yields a full snapshot.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn previous(&self) -> Option<&Observation> {
        self.previous.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: EntityId, name: &str, position: [f64; 3]) -> Value {
        json!({ "id": id, "name": name, "position": position, "size": [2.0, 5.0, 2.0] })
    }

    fn make_obs(tick: u64, player_pos: [f64; 3], extra_entities: Vec<Value>) -> Observation {
        let mut entities = vec![
            json!({ "id": 5, "name": "Ground", "position": [0.0, -0.5, 0.0], "size": [100.0, 1.0, 100.0], "color": [0.33, 0.94, 0.77] }),
            json!({ "id": 6, "name": "LowStep", "position": [8.0, 1.0, 18.0], "size": [8.0, 2.0, 10.0] }),
            entity(19, "HumanoidRootPart", player_pos),
        ];
        entities.extend(extra_entities);
        serde_json::from_value(json!({
            "tick": tick,
            "game_status": "active",
            "player": { "id": "abc", "position": player_pos, "health": 100, "attributes": { "ViewForwardX": 0, "ViewForwardZ": -1 } },
            "other_players": [],
            "world": { "entities": entities },
            "events": [],
        }))
        .unwrap()
    }

    fn delta(diff: Diff) -> ObservationDelta {
        match diff {
            Diff::Delta(d) => d,
            Diff::Snapshot(_) => panic!("expected a delta"),
        }
    }

    #[test]
    fn test_first_observation_is_full_snapshot() {
        let obs = make_obs(100, [0.0, 2.55, 0.0], vec![]);
        assert_eq!(diff(None, &obs), Diff::Snapshot(obs.clone()));
    }

    #[test]
    fn test_identical_observations_only_carry_heartbeat() {
        let a = make_obs(100, [0.0, 2.55, 0.0], vec![]);
        let b = make_obs(200, [0.0, 2.55, 0.0], vec![]);
        let d = diff(Some(&a), &b);
        assert!(d.is_heartbeat_only());

        let json = d.to_value();
        assert_eq!(json, json!({ "tick": 200, "game_status": "active", "events": [] }));
    }

    #[test]
    fn test_moved_player_reports_only_changed_fields() {
        let a = make_obs(200, [0.0, 2.55, 0.0], vec![]);
        let b = make_obs(300, [5.0, 2.55, 3.0], vec![]);
        let d = delta(diff(Some(&a), &b));

        let player = d.player.expect("player changed");
        assert_eq!(player["position"], json!([5.0, 2.55, 3.0]));
        assert!(player.get("health").is_none());

        let entities = d.world.as_ref().and_then(WorldDelta::entities).unwrap();
        assert_eq!(entities.changed.len(), 1);
        assert_eq!(entities.changed[0].id, 19);
        assert!(entities.added.is_empty());
        assert!(entities.removed.is_empty());

        let wire = serde_json::to_value(d.world.unwrap()).unwrap();
        assert!(wire["entities"].get("added").is_none());
        assert!(wire["entities"].get("removed").is_none());
    }

    #[test]
    fn test_added_then_removed_entity() {
        let a = make_obs(300, [5.0, 2.55, 3.0], vec![]);
        let b = make_obs(400, [5.0, 2.55, 3.0], vec![entity(20, "NewBlock", [10.0, 0.0, 10.0])]);
        let added = delta(diff(Some(&a), &b));
        let entities = added.world.as_ref().and_then(WorldDelta::entities).unwrap();
        assert_eq!(entities.added.len(), 1);
        assert_eq!(entities.added[0].id, 20);
        assert!(entities.changed.is_empty());
        assert!(added.player.is_none());

        let c = make_obs(500, [5.0, 2.55, 3.0], vec![]);
        let removed = delta(diff(Some(&b), &c));
        let entities = removed.world.as_ref().and_then(WorldDelta::entities).unwrap();
        assert_eq!(entities.removed, vec![20]);
        assert!(entities.added.is_empty() && entities.changed.is_empty());
    }

    #[test]
    fn test_events_always_copied() {
        let a = make_obs(1, [0.0, 0.0, 0.0], vec![]);
        let mut b = make_obs(2, [0.0, 0.0, 0.0], vec![]);
        b.events = vec![json!({ "type": "goal", "by": "p2" })];
        let d = delta(diff(Some(&a), &b));
        assert_eq!(d.events, b.events);
        assert!(!diff(Some(&a), &b).is_heartbeat_only());
    }

    #[test]
    fn test_missing_world_falls_back_to_structural_diff() {
        let a: Observation = serde_json::from_value(json!({ "tick": 1, "world": null })).unwrap();
        let b: Observation =
            serde_json::from_value(json!({ "tick": 2, "world": { "weather": "rain" } })).unwrap();
        let d = delta(diff(Some(&a), &b));
        assert_eq!(d.world, Some(WorldDelta::Structural(json!({ "weather": "rain" }))));
    }

    #[test]
    fn test_removed_key_is_reported_as_null() {
        let prev = json!({ "health": 100, "shield": 5 });
        let curr = json!({ "health": 100 });
        assert_eq!(deep_diff(&prev, &curr, 0.0), Some(json!({ "shield": null })));
    }

    #[test]
    fn test_arrays_are_order_sensitive() {
        let prev = json!([1, 2, 3]);
        let curr = json!([3, 2, 1]);
        assert_eq!(deep_diff(&prev, &curr, 0.0), Some(curr.clone()));
    }

    #[test]
    fn test_integer_and_float_compare_by_value() {
        assert!(structurally_equal(&json!(1), &json!(1.0), 0.0));
    }

    #[test]
    fn test_epsilon_absorbs_numeric_jitter() {
        let a = make_obs(1, [1.0, 2.0, 3.0], vec![]);
        let b = make_obs(2, [1.0001, 2.0, 3.0], vec![]);
        let exact = diff(Some(&a), &b);
        assert!(!exact.is_heartbeat_only());

        let options = DiffOptions {
            epsilon: 0.01,
            ..Default::default()
        };
        assert!(diff_with(Some(&a), &b, &options).is_heartbeat_only());
    }

    #[test]
    fn test_slow_drift_is_reported_once_it_exceeds_epsilon() {
        let mut differ = ObservationDiffer::new(DiffOptions {
            epsilon: 0.01,
            ..Default::default()
        });
        differ.next(make_obs(0, [0.0, 0.0, 0.0], vec![])).unwrap();

        let mut reported = Vec::new();
        for tick in 1..=100u64 {
            let x = tick as f64 * 0.009;
            let d = differ.next(make_obs(tick, [x, 0.0, 0.0], vec![])).unwrap();
            if !d.is_heartbeat_only() {
                let d = delta(d);
                let entities = d.world.as_ref().and_then(WorldDelta::entities).unwrap();
                assert_eq!(entities.changed[0].id, 19);
                reported.push(tick);
            }
        }

        // Each step is below epsilon, two steps are not.
        assert_eq!(reported.first(), Some(&2));
        assert!(reported.len() >= 45, "reported at {reported:?}");
        let known = differ.previous().unwrap().player["position"][0].as_f64().unwrap();
        assert!((known - 0.9).abs() <= 0.01, "baseline stuck at {known}");
    }

    #[test]
    fn test_jitter_within_epsilon_keeps_the_reported_value() {
        let mut differ = ObservationDiffer::new(DiffOptions {
            epsilon: 0.01,
            ..Default::default()
        });
        differ.next(make_obs(1, [1.0, 0.0, 0.0], vec![])).unwrap();
        for (tick, x) in [(2, 1.004), (3, 0.997), (4, 1.006)] {
            assert!(differ.next(make_obs(tick, [x, 0.0, 0.0], vec![])).unwrap().is_heartbeat_only());
        }
        let baseline = differ.previous().unwrap();
        assert_eq!(baseline.tick, 4);
        assert_eq!(baseline.player["position"], json!([1.0, 0.0, 0.0]));
        assert_eq!(baseline.entities().unwrap()[2].position, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_other_world_keys_are_diffed_next_to_entities() {
        let mut a = make_obs(1, [0.0, 0.0, 0.0], vec![]);
        let mut b = make_obs(2, [0.0, 0.0, 0.0], vec![]);
        a.world["time_of_day"] = json!("dusk");
        b.world["time_of_day"] = json!("night");
        let d = delta(diff(Some(&a), &b));
        match d.world.unwrap() {
            WorldDelta::Entities(world) => {
                assert!(world.entities.is_none());
                assert_eq!(world.other.get("time_of_day"), Some(&json!("night")));
            }
            WorldDelta::Structural(v) => panic!("unexpected structural diff: {v}"),
        }
    }

    #[test]
    fn test_differ_discards_stale_ticks_and_strips_attributes() {
        let mut differ = ObservationDiffer::new(DiffOptions {
            ignored_attributes: vec!["ViewForwardX".into(), "ViewForwardZ".into()],
            ..Default::default()
        });
        let first = differ.next(make_obs(10, [0.0, 0.0, 0.0], vec![])).unwrap();
        match first {
            Diff::Snapshot(obs) => assert_eq!(obs.player["attributes"], json!({})),
            Diff::Delta(_) => panic!("first diff must be a snapshot"),
        }

        assert!(differ.next(make_obs(9, [0.0, 0.0, 0.0], vec![])).is_none());

        let mut turned = make_obs(11, [0.0, 0.0, 0.0], vec![]);
        turned.player["attributes"]["ViewForwardX"] = json!(1);
        let d = differ.next(turned).unwrap();
        assert!(d.is_heartbeat_only());
        assert_eq!(d.tick(), 11);

        differ.reset();
        assert!(matches!(
            differ.next(make_obs(12, [0.0, 0.0, 0.0], vec![])),
            Some(Diff::Snapshot(_))
        ));
    }
}
