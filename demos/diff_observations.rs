//! Prints the diff of each step of a synthetic walk and how much smaller it is than the
//! full observation.
//!
//! ```sh
//! cargo run --example diff_observations -- --steps 6
//! ```

use clap::Parser;
use serde_json::json;
use tandem_core::{DiffOptions, Observation, ObservationDiffer, observation::RENDER_ATTRIBUTES};

#[derive(Parser, Debug)]
struct Args {
    /// Number of observations to generate
    #[arg(long, default_value_t = 5)]
    steps: u64,

    /// Tolerance for numeric comparisons
    #[arg(long, default_value_t = 0.0)]
    epsilon: f64,
}

/// A player walking in a circle past a crate; a coin appears on step 3 and is picked up on step 4.
fn observation(step: u64) -> anyhow::Result<Observation> {
    let angle = step as f64 * 0.35;
    let mut entities = vec![json!({
        "id": 19, "name": "Crate",
        "position": [4.0, 0.0, 2.0], "size": [1.0, 1.0, 1.0],
        "attributes": {"ModelUrl": "crate.glb"}
    })];
    if step == 3 {
        let coin = [angle.cos() * 6.0, 0.5, angle.sin() * 6.0];
        entities.push(json!({
            "id": 20, "name": "Coin",
            "position": coin, "size": [0.3, 0.3, 0.1]
        }));
    }
    let coins = if step >= 4 { 1 } else { 0 };
    let events = if step == 4 {
        vec![json!({"type": "pickup", "entity": 20})]
    } else {
        vec![]
    };
    let position = [angle.cos() * 6.0, 0.0, angle.sin() * 6.0];
    let fov = 70.0 + step as f64;
    Ok(serde_json::from_value(json!({
        "tick": step * 10,
        "game_status": "active",
        "player": {
            "position": position,
            "health": 100,
            "coins": coins,
            "attributes": {"ViewFovDeg": fov}
        },
        "other_players": [],
        "world": {"entities": entities},
        "events": events
    }))?)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut differ = ObservationDiffer::new(DiffOptions {
        epsilon: args.epsilon,
        ignored_attributes: RENDER_ATTRIBUTES.iter().map(|s| s.to_string()).collect(),
    });

    for step in 0..args.steps {
        let current = observation(step)?;
        let full = serde_json::to_string(&current)?.len();
        let Some(diff) = differ.next(current) else {
            continue;
        };
        let sent = serde_json::to_string(&diff)?;
        println!(
            "tick {:>3}: {:>4} -> {:>4} bytes ({:>3.0}%){}",
            diff.tick(),
            full,
            sent.len(),
            100.0 * sent.len() as f64 / full.max(1) as f64,
            if diff.is_heartbeat_only() { " heartbeat" } else { "" }
        );
        println!("  {}", sent);
    }
    Ok(())
}
