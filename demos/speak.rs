//! Speaks each command-line argument through ElevenLabs and `ffplay`.
//!
//! Needs `ELEVENLABS_API_KEY` and a voice id (`AGENT_VOICE_ID` or `ELEVENLABS_VOICE_ID`).
//!
//! ```sh
//! cargo run --example speak -- "Hello there." "Second sentence."
//! ```

use anyhow::Context;
use clap::Parser;
use elevenlabs_realtime::{AudioStreamPlayer, ElevenLabsConfig, PlayerConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Speak text through the realtime TTS player")]
struct Args {
    /// Output format requested from ElevenLabs
    #[arg(long, default_value = "pcm_16000")]
    format: String,

    /// Utterances, played in order
    #[arg(required = true)]
    text: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let args = Args::parse();
    let api_key = std::env::var("ELEVENLABS_API_KEY").context("ELEVENLABS_API_KEY must be set")?;
    let voice_id = std::env::var("AGENT_VOICE_ID")
        .or_else(|_| std::env::var("ELEVENLABS_VOICE_ID"))
        .context("AGENT_VOICE_ID or ELEVENLABS_VOICE_ID must be set")?;

    let mut config = ElevenLabsConfig::new(api_key.into(), voice_id);
    config.output_format = args.format;
    let player = AudioStreamPlayer::elevenlabs(config, PlayerConfig::default());

    for text in &args.text {
        player.enqueue(text);
    }
    info!(utterances = player.pending(), "Queued");
    player.wait_idle().await;
    player.close().await;
    Ok(())
}
