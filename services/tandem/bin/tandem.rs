//! Main Entrypoint for the Tandem Agent Pair
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and command line.
//! 2. Joining the world simulation.
//! 3. Building both agents, the scheduler and the voice.
//! 4. Running the world loop and the console until quit or Ctrl+C.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use clap::Parser;
use elevenlabs_realtime::{AudioStreamPlayer, ElevenLabsConfig, PlayerConfig};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tandem_core::{
    AgentRole, AgentRuntime, DiffOptions, EventBridge, HeartbeatPolicy, TurnScheduler,
    llm_client::{LLMClient, OpenAICompatibleClient},
    observation::RENDER_ATTRIBUTES,
    runtime::LlmAgent,
};
use tandem_service::{
    config::Config,
    console,
    persistence::ConversationStore,
    prompts::SystemPrompts,
    session::{Session, Speaker},
    tool::WorldTool,
    world::{JOIN_ATTEMPTS, WorldClient},
};
use tracing::info;

/// A speech agent and an action agent sharing one game world.
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(version, about, long_about = None)]
struct Args {
    /// World API base URL (overrides WORLD_API_BASE)
    #[arg(long)]
    world: Option<String>,

    /// Name to join the world with (overrides WORLD_JOIN_NAME)
    #[arg(long)]
    name: Option<String>,

    /// World polling interval in milliseconds (overrides OBSERVE_INTERVAL_MS)
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(100..))]
    interval: Option<u64>,

    /// Disable voice output even when ElevenLabs is configured
    #[arg(long)]
    no_audio: bool,

    /// Do not poll the world automatically; use /observe instead
    #[arg(long)]
    manual: bool,
}

/// Listens for the `Ctrl+C` signal to gracefully shut down.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let args = Args::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(world) = args.world {
        config.world_api_base = world.trim_end_matches('/').to_string();
    }
    if let Some(name) = args.name {
        config.world_join_name = name;
    }
    if let Some(interval) = args.interval {
        config.observe_interval = Duration::from_millis(interval);
    }
    if args.no_audio {
        config.voice = None;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Joining world...");

    // --- 3. Join the World ---
    let world = Arc::new(WorldClient::new(
        config.world_api_base.clone(),
        config.world_join_name.clone(),
    ));
    world
        .join_with_retry(JOIN_ATTEMPTS)
        .await
        .context("Failed to join the world")?;

    // --- 4. Initialize Agents ---
    let diff_options = DiffOptions {
        epsilon: config.diff_epsilon,
        ignored_attributes: RENDER_ATTRIBUTES.iter().map(|s| s.to_string()).collect(),
    };
    let openai_config = OpenAIConfig::new()
        .with_api_key(&config.openai_api_key)
        .with_api_base(&config.llm_api_base);
    let llm_client: Arc<dyn LLMClient> = Arc::new(OpenAICompatibleClient::new(
        openai_config,
        config.chat_model.clone(),
    ));
    let prompts = SystemPrompts::load(&config.prompts_path);

    let speech = Arc::new(LlmAgent::new(AgentRole::Speech.as_str(), llm_client.clone()));
    let action = Arc::new(
        LlmAgent::new(AgentRole::Action.as_str(), llm_client)
            .with_tools(Arc::new(WorldTool::new(world.clone(), diff_options.clone()))),
    );
    speech.set_system_prompt(prompts.speech.clone());
    action.set_system_prompt(prompts.action.clone());

    let heartbeat = if config.skip_heartbeat_diffs {
        HeartbeatPolicy::SkipHeartbeatOnly
    } else {
        HeartbeatPolicy::Always
    };
    let scheduler = TurnScheduler::new(speech, action, EventBridge::new(heartbeat));

    // --- 5. Initialize Voice and Persistence ---
    let speaker: Option<Arc<dyn Speaker>> = match &config.voice {
        Some(voice) => {
            let mut tts = ElevenLabsConfig::new(
                SecretString::from(voice.api_key.clone()),
                voice.voice_id.clone(),
            );
            tts.model_id = voice.model_id.clone();
            tts.output_format = voice.output_format.clone();
            let player = AudioStreamPlayer::elevenlabs(tts, PlayerConfig::default());
            player.connect();
            info!(voice_id = %voice.voice_id, "Voice output enabled.");
            Some(Arc::new(player) as Arc<dyn Speaker>)
        }
        None => {
            info!("Voice output disabled (set ELEVENLABS_API_KEY and AGENT_VOICE_ID to enable).");
            None
        }
    };
    let store = ConversationStore::spawn(config.results_dir.clone());

    // --- 6. Run ---
    let (session, transcript) = Session::start(
        scheduler,
        world,
        diff_options,
        speaker,
        Some(store),
    );
    let world_loop = (!args.manual).then(|| session.spawn_world_loop(config.observe_interval));
    info!(
        world = %config.world_api_base,
        model = %config.chat_model,
        interval_ms = config.observe_interval.as_millis() as u64,
        results = %config.results_dir.display(),
        "Session started."
    );

    tokio::select! {
        _ = console::run(session.clone(), transcript, console::stdin_lines()) => {}
        _ = shutdown_signal() => {}
    }

    session.shutdown().await;
    if let Some(handle) = world_loop {
        let _ = handle.await;
    }
    info!("Tandem has shut down.");
    Ok(())
}
