use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

const MIN_OBSERVE_INTERVAL_MS: u64 = 100;

/// Voice output settings. Present only when both the key and a voice are configured.
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceConfig {
    pub api_key: String,
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub world_api_base: String,
    pub world_join_name: String,
    pub observe_interval: Duration,
    pub openai_api_key: String,
    pub llm_api_base: String,
    pub chat_model: String,
    pub prompts_path: PathBuf,
    pub results_dir: PathBuf,
    pub voice: Option<VoiceConfig>,
    pub diff_epsilon: f64,
    pub skip_heartbeat_diffs: bool,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn first_var(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' is not a boolean", other),
        )),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let world_api_base = var_or("WORLD_API_BASE", "http://localhost:8080")
            .trim_end_matches('/')
            .to_string();
        let world_join_name = var_or("WORLD_JOIN_NAME", "TandemBot");

        let interval_str = var_or("OBSERVE_INTERVAL_MS", "2000");
        let interval_ms = interval_str.trim().parse::<u64>().map_err(|e| {
            ConfigError::InvalidValue("OBSERVE_INTERVAL_MS".to_string(), e.to_string())
        })?;
        if interval_ms < MIN_OBSERVE_INTERVAL_MS {
            return Err(ConfigError::InvalidValue(
                "OBSERVE_INTERVAL_MS".to_string(),
                format!("must be at least {} ms", MIN_OBSERVE_INTERVAL_MS),
            ));
        }

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
        let llm_api_base = var_or("LLM_API_BASE", "https://api.openai.com/v1");
        let chat_model = var_or("CHAT_MODEL", "gpt-4o");

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));
        let results_dir = std::env::var("RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./results"));

        let voice = match (
            first_var(&["ELEVENLABS_API_KEY"]),
            first_var(&["AGENT_VOICE_ID", "AGENT_A_VOICE_ID", "ELEVENLABS_VOICE_ID"]),
        ) {
            (Some(api_key), Some(voice_id)) => Some(VoiceConfig {
                api_key,
                voice_id,
                model_id: var_or("ELEVENLABS_MODEL_ID", "eleven_flash_v2_5"),
                output_format: var_or("ELEVENLABS_OUTPUT_FORMAT", "pcm_16000"),
            }),
            _ => None,
        };

        let epsilon_str = var_or("DIFF_EPSILON", "0");
        let diff_epsilon = epsilon_str
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|eps| eps.is_finite() && *eps >= 0.0)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "DIFF_EPSILON".to_string(),
                    format!("'{}' is not a non-negative number", epsilon_str),
                )
            })?;

        let skip_heartbeat_diffs =
            parse_bool("SKIP_HEARTBEAT_DIFFS", &var_or("SKIP_HEARTBEAT_DIFFS", "false"))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            world_api_base,
            world_join_name,
            observe_interval: Duration::from_millis(interval_ms),
            openai_api_key,
            llm_api_base,
            chat_model,
            prompts_path,
            results_dir,
            voice,
            diff_epsilon,
            skip_heartbeat_diffs,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    const VARS: &[&str] = &[
        "WORLD_API_BASE",
        "WORLD_JOIN_NAME",
        "OBSERVE_INTERVAL_MS",
        "OPENAI_API_KEY",
        "LLM_API_BASE",
        "CHAT_MODEL",
        "PROMPTS_PATH",
        "RESULTS_DIR",
        "ELEVENLABS_API_KEY",
        "AGENT_VOICE_ID",
        "AGENT_A_VOICE_ID",
        "ELEVENLABS_VOICE_ID",
        "ELEVENLABS_MODEL_ID",
        "ELEVENLABS_OUTPUT_FORMAT",
        "DIFF_EPSILON",
        "SKIP_HEARTBEAT_DIFFS",
        "RUST_LOG",
    ];

    fn clear_env_vars() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.world_api_base, "http://localhost:8080");
        assert_eq!(config.world_join_name, "TandemBot");
        assert_eq!(config.observe_interval, Duration::from_millis(2000));
        assert_eq!(config.openai_api_key, "test-openai-key");
        assert_eq!(config.llm_api_base, "https://api.openai.com/v1");
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.prompts_path, PathBuf::from("./prompts"));
        assert_eq!(config.results_dir, PathBuf::from("./results"));
        assert_eq!(config.voice, None);
        assert_eq!(config.diff_epsilon, 0.0);
        assert!(!config.skip_heartbeat_diffs);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("WORLD_API_BASE", "http://world.local:9000/");
            env::set_var("WORLD_JOIN_NAME", "Scout");
            env::set_var("OBSERVE_INTERVAL_MS", "500");
            env::set_var("LLM_API_BASE", "http://localhost:11434/v1");
            env::set_var("CHAT_MODEL", "gpt-4o-mini");
            env::set_var("PROMPTS_PATH", "/custom/prompts");
            env::set_var("RESULTS_DIR", "/tmp/results");
            env::set_var("DIFF_EPSILON", "0.001");
            env::set_var("SKIP_HEARTBEAT_DIFFS", "yes");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.world_api_base, "http://world.local:9000");
        assert_eq!(config.world_join_name, "Scout");
        assert_eq!(config.observe_interval, Duration::from_millis(500));
        assert_eq!(config.llm_api_base, "http://localhost:11434/v1");
        assert_eq!(config.chat_model, "gpt-4o-mini");
        assert_eq!(config.prompts_path, PathBuf::from("/custom/prompts"));
        assert_eq!(config.results_dir, PathBuf::from("/tmp/results"));
        assert_eq!(config.diff_epsilon, 0.001);
        assert!(config.skip_heartbeat_diffs);
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_voice_requires_key_and_voice() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("ELEVENLABS_API_KEY", "xi-key");
        }
        assert_eq!(Config::from_env().unwrap().voice, None);

        unsafe {
            env::set_var("ELEVENLABS_VOICE_ID", "fallback-voice");
        }
        let voice = Config::from_env().unwrap().voice.unwrap();
        assert_eq!(voice.voice_id, "fallback-voice");
        assert_eq!(voice.model_id, "eleven_flash_v2_5");
        assert_eq!(voice.output_format, "pcm_16000");

        unsafe {
            env::set_var("AGENT_A_VOICE_ID", "agent-a");
        }
        assert_eq!(Config::from_env().unwrap().voice.unwrap().voice_id, "agent-a");

        unsafe {
            env::set_var("AGENT_VOICE_ID", "primary");
            env::set_var("ELEVENLABS_OUTPUT_FORMAT", "pcm_22050");
        }
        let voice = Config::from_env().unwrap().voice.unwrap();
        assert_eq!(voice.voice_id, "primary");
        assert_eq!(voice.output_format, "pcm_22050");
    }

    #[test]
    #[serial]
    fn test_config_missing_openai_key() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("OPENAI_API_KEY")),
            _ => panic!("Expected MissingVar for OPENAI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_interval_too_small() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("OBSERVE_INTERVAL_MS", "50");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "OBSERVE_INTERVAL_MS"),
            _ => panic!("Expected InvalidValue for OBSERVE_INTERVAL_MS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_epsilon() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("DIFF_EPSILON", "-1");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "DIFF_EPSILON"),
            _ => panic!("Expected InvalidValue for DIFF_EPSILON"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_bool_and_log_level() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("SKIP_HEARTBEAT_DIFFS", "maybe");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "SKIP_HEARTBEAT_DIFFS"),
            _ => panic!("Expected InvalidValue for SKIP_HEARTBEAT_DIFFS"),
        }

        unsafe {
            env::remove_var("SKIP_HEARTBEAT_DIFFS");
            env::set_var("RUST_LOG", "not-a-level");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
