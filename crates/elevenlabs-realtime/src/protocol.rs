//! Wire types for the ElevenLabs text-to-speech `stream-input` WebSocket.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_ID: &str = "eleven_flash_v2_5";
pub const DEFAULT_OUTPUT_FORMAT: &str = "pcm_16000";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.45,
            similarity_boost: 0.8,
            use_speaker_boost: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationConfig {
    /// Characters buffered before each successive generation.
    pub chunk_length_schedule: Vec<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            chunk_length_schedule: vec![120, 160, 250, 290],
        }
    }
}

/// The first frame of a connection. `text` must be a single space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitializeConnection {
    pub text: String,
    pub voice_settings: VoiceSettings,
    pub generation_config: GenerationConfig,
    pub xi_api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendText {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush: Option<bool>,
}

/// Frames sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Initialize(InitializeConnection),
    Text(SendText),
}

impl ClientMessage {
    pub fn initialize(
        api_key: &str,
        voice_settings: VoiceSettings,
        generation_config: GenerationConfig,
    ) -> Self {
        ClientMessage::Initialize(InitializeConnection {
            text: " ".to_string(),
            voice_settings,
            generation_config,
            xi_api_key: api_key.to_string(),
        })
    }

    /// Text that should be synthesized right away.
    pub fn flush_text(text: impl Into<String>) -> Self {
        ClientMessage::Text(SendText {
            text: text.into(),
            flush: Some(true),
        })
    }

    /// Keeps an idle connection from timing out.
    pub fn keepalive() -> Self {
        ClientMessage::Text(SendText {
            text: " ".to_string(),
            flush: None,
        })
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, ClientMessage::Text(SendText { text, flush: None }) if text == " ")
    }
}

/// Frames received from the service. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Base64 PCM audio.
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub is_final: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerMessage {
    pub fn is_final(&self) -> bool {
        self.is_final == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initialize_frame() {
        let msg = ClientMessage::initialize("key", VoiceSettings::default(), GenerationConfig::default());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "text": " ",
                "voice_settings": { "stability": 0.45f32, "similarity_boost": 0.8f32, "use_speaker_boost": true },
                "generation_config": { "chunk_length_schedule": [120, 160, 250, 290] },
                "xi_api_key": "key"
            })
        );
    }

    #[test]
    fn test_text_frames() {
        assert_eq!(
            serde_json::to_value(ClientMessage::flush_text("Hi")).unwrap(),
            json!({ "text": "Hi", "flush": true })
        );
        let keepalive = ClientMessage::keepalive();
        assert_eq!(serde_json::to_value(&keepalive).unwrap(), json!({ "text": " " }));
        assert!(keepalive.is_keepalive());
        assert!(!ClientMessage::flush_text(" ").is_keepalive());
    }

    #[test]
    fn test_server_message() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"audio":"AAA=","isFinal":null,"normalizedAlignment":{}}"#).unwrap();
        assert_eq!(msg.audio.as_deref(), Some("AAA="));
        assert!(!msg.is_final());

        let last: ServerMessage = serde_json::from_str(r#"{"audio":null,"isFinal":true}"#).unwrap();
        assert!(last.audio.is_none());
        assert!(last.is_final());
    }
}
