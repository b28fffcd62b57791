//! Duplex connection to the TTS service.

use crate::{
    TtsError,
    protocol::{ClientMessage, DEFAULT_MODEL_ID, DEFAULT_OUTPUT_FORMAT, GenerationConfig, ServerMessage, VoiceSettings},
};
use async_trait::async_trait;
use futures_util::{FutureExt, SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "wss://api.elevenlabs.io/v1/text-to-speech";

/// An open connection.
#[async_trait]
pub trait TtsTransport: Send {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), TtsError>;

    /// The next well-formed frame, or `None` once the connection is gone.
    async fn recv(&mut self) -> Option<ServerMessage>;

    /// Frames already received but not yet read, without waiting for more.
    fn drain_ready(&mut self) -> usize {
        let mut drained = 0;
        while let Some(Some(_)) = self.recv().now_or_never() {
            drained += 1;
        }
        drained
    }

    fn is_open(&self) -> bool;

    async fn close(&mut self);
}

/// Opens new connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TtsTransport>, TtsError>;
}

/// Settings for connecting to the ElevenLabs realtime endpoint.
#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    pub api_key: SecretString,
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
    pub voice_settings: VoiceSettings,
    pub generation_config: GenerationConfig,
    pub base_url: String,
}

impl ElevenLabsConfig {
    pub fn new(api_key: SecretString, voice_id: impl Into<String>) -> Self {
        Self {
            api_key,
            voice_id: voice_id.into(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            voice_settings: VoiceSettings::default(),
            generation_config: GenerationConfig::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn url(&self) -> String {
        format!(
            "{}/{}/stream-input?model_id={}&output_format={}",
            self.base_url.trim_end_matches('/'),
            self.voice_id,
            self.model_id,
            self.output_format
        )
    }
}

/// Connects over WebSocket and sends the initialization frame.
pub struct WebSocketConnector {
    config: ElevenLabsConfig,
}

impl WebSocketConnector {
    pub fn new(config: ElevenLabsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn TtsTransport>, TtsError> {
        let (ws_stream, _) = connect_async(self.config.url())
            .await
            .map_err(|e| TtsError::Connect(e.to_string()))?;
        info!(voice_id = %self.config.voice_id, "Connected to ElevenLabs realtime WebSocket.");

        let mut transport = WebSocketTransport {
            stream: ws_stream,
            open: true,
        };
        let init = ClientMessage::initialize(
            self.config.api_key.expose_secret(),
            self.config.voice_settings.clone(),
            self.config.generation_config.clone(),
        );
        transport.send(&init).await?;
        Ok(Box::new(transport))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    open: bool,
}

#[async_trait]
impl TtsTransport for WebSocketTransport {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), TtsError> {
        if !self.open {
            return Err(TtsError::Closed);
        }
        let payload = serde_json::to_string(message)?;
        if let Err(e) = self.stream.send(WsMessage::Text(payload.into())).await {
            self.open = false;
            return Err(TtsError::Send(e.to_string()));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        while self.open {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str(&text) {
                    Ok(message) => return Some(message),
                    Err(e) => warn!(error = %e, "Dropping malformed TTS frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "TTS connection closed by server");
                    self.open = false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "TTS connection error");
                    self.open = false;
                }
                None => self.open = false,
            }
        }
        None
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.stream.close(None).await {
                debug!(error = %e, "Error while closing TTS connection");
            }
        }
    }
}
