use thiserror::Error;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("failed to connect to the TTS service: {0}")]
    Connect(String),
    #[error("failed to send to the TTS service: {0}")]
    Send(String),
    #[error("playback sink failed: {0}")]
    Sink(#[from] std::io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection is closed")]
    Closed,
}
