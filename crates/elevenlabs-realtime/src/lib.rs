//! Realtime text-to-speech over the ElevenLabs `stream-input` WebSocket, played through a
//! raw PCM sink.

pub mod audio;
mod error;
pub mod player;
pub mod protocol;
pub mod sink;
pub mod transport;

pub use error::TtsError;
pub use player::{AudioStreamPlayer, PlayerConfig, PlayerState};
pub use transport::ElevenLabsConfig;
