//! Where decoded audio goes.

use crate::{TtsError, audio::PCM16_SAMPLE_RATE};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin, Command},
};
use tracing::{debug, warn};

/// Consumes raw PCM16 audio.
#[async_trait]
pub trait PlaybackSink: Send {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), TtsError>;

    /// Whether the sink can still accept audio.
    fn is_usable(&mut self) -> bool;

    /// Releases the sink. Must not leave anything running.
    async fn shutdown(&mut self);
}

/// Opens a fresh sink for each connection.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PlaybackSink>, TtsError>;
}

/// Pipes audio into an `ffplay` child process.
pub struct FfplayFactory {
    program: String,
    sample_rate: u32,
}

impl Default for FfplayFactory {
    fn default() -> Self {
        Self::new(PCM16_SAMPLE_RATE)
    }
}

impl FfplayFactory {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            program: "ffplay".to_string(),
            sample_rate,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Low-latency raw PCM16 mono playback from stdin.
    pub fn args(&self) -> Vec<String> {
        let rate = self.sample_rate.to_string();
        [
            "-hide_banner", "-loglevel", "error", "-autoexit", "-nodisp",
            "-probesize", "32", "-analyzeduration", "0",
            "-fflags", "nobuffer", "-flags", "low_delay",
            "-f", "s16le", "-ar", rate.as_str(), "-ac", "1",
            "-i", "pipe:0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[async_trait]
impl SinkFactory for FfplayFactory {
    async fn open(&self) -> Result<Box<dyn PlaybackSink>, TtsError> {
        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .inspect_err(|e| warn!(program = %self.program, error = %e, "Audio player unavailable"))?;
        let stdin = child.stdin.take();
        debug!(pid = ?child.id(), "Started audio player");
        Ok(Box::new(FfplaySink { child, stdin }))
    }
}

pub struct FfplaySink {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl PlaybackSink for FfplaySink {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), TtsError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(TtsError::Closed);
        };
        if let Err(e) = stdin.write_all(pcm).await {
            self.stdin = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn is_usable(&mut self) -> bool {
        self.stdin.is_some() && matches!(self.child.try_wait(), Ok(None))
    }

    async fn shutdown(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Audio player already gone");
        }
        let _ = self.child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffplay_args() {
        let args = FfplayFactory::new(22050).args();
        let joined = args.join(" ");
        assert!(joined.contains("-f s16le -ar 22050 -ac 1"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:0"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_open() {
        let factory = FfplayFactory::default().with_program("definitely-not-a-real-player-binary");
        assert!(matches!(factory.open().await, Err(TtsError::Sink(_))));
    }
}
