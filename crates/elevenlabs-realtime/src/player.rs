//! Audio Stream Player
//!
//! Serializes text-to-speech requests and their playback. All connection and sink state
//! lives in one task; callers only push text into its queue. Utterances are synthesized
//! and played strictly in the order they were enqueued.

use crate::{
    TtsError,
    audio::{decode_pcm16, pcm_sample_rate, peak_level},
    protocol::ClientMessage,
    sink::{FfplayFactory, PlaybackSink, SinkFactory},
    transport::{Connector, ElevenLabsConfig, TtsTransport, WebSocketConnector},
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tracing::{Instrument, debug, info, info_span, warn};

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// How long to wait for each inbound frame before treating the utterance as finished.
    pub message_timeout: Duration,
    /// Interval between keepalive frames on an idle connection.
    pub keepalive_interval: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_millis(2500),
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

enum Job {
    Connect,
    Speak(String),
}

/// Handle to the player task.
///
/// Dropping the handle closes the player without waiting for it.
pub struct AudioStreamPlayer {
    jobs: mpsc::UnboundedSender<Job>,
    close: watch::Sender<bool>,
    state: watch::Receiver<PlayerState>,
    outstanding: Arc<watch::Sender<usize>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioStreamPlayer {
    pub fn spawn(
        connector: Arc<dyn Connector>,
        sinks: Arc<dyn SinkFactory>,
        config: PlayerConfig,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(PlayerState::Disconnected);
        let (outstanding, _) = watch::channel(0usize);
        let outstanding = Arc::new(outstanding);

        let worker = Worker {
            connector,
            sinks,
            config,
            connection: None,
            state: state_tx,
            outstanding: outstanding.clone(),
        };
        let task = tokio::spawn(worker.run(jobs_rx, close_rx).instrument(info_span!("tts_player")));

        Self {
            jobs: jobs_tx,
            close: close_tx,
            state: state_rx,
            outstanding,
            task: Mutex::new(Some(task)),
        }
    }

    /// A player speaking through ElevenLabs into `ffplay`.
    pub fn elevenlabs(config: ElevenLabsConfig, player: PlayerConfig) -> Self {
        let sample_rate = pcm_sample_rate(&config.output_format).unwrap_or_else(|| {
            warn!(format = %config.output_format, "Output format is not raw PCM; assuming 16 kHz");
            crate::audio::PCM16_SAMPLE_RATE
        });
        Self::spawn(
            Arc::new(WebSocketConnector::new(config)),
            Arc::new(FfplayFactory::new(sample_rate)),
            player,
        )
    }

    /// Queues an utterance. Blank text and anything after `close` is ignored.
    pub fn enqueue(&self, text: &str) -> bool {
        let cleaned = text.trim();
        if cleaned.is_empty() || self.is_closed() {
            return false;
        }
        self.outstanding.send_modify(|n| *n += 1);
        if self.jobs.send(Job::Speak(cleaned.to_string())).is_err() {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            return false;
        }
        true
    }

    /// Utterances queued or in progress.
    pub fn pending(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Resolves once every queued utterance has been played or dropped.
    pub async fn wait_idle(&self) {
        let mut outstanding = self.outstanding.subscribe();
        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    /// Opens the connection ahead of the first utterance.
    pub fn connect(&self) {
        if !self.is_closed() {
            let _ = self.jobs.send(Job::Connect);
        }
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow()
    }

    /// Stops playback, drops queued utterances and tears down the connection and sink.
    ///
    /// Resolves once everything is released. Calling it again is a no-op.
    pub async fn close(&self) {
        self.close.send_replace(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "TTS player task ended abnormally");
            }
        }
    }
}

impl Drop for AudioStreamPlayer {
    fn drop(&mut self) {
        self.close.send_replace(true);
    }
}

struct Connection {
    transport: Box<dyn TtsTransport>,
    sink: Box<dyn PlaybackSink>,
}

struct Worker {
    connector: Arc<dyn Connector>,
    sinks: Arc<dyn SinkFactory>,
    config: PlayerConfig,
    connection: Option<Connection>,
    state: watch::Sender<PlayerState>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl Worker {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>, mut close: watch::Receiver<bool>) {
        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *close.borrow_and_update() {
                break;
            }
            let connected = self.connection.is_some();
            tokio::select! {
                biased;
                _ = close.changed() => break,
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    tokio::select! {
                        biased;
                        _ = close.changed() => break,
                        _ = self.handle(job) => {}
                    }
                    keepalive.reset();
                }
                _ = keepalive.tick(), if connected => self.send_keepalive().await,
            }
        }

        self.teardown().await;
        self.state.send_replace(PlayerState::Closed);
        jobs.close();
        let mut dropped = 0;
        while jobs.try_recv().is_ok() {
            dropped += 1;
        }
        self.outstanding.send_replace(0);
        info!(dropped, "TTS player closed");
    }

    async fn handle(&mut self, job: Job) {
        match job {
            Job::Connect => {
                if let Err(e) = self.ensure_connected().await {
                    warn!(error = %e, "TTS connection failed");
                }
            }
            Job::Speak(text) => {
                self.speak_one(&text).await;
                self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            }
        }
    }

    fn is_usable(&mut self) -> bool {
        match self.connection.as_mut() {
            Some(conn) => conn.transport.is_open() && conn.sink.is_usable(),
            None => false,
        }
    }

    /// Reuses the current connection when it and its sink still work, otherwise starts over.
    async fn ensure_connected(&mut self) -> Result<(), TtsError> {
        if self.is_usable() {
            return Ok(());
        }
        self.teardown().await;
        self.state.send_replace(PlayerState::Connecting);

        let sink = match self.sinks.open().await {
            Ok(sink) => sink,
            Err(e) => {
                self.state.send_replace(PlayerState::Disconnected);
                return Err(e);
            }
        };
        match self.connector.connect().await {
            Ok(transport) => {
                self.connection = Some(Connection { transport, sink });
                self.state.send_replace(PlayerState::Connected);
                Ok(())
            }
            Err(e) => {
                let mut sink = sink;
                sink.shutdown().await;
                self.state.send_replace(PlayerState::Disconnected);
                Err(e)
            }
        }
    }

    async fn speak_one(&mut self, text: &str) {
        if let Err(e) = self.ensure_connected().await {
            warn!(error = %e, "Dropping utterance; TTS unavailable");
            return;
        }
        let Some(conn) = self.connection.as_mut() else {
            return;
        };

        let stale = conn.transport.drain_ready();
        if stale > 0 {
            debug!(stale, "Discarded frames left over from the previous utterance");
        }
        if let Err(e) = conn.transport.send(&ClientMessage::flush_text(text)).await {
            warn!(error = %e, "Failed to send utterance");
            self.teardown().await;
            return;
        }
        debug!(chars = text.len(), "Utterance sent");

        let mut broken = false;
        let (mut audio_bytes, mut peak) = (0usize, 0.0f32);
        loop {
            match timeout(self.config.message_timeout, conn.transport.recv()).await {
                Err(_) => {
                    debug!("No TTS frame before the timeout; treating utterance as finished");
                    break;
                }
                Ok(None) => {
                    warn!("TTS connection closed mid-utterance");
                    broken = true;
                    break;
                }
                Ok(Some(message)) => {
                    if let Some(error) = message.error.as_deref() {
                        warn!(error, detail = ?message.message, "TTS service reported an error");
                    }
                    if let Some(pcm) = message.audio.as_deref().and_then(decode_pcm16) {
                        audio_bytes += pcm.len();
                        peak = peak.max(peak_level(&pcm));
                        if let Err(e) = conn.sink.write(&pcm).await {
                            warn!(error = %e, "Playback sink failed");
                            broken = true;
                            break;
                        }
                    }
                    if message.is_final() {
                        break;
                    }
                }
            }
        }
        if audio_bytes > 0 && peak == 0.0 {
            debug!(audio_bytes, "Utterance produced only silence");
        } else {
            debug!(audio_bytes, peak, "Utterance played");
        }
        if broken {
            self.teardown().await;
        }
    }

    async fn send_keepalive(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if let Err(e) = conn.transport.send(&ClientMessage::keepalive()).await {
            warn!(error = %e, "Keepalive failed; will reconnect on next utterance");
            self.teardown().await;
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.transport.close().await;
            conn.sink.shutdown().await;
            self.state.send_replace(PlayerState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::encode_i16, protocol::ServerMessage};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    type Log = Arc<Mutex<Vec<String>>>;

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    async fn wait_for(log: &Log, entry: &str) {
        for _ in 0..400 {
            if entries(log).iter().any(|e| e == entry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never saw {entry:?} in {:?}", entries(log));
    }

    /// Replies to each utterance with one audio frame per character, then `isFinal`.
    #[derive(Clone, Copy)]
    enum Behavior {
        Reply,
        Silent,
        DropAfterReply,
    }

    struct FakeTransport {
        log: Log,
        inbox: VecDeque<ServerMessage>,
        open: bool,
        behavior: Behavior,
    }

    #[async_trait]
    impl TtsTransport for FakeTransport {
        async fn send(&mut self, message: &ClientMessage) -> Result<(), TtsError> {
            if !self.open {
                return Err(TtsError::Closed);
            }
            match message {
                m if m.is_keepalive() => self.log.lock().unwrap().push("keepalive".into()),
                ClientMessage::Text(t) => {
                    self.log.lock().unwrap().push(format!("send:{}", t.text));
                    if matches!(self.behavior, Behavior::Reply | Behavior::DropAfterReply) {
                        for (i, _) in t.text.chars().enumerate() {
                            self.inbox.push_back(ServerMessage {
                                audio: Some(encode_i16(&[i as i16])),
                                ..Default::default()
                            });
                        }
                        self.inbox.push_back(ServerMessage {
                            is_final: Some(true),
                            ..Default::default()
                        });
                    }
                }
                ClientMessage::Initialize(_) => {}
            }
            Ok(())
        }

        async fn recv(&mut self) -> Option<ServerMessage> {
            match self.inbox.pop_front() {
                Some(message) => {
                    if self.inbox.is_empty() && matches!(self.behavior, Behavior::DropAfterReply) {
                        self.open = false;
                    }
                    Some(message)
                }
                None if self.open => std::future::pending().await,
                None => None,
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }

        async fn close(&mut self) {
            self.open = false;
            self.log.lock().unwrap().push("close".into());
        }
    }

    struct FakeConnector {
        log: Log,
        latency: Duration,
        behavior: Behavior,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn TtsTransport>, TtsError> {
            self.log.lock().unwrap().push("connect".into());
            tokio::time::sleep(self.latency).await;
            Ok(Box::new(FakeTransport {
                log: self.log.clone(),
                inbox: VecDeque::new(),
                open: true,
                behavior: self.behavior,
            }))
        }
    }

    struct FakeSink {
        log: Log,
    }

    #[async_trait]
    impl PlaybackSink for FakeSink {
        async fn write(&mut self, pcm: &[u8]) -> Result<(), TtsError> {
            self.log.lock().unwrap().push(format!("play:{}", pcm.len()));
            Ok(())
        }

        fn is_usable(&mut self) -> bool {
            true
        }

        async fn shutdown(&mut self) {
            self.log.lock().unwrap().push("sink-shutdown".into());
        }
    }

    struct FakeSinks {
        log: Log,
    }

    #[async_trait]
    impl SinkFactory for FakeSinks {
        async fn open(&self) -> Result<Box<dyn PlaybackSink>, TtsError> {
            Ok(Box::new(FakeSink {
                log: self.log.clone(),
            }))
        }
    }

    fn player(behavior: Behavior, latency: Duration, config: PlayerConfig) -> (AudioStreamPlayer, Log) {
        let log: Log = Arc::default();
        let player = AudioStreamPlayer::spawn(
            Arc::new(FakeConnector {
                log: log.clone(),
                latency,
                behavior,
            }),
            Arc::new(FakeSinks { log: log.clone() }),
            config,
        );
        (player, log)
    }

    fn fast() -> PlayerConfig {
        PlayerConfig {
            message_timeout: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_utterances_play_in_enqueue_order_while_connecting() {
        let (player, log) = player(Behavior::Reply, Duration::from_millis(50), fast());
        assert_eq!(player.state(), PlayerState::Disconnected);
        assert!(player.enqueue("A"));
        assert!(player.enqueue("BB"));

        wait_for(&log, "send:BB").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let entries = entries(&log);
        assert_eq!(
            entries,
            vec!["connect", "send:A", "play:2", "send:BB", "play:2", "play:2"]
        );
        assert_eq!(player.state(), PlayerState::Connected);
        player.close().await;
    }

    #[tokio::test]
    async fn test_blank_text_is_ignored() {
        let (player, log) = player(Behavior::Reply, Duration::ZERO, fast());
        assert!(!player.enqueue("   "));
        assert!(player.enqueue("  hi  "));
        wait_for(&log, "send:hi").await;
        player.close().await;
    }

    #[tokio::test]
    async fn test_wait_idle_tracks_outstanding_utterances() {
        let (player, log) = player(Behavior::Reply, Duration::from_millis(20), fast());
        player.enqueue("one");
        player.enqueue("two");
        assert_eq!(player.pending(), 2);

        tokio::time::timeout(Duration::from_secs(2), player.wait_idle())
            .await
            .expect("queue should drain");
        assert_eq!(player.pending(), 0);
        assert!(entries(&log).iter().any(|e| e == "send:two"));
        player.close().await;
    }

    #[tokio::test]
    async fn test_silent_service_times_out_and_moves_on() {
        let (player, log) = player(Behavior::Silent, Duration::ZERO, fast());
        player.enqueue("one");
        player.enqueue("two");
        let started = std::time::Instant::now();
        wait_for(&log, "send:two").await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(&entries(&log)[..3], &["connect", "send:one", "send:two"]);
        player.close().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_drops() {
        let (player, log) = player(Behavior::DropAfterReply, Duration::ZERO, fast());
        player.enqueue("a");
        wait_for(&log, "send:a").await;
        player.enqueue("b");
        wait_for(&log, "send:b").await;

        let connects = entries(&log).iter().filter(|e| *e == "connect").count();
        assert_eq!(connects, 2);
        player.close().await;
    }

    #[tokio::test]
    async fn test_keepalive_on_idle_connection() {
        let config = PlayerConfig {
            message_timeout: Duration::from_millis(50),
            keepalive_interval: Duration::from_millis(30),
        };
        let (player, log) = player(Behavior::Reply, Duration::ZERO, config);
        player.connect();
        wait_for(&log, "keepalive").await;
        player.close().await;
    }

    #[tokio::test]
    async fn test_close_drops_queue_and_releases_everything() {
        let config = PlayerConfig {
            message_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
        };
        let (player, log) = player(Behavior::Silent, Duration::ZERO, config);
        player.enqueue("first");
        player.enqueue("second");
        wait_for(&log, "send:first").await;

        tokio::time::timeout(Duration::from_secs(2), player.close())
            .await
            .expect("close should not wait for the utterance timeout");
        assert_eq!(player.state(), PlayerState::Closed);
        assert_eq!(player.pending(), 0);
        assert!(!player.enqueue("third"));

        let entries = entries(&log);
        assert!(!entries.iter().any(|e| e == "send:second"));
        assert!(entries.iter().any(|e| e == "close"));
        assert!(entries.iter().any(|e| e == "sink-shutdown"));

        // Nothing runs after close.
        let len = entries.len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(self::entries(&log).len(), len);
        player.close().await;
    }
}
