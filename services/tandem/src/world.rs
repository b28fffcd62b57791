//! HTTP client for the world simulation.
//!
//! The world hands out a session token on `/join`; every later request carries it in the
//! `X-Session` header.

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::{sync::RwLock, time::Duration};
use tandem_core::Observation;
use tracing::{debug, info, instrument, warn};

pub const SESSION_HEADER: &str = "X-Session";
pub const JOIN_ATTEMPTS: u32 = 5;
const JOIN_BASE_DELAY_MS: u64 = 500;
const JOIN_MAX_JITTER_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("World request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("World returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed world response: {0}")]
    Malformed(String),
    #[error("Missing session token; join the world first")]
    NotJoined,
    #[error("Could not join the world after {attempts} attempts: {last}")]
    JoinFailed { attempts: u32, last: String },
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinInfo {
    pub session: String,
    #[serde(default)]
    pub agent_id: Option<Value>,
}

/// What the rest of the service needs from the world.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait World: Send + Sync {
    async fn observe(&self) -> Result<Observation, WorldError>;

    /// Submits one action and returns the world's reply.
    async fn act(&self, action: Value) -> Result<Value, WorldError>;
}

pub struct WorldClient {
    http: reqwest::Client,
    base: String,
    join_name: String,
    session: RwLock<Option<String>>,
}

/// Delay before retry number `attempt` (zero based), without jitter.
pub fn join_backoff(attempt: u32) -> Duration {
    Duration::from_millis(JOIN_BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt)))
}

impl WorldClient {
    pub fn new(base: impl Into<String>, join_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            join_name: join_name.into(),
            session: RwLock::new(None),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn session(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    #[instrument(skip(self), fields(name = %self.join_name))]
    pub async fn join(&self) -> Result<JoinInfo, WorldError> {
        let response = self
            .http
            .post(self.url("/join"))
            .query(&[("name", self.join_name.as_str())])
            .header("Content-Type", "application/json")
            .send()
            .await?;
        let payload = read_json(response).await?;
        let info: JoinInfo = serde_json::from_value(payload.clone())
            .map_err(|_| WorldError::Malformed(format!("join response missing session token: {}", payload)))?;
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(info.session.clone());
        info!(agent_id = ?info.agent_id, "Joined world");
        Ok(info)
    }

    /// Joins, retrying with exponential backoff plus jitter.
    pub async fn join_with_retry(&self, attempts: u32) -> Result<JoinInfo, WorldError> {
        let attempts = attempts.max(1);
        let mut last = String::new();
        for attempt in 0..attempts {
            match self.join().await {
                Ok(info) => return Ok(info),
                Err(e) => {
                    last = e.to_string();
                    if attempt + 1 < attempts {
                        let jitter = rand::rng().random_range(0..=JOIN_MAX_JITTER_MS);
                        let delay = join_backoff(attempt) + Duration::from_millis(jitter);
                        warn!(attempt = attempt + 1, ?delay, error = %e, "Join failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(WorldError::JoinFailed { attempts, last })
    }

    fn require_session(&self) -> Result<String, WorldError> {
        self.session().ok_or(WorldError::NotJoined)
    }
}

#[async_trait]
impl World for WorldClient {
    async fn observe(&self) -> Result<Observation, WorldError> {
        let session = self.require_session()?;
        let response = self
            .http
            .get(self.url("/observe"))
            .header(SESSION_HEADER, session)
            .header("Content-Type", "application/json")
            .send()
            .await?;
        let payload = read_json(response).await?;
        serde_json::from_value(payload).map_err(|e| WorldError::Malformed(e.to_string()))
    }

    async fn act(&self, action: Value) -> Result<Value, WorldError> {
        let session = self.require_session()?;
        debug!(%action, "Sending action");
        let response = self
            .http
            .post(self.url("/input"))
            .header(SESSION_HEADER, session)
            .json(&action)
            .send()
            .await?;
        read_json(response).await
    }
}

/// Reads a JSON body. An empty body is treated as `{}`.
async fn read_json(response: reqwest::Response) -> Result<Value, WorldError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(WorldError::Status {
            status: status.as_u16(),
            body,
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(&body).map_err(|e| WorldError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

    /// Serves the given responses in order, one per connection, and reports each raw request.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let _ = tx.send(request);
                let reply = format!(
                    "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (base, rx)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let lower = line.to_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    #[test]
    fn test_join_backoff_doubles() {
        assert_eq!(join_backoff(0), Duration::from_millis(500));
        assert_eq!(join_backoff(1), Duration::from_millis(1000));
        assert_eq!(join_backoff(3), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn test_requests_before_join_are_rejected() {
        let client = WorldClient::new("http://127.0.0.1:9", "Bot");
        assert!(matches!(client.observe().await, Err(WorldError::NotJoined)));
        assert!(matches!(client.act(json!({})).await, Err(WorldError::NotJoined)));
    }

    #[tokio::test]
    async fn test_join_then_observe_sends_session_header() {
        let (base, mut requests) = serve(vec![
            (200, r#"{"session":"tok-1","agent_id":7}"#),
            (200, r#"{"tick":12,"game_status":"active","world":{"entities":[]}}"#),
        ])
        .await;
        let client = WorldClient::new(format!("{}/", base), "Tandem Bot");

        let info = client.join().await.unwrap();
        assert_eq!(info.session, "tok-1");
        assert_eq!(info.agent_id, Some(json!(7)));
        let join_request = requests.recv().await.unwrap();
        assert!(join_request.starts_with("POST /join?name=Tandem+Bot "));

        let observation = client.observe().await.unwrap();
        assert_eq!(observation.tick, 12);
        let observe_request = requests.recv().await.unwrap().to_lowercase();
        assert!(observe_request.starts_with("get /observe "));
        assert!(observe_request.contains("x-session: tok-1"));
    }

    #[tokio::test]
    async fn test_join_without_session_is_malformed() {
        let (base, _requests) = serve(vec![(200, r#"{"agent_id":1}"#)]).await;
        let client = WorldClient::new(base, "Bot");
        assert!(matches!(client.join().await, Err(WorldError::Malformed(_))));
        assert_eq!(client.session(), None);
    }

    #[tokio::test]
    async fn test_act_posts_json_and_maps_empty_body() {
        let (base, mut requests) = serve(vec![(200, r#"{"session":"s"}"#), (200, "")]).await;
        let client = WorldClient::new(base, "Bot");
        client.join().await.unwrap();
        let _ = requests.recv().await;

        let reply = client
            .act(json!({"type": "Move", "data": {"x": 1, "z": 0}}))
            .await
            .unwrap();
        assert_eq!(reply, json!({}));

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("POST /input "));
        assert!(request.ends_with(r#"{"type":"Move","data":{"x":1,"z":0}}"#));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (base, _requests) = serve(vec![(503, r#"{"error":"busy"}"#)]).await;
        let client = WorldClient::new(base, "Bot");
        match client.join().await {
            Err(WorldError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert!(body.contains("busy"));
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_with_retry_recovers() {
        let (base, _requests) =
            serve(vec![(500, "{}"), (200, r#"{"session":"second"}"#)]).await;
        let client = WorldClient::new(base, "Bot");
        let info = client.join_with_retry(JOIN_ATTEMPTS).await.unwrap();
        assert_eq!(info.session, "second");
        assert_eq!(client.session().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_join_with_retry_gives_up() {
        let (base, _requests) = serve(vec![(500, "{}")]).await;
        let client = WorldClient::new(base, "Bot");
        match client.join_with_retry(1).await {
            Err(WorldError::JoinFailed { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected join failure, got {:?}", other),
        }
    }
}
