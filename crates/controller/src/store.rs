//! Remote control/state store.
//!
//! [`RemoteStore`] is the seam the rest of the controller talks to. The
//! production implementation is the Firebase Realtime Database REST API:
//! plain `GET`/`PUT` on `{url}/{path}.json`, plus the streaming endpoint
//! (`Accept: text/event-stream`) for push notifications.

use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Push events buffered between the stream reader and ControlSync.
const PUSH_CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("push subscriptions are not supported")]
    Unsupported,
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned HTTP {status} for {path}")]
    Status { status: u16, path: String },
    #[error("malformed store payload: {0}")]
    Decode(String),
    #[error("credential unavailable: {0}")]
    Credential(String),
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// `data` replaces the node at `path`.
    Put,
    /// Each child in `data` replaces the matching child under `path`.
    Patch,
}

/// One change notification, relative to the subscribed path.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub kind: PushKind,
    pub path: String,
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

pub trait RemoteStore: Send + Sync + 'static {
    /// Read the value at `path`; a missing node reads as `null`.
    fn get(&self, path: &str) -> impl Future<Output = Result<Value, StoreError>> + Send;

    /// Replace the value at `path`.
    fn set(&self, path: &str, value: &Value) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Subscribe to changes under `path`. Stores that cannot push return
    /// [`StoreError::Unsupported`]. The receiver closes when the feed ends.
    fn subscribe(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<PushEvent>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Firebase REST client
// ---------------------------------------------------------------------------

pub struct FirebaseStore {
    client: reqwest::Client,
    base: String,
    token: SecretString,
    timeout: Duration,
}

impl FirebaseStore {
    /// `timeout` bounds every get/set and the push stream's handshake; the
    /// stream itself is meant to stay open.
    pub fn new(base_url: &str, token: SecretString, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: base_url.trim_end_matches('/').to_string(),
            token,
            timeout,
        })
    }

    /// Read the database auth token from `path`.
    pub fn load_credential(path: &Path) -> Result<SecretString, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Credential(format!("{}: {e}", path.display())))?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(StoreError::Credential(format!("{} is empty", path.display())));
        }
        Ok(SecretString::from(token.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base, path.trim_matches('/'))
    }

    fn auth(&self) -> [(&'static str, &str); 1] {
        [("auth", self.token.expose_secret())]
    }
}

fn check_status(resp: &reqwest::Response, path: &str) -> Result<(), StoreError> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(StoreError::Status {
            status: status.as_u16(),
            path: path.to_string(),
        })
    }
}

impl RemoteStore for FirebaseStore {
    async fn get(&self, path: &str) -> Result<Value, StoreError> {
        let resp = self
            .client
            .get(self.url(path))
            .query(&self.auth())
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(&resp, path)?;
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn set(&self, path: &str, value: &Value) -> Result<(), StoreError> {
        let resp = self
            .client
            .put(self.url(path))
            .query(&self.auth())
            .query(&[("print", "silent")])
            .timeout(self.timeout)
            .json(value)
            .send()
            .await?;
        check_status(&resp, path)
    }

    async fn subscribe(&self, path: &str) -> Result<mpsc::Receiver<PushEvent>, StoreError> {
        let handshake = self
            .client
            .get(self.url(path))
            .query(&self.auth())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let resp = tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;
        check_status(&resp, path)?;

        let (tx, rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let path = path.to_string();
        let mut body = resp.bytes_stream();

        tokio::spawn(async move {
            let mut parser = SseParser::default();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(path = %path, "push stream error: {e}");
                        return;
                    }
                };
                for frame in parser.feed(&chunk) {
                    match interpret(&frame) {
                        Frame::Event(ev) => {
                            if tx.send(ev).await.is_err() {
                                return; // receiver gone
                            }
                        }
                        Frame::Ignore => {}
                        Frame::Close(reason) => {
                            warn!(path = %path, reason, "push stream closed by store");
                            return;
                        }
                    }
                }
            }
            info!(path = %path, "push stream ended");
        });

        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Chunks may split lines (and
/// UTF-8 sequences) anywhere.
#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
    current: SseFrame,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=nl).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.current.event.is_empty() || !self.current.data.is_empty() {
                    frames.push(std::mem::take(&mut self.current));
                }
                continue;
            }
            if line.starts_with(':') {
                continue; // comment
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.current.event = value.to_string(),
                "data" => {
                    if !self.current.data.is_empty() {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                }
                _ => {}
            }
        }

        frames
    }
}

#[derive(Debug, PartialEq)]
enum Frame {
    Event(PushEvent),
    Ignore,
    Close(&'static str),
}

#[derive(Deserialize)]
struct FramePayload {
    path: String,
    data: Value,
}

fn interpret(frame: &SseFrame) -> Frame {
    let kind = match frame.event.as_str() {
        "put" => PushKind::Put,
        "patch" => PushKind::Patch,
        "keep-alive" => return Frame::Ignore,
        "cancel" => return Frame::Close("cancel"),
        "auth_revoked" => return Frame::Close("auth_revoked"),
        other => {
            debug!(event = other, "unknown push event");
            return Frame::Ignore;
        }
    };
    match serde_json::from_str::<FramePayload>(&frame.data) {
        Ok(p) => Frame::Event(PushEvent {
            kind,
            path: p.path,
            data: p.data,
        }),
        Err(e) => {
            warn!("malformed push payload: {e}");
            Frame::Ignore
        }
    }
}

// ===========================================================================
// In-memory store for tests
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================
