//! ControlSync: merges the store's push feed and a fixed-interval poll of
//! the same control tree into one queue of [`ControlChange`]s, drained by a
//! single task into the engine.
//!
//! Polling is the only guaranteed producer and dedupes against the last
//! document it fetched. Push is best-effort and forwarded as received; the
//! engine is idempotent, so a change arriving from both feeds costs only a
//! redundant apply.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{path_segments, ControlChange, ControlDocument};
use crate::engine::Engine;
use crate::store::{PushEvent, PushKind, RemoteStore, StoreError};

const QUEUE_CAPACITY: usize = 64;

pub struct ControlSync<S> {
    store: Arc<S>,
    path: String,
    poll_interval: Duration,
    push: bool,
}

impl<S: RemoteStore> ControlSync<S> {
    pub fn new(store: Arc<S>, path: impl Into<String>, poll_interval: Duration, push: bool) -> Self {
        Self {
            store,
            path: path.into(),
            poll_interval,
            push,
        }
    }

    /// Start the feeds and the consumer that applies their changes to
    /// `engine`. All three stop when `cancel` fires.
    pub fn start(self, engine: Engine, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        self.spawn_feeds(tx, cancel.clone());
        tokio::spawn(consume(rx, engine, cancel))
    }

    fn spawn_feeds(self, tx: mpsc::Sender<ControlChange>, cancel: CancellationToken) {
        info!(
            path = %self.path,
            poll_ms = self.poll_interval.as_millis() as u64,
            push = self.push,
            "control sync starting"
        );
        if self.push {
            tokio::spawn(push_feed(
                Arc::clone(&self.store),
                self.path.clone(),
                tx.clone(),
                cancel.clone(),
            ));
        }
        tokio::spawn(poll_feed(self.store, self.path, self.poll_interval, tx, cancel));
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

async fn consume(
    mut rx: mpsc::Receiver<ControlChange>,
    engine: Engine,
    cancel: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = rx.recv() => change,
        };
        let Some(change) = change else { break };
        debug!(?change, "control sync: applying change");
        engine.apply(&change).await;
    }
    debug!("control sync consumer stopped");
}

// ---------------------------------------------------------------------------
// Poll feed
// ---------------------------------------------------------------------------

async fn poll_feed<S: RemoteStore>(
    store: Arc<S>,
    path: String,
    interval: Duration,
    tx: mpsc::Sender<ControlChange>,
    cancel: CancellationToken,
) {
    // A null cursor means an empty or missing tree is never delivered.
    let mut cursor = Value::Null;
    let mut failing = false;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return,
            r = store.get(&path) => r,
        };
        let doc = match fetched {
            Ok(doc) => {
                if failing {
                    info!(path = %path, "control poll recovered");
                    failing = false;
                }
                doc
            }
            Err(e) => {
                if !failing {
                    warn!(path = %path, "control poll failed: {e}");
                    failing = true;
                }
                continue;
            }
        };

        let changed = doc != cursor;
        cursor = doc;
        if changed {
            debug!(path = %path, "control document changed");
            let change = ControlChange::Snapshot(ControlDocument::new(cursor.clone()));
            if tx.send(change).await.is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Push feed
// ---------------------------------------------------------------------------

/// What a push event turns into before it reaches the queue.
#[derive(Debug, PartialEq)]
enum Resolution {
    Deliver(ControlChange),
    /// Re-read one top-level key and deliver it as a partial change.
    FetchKey(String),
    Ignore,
}

fn resolve(ev: &PushEvent) -> Resolution {
    match (ev.kind, path_segments(&ev.path).as_slice()) {
        (_, []) => {
            if ev.data.is_object() {
                Resolution::Deliver(ControlChange::Snapshot(ControlDocument::new(
                    ev.data.clone(),
                )))
            } else {
                Resolution::Ignore
            }
        }
        (PushKind::Put, [key]) => Resolution::Deliver(ControlChange::Key {
            key: key.to_string(),
            value: ev.data.clone(),
        }),
        // Only the parent key is re-read; nested paths are not resolved.
        (_, [key, ..]) => Resolution::FetchKey(key.to_string()),
    }
}

/// First resubscribe delay; doubles per failed attempt up to
/// `PUSH_RETRY_MAX`, with +-25% jitter.
const PUSH_RETRY_INITIAL: Duration = Duration::from_secs(1);
const PUSH_RETRY_MAX: Duration = Duration::from_secs(30);

fn push_backoff(attempt: u32) -> Duration {
    let base = PUSH_RETRY_INITIAL
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(PUSH_RETRY_MAX);
    base.mul_f64(0.75 + fastrand::f64() * 0.5)
}

/// Subscribe, forward until the stream ends, then resubscribe. Stores that
/// cannot push stop the feed for good; polling carries on either way.
async fn push_feed<S: RemoteStore>(
    store: Arc<S>,
    path: String,
    tx: mpsc::Sender<ControlChange>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return,
            r = store.subscribe(&path) => r,
        };
        match subscribed {
            Ok(events) => {
                info!(path = %path, "push feed subscribed");
                attempt = 0;
                if !forward_push(&*store, &path, events, &tx, &cancel).await {
                    return;
                }
                warn!(path = %path, "push feed ended, resubscribing");
            }
            Err(StoreError::Unsupported) => {
                info!(path = %path, "push feed unsupported, relying on polling");
                return;
            }
            Err(e) => {
                warn!(path = %path, attempt, "push subscription failed, polling continues: {e}");
            }
        }

        let delay = push_backoff(attempt);
        debug!(delay_ms = delay.as_millis() as u64, attempt, "waiting before resubscribe");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
    }
}

/// Forward one subscription's events. Returns `false` when the feed should
/// stop (cancelled or queue closed), `true` when the stream ended.
async fn forward_push<S: RemoteStore>(
    store: &S,
    path: &str,
    mut events: mpsc::Receiver<PushEvent>,
    tx: &mpsc::Sender<ControlChange>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => return false,
            ev = events.recv() => ev,
        };
        let Some(ev) = ev else { return true };

        let change = match resolve(&ev) {
            Resolution::Deliver(change) => change,
            Resolution::Ignore => {
                debug!(?ev, "push event ignored");
                continue;
            }
            Resolution::FetchKey(key) => {
                let key_path = format!("{path}/{key}");
                match store.get(&key_path).await {
                    Ok(value) => ControlChange::Key { key, value },
                    Err(e) => {
                        warn!(path = %key_path, "point read after push failed: {e}");
                        continue;
                    }
                }
            }
        };
        if tx.send(change).await.is_err() {
            return false;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
