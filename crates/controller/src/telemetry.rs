//! Sensor telemetry to the remote store.
//!
//! The supervisor hands each fresh snapshot to a `watch` channel and moves
//! on; a separate task publishes whatever is newest. A slow or failing
//! store therefore never stalls sensing, and a backlog collapses to the
//! latest reading instead of queueing.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sensors::SensorSnapshot;
use crate::store::RemoteStore;

/// Flat record written to `farms/{farmId}/sensors`, in the shape the mobile
/// app reads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub temperature: f64,
    pub humidity: f64,
    /// 0 when dry, 100 when wet.
    pub soil_moisture: u16,
    /// 0 when dark, 1000 when lit.
    pub light_level: u16,
    pub motion_detected: bool,
    pub last_update: i64,
}

impl From<&SensorSnapshot> for TelemetryRecord {
    fn from(s: &SensorSnapshot) -> Self {
        Self {
            temperature: s.temperature,
            humidity: s.humidity,
            soil_moisture: if s.soil_wet { 100 } else { 0 },
            light_level: if s.dark { 0 } else { 1000 },
            motion_detected: s.motion,
            last_update: s.captured_at_millis,
        }
    }
}

pub struct TelemetryPublisher<S> {
    store: Option<Arc<S>>,
    path: String,
    failing: bool,
    warned_disconnected: bool,
}

impl<S: RemoteStore> TelemetryPublisher<S> {
    /// `store` is `None` in disconnected mode; publishing is then a no-op.
    pub fn new(store: Option<Arc<S>>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            failing: false,
            warned_disconnected: false,
        }
    }

    /// Write one record. Returns whether the store accepted it.
    pub async fn publish(&mut self, snapshot: &SensorSnapshot) -> bool {
        let Some(store) = self.store.as_ref() else {
            if !self.warned_disconnected {
                warn!(path = %self.path, "store disconnected, telemetry not published");
                self.warned_disconnected = true;
            }
            return false;
        };

        let record = TelemetryRecord::from(snapshot);
        let value = match serde_json::to_value(&record) {
            Ok(v) => v,
            Err(e) => {
                warn!("telemetry record not serialisable: {e}");
                return false;
            }
        };

        match store.set(&self.path, &value).await {
            Ok(()) => {
                if self.failing {
                    info!(path = %self.path, "telemetry publish recovered");
                    self.failing = false;
                }
                debug!(?record, "telemetry published");
                true
            }
            Err(e) => {
                if !self.failing {
                    warn!(path = %self.path, "telemetry publish failed: {e}");
                    self.failing = true;
                }
                false
            }
        }
    }

    /// Publish every new snapshot sent on `rx` until cancelled or the
    /// sender is dropped.
    pub fn spawn(
        mut self,
        mut rx: watch::Receiver<Option<SensorSnapshot>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = rx.changed() => if r.is_err() { break },
                }
                let latest = *rx.borrow_and_update();
                if let Some(snapshot) = latest {
                    self.publish(&snapshot).await;
                }
            }
            debug!("telemetry publisher stopped");
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
