//! Driver loop. Every tick evaluates the automation policies; sensing and
//! telemetry run when their own intervals have elapsed, measured from the
//! last time each actually ran.

use anyhow::{anyhow, Result};
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::watch;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ms, IntervalSection};
use crate::engine::Engine;
use crate::sensors::{SensorCache, SensorSnapshot};

/// Current wall-clock hour (0..=23) for the lighting policy.
pub type HourSource = Box<dyn FnMut() -> Result<u8> + Send>;

/// Hour in the zone given by `offset`, resolved once at startup.
pub fn local_hour_source(offset: UtcOffset) -> HourSource {
    Box::new(move || {
        OffsetDateTime::now_utc()
            .checked_to_offset(offset)
            .map(|t| t.hour())
            .ok_or_else(|| anyhow!("local time out of range for offset {offset}"))
    })
}

pub struct Supervisor {
    sensors: SensorCache,
    engine: Engine,
    telemetry: watch::Sender<Option<SensorSnapshot>>,
    hour: HourSource,

    tick_every: Duration,
    sensing_every: Duration,
    telemetry_every: Duration,
    backoff: Duration,

    last_sensing: Option<Instant>,
    last_telemetry: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        sensors: SensorCache,
        engine: Engine,
        telemetry: watch::Sender<Option<SensorSnapshot>>,
        hour: HourSource,
        intervals: &IntervalSection,
    ) -> Self {
        Self {
            sensors,
            engine,
            telemetry,
            hour,
            tick_every: ms(intervals.tick_ms),
            sensing_every: ms(intervals.sensing_ms),
            telemetry_every: ms(intervals.telemetry_ms),
            backoff: ms(intervals.error_backoff_ms),
            last_sensing: None,
            last_telemetry: None,
        }
    }

    /// Run until `cancel` fires. A failed tick is logged and followed by a
    /// backoff; nothing else ends the loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            tick_ms = self.tick_every.as_millis() as u64,
            sensing_ms = self.sensing_every.as_millis() as u64,
            telemetry_ms = self.telemetry_every.as_millis() as u64,
            "supervisor running"
        );
        let mut ticker = tokio::time::interval(self.tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                error!("supervisor tick failed: {e:#}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(self.backoff) => {}
                }
                ticker.reset();
            }
        }
        info!("supervisor stopped");
    }

    async fn tick(&mut self) -> Result<()> {
        let now = Instant::now();

        let mut fresh = None;
        if due(self.last_sensing, now, self.sensing_every) {
            self.last_sensing = Some(now);
            fresh = Some(self.sensors.snapshot().await);
        }
        if let Some(snapshot) = fresh {
            if due(self.last_telemetry, now, self.telemetry_every) {
                self.last_telemetry = Some(now);
                debug!(?snapshot, "handing snapshot to telemetry");
                self.telemetry.send_replace(Some(snapshot));
            }
        }

        let dry = self.sensors.is_dry();
        self.engine.check_irrigation(dry).await;

        let dark = self.sensors.is_dark();
        let hour = (self.hour)()?;
        self.engine.check_lighting(dark, hour).await;

        let motion = self.sensors.motion_detected().await;
        self.engine.check_motion(motion).await;

        Ok(())
    }
}

fn due(last: Option<Instant>, now: Instant, every: Duration) -> bool {
    last.map_or(true, |at| now.duration_since(at) >= every)
}

// ===========================================================================
// Tests
// ===========================================================================
