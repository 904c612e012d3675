//! Sensor acquisition with caching and fallback. Reads here never fail and
//! never block on a misbehaving driver: the climate sensor is rate limited
//! and papered over with a perturbed last value, digital inputs are read
//! through their configured polarity, and motion is majority-voted.

use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{ms, SensorSection};
use crate::hal::{ClimateDriver, DigitalInputs, InputRole, Polarity};

/// Synthetic climate used before the first successful read.
const BASELINE: ClimateReading = ClimateReading {
    temperature: 25.0,
    humidity: 60.0,
};

/// Largest random step applied to a cached value when the driver fails.
const TEMP_JITTER: f64 = 0.5;
const HUMIDITY_JITTER: f64 = 1.0;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClimateReading {
    pub temperature: f64,
    pub humidity: f64,
}

/// Outcome of a cached read. The value is always usable; the variant says
/// where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample<T> {
    /// The driver answered just now.
    Fresh(T),
    /// Served from cache because the driver was read too recently.
    Cached(T),
    /// The driver failed or is absent; this is a synthetic stand-in.
    Degraded(T),
}

impl<T: Copy> Sample<T> {
    pub fn value(&self) -> T {
        match *self {
            Self::Fresh(v) | Self::Cached(v) | Self::Degraded(v) => v,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

/// One sensing tick's worth of readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_wet: bool,
    pub dark: bool,
    pub motion: bool,
    pub captured_at_millis: i64,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct SensorCache {
    climate: Option<Box<dyn ClimateDriver>>,
    inputs: Box<dyn DigitalInputs>,
    cfg: SensorSection,

    last_climate: Option<ClimateReading>,
    last_attempt: Option<Instant>,
    climate_failing: bool,

    failing_inputs: HashSet<InputRole>,
    last_motion: Option<Instant>,
}

impl SensorCache {
    /// `climate` is `None` when no temperature/humidity driver is available.
    pub fn new(
        climate: Option<Box<dyn ClimateDriver>>,
        inputs: Box<dyn DigitalInputs>,
        cfg: SensorSection,
    ) -> Self {
        if climate.is_none() {
            warn!("no climate driver, temperature/humidity are synthetic");
        }
        Self {
            climate,
            inputs,
            cfg,
            last_climate: None,
            last_attempt: None,
            climate_failing: false,
            failing_inputs: HashSet::new(),
            last_motion: None,
        }
    }

    // -- Climate ------------------------------------------------------------

    pub fn read_climate(&mut self) -> Sample<ClimateReading> {
        let now = Instant::now();
        let min_interval = ms(self.cfg.dht_min_interval_ms);

        if let (Some(last), Some(at)) = (self.last_climate, self.last_attempt) {
            if now.duration_since(at) < min_interval {
                return Sample::Cached(last);
            }
        }

        let Some(driver) = self.climate.as_mut() else {
            let value = *self.last_climate.get_or_insert_with(|| perturb(BASELINE));
            return Sample::Degraded(value);
        };

        self.last_attempt = Some(now);
        match driver.read_temperature_humidity() {
            Ok((t, h)) => {
                if self.climate_failing {
                    info!("climate sensor recovered");
                    self.climate_failing = false;
                }
                let value = ClimateReading {
                    temperature: round1(t),
                    humidity: round1(h),
                };
                self.last_climate = Some(value);
                Sample::Fresh(value)
            }
            Err(e) => {
                if !self.climate_failing {
                    warn!("climate sensor read failed, using fallback values: {e:#}");
                    self.climate_failing = true;
                }
                let value = perturb(self.last_climate.unwrap_or(BASELINE));
                self.last_climate = Some(value);
                Sample::Degraded(value)
            }
        }
    }

    // -- Digital inputs -----------------------------------------------------

    pub fn is_dry(&mut self) -> bool {
        self.read_condition(InputRole::Soil, self.cfg.soil_polarity)
    }

    pub fn is_dark(&mut self) -> bool {
        self.read_condition(InputRole::Light, self.cfg.ldr_polarity)
    }

    /// Majority vote over the configured number of motion samples. Strictly
    /// more than half must agree. No cooldown is applied.
    pub async fn motion_present(&mut self) -> bool {
        let n = self.cfg.motion_samples.max(1);
        let spacing = ms(self.cfg.motion_sample_spacing_ms);
        let mut positives = 0u32;

        for i in 0..n {
            if self.read_condition(InputRole::Motion, self.cfg.motion_polarity) {
                positives += 1;
            }
            if i + 1 < n && !spacing.is_zero() {
                sleep(spacing).await;
            }
        }

        positives * 2 > n
    }

    /// Motion vote gated by the cooldown window: continuous presence
    /// triggers once per window.
    pub async fn motion_detected(&mut self) -> bool {
        if !self.motion_present().await {
            return false;
        }
        let now = Instant::now();
        let cooldown = Duration::from_millis(self.cfg.motion_cooldown_ms);
        match self.last_motion {
            Some(at) if now.duration_since(at) <= cooldown => false,
            _ => {
                self.last_motion = Some(now);
                true
            }
        }
    }

    /// Read everything once. Telemetry reports the raw motion vote, not the
    /// cooldown-gated trigger.
    pub async fn snapshot(&mut self) -> SensorSnapshot {
        let sample = self.read_climate();
        if sample.is_degraded() {
            debug!("climate values in this snapshot are synthetic");
        }
        let climate = sample.value();
        let soil_wet = !self.is_dry();
        let dark = self.is_dark();
        let motion = self.motion_present().await;

        SensorSnapshot {
            temperature: climate.temperature,
            humidity: climate.humidity,
            soil_wet,
            dark,
            motion,
            captured_at_millis: now_millis(),
        }
    }

    fn read_condition(&mut self, role: InputRole, polarity: Polarity) -> bool {
        match self.inputs.read_digital(role) {
            Ok(level) => {
                if self.failing_inputs.remove(&role) {
                    info!(input = %role, "input read recovered");
                }
                polarity.is_asserted(level)
            }
            Err(e) => {
                if self.failing_inputs.insert(role) {
                    warn!(input = %role, "input read failed, treating as inactive: {e:#}");
                }
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn perturb(prev: ClimateReading) -> ClimateReading {
    let jitter = |span: f64| (fastrand::f64() * 2.0 - 1.0) * span;
    ClimateReading {
        temperature: round1(prev.temperature + jitter(TEMP_JITTER)),
        humidity: round1((prev.humidity + jitter(HUMIDITY_JITTER)).clamp(0.0, 100.0)),
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub fn now_millis() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

// ===========================================================================
// Tests
// ===========================================================================
