//! Simulated farm for running the controller off-device.
//!
//! One shared world backs all three driver traits so the loop closes:
//! - Soil moisture dries at a scenario-dependent rate and re-wets while the
//!   pump relay is energised
//! - Darkness follows the local dark-hours window
//! - Motion events are rare and random, each lasting a few seconds
//! - Temperature/humidity random-walk around a set point, and the climate
//!   read fails intermittently like a real DHT22 does
//!
//! Raw levels are produced through the configured polarities, so the
//! controller's polarity handling is exercised exactly as on hardware.

use anyhow::{bail, Result};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info};

use super::{ClimateDriver, DigitalInputs, InputRole, Polarity, RelayOutputs};
use crate::actuators::ActuatorId;
use crate::config::{AutomationSection, SensorSection};
use crate::engine::in_dark_window;

/// Moisture (percent) below which the soil probe reports dry.
const DRY_THRESHOLD: f64 = 35.0;
/// Moisture gained per second of pumping.
const WET_RATE: f64 = 2.0;
const MOTION_EVENT_SECS: f64 = 3.0;
const TEMP_SET_POINT: f64 = 24.0;
const HUMIDITY_SET_POINT: f64 = 60.0;

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Soil starts moist and dries within a couple of minutes, so auto
    /// irrigation fires early. Occasional motion and climate failures.
    Drying,
    /// Soil stays wet; a quiet farm for checking manual control.
    Wet,
    /// Frequent climate read failures and frequent motion.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "wet" => Self::Wet,
            "flaky" => Self::Flaky,
            _ => Self::Drying,
        }
    }

    /// (start moisture, drying per second, motion events per second, DHT
    /// failure probability)
    fn params(self) -> (f64, f64, f64, f32) {
        match self {
            Self::Drying => (55.0, 0.25, 0.002, 0.10),
            Self::Wet => (90.0, 0.01, 0.0, 0.02),
            Self::Flaky => (50.0, 0.20, 0.02, 0.50),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Wet => write!(f, "wet"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

struct World {
    moisture: f64,
    dry_rate: f64,
    motion_rate: f64,
    dht_fail_prob: f32,

    temperature: f64,
    humidity: f64,
    motion_left: f64,
    pump_on: bool,
    last_step: Instant,

    polarity: SensorSection,
    relays_active_low: bool,
    utc_offset: UtcOffset,
    dark_start: u8,
    dark_end: u8,
}

impl World {
    /// Advance the world by `dt` seconds.
    fn step(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let delta = if self.pump_on { WET_RATE } else { -self.dry_rate };
        self.moisture = (self.moisture + delta * dt).clamp(0.0, 100.0);

        // Mean-reverting random walk; watering nudges humidity up.
        let walk = |v: f64, target: f64, sigma: f64| {
            v + 0.05 * (target - v) * dt + (fastrand::f64() * 2.0 - 1.0) * sigma * dt.sqrt()
        };
        let humid_target = HUMIDITY_SET_POINT + if self.pump_on { 10.0 } else { 0.0 };
        self.temperature = walk(self.temperature, TEMP_SET_POINT, 0.2);
        self.humidity = walk(self.humidity, humid_target, 0.5).clamp(0.0, 100.0);

        if self.motion_left > 0.0 {
            self.motion_left = (self.motion_left - dt).max(0.0);
        } else if fastrand::f64() < self.motion_rate * dt {
            debug!("sim: motion event");
            self.motion_left = MOTION_EVENT_SECS;
        }
    }

    fn catch_up(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_step).as_secs_f64();
        self.last_step = now;
        self.step(dt);
    }

    fn dark(&self) -> bool {
        let hour = OffsetDateTime::now_utc().to_offset(self.utc_offset).hour();
        in_dark_window(hour, self.dark_start, self.dark_end)
    }
}

/// Shared simulated world. Clone handles are cheap; hand one to each
/// driver.
#[derive(Clone)]
pub struct SimFarm {
    world: Arc<Mutex<World>>,
}

impl SimFarm {
    pub fn new(
        scenario: Scenario,
        sensors: &SensorSection,
        automation: &AutomationSection,
        relays_active_low: bool,
        utc_offset: UtcOffset,
    ) -> Self {
        let (moisture, dry_rate, motion_rate, dht_fail_prob) = scenario.params();
        info!(%scenario, "simulated farm");
        Self {
            world: Arc::new(Mutex::new(World {
                moisture,
                dry_rate,
                motion_rate,
                dht_fail_prob,
                temperature: TEMP_SET_POINT,
                humidity: HUMIDITY_SET_POINT,
                motion_left: 0.0,
                pump_on: false,
                last_step: Instant::now(),
                polarity: sensors.clone(),
                relays_active_low,
                utc_offset,
                dark_start: automation.dark_start_hour,
                dark_end: automation.dark_end_hour,
            })),
        }
    }

    pub fn inputs(&self) -> SimInputs {
        SimInputs(self.clone())
    }

    pub fn relays(&self) -> SimRelays {
        SimRelays(self.clone())
    }

    pub fn climate(&self) -> SimClimate {
        SimClimate(self.clone())
    }

    fn with<T>(&self, f: impl FnOnce(&mut World) -> T) -> Result<T> {
        match self.world.lock() {
            Ok(mut w) => Ok(f(&mut w)),
            Err(_) => bail!("simulated world poisoned"),
        }
    }
}

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

pub struct SimInputs(SimFarm);

impl DigitalInputs for SimInputs {
    fn read_digital(&mut self, role: InputRole) -> Result<bool> {
        self.0.with(|w| {
            w.catch_up();
            let (asserted, polarity): (bool, Polarity) = match role {
                InputRole::Soil => (w.moisture < DRY_THRESHOLD, w.polarity.soil_polarity),
                InputRole::Light => (w.dark(), w.polarity.ldr_polarity),
                InputRole::Motion => (w.motion_left > 0.0, w.polarity.motion_polarity),
            };
            polarity.level_for(asserted)
        })
    }
}

pub struct SimRelays(SimFarm);

impl RelayOutputs for SimRelays {
    fn write_digital(&mut self, id: ActuatorId, high: bool) -> Result<()> {
        self.0.with(|w| {
            w.catch_up();
            if id == ActuatorId::Pump {
                w.pump_on = high != w.relays_active_low;
            }
        })
    }
}

pub struct SimClimate(SimFarm);

impl ClimateDriver for SimClimate {
    fn read_temperature_humidity(&mut self) -> Result<(f64, f64)> {
        let (fail, t, h) = self.0.with(|w| {
            w.catch_up();
            (
                fastrand::f32() < w.dht_fail_prob,
                w.temperature,
                w.humidity,
            )
        })?;
        if fail {
            bail!("checksum mismatch (simulated)");
        }
        Ok((t, h))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn farm(scenario: Scenario) -> SimFarm {
        SimFarm::new(
            scenario,
            &SensorSection::default(),
            &AutomationSection::default(),
            true,
            UtcOffset::UTC,
        )
    }

    fn step(farm: &SimFarm, secs: f64) {
        farm.with(|w| w.step(secs)).unwrap();
    }

    fn moisture(farm: &SimFarm) -> f64 {
        farm.with(|w| w.moisture).unwrap()
    }

    #[test]
    fn drying_soil_eventually_reads_dry() {
        let farm = farm(Scenario::Drying);
        let mut inputs = farm.inputs();
        // Soil probe is active-high: LOW while moist.
        assert!(!inputs.read_digital(InputRole::Soil).unwrap());
        step(&farm, 120.0);
        assert!(inputs.read_digital(InputRole::Soil).unwrap());
    }

    #[test]
    fn pumping_rewets_soil() {
        let farm = farm(Scenario::Drying);
        step(&farm, 120.0);
        let before = moisture(&farm);

        // Relays are active-low: LOW energises the pump.
        farm.relays().write_digital(ActuatorId::Pump, false).unwrap();
        step(&farm, 10.0);
        assert!(moisture(&farm) > before);

        farm.relays().write_digital(ActuatorId::Pump, true).unwrap();
        assert!(!farm.with(|w| w.pump_on).unwrap());
    }

    #[test]
    fn other_relays_do_not_water() {
        let farm = farm(Scenario::Drying);
        farm.relays().write_digital(ActuatorId::Fan, false).unwrap();
        assert!(!farm.with(|w| w.pump_on).unwrap());
    }

    #[test]
    fn motion_reported_active_low() {
        let farm = farm(Scenario::Wet);
        let mut inputs = farm.inputs();
        assert!(inputs.read_digital(InputRole::Motion).unwrap(), "idle HIGH");
        farm.with(|w| w.motion_left = MOTION_EVENT_SECS).unwrap();
        assert!(!inputs.read_digital(InputRole::Motion).unwrap());
        step(&farm, MOTION_EVENT_SECS + 0.1);
        assert!(inputs.read_digital(InputRole::Motion).unwrap());
    }

    #[test]
    fn climate_stays_plausible() {
        let farm = farm(Scenario::Flaky);
        let mut climate = farm.climate();
        let mut ok = 0;
        let mut failed = 0;
        for _ in 0..400 {
            step(&farm, 1.0);
            match climate.read_temperature_humidity() {
                Ok((t, h)) => {
                    ok += 1;
                    assert!((10.0..40.0).contains(&t), "temperature {t}");
                    assert!((0.0..=100.0).contains(&h), "humidity {h}");
                }
                Err(_) => failed += 1,
            }
        }
        // Failure probability is 0.5; both outcomes must occur.
        assert!(ok > 0 && failed > 0, "ok={ok} failed={failed}");
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("WET"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy("flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
        assert_eq!(Scenario::Flaky.to_string(), "flaky");
    }
}
