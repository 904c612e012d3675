//! Hardware boundary: the raw pin reads and writes the controller sits on.
//! The `gpio` feature gates the real rppal backend; without it, a simulated
//! farm stands in for the sensors and relay board.

use anyhow::Result;
use serde::Deserialize;
use std::fmt;

use crate::actuators::ActuatorId;

#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub mod dht22;
#[cfg(feature = "gpio")]
pub mod gpio;
#[cfg_attr(feature = "gpio", allow(dead_code))]
pub mod sim;

// ---------------------------------------------------------------------------
// Pin roles
// ---------------------------------------------------------------------------

/// Digital inputs the controller samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputRole {
    Soil,
    Light,
    Motion,
}

impl fmt::Display for InputRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soil => write!(f, "soil"),
            Self::Light => write!(f, "ldr"),
            Self::Motion => write!(f, "motion"),
        }
    }
}

/// Which physical level asserts a digital input's condition (dry, dark,
/// motion). `ActiveHigh` means HIGH asserts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Interpret a raw level (true = HIGH) as the logical condition.
    pub fn is_asserted(self, high: bool) -> bool {
        match self {
            Self::ActiveHigh => high,
            Self::ActiveLow => !high,
        }
    }

    /// Raw level a sensor with this polarity outputs for `asserted`.
    pub fn level_for(self, asserted: bool) -> bool {
        match self {
            Self::ActiveHigh => asserted,
            Self::ActiveLow => !asserted,
        }
    }
}

// ---------------------------------------------------------------------------
// Driver traits
// ---------------------------------------------------------------------------

/// Combined temperature/humidity sensor (DHT22 class). Each call may fail.
pub trait ClimateDriver: Send {
    /// Returns `(temperature_c, humidity_pct)`.
    fn read_temperature_humidity(&mut self) -> Result<(f64, f64)>;
}

/// Raw digital reads. `Ok(true)` is a HIGH level.
pub trait DigitalInputs: Send {
    fn read_digital(&mut self, role: InputRole) -> Result<bool>;
}

/// Raw relay writes. `true` drives the pin HIGH; polarity is the caller's
/// concern.
pub trait RelayOutputs: Send {
    fn write_digital(&mut self, id: ActuatorId, high: bool) -> Result<()>;
}

// ===========================================================================
// Test doubles
// ===========================================================================
