//! Relay bank: named on/off switches with the last commanded state kept in
//! memory. Relay boards differ in which level energises a channel, so every
//! write goes through the configured polarity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::hal::RelayOutputs;

// ---------------------------------------------------------------------------
// Actuator identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorId {
    Pump,
    Light,
    Fan,
    Alarm,
}

impl ActuatorId {
    pub const ALL: [ActuatorId; 4] = [Self::Pump, Self::Light, Self::Fan, Self::Alarm];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pump => "pump",
            Self::Light => "light",
            Self::Fan => "fan",
            Self::Alarm => "alarm",
        }
    }
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Bank
// ---------------------------------------------------------------------------

pub struct ActuatorBank {
    outputs: Box<dyn RelayOutputs>,
    active_low: bool, // many relay boards are active-low
    state: BTreeMap<ActuatorId, bool>,
}

impl ActuatorBank {
    /// Register `ids` and drive each one to OFF.
    pub fn new(outputs: Box<dyn RelayOutputs>, ids: &[ActuatorId], active_low: bool) -> Self {
        let mut bank = Self {
            outputs,
            active_low,
            state: ids.iter().map(|&id| (id, false)).collect(),
        };
        for &id in ids {
            bank.write(id, false);
        }
        info!(relays = ids.len(), active_low, "relay bank initialised");
        bank
    }

    /// Command `id` on or off. Returns false if `id` has no relay.
    pub fn set(&mut self, id: ActuatorId, on: bool) -> bool {
        let Some(current) = self.state.get(&id).copied() else {
            warn!(actuator = %id, "no relay registered");
            return false;
        };
        self.write(id, on);
        self.state.insert(id, on);
        if current != on {
            info!(actuator = %id, "turned {}", if on { "ON" } else { "OFF" });
        } else {
            debug!(actuator = %id, on, "unchanged");
        }
        true
    }

    pub fn turn_on(&mut self, id: ActuatorId) -> bool {
        self.set(id, true)
    }

    pub fn turn_off(&mut self, id: ActuatorId) -> bool {
        self.set(id, false)
    }

    /// Last commanded state; unknown relays read as off.
    pub fn get(&self, id: ActuatorId) -> bool {
        self.state.get(&id).copied().unwrap_or(false)
    }

    /// Force every relay off. Each write is attempted regardless of how the
    /// previous one went.
    pub fn all_off(&mut self) {
        warn!("all relays OFF");
        let ids: Vec<ActuatorId> = self.state.keys().copied().collect();
        for id in ids {
            self.set(id, false);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<ActuatorId, bool> {
        self.state.clone()
    }

    fn write(&mut self, id: ActuatorId, on: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        let level = on != self.active_low;
        if let Err(e) = self.outputs.write_digital(id, level) {
            error!(actuator = %id, "relay write failed: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
