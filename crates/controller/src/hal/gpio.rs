//! Raspberry Pi GPIO backend via rppal.

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use std::collections::HashMap;
use tracing::info;

use super::{DigitalInputs, InputRole, RelayOutputs};
use crate::actuators::ActuatorId;

pub struct GpioInputs {
    pins: HashMap<InputRole, InputPin>,
}

impl GpioInputs {
    pub fn new(gpio: &Gpio, roles: &[(InputRole, u8)]) -> Result<Self> {
        let mut pins = HashMap::new();
        for &(role, pin_num) in roles {
            let pin = gpio
                .get(pin_num)
                .with_context(|| format!("{role} input on gpio {pin_num}"))?
                .into_input();
            info!(input = %role, gpio = pin_num, "input pin ready");
            pins.insert(role, pin);
        }
        Ok(Self { pins })
    }
}

impl DigitalInputs for GpioInputs {
    fn read_digital(&mut self, role: InputRole) -> Result<bool> {
        let pin = self
            .pins
            .get(&role)
            .with_context(|| format!("no pin assigned to {role}"))?;
        Ok(pin.is_high())
    }
}

pub struct GpioRelays {
    pins: HashMap<ActuatorId, OutputPin>,
}

impl GpioRelays {
    /// Claim each relay pin already at its OFF level, so no relay clicks on
    /// between process start and the bank's first write.
    pub fn new(gpio: &Gpio, relays: &[(ActuatorId, u8)], active_low: bool) -> Result<Self> {
        let mut pins = HashMap::new();
        for &(id, pin_num) in relays {
            let pin = gpio
                .get(pin_num)
                .with_context(|| format!("{id} relay on gpio {pin_num}"))?;
            let pin = if active_low {
                pin.into_output_high() // active-low relay OFF
            } else {
                pin.into_output_low() // active-high relay OFF
            };
            info!(actuator = %id, gpio = pin_num, "relay pin ready");
            pins.insert(id, pin);
        }
        Ok(Self { pins })
    }
}

impl RelayOutputs for GpioRelays {
    fn write_digital(&mut self, id: ActuatorId, high: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(&id)
            .with_context(|| format!("no pin assigned to {id}"))?;
        if high {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }
}
