//! Reconciliation engine: the single writer of the relay bank.
//!
//! Control changes from the store and the periodic policy checks both land
//! here, behind one lock, so a policy tick's read-then-write of a relay can
//! never interleave with an operator command.
//!
//! ## Policies
//!
//! ```text
//! Irrigation  Manual ◀──[autoMode=false]──▶ Auto
//!             Auto: soil dry && pump off ──▶ CycleRunning ──[duration]──▶ pump off
//!
//! Lighting    Manual ◀──[preset!=auto]──▶ Auto
//!             Auto: light = dark-hours || ldr dark   (every tick)
//!
//! Alarm       Idle ──[motion]──▶ Sounding ──[pulse pattern done]──▶ Idle
//!
//! Ventilation passthrough;  Emergency: everything off, modes untouched
//! ```
//!
//! Timed sequences run as their own tasks. The abort handle stored in the
//! core doubles as the single-flight flag: present means running.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::actuators::{ActuatorBank, ActuatorId};
use crate::config::{ms, AutomationSection};
use crate::control::{ControlChange, ControlCommand, ModeCommand};

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub irrigation_duration: Duration,
    pub dark_start_hour: u8,
    pub dark_end_hour: u8,
    pub alarm_pulses: u32,
    pub alarm_on: Duration,
    pub alarm_off: Duration,
}

impl From<&AutomationSection> for PolicyConfig {
    fn from(a: &AutomationSection) -> Self {
        Self {
            irrigation_duration: Duration::from_secs(a.irrigation_duration_sec),
            dark_start_hour: a.dark_start_hour,
            dark_end_hour: a.dark_end_hour,
            alarm_pulses: a.alarm_pulses,
            alarm_on: ms(a.alarm_on_ms),
            alarm_off: ms(a.alarm_off_ms),
        }
    }
}

/// Which namespaces automation currently owns. Only control changes flip
/// these; sensor logic never does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutomationMode {
    pub irrigation: bool,
    pub lighting: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub actuators: BTreeMap<ActuatorId, bool>,
    pub mode: AutomationMode,
    pub irrigation_running: bool,
    pub alarm_sounding: bool,
}

struct Core {
    bank: ActuatorBank,
    mode: AutomationMode,
    irrigation_cycle: Option<AbortHandle>,
    alarm: Option<AbortHandle>,
}

impl Core {
    fn cancel_sequences(&mut self) {
        if let Some(h) = self.irrigation_cycle.take() {
            h.abort();
            info!("engine: irrigation cycle cancelled");
        }
        if let Some(h) = self.alarm.take() {
            h.abort();
            info!("engine: alarm pattern cancelled");
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Engine {
    core: Arc<Mutex<Core>>,
    policy: Arc<PolicyConfig>,
}

impl Engine {
    /// Starts with automation disabled; the bank is already all-off.
    pub fn new(bank: ActuatorBank, policy: PolicyConfig) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core {
                bank,
                mode: AutomationMode::default(),
                irrigation_cycle: None,
                alarm: None,
            })),
            policy: Arc::new(policy),
        }
    }

    // -- Control changes ----------------------------------------------------

    /// Apply every namespace present in `change`; absent namespaces are not
    /// touched. Applying the same change twice is the same as applying it
    /// once.
    pub async fn apply(&self, change: &ControlChange) {
        let commands = change.commands();
        if commands.is_empty() {
            debug!(?change, "engine: change carries no known namespace");
            return;
        }
        let mut core = self.core.lock().await;
        for cmd in commands {
            apply_command(&mut core, cmd);
        }
    }

    // -- Policy ticks -------------------------------------------------------

    /// Start a timed irrigation cycle if auto mode is on, the soil is dry,
    /// the pump is off and no cycle is already running. Returns whether a
    /// cycle was started.
    pub async fn check_irrigation(&self, soil_dry: bool) -> bool {
        let mut core = self.core.lock().await;
        if !core.mode.irrigation || !soil_dry {
            return false;
        }
        if core.bank.get(ActuatorId::Pump) || core.irrigation_cycle.is_some() {
            return false;
        }

        info!(
            duration_sec = self.policy.irrigation_duration.as_secs(),
            "engine: soil dry, starting irrigation cycle"
        );
        core.bank.turn_on(ActuatorId::Pump);

        let shared = Arc::clone(&self.core);
        let duration = self.policy.irrigation_duration;
        let task = tokio::spawn(async move {
            sleep(duration).await;
            let mut core = shared.lock().await;
            core.bank.turn_off(ActuatorId::Pump);
            core.irrigation_cycle = None;
            info!(
                duration_sec = duration.as_secs(),
                "engine: irrigation cycle complete"
            );
        });
        core.irrigation_cycle = Some(task.abort_handle());
        true
    }

    /// In auto mode, hold the light on during dark hours or when the LDR
    /// reads dark, off otherwise. Re-evaluated every tick.
    pub async fn check_lighting(&self, dark: bool, hour: u8) {
        let mut core = self.core.lock().await;
        if !core.mode.lighting {
            return;
        }
        let want = dark
            || in_dark_window(hour, self.policy.dark_start_hour, self.policy.dark_end_hour);
        if core.bank.get(ActuatorId::Light) != want {
            info!(
                dark,
                hour,
                "engine: auto lighting turning light {}",
                if want { "ON" } else { "OFF" }
            );
            core.bank.set(ActuatorId::Light, want);
        }
    }

    /// Sound the alarm pattern for a (cooldown-gated) motion detection.
    pub async fn check_motion(&self, detected: bool) -> bool {
        if !detected {
            return false;
        }
        warn!("engine: motion detected");
        self.trigger_alarm().await
    }

    /// Start the alarm pulse pattern unless one is already sounding. A
    /// trigger while sounding is dropped, not queued.
    pub async fn trigger_alarm(&self) -> bool {
        let mut core = self.core.lock().await;
        if core.alarm.is_some() {
            debug!("engine: alarm already sounding, trigger dropped");
            return false;
        }

        let shared = Arc::clone(&self.core);
        let policy = Arc::clone(&self.policy);
        let task = tokio::spawn(async move {
            for _ in 0..policy.alarm_pulses {
                shared.lock().await.bank.turn_on(ActuatorId::Alarm);
                sleep(policy.alarm_on).await;
                shared.lock().await.bank.turn_off(ActuatorId::Alarm);
                sleep(policy.alarm_off).await;
            }
            shared.lock().await.alarm = None;
            debug!("engine: alarm pattern finished");
        });
        core.alarm = Some(task.abort_handle());
        true
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Cancel running sequences and force every relay off.
    pub async fn shutdown(&self) {
        let mut core = self.core.lock().await;
        core.cancel_sequences();
        core.bank.all_off();
    }

    pub async fn status(&self) -> EngineStatus {
        let core = self.core.lock().await;
        EngineStatus {
            actuators: core.bank.snapshot(),
            mode: core.mode,
            irrigation_running: core.irrigation_cycle.is_some(),
            alarm_sounding: core.alarm.is_some(),
        }
    }
}

fn apply_command(core: &mut Core, cmd: ControlCommand) {
    match cmd {
        ControlCommand::Irrigation(ModeCommand::Auto) => {
            if !core.mode.irrigation {
                info!("engine: auto irrigation ENABLED");
            }
            core.mode.irrigation = true;
        }
        ControlCommand::Irrigation(ModeCommand::Manual { enabled }) => {
            if core.mode.irrigation {
                info!("engine: auto irrigation DISABLED");
            }
            core.mode.irrigation = false;
            // Manual means the pump is exactly what was commanded; a running
            // cycle's off-timer would contradict that.
            if let Some(h) = core.irrigation_cycle.take() {
                h.abort();
            }
            core.bank.set(ActuatorId::Pump, enabled);
        }
        ControlCommand::Lighting(ModeCommand::Auto) => {
            if !core.mode.lighting {
                info!("engine: auto lighting ENABLED");
            }
            core.mode.lighting = true;
        }
        ControlCommand::Lighting(ModeCommand::Manual { enabled }) => {
            if core.mode.lighting {
                info!("engine: auto lighting DISABLED");
            }
            core.mode.lighting = false;
            core.bank.set(ActuatorId::Light, enabled);
        }
        ControlCommand::Ventilation { enabled } => {
            core.bank.set(ActuatorId::Fan, enabled);
        }
        ControlCommand::Emergency { stopped: true } => {
            warn!("engine: EMERGENCY STOP");
            core.cancel_sequences();
            core.bank.all_off();
        }
        ControlCommand::Emergency { stopped: false } => {}
    }
}

/// Whether `hour` falls in `[start, end)`, wrapping past midnight when
/// `start > end`. An empty window (`start == end`) never matches.
pub fn in_dark_window(hour: u8, start: u8, end: u8) -> bool {
    if start <= end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

// ===========================================================================
// Tests
// ===========================================================================
