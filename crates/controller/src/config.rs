//! TOML config file loading, validation, and environment overrides.
//!
//! Every field has a default, so an empty file describes the stock wiring of
//! the greenhouse board.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::actuators::ActuatorId;
use crate::hal::{InputRole, Polarity};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub farm_id: String,
    pub store: StoreSection,
    pub pins: PinSection,
    pub relays: RelaySection,
    pub sensors: SensorSection,
    pub automation: AutomationSection,
    pub intervals: IntervalSection,
    pub web: WebSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Realtime database root, e.g. `https://example-rtdb.firebaseio.com`.
    /// Empty runs the controller local-only.
    pub url: String,
    pub credential_path: String,
    /// Attach the streaming listener in addition to polling.
    pub push: bool,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinSection {
    pub dht22: i64,
    pub soil: i64,
    pub ldr: i64,
    pub motion: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub active_low: bool,
    pub pump: i64,
    pub light: i64,
    pub fan: i64,
    pub alarm: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub soil_polarity: Polarity,
    pub ldr_polarity: Polarity,
    pub motion_polarity: Polarity,
    pub dht_min_interval_ms: u64,
    pub motion_samples: u32,
    pub motion_sample_spacing_ms: u64,
    pub motion_cooldown_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationSection {
    pub irrigation_duration_sec: u64,
    pub dark_start_hour: u8,
    pub dark_end_hour: u8,
    pub alarm_pulses: u32,
    pub alarm_on_ms: u64,
    pub alarm_off_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalSection {
    pub tick_ms: u64,
    pub sensing_ms: u64,
    pub telemetry_ms: u64,
    pub control_poll_ms: u64,
    pub error_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub enabled: bool,
    pub port: u16,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            farm_id: "farm_1".into(),
            store: StoreSection::default(),
            pins: PinSection::default(),
            relays: RelaySection::default(),
            sensors: SensorSection::default(),
            automation: AutomationSection::default(),
            intervals: IntervalSection::default(),
            web: WebSection::default(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            credential_path: "credential.token".into(),
            push: true,
            request_timeout_ms: 5000,
        }
    }
}

impl Default for PinSection {
    fn default() -> Self {
        Self {
            dht22: 4,
            soil: 17,
            ldr: 27,
            motion: 22,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            active_low: true,
            pump: 23,
            light: 24,
            fan: 25,
            alarm: 26,
        }
    }
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            soil_polarity: Polarity::ActiveHigh,
            ldr_polarity: Polarity::ActiveHigh,
            motion_polarity: Polarity::ActiveLow,
            dht_min_interval_ms: 2000,
            motion_samples: 3,
            motion_sample_spacing_ms: 20,
            motion_cooldown_ms: 5000,
        }
    }
}

impl Default for AutomationSection {
    fn default() -> Self {
        Self {
            irrigation_duration_sec: 60,
            dark_start_hour: 18,
            dark_end_hour: 6,
            alarm_pulses: 5,
            alarm_on_ms: 300,
            alarm_off_ms: 200,
        }
    }
}

impl Default for IntervalSection {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            sensing_ms: 1000,
            telemetry_ms: 1000,
            control_poll_ms: 2000,
            error_backoff_ms: 1000,
        }
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.farm_id.trim().is_empty() {
            errors.push("farm_id is empty".into());
        }
        self.validate_store(&mut errors);
        self.validate_pins(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_store(&self, errors: &mut Vec<String>) {
        let url = self.store.url.trim();
        if !url.is_empty() && !(url.starts_with("https://") || url.starts_with("http://")) {
            errors.push(format!("store.url '{url}' must start with http:// or https://"));
        }
        if !url.is_empty() && self.store.credential_path.trim().is_empty() {
            errors.push("store.credential_path is empty".into());
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let mut seen: HashMap<i64, &str> = HashMap::new();

        for (role, pin) in self.all_pins() {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{role}: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if let Some(other) = seen.insert(pin, role) {
                errors.push(format!("{role}: pin {pin} is already used by {other}"));
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let a = &self.automation;
        for (name, hour) in [
            ("automation.dark_start_hour", a.dark_start_hour),
            ("automation.dark_end_hour", a.dark_end_hour),
        ] {
            if hour > 23 {
                errors.push(format!("{name} {hour} out of range [0, 23]"));
            }
        }

        let positives = [
            ("automation.irrigation_duration_sec", a.irrigation_duration_sec),
            ("automation.alarm_on_ms", a.alarm_on_ms),
            ("automation.alarm_off_ms", a.alarm_off_ms),
            ("automation.alarm_pulses", u64::from(a.alarm_pulses)),
            ("sensors.dht_min_interval_ms", self.sensors.dht_min_interval_ms),
            ("sensors.motion_samples", u64::from(self.sensors.motion_samples)),
            ("sensors.motion_cooldown_ms", self.sensors.motion_cooldown_ms),
            ("intervals.tick_ms", self.intervals.tick_ms),
            ("intervals.sensing_ms", self.intervals.sensing_ms),
            ("intervals.telemetry_ms", self.intervals.telemetry_ms),
            ("intervals.control_poll_ms", self.intervals.control_poll_ms),
            ("intervals.error_backoff_ms", self.intervals.error_backoff_ms),
            ("store.request_timeout_ms", self.store.request_timeout_ms),
        ];
        for (name, value) in positives {
            if value == 0 {
                errors.push(format!("{name} must be positive, got 0"));
            }
        }
    }

    /// Every configured pin, labelled by role, inputs first.
    pub fn all_pins(&self) -> [(&'static str, i64); 8] {
        [
            ("pins.dht22", self.pins.dht22),
            ("pins.soil", self.pins.soil),
            ("pins.ldr", self.pins.ldr),
            ("pins.motion", self.pins.motion),
            ("relays.pump", self.relays.pump),
            ("relays.light", self.relays.light),
            ("relays.fan", self.relays.fan),
            ("relays.alarm", self.relays.alarm),
        ]
    }

    pub fn dht22_pin(&self) -> u8 {
        pin_u8(self.pins.dht22)
    }

    pub fn input_pins(&self) -> Vec<(InputRole, u8)> {
        vec![
            (InputRole::Soil, pin_u8(self.pins.soil)),
            (InputRole::Light, pin_u8(self.pins.ldr)),
            (InputRole::Motion, pin_u8(self.pins.motion)),
        ]
    }

    pub fn relay_pins(&self) -> Vec<(ActuatorId, u8)> {
        vec![
            (ActuatorId::Pump, pin_u8(self.relays.pump)),
            (ActuatorId::Light, pin_u8(self.relays.light)),
            (ActuatorId::Fan, pin_u8(self.relays.fan)),
            (ActuatorId::Alarm, pin_u8(self.relays.alarm)),
        ]
    }

    pub fn controls_path(&self) -> String {
        format!("farms/{}/controls", self.farm_id)
    }

    pub fn sensors_path(&self) -> String {
        format!("farms/{}/sensors", self.farm_id)
    }

    /// Apply `FARM_ID`, `STORE_URL`, `STORE_CREDENTIAL_PATH`,
    /// `RELAY_ACTIVE_LOW` and `WEB_PORT` from `lookup`, one at a time. An
    /// override that would make the config invalid is logged and skipped;
    /// the rest still apply.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides: [(&str, fn(&mut Config, String) -> Result<()>); 5] = [
            ("FARM_ID", |c, v| {
                c.farm_id = v;
                Ok(())
            }),
            ("STORE_URL", |c, v| {
                c.store.url = v;
                Ok(())
            }),
            ("STORE_CREDENTIAL_PATH", |c, v| {
                c.store.credential_path = v;
                Ok(())
            }),
            ("RELAY_ACTIVE_LOW", |c, v| {
                c.relays.active_low = v == "1" || v.eq_ignore_ascii_case("true");
                Ok(())
            }),
            ("WEB_PORT", |c, v| {
                c.web.port = v.parse().with_context(|| format!("'{v}' is not a port"))?;
                Ok(())
            }),
        ];

        for (key, apply) in overrides {
            let Some(value) = lookup(key) else { continue };
            let mut candidate = self.clone();
            match apply(&mut candidate, value).and_then(|()| candidate.validate()) {
                Ok(()) => *self = candidate,
                Err(e) => tracing::error!("{key} override ignored: {e:#}"),
            }
        }
    }
}

/// Validated pins are in 2..=27; anything else maps to 0 and never reaches
/// hardware because validation rejects it first.
fn pin_u8(pin: i64) -> u8 {
    u8::try_from(pin).unwrap_or(0)
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

/// Load the config, degrading to defaults instead of failing. A missing
/// file is expected on a fresh device; anything else is reported loudly.
pub fn load_or_default(path: &Path) -> Config {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Config::default();
    }
    match load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{e:#}");
            tracing::error!("continuing on default configuration");
            Config::default()
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.farm_id, "farm_1");
        assert_eq!(config.pins.dht22, 4);
        assert_eq!(config.relays.alarm, 26);
        assert!(config.relays.active_low);
        assert_eq!(config.sensors.motion_polarity, Polarity::ActiveLow);
        assert_eq!(config.automation.irrigation_duration_sec, 60);
        assert_eq!(config.intervals.control_poll_ms, 2000);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_config_keeps_other_defaults() {
        let toml_str = r#"
farm_id = "north"

[store]
url = "https://example-rtdb.firebaseio.com"
push = false

[sensors]
soil_polarity = "active_low"

[automation]
dark_start_hour = 20
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.farm_id, "north");
        assert!(!config.store.push);
        assert_eq!(config.store.request_timeout_ms, 5000);
        assert_eq!(config.sensors.soil_polarity, Polarity::ActiveLow);
        assert_eq!(config.sensors.ldr_polarity, Polarity::ActiveHigh);
        assert_eq!(config.automation.dark_start_hour, 20);
        assert_eq!(config.automation.dark_end_hour, 6);
        config.validate().unwrap();
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let config: Config = toml::from_str(include_str!("../../../config.toml")).unwrap();
        config.validate().unwrap();
        let defaults = Config::default();
        assert_eq!(config.all_pins(), defaults.all_pins());
        assert_eq!(config.store.credential_path, defaults.store.credential_path);
        assert_eq!(config.web.port, defaults.web.port);
    }

    #[test]
    fn parse_unknown_polarity_fails() {
        let toml_str = "[sensors]\nsoil_polarity = \"sideways\"\n";
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn store_paths_use_farm_id() {
        let cfg = Config {
            farm_id: "f9".into(),
            ..Config::default()
        };
        assert_eq!(cfg.controls_path(), "farms/f9/controls");
        assert_eq!(cfg.sensors_path(), "farms/f9/sensors");
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn empty_farm_id_rejected() {
        let cfg = Config {
            farm_id: "  ".into(),
            ..Config::default()
        };
        assert_validation_err(&cfg, "farm_id is empty");
    }

    #[test]
    fn store_url_scheme_checked() {
        let mut cfg = Config::default();
        cfg.store.url = "ftp://somewhere".into();
        assert_validation_err(&cfg, "must start with http");
    }

    #[test]
    fn gpio_pin_0_rejected() {
        let mut cfg = Config::default();
        cfg.pins.soil = 0;
        assert_validation_err(&cfg, "pins.soil: pin 0 is not a valid BCM GPIO pin");
    }

    #[test]
    fn gpio_pin_28_rejected() {
        let mut cfg = Config::default();
        cfg.relays.fan = 28;
        assert_validation_err(&cfg, "relays.fan: pin 28 is not a valid BCM GPIO pin");
    }

    #[test]
    fn duplicate_pin_across_roles_rejected() {
        let mut cfg = Config::default();
        cfg.relays.pump = cfg.pins.soil;
        assert_validation_err(&cfg, "relays.pump: pin 17 is already used by pins.soil");
    }

    #[test]
    fn dark_hour_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.automation.dark_end_hour = 24;
        assert_validation_err(&cfg, "automation.dark_end_hour 24 out of range");
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = Config::default();
        cfg.intervals.control_poll_ms = 0;
        assert_validation_err(&cfg, "intervals.control_poll_ms must be positive");
    }

    #[test]
    fn zero_motion_samples_rejected() {
        let mut cfg = Config::default();
        cfg.sensors.motion_samples = 0;
        assert_validation_err(&cfg, "sensors.motion_samples must be positive");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.farm_id = String::new();
        cfg.pins.ldr = 1;
        cfg.intervals.tick_ms = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("farm_id is empty"));
        assert!(msg.contains("pins.ldr"));
        assert!(msg.contains("intervals.tick_ms"));
    }

    // -- Environment overrides ----------------------------------------------

    #[test]
    fn env_overrides_applied() {
        let env: HashMap<&str, &str> = [
            ("FARM_ID", "south"),
            ("STORE_URL", "https://x.firebaseio.com"),
            ("RELAY_ACTIVE_LOW", "false"),
            ("WEB_PORT", "9090"),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.farm_id, "south");
        assert_eq!(cfg.store.url, "https://x.firebaseio.com");
        assert!(!cfg.relays.active_low);
        assert_eq!(cfg.web.port, 9090);
        assert_eq!(cfg.store.credential_path, "credential.token");
    }

    #[test]
    fn env_bad_port_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env(|k| (k == "WEB_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(cfg.web.port, 8080);
    }

    #[test]
    fn invalid_env_override_keeps_file_config() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "farm_id = \"east\"\n[web]\nport = 8181").unwrap();
        let mut cfg = load_or_default(f.path());

        let env: HashMap<&str, &str> = [
            ("FARM_ID", ""),
            ("STORE_URL", "ftp://nowhere"),
            ("RELAY_ACTIVE_LOW", "false"),
        ]
        .into_iter()
        .collect();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.farm_id, "east");
        assert_eq!(cfg.store.url, "");
        assert_eq!(cfg.web.port, 8181);
        assert!(!cfg.relays.active_low, "valid override still applied");
    }

    // -- Load ---------------------------------------------------------------

    #[test]
    fn load_or_default_missing_file() {
        let cfg = load_or_default(Path::new("/nonexistent/farm/config.toml"));
        assert_eq!(cfg.farm_id, "farm_1");
    }

    #[test]
    fn load_or_default_invalid_file_falls_back() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[pins]\nsoil = 99").unwrap();
        assert!(load(f.path()).is_err());
        let cfg = load_or_default(f.path());
        assert_eq!(cfg.pins.soil, 17);
    }

    #[test]
    fn load_valid_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "farm_id = \"east\"\n[relays]\nactive_low = false").unwrap();
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.farm_id, "east");
        assert!(!cfg.relays.active_low);
    }
}
