mod actuators;
mod config;
mod control;
mod engine;
mod hal;
mod sensors;
mod store;
mod supervisor;
mod sync;
mod telemetry;
mod web;

use anyhow::{Context, Result};
use std::{env, path::Path, sync::Arc, time::Instant};
use time::UtcOffset;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuators::{ActuatorBank, ActuatorId};
use config::{ms, Config};
use engine::{Engine, PolicyConfig};
use hal::{ClimateDriver, DigitalInputs, RelayOutputs};
use sensors::SensorCache;
use store::FirebaseStore;
use supervisor::{local_hour_source, Supervisor};
use sync::ControlSync;
use telemetry::TelemetryPublisher;
use web::WebState;

type Hardware = (
    Option<Box<dyn ClimateDriver>>,
    Box<dyn DigitalInputs>,
    Box<dyn RelayOutputs>,
);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The local offset can only be read soundly while the process is still
    // single-threaded, so resolve it before the runtime starts.
    let utc_offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
        warn!("local UTC offset unavailable ({e}), dark hours use UTC");
        UtcOffset::UTC
    });

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(run(utc_offset))
}

async fn run(utc_offset: UtcOffset) -> Result<()> {
    let started_at = Instant::now();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load_or_default(Path::new(&config_path));
    cfg.apply_env(|key| env::var(key).ok());
    info!(farm_id = %cfg.farm_id, "farm controller starting");

    // ── Hardware ────────────────────────────────────────────────────
    let (climate, inputs, relays) = hardware(&cfg, utc_offset)?;

    // Fail-safe: the bank drives every relay OFF as it registers it.
    let bank = ActuatorBank::new(relays, &ActuatorId::ALL, cfg.relays.active_low);
    let engine = Engine::new(bank, PolicyConfig::from(&cfg.automation));
    let sensors = SensorCache::new(climate, inputs, cfg.sensors.clone());

    // ── Remote store ────────────────────────────────────────────────
    let store = connect_store(&cfg);
    let cancel = CancellationToken::new();
    let (snapshot_tx, snapshot_rx) = watch::channel(None);

    match &store {
        Some(store) => {
            ControlSync::new(
                Arc::clone(store),
                cfg.controls_path(),
                ms(cfg.intervals.control_poll_ms),
                cfg.store.push,
            )
            .start(engine.clone(), cancel.clone());
        }
        None => warn!("control sync disabled, local automation only"),
    }
    TelemetryPublisher::new(store.clone(), cfg.sensors_path())
        .spawn(snapshot_rx.clone(), cancel.clone());

    // ── Web server ──────────────────────────────────────────────────
    if cfg.web.enabled {
        let state = WebState {
            farm_id: cfg.farm_id.clone(),
            started_at,
            store_connected: store.is_some(),
            engine: engine.clone(),
            sensors: snapshot_rx,
        };
        let port = cfg.web.port;
        let web_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(state, port, web_cancel).await {
                error!("{e:#}");
            }
        });
    }

    // ── Signals ─────────────────────────────────────────────────────
    tokio::spawn(shutdown_signal(cancel.clone()));

    // ── Driver loop ─────────────────────────────────────────────────
    Supervisor::new(
        sensors,
        engine.clone(),
        snapshot_tx,
        local_hour_source(utc_offset),
        &cfg.intervals,
    )
    .run(cancel.clone())
    .await;

    engine.shutdown().await;
    info!("farm controller stopped");
    Ok(())
}

/// Build the store client, or `None` to run disconnected.
fn connect_store(cfg: &Config) -> Option<Arc<FirebaseStore>> {
    if cfg.store.url.trim().is_empty() {
        warn!("no store.url configured, running disconnected");
        return None;
    }
    let token = match FirebaseStore::load_credential(Path::new(&cfg.store.credential_path)) {
        Ok(token) => token,
        Err(e) => {
            error!("{e}");
            warn!("running disconnected: telemetry and remote control unavailable");
            return None;
        }
    };
    match FirebaseStore::new(&cfg.store.url, token, ms(cfg.store.request_timeout_ms)) {
        Ok(store) => {
            info!(url = %cfg.store.url, "store client ready");
            Some(Arc::new(store))
        }
        Err(e) => {
            error!("store client: {e}");
            warn!("running disconnected: telemetry and remote control unavailable");
            None
        }
    }
}

#[cfg(feature = "gpio")]
fn hardware(cfg: &Config, _utc_offset: UtcOffset) -> Result<Hardware> {
    use hal::dht22::Dht22;
    use hal::gpio::{GpioInputs, GpioRelays};

    let gpio = rppal::gpio::Gpio::new().context("failed to open GPIO")?;
    let relays = GpioRelays::new(&gpio, &cfg.relay_pins(), cfg.relays.active_low)?;
    let inputs = GpioInputs::new(&gpio, &cfg.input_pins())?;
    let climate: Option<Box<dyn ClimateDriver>> = match Dht22::new(cfg.dht22_pin()) {
        Ok(dht) => Some(Box::new(dht)),
        Err(e) => {
            warn!("DHT22 unavailable: {e:#}");
            None
        }
    };
    let inputs: Box<dyn DigitalInputs> = Box::new(inputs);
    let relays: Box<dyn RelayOutputs> = Box::new(relays);
    Ok((climate, inputs, relays))
}

#[cfg(not(feature = "gpio"))]
fn hardware(cfg: &Config, utc_offset: UtcOffset) -> Result<Hardware> {
    use hal::sim::{Scenario, SimFarm};

    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let farm = SimFarm::new(
        scenario,
        &cfg.sensors,
        &cfg.automation,
        cfg.relays.active_low,
        utc_offset,
    );
    let climate: Box<dyn ClimateDriver> = Box::new(farm.climate());
    let inputs: Box<dyn DigitalInputs> = Box::new(farm.inputs());
    let relays: Box<dyn RelayOutputs> = Box::new(farm.relays());
    Ok((Some(climate), inputs, relays))
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    cancel.cancel();
}
