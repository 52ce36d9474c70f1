use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use rtk_base::{BaseRuntime, BaseSettings};
use rtk_gnss::{
    CorrectionSource, CorrectionsConfig, GnssAdapter, GnssConfig, SerialCorrectionSource,
    SerialGnssReceiver, SimulatedCorrectionSource, SimulatedGnssReceiver,
};
use rtk_radio::{CorrectionRadio, RadioConfig};
use rtk_rover::{RoverRuntime, RoverSettings};
use rtk_telemetry::{TelemetryConfig, TelemetryServer};

#[derive(Debug, Parser)]
#[command(name = "rtkd", version, about = "RTK correction link daemon (base + rover)")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config/rtklink.toml")]
    config: String,

    /// Force GNSS simulation (even if a receiver is present).
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Receive corrections over LoRa, feed the receiver, broadcast telemetry.
    Rover,
    /// Forward RTCM bytes from a correction source over LoRa.
    Base,
    /// Validate the configuration and exit.
    Doctor,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Config {
    device_id: String,
    update_hz: f64,
    logging: LoggingConfig,
    gnss: GnssConfig,
    lora: RadioConfig,
    telemetry: TelemetryConfig,
    corrections: CorrectionsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            update_hz: 5.0,
            logging: LoggingConfig::default(),
            gnss: GnssConfig::default(),
            lora: RadioConfig::default(),
            telemetry: TelemetryConfig::default(),
            corrections: CorrectionsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

fn default_device_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "rtk-node".to_string())
}

/// Loads the config, falling back to defaults when the file is absent so a
/// bare unit can still boot into simulation. The note is logged once the
/// subscriber exists.
fn load_config(path: &str) -> Result<(Config, Option<String>)> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = toml::from_str(&raw).with_context(|| format!("parse config {path}"))?;
            Ok((cfg, None))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((
            Config::default(),
            Some(format!("Config file {path} not found; using defaults")),
        )),
        Err(e) => Err(e).with_context(|| format!("read config {path}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (cfg, note) = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level)),
        )
        .init();
    if let Some(note) = note {
        warn!("{note}");
    }
    info!("Effective config: {cfg:?}");

    match cli.cmd {
        Command::Rover => run_rover(cfg, cli.simulate).await,
        Command::Base => run_base(cfg).await,
        Command::Doctor => doctor(&cfg),
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    anyhow::ensure!(!cfg.device_id.trim().is_empty(), "device_id is empty");
    anyhow::ensure!(
        cfg.update_hz >= 1.0 && cfg.update_hz <= 50.0,
        "update_hz should be 1..50"
    );
    rtk_gnss::doctor::check_gnss(&cfg.gnss)?;
    rtk_gnss::doctor::check_corrections(&cfg.corrections)?;
    rtk_radio::doctor::check_radio(&cfg.lora)?;
    rtk_telemetry::doctor::check_telemetry(&cfg.telemetry)?;
    info!("doctor: OK");
    Ok(())
}

async fn run_rover(cfg: Config, force_sim: bool) -> Result<()> {
    let mut startup_warnings: Vec<String> = Vec::new();

    let gnss = build_gnss(&cfg.gnss, force_sim, &mut startup_warnings)?;

    // Radio config errors are fatal; an absent radio only downgrades to a
    // warning carried in every telemetry snapshot.
    let radio: Option<Box<dyn CorrectionRadio>> = if cfg.lora.enabled {
        let mut radio = rtk_radio::build_radio(&cfg.lora)?;
        match radio.open() {
            Ok(()) => Some(radio),
            Err(e) => {
                warn!("LoRa receiver failed to start: {e}");
                startup_warnings.push(format!("LoRa disabled: {e}"));
                None
            }
        }
    } else {
        None
    };

    let (updates_tx, updates_rx) = watch::channel(None);
    let telemetry = if cfg.telemetry.enabled {
        match TelemetryServer::start(&cfg.telemetry, updates_rx).await {
            Ok(server) => Some(server),
            Err(e) => {
                warn!("Telemetry server failed to start: {e:#}");
                startup_warnings.push(format!("Telemetry disabled: {e}"));
                None
            }
        }
    } else {
        None
    };

    let settings = RoverSettings {
        device_id: cfg.device_id.clone(),
        update_hz: cfg.update_hz,
        broadcast_hz: cfg.telemetry.broadcast_hz,
        fix_stale_s: cfg.gnss.fix_stale_s,
        correction_stale_s: cfg.lora.correction_stale_s,
    };
    let runtime = RoverRuntime::new(
        settings,
        gnss,
        radio,
        telemetry,
        updates_tx,
        startup_warnings,
    );
    runtime.run(shutdown_signal()).await
}

fn build_gnss(
    cfg: &GnssConfig,
    force_sim: bool,
    warnings: &mut Vec<String>,
) -> Result<Box<dyn GnssAdapter>> {
    if cfg.enabled && !force_sim {
        match SerialGnssReceiver::start(cfg) {
            Ok(receiver) => {
                info!("GNSS source: serial");
                return Ok(Box::new(receiver));
            }
            Err(e) => {
                if !cfg.simulate_without_hardware {
                    return Err(e);
                }
                warn!("Serial GNSS unavailable ({e}), using simulation");
                warnings.push("GNSS simulation mode".to_string());
            }
        }
    }
    info!("GNSS source: simulation");
    Ok(Box::new(SimulatedGnssReceiver::start(cfg)))
}

async fn run_base(cfg: Config) -> Result<()> {
    anyhow::ensure!(cfg.lora.enabled, "base requires lora.enabled = true");

    let mode = cfg.corrections.mode.trim().to_lowercase();
    let mut source: Box<dyn CorrectionSource> = match mode.as_str() {
        "serial" => Box::new(SerialCorrectionSource::start(&cfg.corrections)),
        "simulate" | "sim" => Box::new(SimulatedCorrectionSource::start(&cfg.corrections)),
        other => anyhow::bail!("unknown corrections.mode: {other}"),
    };
    // If serial is selected but no hardware is present, optionally fall back
    // to simulation so the link itself can still be exercised.
    if mode == "serial" && cfg.corrections.fallback_to_sim && !source.is_connected() {
        warn!("Serial correction source not available; falling back to simulation");
        source.stop();
        source = Box::new(SimulatedCorrectionSource::start(&cfg.corrections));
    }

    let mut radio = rtk_radio::build_radio(&cfg.lora)?;
    radio.open()?;

    let transport = cfg.lora.transport.trim().to_lowercase();
    let packetize = matches!(
        transport.as_str(),
        "sx126x-spi" | "sx126x_spi" | "sx126x" | "spi"
    );

    let settings = BaseSettings {
        device_id: cfg.device_id.clone(),
        packetize,
        network_id: cfg.lora.network_id,
        max_payload_bytes: cfg.lora.max_payload_bytes,
        heartbeat_enabled: cfg.lora.heartbeat_enabled,
        heartbeat_interval_s: cfg.lora.heartbeat_interval_s,
    };
    BaseRuntime::new(settings, source, radio)
        .run(shutdown_signal())
        .await
}

/// SIGINT/SIGTERM -> a watch the runtimes observe within one poll interval.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("SIGTERM handler unavailable: {e}");
                        let _ = ctrl_c.await;
                        info!("Received shutdown signal, stopping");
                        let _ = tx.send(true);
                        std::future::pending::<()>().await;
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("Received shutdown signal, stopping");
        let _ = tx.send(true);
        // Keep the sender alive so receivers see the flipped value instead
        // of a closed channel.
        std::future::pending::<()>().await;
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let (cfg, _) = load_config("/definitely/not/here.toml").unwrap();
        assert_eq!(cfg.update_hz, 5.0);
        assert!(cfg.gnss.enabled);
        assert_eq!(cfg.lora.network_id, 18);
    }

    #[test]
    fn sections_override_defaults() {
        let raw = r#"
            device_id = "ROVER-07"

            [gnss]
            simulate_without_hardware = true
            serial_port = "/dev/ttyACM1"

            [lora]
            transport = "sx126x-spi"
            frequency_mhz = 868.1

            [telemetry]
            broadcast_hz = 2.0
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.device_id, "ROVER-07");
        assert!(cfg.gnss.simulate_without_hardware);
        assert_eq!(cfg.gnss.serial_port, "/dev/ttyACM1");
        assert_eq!(cfg.lora.transport, "sx126x-spi");
        assert_eq!(cfg.lora.frequency_mhz, 868.1);
        assert_eq!(cfg.telemetry.broadcast_hz, 2.0);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.lora.sync_word, 0x3444);
        assert_eq!(cfg.corrections.mode, "serial");
    }

    #[test]
    fn doctor_flags_bad_sections() {
        let mut cfg = Config::default();
        cfg.lora.spreading_factor = 42;
        assert!(doctor(&cfg).is_err());
    }
}
