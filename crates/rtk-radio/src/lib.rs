pub mod doctor;
mod serial;
mod sim;
mod sx126x;
mod uart_hat;

pub use serial::SerialRadio;
pub use sim::SimulatedRadio;
pub use sx126x::Sx126xRadio;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use bytes::Bytes;
use rtk_proto::error::LinkError;
use rtk_proto::telemetry::utc_now;
use serde::Deserialize;
use time::OffsetDateTime;

/// Capability contract shared by every radio transport. The rover and base
/// runtimes depend only on this; which variant is live is a config choice.
///
/// `is_connected` is the raw transport state. Correction staleness is the
/// runtime's concern, derived from `last_rx_utc`, not reported here.
pub trait CorrectionRadio: Send {
    /// Starts the transport pump. Errors only on configurations that can
    /// never work; an absent or broken device is retried on a fixed cadence.
    fn open(&mut self) -> Result<(), LinkError>;

    /// Queues a payload for transmission. Fails when the link is down or the
    /// TX queue is saturated; callers treat that as a failed write.
    fn send(&self, payload: Bytes) -> Result<usize, LinkError>;

    /// Drains correction chunks received since the last poll, in arrival
    /// order. Never blocks.
    fn poll_received(&mut self) -> Vec<Bytes>;

    fn is_connected(&self) -> bool;

    fn bytes_received(&self) -> u64;

    fn bytes_sent(&self) -> u64;

    fn last_rx_utc(&self) -> Option<OffsetDateTime>;

    fn last_tx_utc(&self) -> Option<OffsetDateTime>;

    fn stop(&mut self);
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub enabled: bool,
    /// "serial" for transparent UART radios, "sx126x-spi" for the SX1262
    /// LoRa HAT driven directly over SPI, "simulate" for hardware-free runs.
    pub transport: String,

    // Transparent serial pipe.
    pub serial_port: String,
    pub baudrate: u32,
    pub receive_chunk_bytes: usize,

    /// No correction bytes inside this window marks the radio channel stale.
    pub correction_stale_s: f64,

    // RF/profile params.
    pub frequency_mhz: f64,
    pub network_id: u8,
    pub tx_power_dbm: i8,
    pub sync_word: u16,
    pub spreading_factor: u8,
    pub bandwidth_hz: u32,
    pub coding_rate: u8, // 4/x
    pub preamble_length: u16,
    pub crc_enabled: bool,
    /// Max payload bytes per LoRa packet for the correction stream
    /// (excluding the packet header).
    pub max_payload_bytes: usize,

    // Link verification heartbeat (base side). Sent even when no RTCM bytes
    // are available yet.
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_s: f64,

    // SX126x SPI wiring (BCM GPIO numbering). The IRQ line is accepted for
    // wiring parity but unused: IRQ status is polled over SPI.
    pub spi_bus_id: u8,
    pub spi_cs_id: u8,
    pub reset_pin: u8,
    pub busy_pin: u8,
    pub irq_pin: Option<u8>,
    pub txen_pin: Option<u8>,
    pub rxen_pin: Option<u8>,

    // SX1262 UART HAT pre-flight configuration. If enabled, the service
    // toggles M0/M1 and programs the module registers at startup.
    pub uart_hat_auto_config: bool,
    pub uart_hat_m0_pin: u8,
    pub uart_hat_m1_pin: u8,
    pub uart_hat_address: u16,
    pub uart_hat_air_speed: u32,
    pub uart_hat_buffer_size: u32,
    pub uart_hat_persist: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: "serial".into(),
            serial_port: "/dev/ttyS0".into(),
            baudrate: 57_600,
            receive_chunk_bytes: 512,
            correction_stale_s: 10.0,
            frequency_mhz: 913.0,
            network_id: 18,
            tx_power_dbm: 22,
            sync_word: 0x3444,
            spreading_factor: 7,
            bandwidth_hz: 125_000,
            coding_rate: 5,
            preamble_length: 12,
            crc_enabled: true,
            max_payload_bytes: 240,
            heartbeat_enabled: true,
            heartbeat_interval_s: 1.0,
            spi_bus_id: 0,
            spi_cs_id: 0,
            reset_pin: 18,
            busy_pin: 20,
            irq_pin: Some(16),
            txen_pin: Some(6),
            rxen_pin: None,
            uart_hat_auto_config: false,
            uart_hat_m0_pin: 22,
            uart_hat_m1_pin: 27,
            uart_hat_address: 0xFFFF,
            uart_hat_air_speed: 2400,
            uart_hat_buffer_size: 240,
            uart_hat_persist: true,
        }
    }
}

/// Builds the configured transport. Unknown transports are config errors and
/// therefore fatal before any loop starts.
pub fn build_radio(cfg: &RadioConfig) -> Result<Box<dyn CorrectionRadio>> {
    match cfg.transport.trim().to_lowercase().as_str() {
        "serial" => Ok(Box::new(SerialRadio::new(cfg.clone()))),
        "sx126x-spi" | "sx126x_spi" | "sx126x" | "spi" => {
            Ok(Box::new(Sx126xRadio::new(cfg.clone())))
        }
        "simulate" | "sim" => Ok(Box::new(SimulatedRadio::new())),
        other => anyhow::bail!("unknown lora.transport: {other}"),
    }
}

/// Counters and link state shared between a radio's pump task and its
/// non-blocking adapter surface.
#[derive(Default)]
pub(crate) struct RadioShared {
    connected: AtomicBool,
    bytes_rx: AtomicU64,
    bytes_tx: AtomicU64,
    heartbeats_rx: AtomicU64,
    last_rx: Mutex<Option<OffsetDateTime>>,
    last_tx: Mutex<Option<OffsetDateTime>>,
    last_station: Mutex<Option<String>>,
}

impl RadioShared {
    pub(crate) fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_rx(&self, len: usize) -> u64 {
        *self.last_rx.lock().unwrap() = Some(utc_now());
        self.bytes_rx.fetch_add(len as u64, Ordering::SeqCst) + len as u64
    }

    pub(crate) fn mark_tx(&self, len: usize) -> u64 {
        *self.last_tx.lock().unwrap() = Some(utc_now());
        self.bytes_tx.fetch_add(len as u64, Ordering::SeqCst) + len as u64
    }

    /// Heartbeat receipt refreshes link recency even though no correction
    /// bytes flowed: receipt itself verifies the RF path.
    pub(crate) fn mark_heartbeat(&self, station_id: Option<String>) -> u64 {
        *self.last_rx.lock().unwrap() = Some(utc_now());
        if let Some(station) = station_id {
            *self.last_station.lock().unwrap() = Some(station);
        }
        self.heartbeats_rx.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn last_station(&self) -> Option<String> {
        self.last_station.lock().unwrap().clone()
    }

    pub(crate) fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::SeqCst)
    }

    pub(crate) fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::SeqCst)
    }

    pub(crate) fn last_rx(&self) -> Option<OffsetDateTime> {
        *self.last_rx.lock().unwrap()
    }

    pub(crate) fn last_tx(&self) -> Option<OffsetDateTime> {
        *self.last_tx.lock().unwrap()
    }
}

/// Rate limiter for progress logging so byte counters do not spam the
/// journal at line rate.
#[derive(Debug)]
pub(crate) struct LogThrottle {
    every: std::time::Duration,
    next_at: Option<std::time::Instant>,
}

impl LogThrottle {
    pub(crate) fn new(every: std::time::Duration) -> Self {
        Self {
            every,
            next_at: None,
        }
    }

    pub(crate) fn ready(&mut self) -> bool {
        let now = std::time::Instant::now();
        match self.next_at {
            Some(at) if now < at => false,
            _ => {
                self.next_at = Some(now + self.every);
                true
            }
        }
    }
}
