//! Base station runtime: the mirror of the rover's radio-write half.
//!
//! Pumps raw RTCM bytes from a correction source to the radio on a fixed
//! cadence, packetizing when the radio is packet-based, and keeps a small
//! heartbeat flowing so the rover can verify the link before corrections do.
//! Failure handling mirrors the rover: per-channel retry, never fatal.

use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use rtk_gnss::CorrectionSource;
use rtk_proto::frame::HeartbeatFrame;
use rtk_proto::packet::{build_packet, encode_station_id, PacketType};
use rtk_radio::CorrectionRadio;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

const IDLE_SLEEP: Duration = Duration::from_millis(20);
const STATUS_LOG_EVERY: Duration = Duration::from_secs(5);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);
const MIN_PACKET_CHUNK: usize = 16;

/// Link-health summary for the base service. Log-only; the base has no
/// telemetry consumer of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseState {
    pub device_id: String,
    pub corrections_connected: bool,
    pub lora_connected: bool,
    pub lora_bytes_tx: u64,
    pub last_tx_utc: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl BaseState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            corrections_connected: false,
            lora_connected: false,
            lora_bytes_tx: 0,
            last_tx_utc: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaseSettings {
    pub device_id: String,
    /// True when the radio transports discrete packets and the correction
    /// stream must be sliced into the packet envelope.
    pub packetize: bool,
    pub network_id: u8,
    pub max_payload_bytes: usize,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_s: f64,
}

pub struct BaseRuntime {
    settings: BaseSettings,
    source: Box<dyn CorrectionSource>,
    radio: Box<dyn CorrectionRadio>,
    state: BaseState,
    packet_seq: u16,
    heartbeat_seq: u16,
    next_heartbeat: Option<Instant>,
    next_status_log: Option<Instant>,
}

impl BaseRuntime {
    pub fn new(
        settings: BaseSettings,
        source: Box<dyn CorrectionSource>,
        radio: Box<dyn CorrectionRadio>,
    ) -> Self {
        let state = BaseState::new(settings.device_id.as_str());
        Self {
            settings,
            source,
            radio,
            state,
            packet_seq: 0,
            heartbeat_seq: 0,
            next_heartbeat: None,
            next_status_log: None,
        }
    }

    pub fn state(&self) -> &BaseState {
        &self.state
    }

    /// Runs until the shutdown signal flips, then releases both transports.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Base runtime started as {}", self.settings.device_id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let forwarded = self.step(Instant::now());
            if !forwarded {
                // Nothing flowing; avoid busy-looping against the simulator.
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        self.stop_components();
        Ok(())
    }

    /// One pass: forward a chunk if one is available, keep the heartbeat
    /// cadence, refresh the status summary. Returns whether correction
    /// bytes moved.
    fn step(&mut self, now: Instant) -> bool {
        let payload = self.source.read_chunk();
        let forwarded = !payload.is_empty();
        if forwarded {
            self.forward(payload);
        }

        let heartbeat_due = self
            .settings
            .heartbeat_enabled
            .then(|| self.next_heartbeat.map(|at| now >= at).unwrap_or(true))
            .unwrap_or(false);
        if heartbeat_due {
            self.send_heartbeat();
            let every = Duration::from_secs_f64(self.settings.heartbeat_interval_s.max(0.0))
                .max(MIN_HEARTBEAT_INTERVAL);
            self.next_heartbeat = Some(now + every);
        }

        self.state.corrections_connected = self.source.is_connected();
        self.state.lora_connected = self.radio.is_connected();
        self.state.lora_bytes_tx = self.radio.bytes_sent();
        self.state.last_tx_utc = self.radio.last_tx_utc();

        let log_due = self.next_status_log.map(|at| now >= at).unwrap_or(true);
        if log_due {
            self.next_status_log = Some(now + STATUS_LOG_EVERY);
            info!(
                "Status: corr={} lora={} bytes_tx={} last_tx={}",
                if self.state.corrections_connected { "OK" } else { "NO" },
                if self.state.lora_connected { "OK" } else { "NO" },
                self.state.lora_bytes_tx,
                self.state
                    .last_tx_utc
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "n/a".into()),
            );
        }

        forwarded
    }

    fn forward(&mut self, payload: Bytes) {
        if self.settings.packetize {
            let max_chunk = self.settings.max_payload_bytes.max(MIN_PACKET_CHUNK);
            for chunk in payload.chunks(max_chunk) {
                self.packet_seq = self.packet_seq.wrapping_add(1);
                let packet = build_packet(
                    PacketType::Corrections,
                    self.settings.network_id,
                    self.packet_seq,
                    chunk,
                );
                if let Err(e) = self.radio.send(packet) {
                    warn!("LoRa write failed: {e}");
                    self.state.last_error = Some("LoRa write failed".to_string());
                    break;
                }
            }
        } else if let Err(e) = self.radio.send(payload) {
            warn!("LoRa write failed: {e}");
            self.state.last_error = Some("LoRa write failed".to_string());
        }
    }

    // Sent even when no RTCM bytes are flowing yet, so the rover can verify
    // the radio path on its own.
    fn send_heartbeat(&mut self) {
        self.heartbeat_seq = self.heartbeat_seq.wrapping_add(1);
        let heartbeat = if self.settings.packetize {
            build_packet(
                PacketType::Heartbeat,
                self.settings.network_id,
                self.heartbeat_seq,
                &encode_station_id(&self.settings.device_id),
            )
        } else {
            HeartbeatFrame::new(&self.settings.device_id, self.heartbeat_seq).encode()
        };
        if let Err(e) = self.radio.send(heartbeat) {
            warn!("LoRa heartbeat send failed: {e}");
        }
    }

    fn stop_components(&mut self) {
        info!("Base runtime stopping");
        self.source.stop();
        self.radio.stop();
    }
}
