pub mod doctor;
pub mod nmea;
mod ports;
mod raw;
mod receiver;
mod sim;

pub use raw::{CorrectionSource, SerialCorrectionSource, SimulatedCorrectionSource};
pub use receiver::SerialGnssReceiver;
pub use sim::SimulatedGnssReceiver;

use rtk_proto::telemetry::Fix;
use serde::Deserialize;
use time::OffsetDateTime;

/// Capability contract the rover runtime depends on. The loop never learns
/// whether a serial receiver or the simulator backs it.
pub trait GnssAdapter: Send {
    /// Last parsed fix, immediately; never blocks.
    fn latest_fix(&self) -> Option<Fix>;

    /// Forwards RTCM bytes to the receiver in arrival order. Transient write
    /// failures are logged, never raised: correction injection must not
    /// stall the control loop.
    fn inject_corrections(&self, payload: &[u8]);

    fn is_connected(&self) -> bool;

    fn last_correction_utc(&self) -> Option<OffsetDateTime>;

    fn stop(&mut self);
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GnssConfig {
    pub enabled: bool,
    pub simulate_without_hardware: bool,
    pub serial_port: String,
    pub baudrate: u32,
    /// No new fix inside this window marks the GNSS channel stale.
    pub fix_stale_s: f64,
    // Default simulated position: Stanley Park, Vancouver, BC.
    pub sim_lat: f64,
    pub sim_lng: f64,
    pub sim_alt_m: f64,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            simulate_without_hardware: false,
            serial_port: "/dev/ttyACM0".into(),
            baudrate: 115_200,
            fix_stale_s: 5.0,
            sim_lat: 49.3043,
            sim_lng: -123.1443,
            sim_alt_m: 20.0,
        }
    }
}

/// Correction-source settings for the base station's forwarding path.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrectionsConfig {
    /// "serial" to forward RTCM bytes from a GNSS receiver, "simulate" for
    /// link testing without hardware.
    pub mode: String,
    pub serial_port: String,
    pub baudrate: u32,
    pub read_chunk_bytes: usize,
    pub fallback_to_sim: bool,
    pub simulate_interval_s: f64,
    pub simulate_chunk_bytes: usize,
    pub simulate_prefix: String,
}

impl Default for CorrectionsConfig {
    fn default() -> Self {
        Self {
            mode: "serial".into(),
            serial_port: "/dev/ttyACM0".into(),
            baudrate: 115_200,
            read_chunk_bytes: 1024,
            fallback_to_sim: false,
            simulate_interval_s: 0.25,
            simulate_chunk_bytes: 80,
            simulate_prefix: "RTCMTEST".into(),
        }
    }
}

/// Rate limiter for probe/progress logging so a flapping port does not spam
/// the journal.
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
