use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rtk_proto::telemetry::{utc_now, Fix, FixQuality};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{GnssAdapter, GnssConfig};

const TICK: Duration = Duration::from_millis(250);

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    latest_fix: Mutex<Option<Fix>>,
    last_correction: Mutex<Option<OffsetDateTime>>,
}

/// Deterministic stand-in for the serial receiver: random-walks a fix around
/// the configured start point so the rest of the rover, and the mobile
/// client, can be exercised without hardware.
pub struct SimulatedGnssReceiver {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedGnssReceiver {
    pub fn start(cfg: &GnssConfig) -> Self {
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            "GNSS simulation enabled at {:.7}, {:.7}",
            cfg.sim_lat, cfg.sim_lng
        );
        let task = tokio::spawn(walk(cfg.clone(), shared.clone(), shutdown_rx));
        Self {
            shared,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

impl GnssAdapter for SimulatedGnssReceiver {
    fn latest_fix(&self) -> Option<Fix> {
        self.shared.latest_fix.lock().unwrap().clone()
    }

    fn inject_corrections(&self, payload: &[u8]) {
        if !payload.is_empty() {
            *self.shared.last_correction.lock().unwrap() = Some(utc_now());
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn last_correction_utc(&self) -> Option<OffsetDateTime> {
        *self.shared.last_correction.lock().unwrap()
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn walk(cfg: GnssConfig, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut lat = cfg.sim_lat;
    let mut lng = cfg.sim_lng;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(TICK) => {}
            _ = shutdown.changed() => break,
        }
        {
            let mut rng = rand::thread_rng();
            lat += rng.gen_range(-0.000002..0.000002);
            lng += rng.gen_range(-0.000002..0.000002);
        }
        let fix = Fix {
            timestamp_utc: utc_now(),
            lat,
            lng,
            quality: FixQuality::RtkFixed,
            alt_m: Some(cfg.sim_alt_m),
            accuracy_m: Some(0.02),
            hdop: Some(0.4),
            satellites: Some(18),
            correction_age_s: None,
        };
        *shared.latest_fix.lock().unwrap() = Some(fix);
    }
    shared.connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produces_fixes_and_marks_connected() {
        let mut sim = SimulatedGnssReceiver::start(&GnssConfig::default());
        assert!(sim.is_connected());
        tokio::time::sleep(Duration::from_millis(600)).await;
        let fix = sim.latest_fix().expect("fix after a few ticks");
        assert_eq!(fix.quality, FixQuality::RtkFixed);
        assert!((fix.lat - 49.3043).abs() < 0.001);
        sim.stop();
        assert!(!sim.is_connected());
    }

    #[tokio::test]
    async fn injection_stamps_last_correction() {
        let mut sim = SimulatedGnssReceiver::start(&GnssConfig::default());
        assert!(sim.last_correction_utc().is_none());
        sim.inject_corrections(b"\xd3\x00\x04data");
        assert!(sim.last_correction_utc().is_some());
        sim.inject_corrections(b"");
        sim.stop();
    }
}
