//! Raw correction sources for the base station: the receiver-facing half of
//! the RTCM forwarding path. No sentence parsing here, the byte stream is
//! opaque and forwarded as-is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

use rtk_proto::telemetry::utc_now;

use crate::{ports, CorrectionsConfig, LogThrottle};

const REOPEN_DELAY: Duration = Duration::from_secs(1);
const READ_FAIL_DELAY: Duration = Duration::from_millis(500);

pub trait CorrectionSource: Send {
    /// Next available chunk of raw RTCM bytes; empty when idle. Never blocks.
    fn read_chunk(&mut self) -> Bytes;

    fn is_connected(&self) -> bool;

    fn stop(&mut self);
}

/// Reads RTCM bytes from a GNSS receiver's serial port via a background
/// task; chunks come out in arrival order.
pub struct SerialCorrectionSource {
    connected: Arc<AtomicBool>,
    rx: mpsc::Receiver<Bytes>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SerialCorrectionSource {
    pub fn start(cfg: &CorrectionsConfig) -> Self {
        let mut probe_log = LogThrottle::new(Duration::from_secs(10));
        let initial = open_serial(cfg, &mut probe_log);
        if initial.is_none() {
            warn!("Correction serial unavailable at startup; will keep retrying");
        }

        let connected = Arc::new(AtomicBool::new(initial.is_some()));
        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(pump(
            cfg.clone(),
            initial,
            connected.clone(),
            tx,
            shutdown_rx,
            probe_log,
        ));

        Self {
            connected,
            rx,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

impl CorrectionSource for SerialCorrectionSource {
    fn read_chunk(&mut self) -> Bytes {
        self.rx.try_recv().unwrap_or_else(|_| Bytes::new())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn pump(
    cfg: CorrectionsConfig,
    mut port: Option<SerialStream>,
    connected: Arc<AtomicBool>,
    tx: mpsc::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    mut probe_log: LogThrottle,
) {
    let chunk_len = cfg.read_chunk_bytes.max(1);
    let mut buf = vec![0u8; chunk_len];

    'reopen: loop {
        if *shutdown.borrow() {
            break;
        }
        let mut stream = match port.take() {
            Some(s) => s,
            None => match open_serial(&cfg, &mut probe_log) {
                Some(s) => s,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(REOPEN_DELAY) => continue 'reopen,
                        _ = shutdown.changed() => break 'reopen,
                    }
                }
            },
        };
        connected.store(true, Ordering::SeqCst);

        'session: loop {
            tokio::select! {
                _ = shutdown.changed() => break 'session,
                res = stream.read(&mut buf) => match res {
                    Ok(0) => {
                        warn!("Correction serial stream ended");
                        break 'session;
                    }
                    Ok(n) => {
                        if tx.try_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            warn!("Correction backlog full; dropping {n} bytes");
                        }
                    }
                    Err(e) => {
                        warn!("Correction serial read error: {e}");
                        break 'session;
                    }
                },
            }
        }

        connected.store(false, Ordering::SeqCst);
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(READ_FAIL_DELAY) => {}
            _ = shutdown.changed() => break,
        }
    }
    connected.store(false, Ordering::SeqCst);
}

fn open_serial(cfg: &CorrectionsConfig, probe_log: &mut LogThrottle) -> Option<SerialStream> {
    let mut attempts: Vec<String> = Vec::new();
    for port in ports::gnss_candidates(&cfg.serial_port) {
        if !ports::port_exists(&port) {
            continue;
        }
        attempts.push(port.clone());
        match tokio_serial::new(&port, cfg.baudrate).open_native_async() {
            Ok(stream) => {
                info!("Correction serial opened on {port}");
                return Some(stream);
            }
            Err(e) => {
                if probe_log.ready() {
                    warn!("Correction serial open failed on {port}: {e}");
                }
            }
        }
    }
    if probe_log.ready() {
        if attempts.is_empty() {
            warn!("Correction serial unavailable: no candidate ports found");
        } else {
            warn!(
                "Correction serial unavailable on candidate ports: {}",
                attempts.join(", ")
            );
        }
    }
    None
}

/// Synthesizes a recognizable test payload on a fixed interval so the radio
/// link can be validated end to end before real RTCM hardware arrives.
pub struct SimulatedCorrectionSource {
    cfg: CorrectionsConfig,
    connected: bool,
    next_at: Option<Instant>,
    seq: u64,
}

impl SimulatedCorrectionSource {
    pub fn start(cfg: &CorrectionsConfig) -> Self {
        info!(
            "Correction source: simulation (every {:.2}s, {} bytes)",
            cfg.simulate_interval_s, cfg.simulate_chunk_bytes
        );
        Self {
            cfg: cfg.clone(),
            connected: true,
            next_at: None,
            seq: 0,
        }
    }
}

impl CorrectionSource for SimulatedCorrectionSource {
    fn read_chunk(&mut self) -> Bytes {
        if !self.connected {
            return Bytes::new();
        }
        let now = Instant::now();
        if let Some(at) = self.next_at {
            if now < at {
                return Bytes::new();
            }
        }
        let interval = Duration::from_secs_f64(self.cfg.simulate_interval_s.max(0.05));
        self.next_at = Some(now + interval);
        self.seq += 1;

        let prefix: String = {
            let trimmed = self.cfg.simulate_prefix.trim();
            let p: String = trimmed.chars().filter(char::is_ascii).take(24).collect();
            if p.is_empty() {
                "RTCMTEST".to_string()
            } else {
                p
            }
        };
        let stamp = utc_now().format(&Rfc3339).unwrap_or_default();
        let mut payload = format!("{prefix} {stamp} {}", self.seq).into_bytes();

        let target = self.cfg.simulate_chunk_bytes;
        if target > 0 {
            if payload.len() < target {
                payload.resize(target, b'#');
            } else {
                payload.truncate(target);
            }
        }
        Bytes::from(payload)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn stop(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_cfg() -> CorrectionsConfig {
        CorrectionsConfig {
            mode: "simulate".into(),
            simulate_interval_s: 0.0,
            simulate_chunk_bytes: 80,
            ..CorrectionsConfig::default()
        }
    }

    #[tokio::test]
    async fn simulated_chunks_are_padded_and_sequenced() {
        let mut source = SimulatedCorrectionSource::start(&sim_cfg());
        let first = source.read_chunk();
        assert_eq!(first.len(), 80);
        assert!(first.starts_with(b"RTCMTEST "));
        assert!(first.ends_with(b"#"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = source.read_chunk();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn stopped_source_goes_quiet() {
        let mut source = SimulatedCorrectionSource::start(&sim_cfg());
        assert!(!source.read_chunk().is_empty());
        source.stop();
        assert!(!source.is_connected());
        assert!(source.read_chunk().is_empty());
    }

    #[tokio::test]
    async fn interval_throttles_output() {
        let mut cfg = sim_cfg();
        cfg.simulate_interval_s = 5.0;
        let mut source = SimulatedCorrectionSource::start(&cfg);
        assert!(!source.read_chunk().is_empty());
        assert!(source.read_chunk().is_empty());
    }
}
