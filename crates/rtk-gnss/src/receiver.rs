use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use rtk_proto::telemetry::{utc_now, Fix};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

use crate::{nmea, ports, GnssAdapter, GnssConfig, LogThrottle};

const REOPEN_DELAY: Duration = Duration::from_secs(1);
const READ_FAIL_DELAY: Duration = Duration::from_millis(500);
const MAX_LINE_LEN: usize = 1024;

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    latest_fix: Mutex<Option<Fix>>,
    last_correction: Mutex<Option<OffsetDateTime>>,
}

/// NMEA receiver over a serial port. A background task owns the port, parses
/// GGA sentences into the shared fix slot, and drains the correction
/// injection queue onto the same port; the adapter surface is non-blocking.
pub struct SerialGnssReceiver {
    shared: Arc<Shared>,
    corr_tx: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SerialGnssReceiver {
    /// Opens the port and starts the reader task. When no port can be opened
    /// and the config allows simulation, this fails so the caller can fall
    /// back to the simulated receiver; otherwise the task keeps retrying.
    pub fn start(cfg: &GnssConfig) -> Result<Self> {
        let mut probe_log = LogThrottle::new(Duration::from_secs(10));
        let initial = open_serial(cfg, &mut probe_log);
        if initial.is_none() {
            if cfg.simulate_without_hardware {
                anyhow::bail!("GNSS serial unavailable");
            }
            warn!("GNSS serial unavailable at startup; will keep retrying");
        }

        let shared = Arc::new(Shared::default());
        shared.connected.store(initial.is_some(), Ordering::SeqCst);
        let (corr_tx, corr_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(pump(
            cfg.clone(),
            initial,
            shared.clone(),
            corr_rx,
            shutdown_rx,
            probe_log,
        ));

        Ok(Self {
            shared,
            corr_tx,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }
}

impl GnssAdapter for SerialGnssReceiver {
    fn latest_fix(&self) -> Option<Fix> {
        self.shared.latest_fix.lock().unwrap().clone()
    }

    fn inject_corrections(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        if self
            .corr_tx
            .try_send(Bytes::copy_from_slice(payload))
            .is_err()
        {
            warn!("GNSS injection queue full; dropping {} correction bytes", payload.len());
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

async fn pump(
    cfg: GnssConfig,
    mut port: Option<SerialStream>,
    shared: Arc<Shared>,
    mut corr_rx: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    mut probe_log: LogThrottle,
) {
    'reopen: loop {
        if *shutdown.borrow() {
            break;
        }
        let stream = match port.take() {
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
        shared.connected.store(true, Ordering::SeqCst);

        let (rd, mut wr) = tokio::io::split(stream);
        let mut reader = BufReader::new(rd);
        let mut line: Vec<u8> = Vec::new();
        let mut injection_closed = false;

        'session: loop {
            tokio::select! {
                _ = shutdown.changed() => break 'session,
                res = reader.read_until(b'\n', &mut line) => match res {
                    Ok(0) => {
                        warn!("GNSS serial stream ended");
                        break 'session;
                    }
                    Ok(_) => {
                        if line.last() == Some(&b'\n') {
                            let parsed = {
                                let text = String::from_utf8_lossy(&line);
                                let trimmed = text.trim();
                                if trimmed.starts_with('$') {
                                    nmea::parse_sentence(trimmed)
                                } else {
                                    None
                                }
                            };
                            line.clear();
                            if let Some(fix) = parsed {
                                *shared.latest_fix.lock().unwrap() = Some(fix);
                                shared.connected.store(true, Ordering::SeqCst);
                            }
                        } else if line.len() > MAX_LINE_LEN {
                            // Binary noise with no newline; resync.
                            line.clear();
                        }
                    }
                    Err(e) => {
                        warn!("GNSS serial read failed: {e}");
                        break 'session;
                    }
                },
                chunk = corr_rx.recv(), if !injection_closed => match chunk {
                    Some(payload) => {
                        if let Err(e) = wr.write_all(&payload).await {
                            warn!("Failed to write GNSS correction bytes: {e}");
                            break 'session;
                        }
                        *shared.last_correction.lock().unwrap() = Some(utc_now());
                    }
                    None => injection_closed = true,
                },
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(READ_FAIL_DELAY) => {}
            _ = shutdown.changed() => break,
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}

fn open_serial(cfg: &GnssConfig, probe_log: &mut LogThrottle) -> Option<SerialStream> {
    let mut attempts: Vec<String> = Vec::new();
    for port in ports::gnss_candidates(&cfg.serial_port) {
        if !ports::port_exists(&port) {
            continue;
        }
        attempts.push(port.clone());
        match tokio_serial::new(&port, cfg.baudrate).open_native_async() {
            Ok(stream) => {
                info!("GNSS serial opened on {} @ {}", port, cfg.baudrate);
                return Some(stream);
            }
            Err(e) => {
                if probe_log.ready() {
                    warn!("GNSS serial open failed on {port}: {e}");
                }
            }
        }
    }
    if probe_log.ready() {
        if attempts.is_empty() {
            warn!("GNSS serial unavailable: no candidate ports found");
        } else {
            warn!(
                "GNSS serial unavailable on candidate ports: {}",
                attempts.join(", ")
            );
        }
    }
    None
}
