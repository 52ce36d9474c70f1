//! Transparent serial pipe variant: the radio module handles modulation and
//! presents a plain byte stream, so this adapter is mostly a passthrough
//! plus control-plane frame stripping and an optional one-time module
//! configuration handshake at open time.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rtk_proto::error::LinkError;
use rtk_proto::frame::{FrameSplitter, StreamItem};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

use crate::{uart_hat, CorrectionRadio, LogThrottle, RadioConfig, RadioShared};

const REOPEN_DELAY: Duration = Duration::from_secs(1);
const READ_FAIL_DELAY: Duration = Duration::from_millis(500);
const RX_QUEUE: usize = 256;
const TX_QUEUE: usize = 64;

pub struct SerialRadio {
    cfg: RadioConfig,
    shared: Arc<RadioShared>,
    rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
    pump_parts: Option<(mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>)>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SerialRadio {
    pub fn new(cfg: RadioConfig) -> Self {
        let (rx_tx, rx_rx) = mpsc::channel(RX_QUEUE);
        let (tx_tx, tx_rx) = mpsc::channel(TX_QUEUE);
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg,
            shared: Arc::new(RadioShared::default()),
            rx: rx_rx,
            tx: tx_tx,
            pump_parts: Some((rx_tx, tx_rx)),
            shutdown,
            task: None,
        }
    }
}

impl CorrectionRadio for SerialRadio {
    fn open(&mut self) -> Result<(), LinkError> {
        let Some((rx_tx, tx_rx)) = self.pump_parts.take() else {
            return Ok(());
        };
        info!(
            "LoRa serial transport starting on {} @ {} MHz",
            self.cfg.serial_port, self.cfg.frequency_mhz
        );
        let task = tokio::spawn(pump(
            self.cfg.clone(),
            self.shared.clone(),
            rx_tx,
            tx_rx,
            self.shutdown.subscribe(),
        ));
        self.task = Some(task);
        Ok(())
    }

    fn send(&self, payload: Bytes) -> Result<usize, LinkError> {
        if payload.is_empty() {
            return Ok(0);
        }
        if !self.shared.connected() {
            return Err(LinkError::Io("LoRa serial link down".into()));
        }
        let len = payload.len();
        self.tx
            .try_send(payload)
            .map_err(|_| LinkError::Io("LoRa TX queue saturated".into()))?;
        Ok(len)
    }

    fn poll_received(&mut self) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    fn is_connected(&self) -> bool {
        self.shared.connected()
    }

    fn bytes_received(&self) -> u64 {
        self.shared.bytes_rx()
    }

    fn bytes_sent(&self) -> u64 {
        self.shared.bytes_tx()
    }

    fn last_rx_utc(&self) -> Option<OffsetDateTime> {
        self.shared.last_rx()
    }

    fn last_tx_utc(&self) -> Option<OffsetDateTime> {
        self.shared.last_tx()
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        self.shared.set_connected(false);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn pump(
    cfg: RadioConfig,
    shared: Arc<RadioShared>,
    rx_tx: mpsc::Sender<Bytes>,
    mut tx_rx: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut probe_log = LogThrottle::new(Duration::from_secs(10));
    let mut rx_log = LogThrottle::new(Duration::from_secs(5));
    let mut tx_log = LogThrottle::new(Duration::from_secs(5));
    let mut hb_log = LogThrottle::new(Duration::from_secs(5));
    let mut hat_attempted: HashSet<String> = HashSet::new();
    let mut splitter = FrameSplitter::new();
    let mut buf = vec![0u8; cfg.receive_chunk_bytes.max(1)];
    let mut tx_closed = false;

    'reopen: loop {
        if *shutdown.borrow() {
            break;
        }
        let stream = match open_serial(&cfg, &mut probe_log, &mut hat_attempted).await {
            Some(s) => s,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(REOPEN_DELAY) => continue 'reopen,
                    _ = shutdown.changed() => break 'reopen,
                }
            }
        };
        shared.set_connected(true);
        let (mut rd, mut wr) = tokio::io::split(stream);

        'session: loop {
            tokio::select! {
                _ = shutdown.changed() => break 'session,
                res = rd.read(&mut buf) => match res {
                    Ok(0) => {
                        warn!("LoRa serial stream ended");
                        break 'session;
                    }
                    Ok(n) => {
                        let total = shared.mark_rx(n);
                        if rx_log.ready() {
                            info!("LoRa RX: total={total} bytes (last chunk={n} bytes)");
                        }
                        for item in splitter.push(&buf[..n]) {
                            match item {
                                StreamItem::Data(data) => {
                                    let len = data.len();
                                    if rx_tx.try_send(data).is_err() {
                                        warn!("LoRa RX backlog full; dropping {len} correction bytes");
                                    }
                                }
                                StreamItem::Heartbeat(hb) => {
                                    let count = shared.mark_heartbeat(Some(hb.station_id.clone()));
                                    if hb_log.ready() {
                                        info!(
                                            "LoRa heartbeat RX: from={} seq={} (count={count})",
                                            hb.station_id, hb.seq
                                        );
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("LoRa read error: {e}");
                        break 'session;
                    }
                },
                payload = tx_rx.recv(), if !tx_closed => match payload {
                    Some(payload) => {
                        if let Err(e) = wr.write_all(&payload).await {
                            warn!("LoRa write error: {e}");
                            break 'session;
                        }
                        let total = shared.mark_tx(payload.len());
                        if tx_log.ready() {
                            info!(
                                "LoRa TX: total={total} bytes (last chunk={} bytes)",
                                payload.len()
                            );
                        }
                    }
                    None => tx_closed = true,
                },
            }
        }

        shared.set_connected(false);
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(READ_FAIL_DELAY) => {}
            _ = shutdown.changed() => break,
        }
    }
    shared.set_connected(false);
}

async fn open_serial(
    cfg: &RadioConfig,
    probe_log: &mut LogThrottle,
    hat_attempted: &mut HashSet<String>,
) -> Option<SerialStream> {
    let mut attempts: Vec<String> = Vec::new();
    for port in candidate_ports(&cfg.serial_port) {
        if !port_exists(&port) {
            continue;
        }
        attempts.push(port.clone());
        if cfg.uart_hat_auto_config && hat_attempted.insert(port.clone()) {
            if let Err(e) = uart_hat::configure(cfg, &port).await {
                warn!("UART HAT config failed on {port}: {e:#}");
            }
        }
        match tokio_serial::new(&port, cfg.baudrate).open_native_async() {
            Ok(stream) => {
                info!("LoRa serial opened on {} @ {} baud", port, cfg.baudrate);
                return Some(stream);
            }
            Err(e) => {
                if probe_log.ready() {
                    warn!("LoRa serial open failed on {port}: {e}");
                }
            }
        }
    }
    if probe_log.ready() {
        if attempts.is_empty() {
            warn!("LoRa serial unavailable: no candidate ports found");
        } else {
            warn!(
                "LoRa serial unavailable on candidate ports: {}",
                attempts.join(", ")
            );
        }
    }
    None
}

/// LoRa UART modules usually appear behind CP210x bridges; prefer those
/// among the stable by-id links, then fall back to the common UART nodes.
fn candidate_ports(preferred: &str) -> Vec<String> {
    let mut ports: Vec<String> = Vec::new();
    let mut add = |port: &str, ports: &mut Vec<String>| {
        let p = port.trim();
        if !p.is_empty() && !ports.iter().any(|seen| seen == p) {
            ports.push(p.to_string());
        }
    };

    add(preferred, &mut ports);

    let mut by_id: Vec<String> = std::fs::read_dir("/dev/serial/by-id")
        .map(|dir| {
            dir.filter_map(|e| e.ok())
                .map(|e| e.path().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    by_id.sort();

    for path in &by_id {
        let lowered = path.to_lowercase();
        if lowered.contains("cp210") || lowered.contains("usb_to_uart") {
            add(path, &mut ports);
        }
    }
    for path in &by_id {
        add(path, &mut ports);
    }
    for fallback in ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/serial0", "/dev/ttyS0"] {
        add(fallback, &mut ports);
    }
    ports
}

// Non-/dev paths are allowed (for test/dev environments).
fn port_exists(port: &str) -> bool {
    if !port.starts_with("/dev/") {
        return true;
    }
    Path::new(port).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_start_with_preferred_port() {
        let ports = candidate_ports("/dev/ttyS0");
        assert_eq!(ports[0], "/dev/ttyS0");
        assert_eq!(ports.iter().filter(|p| p.as_str() == "/dev/ttyS0").count(), 1);
    }

    #[tokio::test]
    async fn send_fails_while_link_is_down() {
        let radio = SerialRadio::new(RadioConfig::default());
        let err = radio.send(Bytes::from_static(b"\xd3\x00\x04test")).unwrap_err();
        assert!(matches!(err, LinkError::Io(_)));
        // Empty payloads are a no-op even when down.
        assert_eq!(radio.send(Bytes::new()).unwrap(), 0);
    }
}
