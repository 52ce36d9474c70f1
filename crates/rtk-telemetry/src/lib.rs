//! Telemetry broadcaster: one socket server, at most one live client,
//! newline-delimited JSON pushed at whatever pace the producer publishes.
//!
//! The producer side is a `watch` channel, so the queue depth is one by
//! construction and a slow or absent client can never block the rover loop.
//! A new connection replaces the current client; a failed or timed-out write
//! drops the client and the server goes back to accepting.

pub mod doctor;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rtk_proto::telemetry::{encode_line, TelemetryMessage};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub broadcast_hz: f64,
    pub write_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:7870".into(),
            broadcast_hz: 4.0,
            write_timeout_ms: 1000,
        }
    }
}

#[derive(Default)]
struct Shared {
    client_addr: Mutex<Option<String>>,
    last_command: Mutex<Option<serde_json::Value>>,
}

pub struct TelemetryServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TelemetryServer {
    pub async fn start(
        cfg: &TelemetryConfig,
        updates: watch::Receiver<Option<TelemetryMessage>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&cfg.listen_addr)
            .await
            .with_context(|| format!("bind telemetry listener on {}", cfg.listen_addr))?;
        let local_addr = listener.local_addr().context("telemetry local addr")?;
        info!("Telemetry server listening on {local_addr}");

        let shared = Arc::new(Shared::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let write_timeout = Duration::from_millis(cfg.write_timeout_ms.max(50));
        let task = tokio::spawn(serve(
            listener,
            updates,
            shared.clone(),
            shutdown_rx,
            write_timeout,
        ));

        Ok(Self {
            shared,
            local_addr,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn has_client(&self) -> bool {
        self.shared.client_addr.lock().unwrap().is_some()
    }

    pub fn client_addr(&self) -> Option<String> {
        self.shared.client_addr.lock().unwrap().clone()
    }

    /// Last well-formed JSON object the client sent, if any.
    pub fn last_command(&self) -> Option<serde_json::Value> {
        self.shared.last_command.lock().unwrap().clone()
    }

    pub fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        *self.shared.client_addr.lock().unwrap() = None;
    }
}

struct ActiveClient {
    writer: OwnedWriteHalf,
    peer: String,
    generation: u64,
    reader: JoinHandle<()>,
}

async fn serve(
    listener: TcpListener,
    mut updates: watch::Receiver<Option<TelemetryMessage>>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    write_timeout: Duration,
) {
    let mut client: Option<ActiveClient> = None;
    let (gone_tx, mut gone_rx) = mpsc::channel::<u64>(8);
    let mut generation: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((sock, peer)) => {
                    if let Some(old) = client.take() {
                        info!("Telemetry client {} replaced by {peer}", old.peer);
                        old.reader.abort();
                    }
                    generation += 1;
                    let (rd, wr) = sock.into_split();
                    let reader = tokio::spawn(client_rx(rd, shared.clone(), gone_tx.clone(), generation));
                    *shared.client_addr.lock().unwrap() = Some(peer.to_string());
                    info!("Telemetry client connected: {peer}");
                    client = Some(ActiveClient {
                        writer: wr,
                        peer: peer.to_string(),
                        generation,
                        reader,
                    });
                }
                Err(e) => warn!("Telemetry accept failed: {e}"),
            },
            res = updates.changed() => {
                if res.is_err() {
                    // Producer is gone; nothing left to broadcast.
                    break;
                }
                let msg = updates.borrow_and_update().clone();
                let (Some(msg), Some(active)) = (msg, client.as_mut()) else {
                    continue;
                };
                let line = match encode_line(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Telemetry encode failed: {e}");
                        continue;
                    }
                };
                let sent =
                    tokio::time::timeout(write_timeout, active.writer.write_all(line.as_bytes()))
                        .await;
                if !matches!(sent, Ok(Ok(()))) {
                    warn!("Telemetry send to {} failed; awaiting a new client", active.peer);
                    drop_client(&mut client, &shared);
                }
            },
            Some(gone) = gone_rx.recv() => {
                if client.as_ref().map(|c| c.generation) == Some(gone) {
                    info!("Telemetry client disconnected");
                    drop_client(&mut client, &shared);
                }
            },
        }
    }
    drop_client(&mut client, &shared);
}

fn drop_client(client: &mut Option<ActiveClient>, shared: &Shared) {
    if let Some(old) = client.take() {
        old.reader.abort();
    }
    *shared.client_addr.lock().unwrap() = None;
}

/// Drains inbound lines from the client. Serves two purposes: disconnect
/// detection, and recording the last command object the app sent.
async fn client_rx(rd: OwnedReadHalf, shared: Arc<Shared>, gone: mpsc::Sender<u64>, generation: u64) {
    let mut reader = BufReader::new(rd);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                    if value.is_object() {
                        *shared.last_command.lock().unwrap() = Some(value);
                    }
                }
            }
        }
    }
    let _ = gone.send(generation).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtk_proto::telemetry::{decode_line, RoverStatus};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn test_cfg() -> TelemetryConfig {
        TelemetryConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..TelemetryConfig::default()
        }
    }

    fn message(bytes: u64) -> TelemetryMessage {
        let mut rover = RoverStatus::new("ROVER-01");
        rover.lora_bytes_rx = bytes;
        TelemetryMessage::new(rover, None, Vec::new(), None)
    }

    async fn read_json_line(stream: &mut TcpStream) -> TelemetryMessage {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "peer closed before a full line arrived");
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        decode_line(&String::from_utf8(buf).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn pushes_latest_message_to_client() {
        let (tx, rx) = watch::channel(None);
        let mut server = TelemetryServer::start(&test_cfg(), rx).await.unwrap();
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.has_client());

        tx.send_replace(Some(message(7)));
        let got = read_json_line(&mut client).await;
        assert_eq!(got.rover.lora_bytes_rx, 7);
        server.stop();
    }

    #[tokio::test]
    async fn new_connection_replaces_previous_client() {
        let (tx, rx) = watch::channel(None);
        let mut server = TelemetryServer::start(&test_cfg(), rx).await.unwrap();

        let _first = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first_addr = server.client_addr();

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_ne!(server.client_addr(), first_addr);

        tx.send_replace(Some(message(42)));
        let got = read_json_line(&mut second).await;
        assert_eq!(got.rover.lora_bytes_rx, 42);
        server.stop();
    }

    #[tokio::test]
    async fn accepts_new_client_after_disconnect() {
        let (tx, rx) = watch::channel(None);
        let mut server = TelemetryServer::start(&test_cfg(), rx).await.unwrap();

        let first = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.has_client());
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.has_client());

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(Some(message(3)));
        let got = read_json_line(&mut second).await;
        assert_eq!(got.rover.lora_bytes_rx, 3);
        server.stop();
    }

    #[tokio::test]
    async fn records_last_command_from_client() {
        let (_tx, rx) = watch::channel(None);
        let mut server = TelemetryServer::start(&test_cfg(), rx).await.unwrap();
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        client
            .write_all(b"{\"cmd\":\"mark\",\"label\":\"stake-4\"}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cmd = server.last_command().expect("command recorded");
        assert_eq!(cmd["cmd"], "mark");
        server.stop();
    }
}
