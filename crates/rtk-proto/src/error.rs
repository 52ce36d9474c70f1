use thiserror::Error;

/// Failure classes shared by every link adapter. None of these may terminate
/// a runtime: open and I/O failures are retried on a fixed cadence, parse
/// failures drop the offending bytes and resynchronize, and a lost telemetry
/// peer reverts the broadcaster to accepting connections.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("transport unavailable: {0}")]
    Open(String),

    #[error("transport i/o failed: {0}")]
    Io(String),

    #[error("malformed frame: {0}")]
    Parse(String),

    #[error("telemetry peer lost")]
    PeerLost,
}
