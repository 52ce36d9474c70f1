//! Control-plane framing for transparent serial radios.
//!
//! The base station multiplexes small heartbeat frames with raw RTCM bytes on
//! the same UART. Frames are delimited by STX/ETX so the rover can detect and
//! strip them without line-based parsing; everything between frames is
//! correction data and is passed through untouched, in arrival order.

use bytes::Bytes;
use time::format_description::well_known::Rfc3339;

use crate::telemetry::utc_now;

pub const HB_PREFIX: &[u8] = b"\x02RTKHB,";
pub const HB_SUFFIX: u8 = 0x03;

/// Anything longer than this starting with the prefix is treated as a
/// false positive and resynchronized byte by byte.
pub const MAX_FRAME_LEN: usize = 200;

// Avoid commas and control chars which would complicate parsing.
fn clean_field(value: &str) -> String {
    let safe: String = value
        .trim()
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .map(|c| if c == ',' { '_' } else { c })
        .take(40)
        .collect();
    if safe.is_empty() {
        "BASE".to_string()
    } else {
        safe
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatFrame {
    pub station_id: String,
    pub timestamp_utc: String,
    pub seq: u16,
}

impl HeartbeatFrame {
    pub fn new(station_id: &str, seq: u16) -> Self {
        let stamp = utc_now().format(&Rfc3339).unwrap_or_default();
        Self {
            station_id: station_id.to_string(),
            timestamp_utc: stamp,
            seq,
        }
    }

    pub fn encode(&self) -> Bytes {
        let body = format!(
            "{},{},{}",
            clean_field(&self.station_id),
            clean_field(&self.timestamp_utc),
            self.seq
        );
        let mut out = Vec::with_capacity(HB_PREFIX.len() + body.len() + 1);
        out.extend_from_slice(HB_PREFIX);
        out.extend_from_slice(body.as_bytes());
        out.push(HB_SUFFIX);
        Bytes::from(out)
    }

    /// Decodes a delimited frame. Receipt matters even when the body is
    /// mangled, so missing fields fall back instead of failing.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let body = frame
            .strip_prefix(HB_PREFIX)?
            .strip_suffix(&[HB_SUFFIX])?;
        Some(Self::decode_body(body))
    }

    fn decode_body(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let mut parts = text.split(',');
        let station = parts.next().map(str::trim).unwrap_or("");
        let stamp = parts.next().map(str::trim).unwrap_or("");
        let seq = parts
            .next()
            .and_then(|s| s.trim().parse::<u16>().ok())
            .unwrap_or(0);
        Self {
            station_id: if station.is_empty() {
                "unknown".to_string()
            } else {
                station.to_string()
            },
            timestamp_utc: stamp.to_string(),
            seq,
        }
    }
}

/// One item recovered from the multiplexed stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Correction bytes, forwarded verbatim.
    Data(Bytes),
    /// A control-plane heartbeat, stripped from the data path.
    Heartbeat(HeartbeatFrame),
}

/// Resynchronizable splitter for the heartbeat/correction multiplex.
///
/// Data segments come out in arrival order with nothing dropped or
/// duplicated; the only bytes withheld are a buffer tail that could still be
/// the start of a heartbeat prefix split across chunks.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buf: Vec<u8>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        let mut out = Vec::new();
        if chunk.is_empty() {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        loop {
            let Some(start) = find(&self.buf, HB_PREFIX) else {
                // No prefix in the buffer; flush everything except the
                // minimal tail that could still begin one.
                let keep = prefix_overlap_tail(&self.buf);
                let cut = self.buf.len() - keep;
                self.emit_data(&mut out, cut);
                return out;
            };

            if start > 0 {
                // Bytes ahead of the frame are correction data.
                self.emit_data(&mut out, start);
                continue;
            }

            // Buffer starts with the heartbeat prefix.
            let Some(rel) = self.buf[HB_PREFIX.len()..]
                .iter()
                .position(|&b| b == HB_SUFFIX)
            else {
                // Incomplete frame. If it grows past the cap it was never a
                // frame; resync by emitting one byte as data.
                if self.buf.len() > MAX_FRAME_LEN {
                    self.emit_data(&mut out, 1);
                    continue;
                }
                return out;
            };

            let frame_len = HB_PREFIX.len() + rel + 1;
            if frame_len > MAX_FRAME_LEN {
                self.emit_data(&mut out, 1);
                continue;
            }

            let frame: Vec<u8> = self.buf.drain(..frame_len).collect();
            let body = &frame[HB_PREFIX.len()..frame.len() - 1];
            out.push(StreamItem::Heartbeat(HeartbeatFrame::decode_body(body)));
        }
    }

    fn emit_data(&mut self, out: &mut Vec<StreamItem>, len: usize) {
        if len == 0 {
            return;
        }
        let data: Vec<u8> = self.buf.drain(..len).collect();
        out.push(StreamItem::Data(Bytes::from(data)));
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Largest suffix of `data` that matches a proper prefix of `HB_PREFIX`.
fn prefix_overlap_tail(data: &[u8]) -> usize {
    let max_tail = data.len().min(HB_PREFIX.len() - 1);
    for n in (1..=max_tail).rev() {
        if data.ends_with(&HB_PREFIX[..n]) {
            return n;
        }
    }
    0
}
