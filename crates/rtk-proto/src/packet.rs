//! Packet envelope for chip-driver radios.
//!
//! Unlike the transparent serial pipe, the SX126x path delivers discrete
//! packets, so corrections and heartbeats ride in a small typed envelope:
//! magic + version + network id + type + u16 sequence, then the payload.

use bytes::Bytes;

pub const MAGIC: &[u8] = b"RTK";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;

pub const STATION_ID_MAX_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Heartbeat,
    Corrections,
}

impl PacketType {
    pub fn as_byte(self) -> u8 {
        match self {
            PacketType::Heartbeat => 1,
            PacketType::Corrections => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(PacketType::Heartbeat),
            2 => Some(PacketType::Corrections),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub network_id: u8,
    pub seq: u16,
    pub payload: Bytes,
}

pub fn build_packet(packet_type: PacketType, network_id: u8, seq: u16, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(network_id);
    out.push(packet_type.as_byte());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    Bytes::from(out)
}

/// `None` on anything that is not one of ours: short frames, foreign magic,
/// version mismatch, unknown type. Callers drop those silently.
pub fn parse_packet(raw: &[u8]) -> Option<Packet> {
    if raw.len() < HEADER_LEN {
        return None;
    }
    if &raw[..3] != MAGIC {
        return None;
    }
    if raw[3] != VERSION {
        return None;
    }
    let network_id = raw[4];
    let packet_type = PacketType::from_byte(raw[5])?;
    let seq = u16::from_be_bytes([raw[6], raw[7]]);
    Some(Packet {
        packet_type,
        network_id,
        seq,
        payload: Bytes::copy_from_slice(&raw[HEADER_LEN..]),
    })
}

pub fn encode_station_id(station_id: &str) -> Bytes {
    let cleaned: Vec<u8> = station_id
        .trim()
        .bytes()
        .filter(u8::is_ascii)
        .take(STATION_ID_MAX_LEN)
        .collect();
    Bytes::from(cleaned)
}

pub fn decode_station_id(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrections_round_trip() {
        let built = build_packet(PacketType::Corrections, 18, 513, b"\xd3\x00\x04rtcm");
        let pkt = parse_packet(&built).unwrap();
        assert_eq!(pkt.packet_type, PacketType::Corrections);
        assert_eq!(pkt.network_id, 18);
        assert_eq!(pkt.seq, 513);
        assert_eq!(pkt.payload.as_ref(), b"\xd3\x00\x04rtcm");
    }

    #[test]
    fn heartbeat_station_id_round_trip() {
        let built = build_packet(
            PacketType::Heartbeat,
            18,
            1,
            &encode_station_id("  BASE-01  "),
        );
        let pkt = parse_packet(&built).unwrap();
        assert_eq!(decode_station_id(&pkt.payload), "BASE-01");
    }

    #[test]
    fn foreign_frames_are_rejected() {
        assert!(parse_packet(b"RTK").is_none());
        assert!(parse_packet(b"XYZ\x01\x12\x02\x00\x01abc").is_none());
        // version mismatch
        assert!(parse_packet(b"RTK\x02\x12\x02\x00\x01abc").is_none());
        // unknown packet type
        assert!(parse_packet(b"RTK\x01\x12\x09\x00\x01abc").is_none());
    }

    #[test]
    fn station_id_is_capped() {
        let long = "X".repeat(80);
        assert_eq!(encode_station_id(&long).len(), STATION_ID_MAX_LEN);
        assert_eq!(decode_station_id(b"  "), "unknown");
    }

    #[test]
    fn seq_wraps_at_u16() {
        let built = build_packet(PacketType::Corrections, 18, u16::MAX, b"x");
        assert_eq!(parse_packet(&built).unwrap().seq, u16::MAX);
    }
}
