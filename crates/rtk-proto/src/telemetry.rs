use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Message type tag on every telemetry line. The mobile client matches on
/// this string, so it is part of the wire contract.
pub const TELEMETRY_TYPE: &str = "rover.telemetry.v1";

/// Current UTC instant, truncated to whole seconds for the wire.
pub fn utc_now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixQuality {
    #[serde(rename = "no-fix")]
    NoFix,
    #[serde(rename = "gps")]
    Gps,
    #[serde(rename = "dgps")]
    Dgps,
    #[serde(rename = "rtk-float")]
    RtkFloat,
    #[serde(rename = "rtk-fixed")]
    RtkFixed,
    #[serde(rename = "dead-reckoning")]
    DeadReckoning,
    #[serde(rename = "unknown")]
    Unknown,
}

impl FixQuality {
    /// Maps the GGA fix-quality digit.
    pub fn from_nmea(quality: u8) -> Self {
        match quality {
            0 => FixQuality::NoFix,
            1 => FixQuality::Gps,
            2 => FixQuality::Dgps,
            4 => FixQuality::RtkFixed,
            5 => FixQuality::RtkFloat,
            6 => FixQuality::DeadReckoning,
            _ => FixQuality::Unknown,
        }
    }
}

/// One positioning solution snapshot. Superseded wholesale by the next fix,
/// never merged field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp_utc: OffsetDateTime,
    pub lat: f64,
    pub lng: f64,
    pub quality: FixQuality,
    pub alt_m: Option<f64>,
    pub accuracy_m: Option<f64>,
    pub hdop: Option<f64>,
    pub satellites: Option<u32>,
    pub correction_age_s: Option<f64>,
}

/// Link-health summary for the rover. `lora_connected` is time-windowed by
/// the rover runtime, not a raw transport flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoverStatus {
    pub device_id: String,
    pub gnss_connected: bool,
    pub lora_connected: bool,
    pub bluetooth_connected: bool,
    pub bluetooth_client: Option<String>,
    pub lora_bytes_rx: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_correction_utc: Option<OffsetDateTime>,
}

impl RoverStatus {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            gnss_connected: false,
            lora_connected: false,
            bluetooth_connected: false,
            bluetooth_client: None,
            lora_bytes_rx: 0,
            last_correction_utc: None,
        }
    }
}

/// The wire envelope pushed to the mobile client, one JSON object per line.
/// Built fresh on every broadcast tick and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp_utc: OffsetDateTime,
    pub rover: RoverStatus,
    pub fix: Option<Fix>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl TelemetryMessage {
    pub fn new(
        rover: RoverStatus,
        fix: Option<Fix>,
        warnings: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            message_type: TELEMETRY_TYPE.to_string(),
            timestamp_utc: utc_now(),
            rover,
            fix,
            warnings,
            error,
        }
    }
}

/// Serializes one message as a newline-terminated compact JSON object.
pub fn encode_line(msg: &TelemetryMessage) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// The mobile-client side of the contract: parses one line back into a
/// message, `None` on blank or malformed input.
pub fn decode_line(line: &str) -> Option<TelemetryMessage> {
    let raw = line.trim();
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status() -> RoverStatus {
        RoverStatus {
            device_id: "ROVER-01".into(),
            gnss_connected: true,
            lora_connected: true,
            bluetooth_connected: true,
            bluetooth_client: Some("AA:BB:CC:DD:EE:FF".into()),
            lora_bytes_rx: 4821,
            last_correction_utc: Some(utc_now()),
        }
    }

    fn sample_fix() -> Fix {
        Fix {
            timestamp_utc: utc_now(),
            lat: 49.3043,
            lng: -123.1443,
            quality: FixQuality::RtkFixed,
            alt_m: Some(20.0),
            accuracy_m: Some(0.02),
            hdop: Some(0.4),
            satellites: Some(18),
            correction_age_s: Some(1.5),
        }
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let msg = TelemetryMessage::new(
            sample_status(),
            Some(sample_fix()),
            vec!["Waiting for LoRa corrections".into()],
            None,
        );
        let line = encode_line(&msg).unwrap();
        assert!(line.ends_with('\n'));
        let back = decode_line(&line).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn null_fix_round_trips_to_none() {
        let msg = TelemetryMessage::new(sample_status(), None, Vec::new(), Some("boom".into()));
        let line = encode_line(&msg).unwrap();
        assert!(line.contains("\"fix\":null"));
        let back = decode_line(&line).unwrap();
        assert!(back.fix.is_none());
        assert_eq!(back.error.as_deref(), Some("boom"));
    }

    #[test]
    fn wire_field_names_are_stable() {
        let msg = TelemetryMessage::new(sample_status(), Some(sample_fix()), Vec::new(), None);
        let value: serde_json::Value = serde_json::from_str(&encode_line(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], TELEMETRY_TYPE);
        for key in [
            "device_id",
            "gnss_connected",
            "lora_connected",
            "bluetooth_connected",
            "bluetooth_client",
            "lora_bytes_rx",
            "last_correction_utc",
        ] {
            assert!(value["rover"].get(key).is_some(), "missing rover.{key}");
        }
        assert_eq!(value["fix"]["quality"], "rtk-fixed");
    }

    #[test]
    fn quality_digit_mapping() {
        assert_eq!(FixQuality::from_nmea(0), FixQuality::NoFix);
        assert_eq!(FixQuality::from_nmea(2), FixQuality::Dgps);
        assert_eq!(FixQuality::from_nmea(4), FixQuality::RtkFixed);
        assert_eq!(FixQuality::from_nmea(5), FixQuality::RtkFloat);
        assert_eq!(FixQuality::from_nmea(9), FixQuality::Unknown);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_line("").is_none());
        assert!(decode_line("   \n").is_none());
        assert!(decode_line("{not json").is_none());
        assert!(decode_line("[1,2,3]").is_none());
    }
}
