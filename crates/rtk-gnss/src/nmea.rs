//! Minimal NMEA parsing: GGA only, which carries everything the telemetry
//! stream needs (position, quality, hdop, satellites, altitude). Anything
//! else, and anything garbled, is discarded without disturbing the stream.

use rtk_proto::telemetry::{utc_now, Fix, FixQuality};

/// Parses one sentence; `None` for non-GGA sentences, sentences without a
/// position, and anything that fails framing or checksum.
pub fn parse_sentence(sentence: &str) -> Option<Fix> {
    let line = sentence.trim();
    let body = checked_body(line)?;

    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() < 10 || !parts[0].ends_with("GGA") {
        return None;
    }

    // 1=time 2=lat 3=N/S 4=lon 5=E/W 6=quality 7=sats 8=hdop 9=alt
    let lat = parse_deg_min(parts[2], parts[3])?;
    let lng = parse_deg_min(parts[4], parts[5])?;

    let quality_digit: u8 = parts[6].parse().unwrap_or(0);
    let satellites: Option<u32> = parts[7].parse().ok();
    let hdop: Option<f64> = parts[8].parse().ok().filter(|h: &f64| *h > 0.0);
    let alt_m: Option<f64> = parts[9].parse().ok();

    Some(Fix {
        timestamp_utc: utc_now(),
        lat,
        lng,
        quality: FixQuality::from_nmea(quality_digit),
        alt_m,
        accuracy_m: hdop.map(|h| h * 5.0),
        hdop,
        satellites,
        correction_age_s: None,
    })
}

/// Strips `$` and the `*hh` trailer, verifying the checksum when one is
/// present. Some receivers omit it, so absence is tolerated.
fn checked_body(line: &str) -> Option<&str> {
    let body = line.strip_prefix('$')?;
    match body.rsplit_once('*') {
        Some((data, checksum)) => {
            let expected = u8::from_str_radix(checksum.trim(), 16).ok()?;
            let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);
            if actual == expected {
                Some(data)
            } else {
                None
            }
        }
        None => Some(body),
    }
}

/// `ddmm.mmmm` (lat) / `dddmm.mmmm` (lon) to signed decimal degrees.
fn parse_deg_min(value: &str, hemisphere: &str) -> Option<f64> {
    if value.is_empty() {
        return None;
    }
    let dot = value.find('.')?;
    let deg_len = if dot > 4 { 3 } else { 2 };
    if value.len() < deg_len {
        return None;
    }
    let deg: f64 = value[..deg_len].parse().ok()?;
    let min: f64 = value[deg_len..].parse().ok()?;
    let mut out = deg + min / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        out = -out;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_checksum(body: &str) -> String {
        let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
        format!("${}*{:02X}", body, sum)
    }

    #[test]
    fn parses_rtk_fixed_gga() {
        let line =
            with_checksum("GNGGA,181908.00,4918.258,N,12308.658,W,4,18,0.4,20.0,M,-21.3,M,1.0,0000");
        let fix = parse_sentence(&line).unwrap();
        assert_eq!(fix.quality, FixQuality::RtkFixed);
        assert!((fix.lat - 49.3043).abs() < 1e-3);
        assert!((fix.lng - (-123.1443)).abs() < 1e-3);
        assert_eq!(fix.satellites, Some(18));
        assert_eq!(fix.hdop, Some(0.4));
        assert_eq!(fix.accuracy_m, Some(2.0));
        assert_eq!(fix.alt_m, Some(20.0));
    }

    #[test]
    fn rejects_bad_checksum() {
        let line = "$GNGGA,181908.00,4918.258,N,12308.658,W,4,18,0.4,20.0,M,-21.3,M,1.0,0000*00";
        assert!(parse_sentence(line).is_none());
    }

    #[test]
    fn rejects_sentence_without_position() {
        let line = with_checksum("GNGGA,181908.00,,,,,0,00,99.9,,M,,M,,");
        assert!(parse_sentence(&line).is_none());
    }

    #[test]
    fn ignores_other_sentence_types() {
        let line = with_checksum("GNRMC,181908.00,A,4918.258,N,12308.658,W,0.0,0.0,060826,,,A");
        assert!(parse_sentence(&line).is_none());
    }

    #[test]
    fn ignores_garbage_lines() {
        assert!(parse_sentence("").is_none());
        assert!(parse_sentence("not an nmea line").is_none());
        assert!(parse_sentence("$GNGGA,halfway-thro").is_none());
        assert!(parse_sentence("$GNGGA,1,2,3*ZZ").is_none());
    }

    #[test]
    fn southern_and_western_hemispheres_are_negative() {
        let line =
            with_checksum("GPGGA,181908.00,3351.000,S,15112.000,E,1,07,1.2,5.0,M,0.0,M,,");
        let fix = parse_sentence(&line).unwrap();
        assert!(fix.lat < 0.0);
        assert!(fix.lng > 0.0);
        assert_eq!(fix.quality, FixQuality::Gps);
    }
}
