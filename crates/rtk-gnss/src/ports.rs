//! Candidate-port discovery for GNSS receivers.
//!
//! Receivers show up on different device nodes depending on the adapter and
//! boot order, so the configured port is only the first candidate: stable
//! `/dev/serial/by-id` links that look GNSS-ish come next, then the usual
//! ttyACM/ttyUSB fallbacks. USB-UART bridges that are almost certainly the
//! LoRa radio are skipped so the scan does not steal its port.

use std::path::Path;

const BY_ID_DIR: &str = "/dev/serial/by-id";

const GNSS_MARKERS: [&str; 4] = ["u-blox", "ublox", "gnss", "gps"];

const LORA_MARKERS: [&str; 7] = [
    "cp210",
    "usb_to_uart",
    "silicon_labs",
    "sx126",
    "lora",
    "ebyte",
    "e22",
];

const FALLBACKS: [&str; 8] = [
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/ttyACM2",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyUSB2",
    "/dev/serial0",
    "/dev/ttyAMA0",
];

pub(crate) fn is_likely_lora_usb(port: &str) -> bool {
    let lowered = port.to_lowercase();
    LORA_MARKERS.iter().any(|m| lowered.contains(m))
}

fn by_id_entries() -> Vec<String> {
    let mut entries: Vec<String> = std::fs::read_dir(BY_ID_DIR)
        .map(|dir| {
            dir.filter_map(|e| e.ok())
                .map(|e| e.path().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    entries.sort();
    entries
}

/// Ordered, de-duplicated candidate list for a GNSS receiver.
pub(crate) fn gnss_candidates(preferred: &str) -> Vec<String> {
    let mut ports: Vec<String> = Vec::new();
    let mut add = |port: &str, ports: &mut Vec<String>| {
        let p = port.trim();
        if !p.is_empty() && !ports.iter().any(|seen| seen == p) {
            ports.push(p.to_string());
        }
    };

    add(preferred, &mut ports);

    let by_id = by_id_entries();
    for path in &by_id {
        let lowered = path.to_lowercase();
        if GNSS_MARKERS.iter().any(|m| lowered.contains(m)) && !is_likely_lora_usb(path) {
            add(path, &mut ports);
        }
    }
    for path in &by_id {
        if !is_likely_lora_usb(path) {
            add(path, &mut ports);
        }
    }
    for fallback in FALLBACKS {
        add(fallback, &mut ports);
    }
    ports
}

/// Non-/dev paths are allowed (for test/dev environments).
pub(crate) fn port_exists(port: &str) -> bool {
    if !port.starts_with("/dev/") {
        return true;
    }
    Path::new(port).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_port_comes_first_without_duplicates() {
        let ports = gnss_candidates("/dev/ttyACM0");
        assert_eq!(ports[0], "/dev/ttyACM0");
        assert_eq!(
            ports.iter().filter(|p| p.as_str() == "/dev/ttyACM0").count(),
            1
        );
    }

    #[test]
    fn lora_bridges_are_recognized() {
        assert!(is_likely_lora_usb(
            "/dev/serial/by-id/usb-Silicon_Labs_CP2102_USB_to_UART_Bridge-if00"
        ));
        assert!(!is_likely_lora_usb("/dev/serial/by-id/usb-u-blox_ZED-F9P-if00"));
    }

    #[test]
    fn non_dev_paths_are_always_allowed() {
        assert!(port_exists("loop://"));
        assert!(!port_exists("/dev/definitely-not-a-port"));
    }
}
