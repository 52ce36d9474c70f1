use anyhow::Result;

use crate::RadioConfig;

const LORA_BANDWIDTHS: [u32; 10] = [
    7_800, 10_400, 15_600, 20_800, 31_250, 41_700, 62_500, 125_000, 250_000, 500_000,
];

pub fn check_radio(cfg: &RadioConfig) -> Result<()> {
    match cfg.transport.trim().to_lowercase().as_str() {
        "serial" | "sx126x-spi" | "sx126x_spi" | "sx126x" | "spi" | "simulate" | "sim" => {}
        other => anyhow::bail!("lora.transport unknown: {other}"),
    }
    anyhow::ensure!(
        cfg.frequency_mhz >= 137.0 && cfg.frequency_mhz <= 1020.0,
        "lora.frequency_mhz out of the SX126x tuning range"
    );
    anyhow::ensure!(
        (5..=12).contains(&cfg.spreading_factor),
        "lora.spreading_factor should be 5..12"
    );
    anyhow::ensure!(
        (5..=8).contains(&cfg.coding_rate),
        "lora.coding_rate should be 5..8 (4/x)"
    );
    anyhow::ensure!(
        LORA_BANDWIDTHS.contains(&cfg.bandwidth_hz),
        "lora.bandwidth_hz is not a LoRa bandwidth"
    );
    anyhow::ensure!(
        cfg.correction_stale_s >= 1.0 && cfg.correction_stale_s <= 300.0,
        "lora.correction_stale_s should be 1..300"
    );
    anyhow::ensure!(
        cfg.max_payload_bytes >= 16 && cfg.max_payload_bytes <= 240,
        "lora.max_payload_bytes should be 16..240"
    );
    anyhow::ensure!(cfg.spi_bus_id <= 2, "lora.spi_bus_id should be 0..2");
    anyhow::ensure!(cfg.spi_cs_id <= 2, "lora.spi_cs_id should be 0..2");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_radio(&RadioConfig::default()).unwrap();
    }

    #[test]
    fn out_of_band_frequency_is_rejected() {
        let cfg = RadioConfig {
            frequency_mhz: 2400.0,
            ..RadioConfig::default()
        };
        assert!(check_radio(&cfg).is_err());
    }

    #[test]
    fn odd_bandwidth_is_rejected() {
        let cfg = RadioConfig {
            bandwidth_hz: 100_000,
            ..RadioConfig::default()
        };
        assert!(check_radio(&cfg).is_err());
    }
}
