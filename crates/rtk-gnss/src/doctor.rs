use anyhow::Result;

use crate::{CorrectionsConfig, GnssConfig};

pub fn check_gnss(cfg: &GnssConfig) -> Result<()> {
    anyhow::ensure!(cfg.baudrate > 0, "gnss.baudrate invalid");
    anyhow::ensure!(
        cfg.fix_stale_s >= 1.0 && cfg.fix_stale_s <= 300.0,
        "gnss.fix_stale_s should be 1..300"
    );
    anyhow::ensure!(
        cfg.sim_lat.abs() <= 90.0 && cfg.sim_lng.abs() <= 180.0,
        "gnss simulated coordinates invalid"
    );
    Ok(())
}

pub fn check_corrections(cfg: &CorrectionsConfig) -> Result<()> {
    match cfg.mode.trim().to_lowercase().as_str() {
        "serial" | "simulate" => {}
        other => anyhow::bail!("corrections.mode unknown: {other}"),
    }
    anyhow::ensure!(cfg.baudrate > 0, "corrections.baudrate invalid");
    anyhow::ensure!(
        cfg.read_chunk_bytes >= 16,
        "corrections.read_chunk_bytes too small"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_gnss(&GnssConfig::default()).unwrap();
        check_corrections(&CorrectionsConfig::default()).unwrap();
    }

    #[test]
    fn bad_mode_is_rejected() {
        let cfg = CorrectionsConfig {
            mode: "carrier-pigeon".into(),
            ..CorrectionsConfig::default()
        };
        assert!(check_corrections(&cfg).is_err());
    }
}
