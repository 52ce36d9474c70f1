use anyhow::Result;

use crate::TelemetryConfig;

pub fn check_telemetry(cfg: &TelemetryConfig) -> Result<()> {
    anyhow::ensure!(
        cfg.listen_addr.parse::<std::net::SocketAddr>().is_ok(),
        "telemetry.listen_addr is not host:port"
    );
    anyhow::ensure!(
        cfg.broadcast_hz >= 0.1 && cfg.broadcast_hz <= 50.0,
        "telemetry.broadcast_hz should be 0.1..50"
    );
    anyhow::ensure!(
        cfg.write_timeout_ms >= 50 && cfg.write_timeout_ms <= 10_000,
        "telemetry.write_timeout_ms should be 50..10000"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_telemetry(&TelemetryConfig::default()).unwrap();
    }

    #[test]
    fn hostname_addr_is_rejected() {
        let cfg = TelemetryConfig {
            listen_addr: "rover.local:7870".into(),
            ..TelemetryConfig::default()
        };
        assert!(check_telemetry(&cfg).is_err());
    }
}
