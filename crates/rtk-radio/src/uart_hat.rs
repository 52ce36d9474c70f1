//! Pre-flight configuration for SX1262 UART HATs in transparent mode.
//!
//! The module is programmed through a vendor command frame on its 9600-baud
//! config port while M0/M1 select configuration mode:
//! `[C0|C2, 00, 09, ADDH, ADDL, NETID, SERIAL, OPTION, CHANNEL, TXMODE, CRYPTH, CRYPTL]`.

use std::time::Duration;

use anyhow::{Context, Result};
use rppal::gpio::Gpio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::RadioConfig;

const CONFIG_BAUD: u32 = 9600;
const ACK_TIMEOUT: Duration = Duration::from_millis(500);
const ATTEMPTS: usize = 3;

fn air_speed_code(air_speed: u32) -> u8 {
    match air_speed {
        1200 => 0x01,
        2400 => 0x02,
        4800 => 0x03,
        9600 => 0x04,
        19200 => 0x05,
        38400 => 0x06,
        62500 => 0x07,
        other => {
            warn!("Unsupported LoRa air speed {other}, falling back to 2400");
            0x02
        }
    }
}

fn buffer_size_code(buffer_size: u32) -> u8 {
    match buffer_size {
        240 => 0x00,
        128 => 0x40,
        64 => 0x80,
        32 => 0xC0,
        other => {
            warn!("Unsupported LoRa buffer size {other}, falling back to 240");
            0x00
        }
    }
}

fn tx_power_code(tx_power_dbm: i8) -> u8 {
    match tx_power_dbm {
        22 => 0x00,
        17 => 0x01,
        13 => 0x02,
        10 => 0x03,
        other => {
            warn!("Unsupported LoRa TX power {other}dBm, falling back to 22dBm");
            0x00
        }
    }
}

/// The module addresses frequencies as base (410 or 850 MHz) plus a channel
/// index 0..=83.
fn clamp_channel(freq_mhz: f64) -> (u32, u8) {
    let base = if freq_mhz >= 850.0 { 850 } else { 410 };
    let channel = (freq_mhz - base as f64).round().clamp(0.0, 83.0) as u8;
    (base, channel)
}

fn build_frame(cfg: &RadioConfig) -> [u8; 12] {
    let header: u8 = if cfg.uart_hat_persist { 0xC0 } else { 0xC2 };
    let (_, channel) = clamp_channel(cfg.frequency_mhz);
    let serial_cfg = 0x60 + air_speed_code(cfg.uart_hat_air_speed); // UART 9600 + air rate
    let option_cfg = buffer_size_code(cfg.uart_hat_buffer_size) + tx_power_code(cfg.tx_power_dbm) + 0x20; // noise RSSI on
    [
        header,
        0x00,
        0x09,
        (cfg.uart_hat_address >> 8) as u8,
        (cfg.uart_hat_address & 0xFF) as u8,
        cfg.network_id,
        serial_cfg,
        option_cfg,
        channel,
        0x03, // transparent transmission mode
        0x00,
        0x00,
    ]
}

/// Programs the module once per port. Errors are reported to the caller,
/// which logs and proceeds: a module that was already configured by hand
/// keeps working without the handshake.
pub(crate) async fn configure(cfg: &RadioConfig, serial_port: &str) -> Result<()> {
    let frame = build_frame(cfg);

    let gpio = Gpio::new().context("open gpio for UART HAT config")?;
    let mut m0 = gpio
        .get(cfg.uart_hat_m0_pin)
        .with_context(|| format!("claim M0 pin {}", cfg.uart_hat_m0_pin))?
        .into_output();
    let mut m1 = gpio
        .get(cfg.uart_hat_m1_pin)
        .with_context(|| format!("claim M1 pin {}", cfg.uart_hat_m1_pin))?
        .into_output();
    m0.set_reset_on_drop(false);
    m1.set_reset_on_drop(false);

    // Enter configuration mode (M0=0, M1=1).
    m0.set_low();
    m1.set_high();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = program(cfg, serial_port, &frame).await;

    // Return to normal mode (M0=0, M1=0) on every path.
    m0.set_low();
    m1.set_low();

    result
}

async fn program(cfg: &RadioConfig, serial_port: &str, frame: &[u8; 12]) -> Result<()> {
    let mut port = tokio_serial::new(serial_port, CONFIG_BAUD)
        .open_native_async()
        .with_context(|| format!("open UART HAT config port {serial_port}"))?;

    let (base_mhz, channel) = clamp_channel(cfg.frequency_mhz);
    let mut ack = [0u8; 64];
    for attempt in 1..=ATTEMPTS {
        port.write_all(frame).await.context("write config frame")?;
        port.flush().await.ok();
        tokio::time::sleep(Duration::from_millis(250)).await;

        match tokio::time::timeout(ACK_TIMEOUT, port.read(&mut ack)).await {
            Ok(Ok(n)) if n >= 3 && ack[0] == 0xC1 && ack[1] == 0x00 && ack[2] == 0x09 => {
                info!(
                    "UART HAT configured: {:.3}MHz (base={base_mhz} + ch={channel}), net={}, addr={}",
                    cfg.frequency_mhz, cfg.network_id, cfg.uart_hat_address
                );
                return Ok(());
            }
            Ok(Ok(n)) if n > 0 => {
                let hex: String = ack[..n].iter().map(|b| format!("{b:02x}")).collect();
                warn!("UART HAT config ACK mismatch (attempt {attempt}): {hex}");
            }
            _ => {}
        }
    }
    anyhow::bail!(
        "UART HAT config got no ACK on {serial_port}; check the jumper is set to B and M0/M1 jumpers are removed"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_clamping_picks_the_band_base() {
        assert_eq!(clamp_channel(913.0), (850, 63));
        assert_eq!(clamp_channel(868.0), (850, 18));
        assert_eq!(clamp_channel(433.0), (410, 23));
        // Out-of-band requests clamp to the channel range.
        assert_eq!(clamp_channel(999.0), (850, 83));
        assert_eq!(clamp_channel(400.0), (410, 0));
    }

    #[test]
    fn config_frame_layout() {
        let cfg = RadioConfig::default();
        let frame = build_frame(&cfg);
        assert_eq!(frame[0], 0xC0); // persist
        assert_eq!(&frame[1..3], &[0x00, 0x09]);
        assert_eq!(frame[3], 0xFF); // ADDH
        assert_eq!(frame[4], 0xFF); // ADDL
        assert_eq!(frame[5], 18); // network id
        assert_eq!(frame[6], 0x62); // UART 9600 + 2400 air speed
        assert_eq!(frame[7], 0x20); // 240B buffer + 22dBm + RSSI
        assert_eq!(frame[8], 63); // 913 MHz -> channel 63
        assert_eq!(frame[9], 0x03); // transparent mode
    }

    #[test]
    fn volatile_config_uses_c2_header() {
        let cfg = RadioConfig {
            uart_hat_persist: false,
            ..RadioConfig::default()
        };
        assert_eq!(build_frame(&cfg)[0], 0xC2);
    }
}
