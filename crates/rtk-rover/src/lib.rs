//! Rover runtime: the control loop that reconciles the GNSS fix stream, the
//! radio correction stream and the telemetry consumer into one coherent,
//! continuously refreshed status record.
//!
//! The loop is the single writer of the held fix and status; adapters pump
//! their I/O on their own tasks and expose non-blocking polls. Any channel
//! may fail or stall without blocking the others, and nothing that happens
//! in an adapter terminates the process.

pub mod link;

use std::time::{Duration, Instant};

use anyhow::Result;
use rtk_gnss::GnssAdapter;
use rtk_proto::telemetry::{utc_now, Fix, RoverStatus, TelemetryMessage};
use rtk_radio::CorrectionRadio;
use rtk_telemetry::TelemetryServer;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::link::{ChannelMonitor, LinkState};

#[derive(Debug, Clone)]
pub struct RoverSettings {
    pub device_id: String,
    pub update_hz: f64,
    pub broadcast_hz: f64,
    pub fix_stale_s: f64,
    pub correction_stale_s: f64,
}

pub struct RoverRuntime {
    settings: RoverSettings,
    gnss: Box<dyn GnssAdapter>,
    radio: Option<Box<dyn CorrectionRadio>>,
    telemetry: Option<TelemetryServer>,
    updates: watch::Sender<Option<TelemetryMessage>>,
    startup_warnings: Vec<String>,
    last_error: Option<String>,

    gnss_monitor: ChannelMonitor,
    radio_monitor: ChannelMonitor,
    client_monitor: ChannelMonitor,
    channel_states: [LinkState; 3],

    held_fix: Option<Fix>,
    lora_bytes_rx: u64,
    last_radio_rx_seen: Option<OffsetDateTime>,
    next_broadcast: Option<Instant>,
}

impl RoverRuntime {
    pub fn new(
        settings: RoverSettings,
        gnss: Box<dyn GnssAdapter>,
        radio: Option<Box<dyn CorrectionRadio>>,
        telemetry: Option<TelemetryServer>,
        updates: watch::Sender<Option<TelemetryMessage>>,
        startup_warnings: Vec<String>,
    ) -> Self {
        let fix_window = Duration::from_secs_f64(settings.fix_stale_s.max(0.1));
        let corr_window = Duration::from_secs_f64(settings.correction_stale_s.max(0.1));
        Self {
            settings,
            gnss,
            radio,
            telemetry,
            updates,
            startup_warnings,
            last_error: None,
            gnss_monitor: ChannelMonitor::new(fix_window),
            radio_monitor: ChannelMonitor::new(corr_window),
            // The client link has no data-staleness notion of its own; a
            // present peer counts as data every tick.
            client_monitor: ChannelMonitor::new(corr_window),
            channel_states: [LinkState::Connecting; 3],
            held_fix: None,
            lora_bytes_rx: 0,
            last_radio_rx_seen: None,
            next_broadcast: None,
        }
    }

    /// Runs until the shutdown signal flips, then releases every transport.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let period = Duration::from_secs_f64(1.0 / self.settings.update_hz.max(1.0));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Rover runtime started: poll {:.1}Hz, telemetry {:.1}Hz",
            self.settings.update_hz, self.settings.broadcast_hz
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.tick(Instant::now());
        }

        self.stop_components();
        Ok(())
    }

    /// One pass of the control loop. Split out from `run` so the scheduling
    /// and the reconciliation logic can be exercised separately.
    fn tick(&mut self, now: Instant) {
        // 1. Forward radio corrections into the receiver, in arrival order.
        if let Some(radio) = self.radio.as_mut() {
            for chunk in radio.poll_received() {
                self.lora_bytes_rx += chunk.len() as u64;
                self.gnss.inject_corrections(&chunk);
                self.radio_monitor.note_data(now);
            }
            // Heartbeats bump the adapter's RX clock without producing
            // correction chunks; they still verify the RF path.
            let last_rx = radio.last_rx_utc();
            if last_rx.is_some() && last_rx != self.last_radio_rx_seen {
                self.last_radio_rx_seen = last_rx;
                self.radio_monitor.note_data(now);
            }
        }

        // 2. Latest fix wins; replaced wholesale, never merged.
        if let Some(fix) = self.gnss.latest_fix() {
            if self.held_fix.as_ref() != Some(&fix) {
                self.gnss_monitor.note_data(now);
            }
            self.held_fix = Some(fix);
        }

        // 3. Channel state machines. Each observes only its own transport;
        // a failure on one never feeds into another.
        let gnss_state = self.gnss_monitor.observe(self.gnss.is_connected(), now);
        let radio_up = self
            .radio
            .as_ref()
            .map(|r| r.is_connected())
            .unwrap_or(false);
        let radio_state = self.radio_monitor.observe(radio_up, now);
        let client = self.telemetry.as_ref().and_then(|t| t.client_addr());
        if client.is_some() {
            self.client_monitor.note_data(now);
        }
        let client_state = self.client_monitor.observe(client.is_some(), now);
        self.log_transitions([gnss_state, radio_state, client_state]);

        // 4. Publish a snapshot on the telemetry cadence. `send_replace`
        // keeps the outgoing queue at depth one: latest value wins.
        let due = self.next_broadcast.map(|at| now >= at).unwrap_or(true);
        if due {
            let every = Duration::from_secs_f64(1.0 / self.settings.broadcast_hz.max(1.0));
            self.next_broadcast = Some(now + every);
            let snapshot = self.snapshot(client);
            self.updates.send_replace(Some(snapshot));
        }
    }

    fn snapshot(&self, client: Option<String>) -> TelemetryMessage {
        let mut rover = RoverStatus::new(self.settings.device_id.as_str());
        rover.gnss_connected = self.gnss.is_connected();
        rover.lora_connected = self.radio_monitor.is_live();
        rover.bluetooth_connected = client.is_some();
        rover.bluetooth_client = client;
        rover.lora_bytes_rx = self.lora_bytes_rx;
        rover.last_correction_utc = self.gnss.last_correction_utc();

        let fix = self.held_fix.clone().map(|mut fix| {
            fix.correction_age_s = rover
                .last_correction_utc
                .map(|t| (utc_now() - t).as_seconds_f64().max(0.0));
            fix
        });

        let mut warnings = self.startup_warnings.clone();
        if self.radio.is_some() && !rover.lora_connected {
            warnings.push("Waiting for LoRa corrections".to_string());
        }
        if fix.is_none() {
            warnings.push("Waiting for GNSS fix".to_string());
        }

        TelemetryMessage::new(rover, fix, warnings, self.last_error.clone())
    }

    fn log_transitions(&mut self, states: [LinkState; 3]) {
        const NAMES: [&str; 3] = ["GNSS", "LoRa", "telemetry client"];
        for (i, (old, new)) in self.channel_states.iter().zip(states.iter()).enumerate() {
            if old != new {
                info!("{} channel: {:?} -> {:?}", NAMES[i], old, new);
            }
        }
        self.channel_states = states;
    }

    fn stop_components(&mut self) {
        info!("Rover runtime stopping");
        if let Some(mut telemetry) = self.telemetry.take() {
            telemetry.stop();
        }
        if let Some(mut radio) = self.radio.take() {
            radio.stop();
        }
        self.gnss.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtk_proto::error::LinkError;
    use rtk_proto::telemetry::FixQuality;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct StubGnss {
        inner: Arc<Mutex<StubGnssInner>>,
    }

    #[derive(Default)]
    struct StubGnssInner {
        fix: Option<Fix>,
        connected: bool,
        injected: Vec<u8>,
        last_correction: Option<OffsetDateTime>,
    }

    impl StubGnss {
        fn set_fix(&self, fix: Fix) {
            self.inner.lock().unwrap().fix = Some(fix);
        }

        fn set_connected(&self, up: bool) {
            self.inner.lock().unwrap().connected = up;
        }

        fn injected(&self) -> Vec<u8> {
            self.inner.lock().unwrap().injected.clone()
        }
    }

    impl GnssAdapter for StubGnss {
        fn latest_fix(&self) -> Option<Fix> {
            self.inner.lock().unwrap().fix.clone()
        }

        fn inject_corrections(&self, payload: &[u8]) {
            let mut inner = self.inner.lock().unwrap();
            inner.injected.extend_from_slice(payload);
            inner.last_correction = Some(utc_now());
        }

        fn is_connected(&self) -> bool {
            self.inner.lock().unwrap().connected
        }

        fn last_correction_utc(&self) -> Option<OffsetDateTime> {
            self.inner.lock().unwrap().last_correction
        }

        fn stop(&mut self) {
            self.set_connected(false);
        }
    }

    #[derive(Clone, Default)]
    struct StubRadio {
        inner: Arc<Mutex<StubRadioInner>>,
    }

    #[derive(Default)]
    struct StubRadioInner {
        queued: VecDeque<Bytes>,
        connected: bool,
        last_rx: Option<OffsetDateTime>,
    }

    impl StubRadio {
        fn connected() -> Self {
            let radio = Self::default();
            radio.inner.lock().unwrap().connected = true;
            radio
        }

        fn queue(&self, chunk: &[u8]) {
            let mut inner = self.inner.lock().unwrap();
            inner.queued.push_back(Bytes::copy_from_slice(chunk));
            inner.last_rx = Some(utc_now());
        }

        fn fail(&self) {
            self.inner.lock().unwrap().connected = false;
        }
    }

    impl CorrectionRadio for StubRadio {
        fn open(&mut self) -> Result<(), LinkError> {
            Ok(())
        }

        fn send(&self, payload: Bytes) -> Result<usize, LinkError> {
            Ok(payload.len())
        }

        fn poll_received(&mut self) -> Vec<Bytes> {
            self.inner.lock().unwrap().queued.drain(..).collect()
        }

        fn is_connected(&self) -> bool {
            self.inner.lock().unwrap().connected
        }

        fn bytes_received(&self) -> u64 {
            0
        }

        fn bytes_sent(&self) -> u64 {
            0
        }

        fn last_rx_utc(&self) -> Option<OffsetDateTime> {
            self.inner.lock().unwrap().last_rx
        }

        fn last_tx_utc(&self) -> Option<OffsetDateTime> {
            None
        }

        fn stop(&mut self) {
            self.fail();
        }
    }

    fn settings() -> RoverSettings {
        RoverSettings {
            device_id: "ROVER-01".into(),
            update_hz: 5.0,
            broadcast_hz: 4.0,
            fix_stale_s: 5.0,
            correction_stale_s: 10.0,
        }
    }

    fn fix_at(lat: f64, lng: f64) -> Fix {
        Fix {
            timestamp_utc: utc_now(),
            lat,
            lng,
            quality: FixQuality::RtkFloat,
            alt_m: None,
            accuracy_m: None,
            hdop: None,
            satellites: Some(12),
            correction_age_s: None,
        }
    }

    fn runtime(
        gnss: &StubGnss,
        radio: Option<&StubRadio>,
    ) -> (RoverRuntime, watch::Receiver<Option<TelemetryMessage>>) {
        let (tx, rx) = watch::channel(None);
        let runtime = RoverRuntime::new(
            settings(),
            Box::new(gnss.clone()),
            radio.map(|r| Box::new(r.clone()) as Box<dyn CorrectionRadio>),
            None,
            tx,
            Vec::new(),
        );
        (runtime, rx)
    }

    #[test]
    fn corrections_forward_in_arrival_order() {
        let gnss = StubGnss::default();
        let radio = StubRadio::connected();
        let (mut runtime, _rx) = runtime(&gnss, Some(&radio));

        let t0 = Instant::now();
        radio.queue(b"\xd3AAA");
        radio.queue(b"BB");
        runtime.tick(t0);
        assert_eq!(gnss.injected(), b"\xd3AAABB");

        radio.queue(b"CCCC");
        runtime.tick(t0 + Duration::from_millis(200));
        assert_eq!(gnss.injected(), b"\xd3AAABBCCCC");
    }

    #[test]
    fn forwarded_bytes_count_into_status() {
        let gnss = StubGnss::default();
        let radio = StubRadio::connected();
        let (mut runtime, rx) = runtime(&gnss, Some(&radio));

        radio.queue(b"12345");
        radio.queue(b"678");
        runtime.tick(Instant::now());
        let msg = rx.borrow().clone().unwrap();
        assert_eq!(msg.rover.lora_bytes_rx, 8);
        assert!(msg.rover.lora_connected);
    }

    #[test]
    fn newest_fix_replaces_the_previous_one_entirely() {
        let gnss = StubGnss::default();
        gnss.set_connected(true);
        let (mut runtime, rx) = runtime(&gnss, None);

        let t0 = Instant::now();
        let first = fix_at(49.0, -123.0);
        gnss.set_fix(first);
        runtime.tick(t0);

        let mut second = fix_at(49.5, -123.5);
        second.alt_m = Some(11.0);
        second.satellites = None;
        gnss.set_fix(second.clone());
        runtime.tick(t0 + Duration::from_secs(1));

        let msg = rx.borrow().clone().unwrap();
        // No field-level merge: the snapshot equals the second fix exactly.
        assert_eq!(msg.fix, Some(second));
    }

    #[test]
    fn silent_radio_goes_stale_while_gnss_keeps_fixing() {
        let gnss = StubGnss::default();
        gnss.set_connected(true);
        gnss.set_fix(fix_at(49.0, -123.0));
        let radio = StubRadio::connected();
        let (mut runtime, rx) = runtime(&gnss, Some(&radio));

        let t0 = Instant::now();
        radio.queue(b"seed");
        runtime.tick(t0);
        assert!(rx.borrow().clone().unwrap().rover.lora_connected);

        // Past the correction staleness window with no new radio bytes: the
        // radio reads down even though the transport still claims open, and
        // the rover's own fix stays available.
        gnss.set_fix(fix_at(49.0001, -123.0001));
        runtime.tick(t0 + Duration::from_secs(11));
        let msg = rx.borrow().clone().unwrap();
        assert!(!msg.rover.lora_connected);
        assert!(msg.fix.is_some());
        assert!(msg
            .warnings
            .iter()
            .any(|w| w == "Waiting for LoRa corrections"));
    }

    #[test]
    fn radio_hard_error_does_not_interrupt_fix_updates() {
        let gnss = StubGnss::default();
        gnss.set_connected(true);
        let radio = StubRadio::connected();
        let (mut runtime, rx) = runtime(&gnss, Some(&radio));

        let t0 = Instant::now();
        radio.queue(b"ok");
        gnss.set_fix(fix_at(49.0, -123.0));
        runtime.tick(t0);
        assert_eq!(runtime.radio_monitor.state(), LinkState::Connected);

        radio.fail();
        let second = fix_at(49.1, -123.1);
        gnss.set_fix(second.clone());
        runtime.tick(t0 + Duration::from_secs(1));

        assert_eq!(runtime.radio_monitor.state(), LinkState::Disconnected);
        assert_eq!(runtime.gnss_monitor.state(), LinkState::Connected);
        let msg = rx.borrow().clone().unwrap();
        assert!(!msg.rover.lora_connected);
        let got = msg.fix.expect("fix survives the radio failure");
        assert_eq!((got.lat, got.lng), (second.lat, second.lng));

        // Next observation reads as the retry in progress.
        runtime.tick(t0 + Duration::from_secs(2));
        assert_eq!(runtime.radio_monitor.state(), LinkState::Connecting);
    }

    #[test]
    fn broadcast_queue_depth_never_exceeds_one() {
        let gnss = StubGnss::default();
        let (mut runtime, rx) = runtime(&gnss, None);

        // Push snapshots far faster than any consumer drains them.
        let t0 = Instant::now();
        for i in 0..20 {
            runtime.lora_bytes_rx = i;
            runtime.tick(t0 + Duration::from_secs(i));
        }
        // Only the most recent snapshot is observable.
        let msg = rx.borrow().clone().unwrap();
        assert_eq!(msg.rover.lora_bytes_rx, 19);
    }

    #[test]
    fn no_fix_yields_waiting_warning() {
        let gnss = StubGnss::default();
        let (mut runtime, rx) = runtime(&gnss, None);
        runtime.tick(Instant::now());
        let msg = rx.borrow().clone().unwrap();
        assert!(msg.fix.is_none());
        assert!(msg.warnings.iter().any(|w| w == "Waiting for GNSS fix"));
        // No radio configured: no LoRa warning, and no stale LoRa flag.
        assert!(!msg.rover.lora_connected);
        assert!(!msg.warnings.iter().any(|w| w.contains("LoRa")));
    }
}
