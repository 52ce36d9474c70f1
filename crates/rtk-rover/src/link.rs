//! Per-channel link state machine.
//!
//! Each channel (GNSS, radio, telemetry client) gets its own monitor. The
//! adapters handle the physical retry cadence; the monitor only derives a
//! reportable state from the raw transport flag plus data recency, so "port
//! open but silent" and "port gone" stay distinguishable.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Stale,
}

#[derive(Debug)]
pub struct ChannelMonitor {
    staleness: Duration,
    state: LinkState,
    last_data: Option<Instant>,
}

impl ChannelMonitor {
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            state: LinkState::Connecting,
            last_data: None,
        }
    }

    /// Records that fresh data arrived on this channel.
    pub fn note_data(&mut self, now: Instant) {
        self.last_data = Some(now);
    }

    /// Reconciles the raw transport flag with data recency.
    ///
    /// A transport drop from a live state reads as `Disconnected` for one
    /// observation, then `Connecting` while the adapter retries. An open
    /// transport is `Connected` only while data is inside the staleness
    /// window; it degrades to `Stale` purely by time, without closing
    /// anything.
    pub fn observe(&mut self, transport_up: bool, now: Instant) -> LinkState {
        self.state = if !transport_up {
            match self.state {
                LinkState::Connected | LinkState::Stale => LinkState::Disconnected,
                LinkState::Disconnected | LinkState::Connecting => LinkState::Connecting,
            }
        } else {
            match self.last_data {
                None => LinkState::Connecting,
                Some(t) if now.duration_since(t) <= self.staleness => LinkState::Connected,
                Some(_) => LinkState::Stale,
            }
        };
        self.state
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Live means `Connected` exactly; `Stale` and `Disconnected` both
    /// report as down in the telemetry booleans.
    pub fn is_live(&self) -> bool {
        self.state == LinkState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[test]
    fn starts_connecting() {
        let monitor = ChannelMonitor::new(WINDOW);
        assert_eq!(monitor.state(), LinkState::Connecting);
        assert!(!monitor.is_live());
    }

    #[test]
    fn open_transport_without_data_is_not_live() {
        let mut monitor = ChannelMonitor::new(WINDOW);
        let now = Instant::now();
        assert_eq!(monitor.observe(true, now), LinkState::Connecting);
        assert!(!monitor.is_live());
    }

    #[test]
    fn goes_live_on_data_and_stale_exactly_past_the_window() {
        let mut monitor = ChannelMonitor::new(WINDOW);
        let t0 = Instant::now();
        monitor.note_data(t0);
        assert_eq!(monitor.observe(true, t0), LinkState::Connected);
        assert_eq!(monitor.observe(true, t0 + WINDOW), LinkState::Connected);
        assert_eq!(
            monitor.observe(true, t0 + WINDOW + Duration::from_millis(1)),
            LinkState::Stale
        );
        assert!(!monitor.is_live());
    }

    #[test]
    fn staleness_ignores_the_raw_transport_flag() {
        let mut monitor = ChannelMonitor::new(WINDOW);
        let t0 = Instant::now();
        monitor.note_data(t0);
        // Transport still claims open, but the window has elapsed.
        assert_eq!(
            monitor.observe(true, t0 + WINDOW * 2),
            LinkState::Stale
        );
        // Fresh data with the transport down is not live either.
        monitor.note_data(t0 + WINDOW * 2);
        assert_ne!(
            monitor.observe(false, t0 + WINDOW * 2),
            LinkState::Connected
        );
    }

    #[test]
    fn hard_drop_reads_disconnected_then_connecting() {
        let mut monitor = ChannelMonitor::new(WINDOW);
        let t0 = Instant::now();
        monitor.note_data(t0);
        assert_eq!(monitor.observe(true, t0), LinkState::Connected);
        assert_eq!(monitor.observe(false, t0), LinkState::Disconnected);
        assert_eq!(monitor.observe(false, t0), LinkState::Connecting);
        // Recovery: transport back with fresh data.
        monitor.note_data(t0 + Duration::from_secs(1));
        assert_eq!(
            monitor.observe(true, t0 + Duration::from_secs(1)),
            LinkState::Connected
        );
    }

    #[test]
    fn stale_then_drop_reads_disconnected() {
        let mut monitor = ChannelMonitor::new(WINDOW);
        let t0 = Instant::now();
        monitor.note_data(t0);
        assert_eq!(monitor.observe(true, t0 + WINDOW * 2), LinkState::Stale);
        assert_eq!(monitor.observe(false, t0 + WINDOW * 2), LinkState::Disconnected);
    }
}
