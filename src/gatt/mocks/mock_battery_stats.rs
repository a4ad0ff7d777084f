//! Mocked implementation of BatteryStatsReporter for use in test

use anyhow::bail;
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

use crate::gatt::scan_stats::BatteryStatsReporter;

/// Routes calls to BatteryStatsReporter into a channel of BatteryEvents
pub struct MockBatteryStats {
    tx: mpsc::UnboundedSender<BatteryEvents>,
    failing: bool,
}

impl MockBatteryStats {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<BatteryEvents>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx, failing: false }, rx)
    }

    /// A reporter that records every call and then fails it, like an unreachable service.
    pub fn new_failing() -> (Self, UnboundedReceiver<BatteryEvents>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx, failing: true }, rx)
    }

    fn record(&self, event: BatteryEvents) -> anyhow::Result<()> {
        self.tx.send(event).unwrap();
        if self.failing {
            bail!("battery stats service unavailable");
        }
        Ok(())
    }
}

/// Events representing calls to BatteryStatsReporter
#[derive(Debug, PartialEq, Eq)]
pub enum BatteryEvents {
    /// uid, is_unoptimized
    ScanStarted(u32, bool),
    /// uid, is_unoptimized
    ScanStopped(u32, bool),
    /// uid, num_results
    ScanResults(u32, u32),
}

impl BatteryStatsReporter for MockBatteryStats {
    fn note_ble_scan_started(&self, uid: u32, is_unoptimized: bool) -> anyhow::Result<()> {
        self.record(BatteryEvents::ScanStarted(uid, is_unoptimized))
    }

    fn note_ble_scan_stopped(&self, uid: u32, is_unoptimized: bool) -> anyhow::Result<()> {
        self.record(BatteryEvents::ScanStopped(uid, is_unoptimized))
    }

    fn note_ble_scan_results(&self, uid: u32, num_results: u32) -> anyhow::Result<()> {
        self.record(BatteryEvents::ScanResults(uid, num_results))
    }
}
