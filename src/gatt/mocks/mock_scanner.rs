//! Mocked implementation of BleScannerInterface for use in test

use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

use crate::core::uuid::Uuid128Bit;
use crate::gatt::native::BleScannerInterface;
use crate::gatt::scan_settings::{ScanFilter, ScanSettings};

/// Routes calls to BleScannerInterface into a channel of ScannerEvents
pub struct MockScanner(mpsc::UnboundedSender<ScannerEvents>);

impl MockScanner {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<ScannerEvents>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

/// Events representing calls to BleScannerInterface
#[derive(Debug, PartialEq)]
pub enum ScannerEvents {
    RegisterScanner(Uuid128Bit),
    Unregister(u8),
    StartScan(u8, ScanSettings, Vec<ScanFilter>),
    StopScan(u8),
    /// scanner_id, report format
    BatchscanReadReports(u8, i32),
}

impl BleScannerInterface for MockScanner {
    fn register_scanner(&self, app_uuid: Uuid128Bit) {
        self.0.send(ScannerEvents::RegisterScanner(app_uuid)).unwrap();
    }

    fn unregister(&self, scanner_id: u8) {
        self.0.send(ScannerEvents::Unregister(scanner_id)).unwrap();
    }

    fn start_scan(&self, scanner_id: u8, settings: ScanSettings, filters: Vec<ScanFilter>) {
        self.0.send(ScannerEvents::StartScan(scanner_id, settings, filters)).unwrap();
    }

    fn stop_scan(&self, scanner_id: u8) {
        self.0.send(ScannerEvents::StopScan(scanner_id)).unwrap();
    }

    fn batchscan_read_reports(&self, scanner_id: u8, report_format: i32) {
        self.0.send(ScannerEvents::BatchscanReadReports(scanner_id, report_format)).unwrap();
    }
}
