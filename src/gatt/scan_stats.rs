//! Per-application scan accounting: rolling history of scan sessions, aggregate timing, rate
//! limiting, and battery accounting notes.

use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{
    GattConfig, EXCESSIVE_SCANNING_PERIOD_MS, NUM_SCAN_DURATIONS_KEPT,
    NUM_SCAN_RESULTS_PER_BATTERY_NOTE, SCAN_TIMEOUT_MS,
};
use crate::gatt::scan_settings::{ScanMode, ScanSettings};

/// External battery/usage accounting service. Failures are logged and otherwise ignored.
pub trait BatteryStatsReporter: Send + Sync {
    fn note_ble_scan_started(&self, uid: u32, is_unoptimized: bool) -> anyhow::Result<()>;
    fn note_ble_scan_stopped(&self, uid: u32, is_unoptimized: bool) -> anyhow::Result<()>;
    fn note_ble_scan_results(&self, uid: u32, num_results: u32) -> anyhow::Result<()>;
}

/// Limits applied to every app's scanning.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanLimits {
    pub num_scan_durations_kept: usize,
    pub excessive_scanning_period: Duration,
    pub scan_timeout: Duration,
    pub results_per_battery_note: u32,
}

impl Default for ScanLimits {
    fn default() -> Self {
        ScanLimits {
            num_scan_durations_kept: NUM_SCAN_DURATIONS_KEPT,
            excessive_scanning_period: Duration::from_millis(EXCESSIVE_SCANNING_PERIOD_MS),
            scan_timeout: Duration::from_millis(SCAN_TIMEOUT_MS),
            results_per_battery_note: NUM_SCAN_RESULTS_PER_BATTERY_NOTE,
        }
    }
}

impl From<&GattConfig> for ScanLimits {
    fn from(config: &GattConfig) -> Self {
        ScanLimits {
            num_scan_durations_kept: config.num_scan_durations_kept,
            excessive_scanning_period: config.excessive_scanning_period,
            scan_timeout: config.scan_timeout,
            results_per_battery_note: config.results_per_battery_note,
        }
    }
}

/// One scan session, ongoing or finished.
#[derive(Clone, Debug)]
pub struct LastScan {
    pub scanner_id: i32,
    pub timestamp: Instant,
    pub duration: Duration,
    pub suspend_duration: Duration,
    pub suspend_start: Option<Instant>,
    pub is_filtered: bool,
    pub is_opportunistic: bool,
    pub is_background: bool,
    pub results: u32,
    pub scan_mode: ScanMode,
}

impl LastScan {
    pub fn is_suspended(&self) -> bool {
        self.suspend_start.is_some()
    }

    fn is_unoptimized(&self) -> bool {
        !(self.is_filtered || self.is_background || self.is_opportunistic)
    }
}

pub struct AppScanStats {
    pub app_name: String,
    pub uid: u32,
    limits: ScanLimits,
    reporter: Arc<dyn BatteryStatsReporter>,

    ongoing: HashMap<i32, LastScan>,
    recent: VecDeque<LastScan>,

    scans_started: u32,
    scans_stopped: u32,
    results_count: u64,
    opportunistic_scans: u32,
    filtered_scans: u32,

    // App-level wall clock: starts with the first concurrent session, ends with the last.
    scan_start_time: Option<Instant>,
    app_sessions: u32,
    min_scan_time: Option<Duration>,
    max_scan_time: Duration,
    total_scan_time: Duration,
}

impl AppScanStats {
    pub fn new(
        app_name: String,
        uid: u32,
        limits: ScanLimits,
        reporter: Arc<dyn BatteryStatsReporter>,
    ) -> Self {
        AppScanStats {
            app_name,
            uid,
            limits,
            reporter,
            ongoing: HashMap::new(),
            recent: VecDeque::new(),
            scans_started: 0,
            scans_stopped: 0,
            results_count: 0,
            opportunistic_scans: 0,
            filtered_scans: 0,
            scan_start_time: None,
            app_sessions: 0,
            min_scan_time: None,
            max_scan_time: Duration::ZERO,
            total_scan_time: Duration::ZERO,
        }
    }

    /// Starts tracking the session of `scanner_id`. Does nothing if it is already tracked.
    pub fn record_scan_start(
        &mut self,
        settings: &ScanSettings,
        is_filtered: bool,
        scanner_id: i32,
    ) {
        if self.ongoing.contains_key(&scanner_id) {
            debug!("Scan {} of {} already recorded", scanner_id, self.app_name);
            return;
        }

        let now = Instant::now();
        let scan = LastScan {
            scanner_id,
            timestamp: now,
            duration: Duration::ZERO,
            suspend_duration: Duration::ZERO,
            suspend_start: None,
            is_filtered,
            is_opportunistic: settings.scan_mode == ScanMode::Opportunistic,
            is_background: settings.is_background(),
            results: 0,
            scan_mode: settings.scan_mode,
        };

        self.scans_started += 1;
        if scan.is_opportunistic {
            self.opportunistic_scans += 1;
        }
        if is_filtered {
            self.filtered_scans += 1;
        }
        if self.ongoing.is_empty() {
            self.scan_start_time = Some(now);
        }

        if let Err(e) = self.reporter.note_ble_scan_started(self.uid, scan.is_unoptimized()) {
            warn!("Failed to note scan start for uid {}: {}", self.uid, e);
        }
        self.ongoing.insert(scanner_id, scan);
    }

    /// Finishes the session of `scanner_id` and files it into the history.
    pub fn record_scan_stop(&mut self, scanner_id: i32) {
        let mut scan = match self.ongoing.remove(&scanner_id) {
            Some(scan) => scan,
            None => {
                debug!("Scan {} of {} was never recorded", scanner_id, self.app_name);
                return;
            }
        };

        let now = Instant::now();
        self.scans_stopped += 1;
        scan.duration = now.duration_since(scan.timestamp);
        if let Some(start) = scan.suspend_start.take() {
            scan.suspend_duration += now.duration_since(start);
        }

        let leftover = scan.results % self.results_per_note();
        if leftover > 0 {
            self.note_results(leftover);
        }
        if let Err(e) = self.reporter.note_ble_scan_stopped(self.uid, scan.is_unoptimized()) {
            warn!("Failed to note scan stop for uid {}: {}", self.uid, e);
        }

        self.recent.push_back(scan);
        while self.recent.len() > self.limits.num_scan_durations_kept {
            self.recent.pop_front();
        }

        if self.ongoing.is_empty() {
            if let Some(start) = self.scan_start_time.take() {
                let total = now.duration_since(start);
                self.app_sessions += 1;
                self.total_scan_time += total;
                self.min_scan_time = Some(self.min_scan_time.map_or(total, |min| min.min(total)));
                self.max_scan_time = self.max_scan_time.max(total);
            }
        }
    }

    pub fn record_scan_suspend(&mut self, scanner_id: i32) {
        match self.ongoing.get_mut(&scanner_id) {
            Some(scan) if !scan.is_suspended() => scan.suspend_start = Some(Instant::now()),
            _ => debug!("Scan {} can't be suspended", scanner_id),
        }
    }

    pub fn record_scan_resume(&mut self, scanner_id: i32) {
        match self.ongoing.get_mut(&scanner_id) {
            Some(scan) => {
                if let Some(start) = scan.suspend_start.take() {
                    scan.suspend_duration += Instant::now().duration_since(start);
                }
            }
            None => debug!("Scan {} can't be resumed", scanner_id),
        }
    }

    /// Counts a result delivered to `scanner_id`, noting battery stats once per batch.
    pub fn add_result(&mut self, scanner_id: i32) {
        let batch = self.results_per_note();
        let results = match self.ongoing.get_mut(&scanner_id) {
            Some(scan) => {
                scan.results += 1;
                scan.results
            }
            None => return,
        };
        self.results_count += 1;
        if results % batch == 0 {
            self.note_results(batch);
        }
    }

    // A zero batch size means every result is noted on its own.
    fn results_per_note(&self) -> u32 {
        self.limits.results_per_battery_note.max(1)
    }

    fn note_results(&self, num_results: u32) {
        if let Err(e) = self.reporter.note_ble_scan_results(self.uid, num_results) {
            warn!("Failed to note scan results for uid {}: {}", self.uid, e);
        }
    }

    /// True when the history is full and its oldest session started within the excessive
    /// scanning period.
    pub fn is_scanning_too_frequently(&self) -> bool {
        if self.recent.len() < self.limits.num_scan_durations_kept {
            return false;
        }
        match self.recent.front() {
            Some(oldest) => {
                let since_oldest = Instant::now().duration_since(oldest.timestamp);
                since_oldest < self.limits.excessive_scanning_period
            }
            None => false,
        }
    }

    /// True when some session has been running unsuspended for longer than the scan timeout.
    pub fn is_scanning_too_long(&self) -> bool {
        self.scanners_running_too_long().next().is_some()
    }

    /// Scanners whose sessions have exceeded the scan timeout without being suspended.
    pub fn scanners_running_too_long(&self) -> impl Iterator<Item = i32> + '_ {
        let now = Instant::now();
        self.ongoing
            .values()
            .filter(move |scan| {
                !scan.is_suspended()
                    && now.duration_since(scan.timestamp) > self.limits.scan_timeout
            })
            .map(|scan| scan.scanner_id)
    }

    pub fn is_scanning(&self) -> bool {
        !self.ongoing.is_empty()
    }

    pub fn ongoing_scan(&self, scanner_id: i32) -> Option<&LastScan> {
        self.ongoing.get(&scanner_id)
    }

    /// Finished sessions, oldest first.
    pub fn recent_scans(&self) -> impl Iterator<Item = &LastScan> {
        self.recent.iter()
    }

    pub fn scans_started(&self) -> u32 {
        self.scans_started
    }

    pub fn scans_stopped(&self) -> u32 {
        self.scans_stopped
    }

    pub fn results_count(&self) -> u64 {
        self.results_count
    }

    pub fn total_scan_time(&self) -> Duration {
        self.total_scan_time
    }

    pub fn min_scan_time(&self) -> Duration {
        self.min_scan_time.unwrap_or(Duration::ZERO)
    }

    pub fn max_scan_time(&self) -> Duration {
        self.max_scan_time
    }

    pub fn average_scan_time(&self) -> Duration {
        if self.app_sessions == 0 {
            return Duration::ZERO;
        }
        self.total_scan_time / self.app_sessions
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "  {} (uid {}){}{}",
            self.app_name,
            self.uid,
            if self.is_scanning() { " (scanning)" } else { "" },
            if self.is_scanning_too_frequently() { " (too frequent)" } else { "" },
        );
        let _ = writeln!(
            out,
            "    started={} stopped={} opportunistic={} filtered={} results={}",
            self.scans_started,
            self.scans_stopped,
            self.opportunistic_scans,
            self.filtered_scans,
            self.results_count
        );
        let _ = writeln!(
            out,
            "    scan time min={:?} max={:?} avg={:?} total={:?}",
            self.min_scan_time(),
            self.max_scan_time(),
            self.average_scan_time(),
            self.total_scan_time
        );
        for scan in &self.recent {
            let _ = writeln!(
                out,
                "    last: scanner={} mode={:?} duration={:?} suspended={:?} results={}{}",
                scan.scanner_id,
                scan.scan_mode,
                scan.duration,
                scan.suspend_duration,
                scan.results,
                if scan.is_filtered { " filtered" } else { "" }
            );
        }
        for scan in self.ongoing.values() {
            let _ = writeln!(
                out,
                "    ongoing: scanner={} mode={:?} for {:?}{}",
                scan.scanner_id,
                scan.scan_mode,
                scan.timestamp.elapsed(),
                if scan.is_suspended() { " suspended" } else { "" }
            );
        }
    }
}
