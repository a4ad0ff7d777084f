//! LE scanning on behalf of registered scanners.
//!
//! A scanner registers first and is granted a scanner id by the controller; scans are then
//! started and stopped under that id. Scanners come in two flavors: those with a callback object
//! (the caller starts the scan once registered) and those backed by a pending intent, which carry
//! their settings along and start scanning as soon as registration completes.
//!
//! Started scans live in one of three queues. Regular scans get every advertisement delivered as
//! it arrives, batch scans get them from the controller in packed reports, and suspended scans
//! get nothing until resumed.

use log::{debug, error, info, warn};
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::core::liveness::{link_to_death, unlink_to_death, RPCProxy};
use crate::core::uuid::{Uuid128Bit, UuidHelper};
use crate::gatt::batch_scan::{
    parse_batch_scan_results, REPORT_FORMAT_FULL, REPORT_FORMAT_TRUNCATED,
};
use crate::gatt::context_map::{App, CallerIdentity, ContextMap};
use crate::gatt::native::{AdvertisingTrackInfo, BleScannerInterface, ScannerCallbacks};
use crate::gatt::scan_record::ScanRecord;
use crate::gatt::scan_settings::{
    CallbackType, ScanFilter, ScanMode, ScanResult, ScanResultType, ScanSettings,
};
use crate::gatt::scan_stats::{BatteryStatsReporter, ScanLimits};
use crate::gatt::status::ScanStatus;
use crate::Message;

/// Advertisement tracking states of `AdvertisingTrackInfo::advertiser_state`.
const ADV_STATE_ON_FOUND: u8 = 0;
const ADV_STATE_ON_LOST: u8 = 1;

/// Event type bit set for legacy advertisements.
const EVENT_TYPE_LEGACY: u16 = 0x10;

/// Scan data length legacy scanners expect, regardless of what was received.
const LEGACY_SCAN_DATA_LEN: usize = 62;

pub trait IScannerCallback: RPCProxy + Send + Sync {
    /// Outcome of `register_scanner`. `scanner_id` is -1 unless `status` is success.
    fn on_scanner_registered(&self, uuid: Uuid128Bit, scanner_id: i32, status: ScanStatus);

    fn on_scan_result(&self, result: ScanResult);

    fn on_batch_scan_results(&self, results: Vec<ScanResult>);

    /// A tracked advertiser was first seen (`on_found`) or lost.
    fn on_found_or_lost(&self, on_found: bool, result: ScanResult);

    fn on_scan_manager_error(&self, error: ScanStatus);
}

/// Delivery target of a scanner that was started without a callback object.
pub trait IScanIntent: Send + Sync {
    /// Identifies the intent, so that a later stop request can find its scanner.
    fn get_object_id(&self) -> String;

    /// Fails if the intent was canceled by its owner.
    fn send_results(
        &self,
        results: Vec<ScanResult>,
        callback_type: CallbackType,
    ) -> anyhow::Result<()>;

    fn send_error(&self, error: ScanStatus) -> anyhow::Result<()>;
}

/// Context of a scanner backed by a pending intent.
#[derive(Clone)]
pub struct PendingIntentInfo {
    pub intent: Arc<dyn IScanIntent>,
    pub settings: ScanSettings,
    pub filters: Vec<ScanFilter>,
    pub calling_package: String,
}

pub type ScannerMap = ContextMap<dyn IScannerCallback, PendingIntentInfo>;
type ScannerApp = App<dyn IScannerCallback, PendingIntentInfo>;

/// A started scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanClient {
    pub scanner_id: i32,
    pub settings: ScanSettings,
    pub filters: Vec<ScanFilter>,
    /// 16-bit service UUIDs that must all be advertised for a result to be delivered.
    pub uuids: Vec<Uuid128Bit>,
}

impl ScanClient {
    fn matches_filters(&self, result: &ScanResult) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(result))
    }

    fn report_format(&self) -> i32 {
        match self.settings.scan_result_type {
            ScanResultType::Abbreviated => REPORT_FORMAT_TRUNCATED,
            ScanResultType::Full => REPORT_FORMAT_FULL,
        }
    }
}

pub struct ScanManager {
    scanners: ScannerMap,
    native: Arc<dyn BleScannerInterface>,
    tx: UnboundedSender<Message>,
    regular_queue: Vec<ScanClient>,
    batch_queue: Vec<ScanClient>,
    suspended_queue: Vec<ScanClient>,
    max_scan_filters: usize,
    start_time: Instant,
}

impl ScanManager {
    pub fn new(
        native: Arc<dyn BleScannerInterface>,
        tx: UnboundedSender<Message>,
        limits: ScanLimits,
        battery_stats: Arc<dyn BatteryStatsReporter>,
        max_scan_filters: usize,
    ) -> Self {
        ScanManager {
            scanners: ContextMap::with_scan_stats(limits, battery_stats),
            native,
            tx,
            regular_queue: vec![],
            batch_queue: vec![],
            suspended_queue: vec![],
            max_scan_filters,
            start_time: Instant::now(),
        }
    }

    pub fn scanners(&self) -> &ScannerMap {
        &self.scanners
    }

    pub fn regular_scan_queue(&self) -> &[ScanClient] {
        &self.regular_queue
    }

    pub fn batch_scan_queue(&self) -> &[ScanClient] {
        &self.batch_queue
    }

    pub fn suspended_scan_queue(&self) -> &[ScanClient] {
        &self.suspended_queue
    }

    /// Batch scans that get full records.
    pub fn full_batch_scan_queue(&self) -> impl Iterator<Item = &ScanClient> {
        self.batch_queue.iter().filter(|c| c.settings.scan_result_type == ScanResultType::Full)
    }

    fn now_nanos(&self) -> u64 {
        self.start_time.elapsed().as_nanos() as u64
    }

    fn all_clients(&self) -> impl Iterator<Item = &ScanClient> {
        self.regular_queue.iter().chain(self.batch_queue.iter()).chain(self.suspended_queue.iter())
    }

    fn find_client(&self, scanner_id: i32) -> Option<&ScanClient> {
        self.all_clients().find(|c| c.scanner_id == scanner_id)
    }

    fn used_filter_slots(&self) -> usize {
        self.all_clients().map(|c| c.filters.len()).sum()
    }

    fn is_rate_limited(app: &ScannerApp) -> bool {
        if app.is_privileged {
            return false;
        }
        app.app_scan_stats
            .as_ref()
            .map_or(false, |stats| stats.lock().unwrap().is_scanning_too_frequently())
    }

    /// Registers a scanner. Returns the uuid the registration is correlated with; the outcome
    /// is reported through `on_scanner_registered`.
    pub fn register_scanner(
        &mut self,
        callback: Arc<dyn IScannerCallback>,
        caller: &CallerIdentity,
    ) -> anyhow::Result<Uuid128Bit> {
        let uuid = UuidHelper::random();
        debug!("register_scanner: uuid={}", UuidHelper::to_string(&uuid));

        let app = self.scanners.add(
            uuid,
            callback.get_object_id(),
            caller,
            Some(callback.clone()),
            None,
        )?;

        if Self::is_rate_limited(&app) {
            error!("App '{}' is scanning too frequently", caller.app_name);
            self.scanners.remove(app.id);
            callback.on_scanner_registered(uuid, -1, ScanStatus::ScanningTooFrequently);
            return Ok(uuid);
        }

        self.native.register_scanner(uuid);
        Ok(uuid)
    }

    pub fn on_scanner_registered(&mut self, uuid: Uuid128Bit, scanner_id: u8, status: u8) {
        let status = ScanStatus::from_raw(status);
        debug!(
            "on_scanner_registered: uuid={} scanner_id={} status={:?}",
            UuidHelper::to_string(&uuid),
            scanner_id,
            status
        );

        let app = match self.scanners.get_by_uuid(&uuid) {
            Some(app) => app,
            None => {
                warn!("No scanner registration for {}", UuidHelper::to_string(&uuid));
                if status == ScanStatus::Success {
                    self.native.unregister(scanner_id);
                }
                return;
            }
        };

        if status != ScanStatus::Success {
            self.scanners.remove_by_uuid(&uuid);
            if let Some(cb) = &app.callback {
                cb.on_scanner_registered(uuid, -1, status);
            }
            return;
        }

        let id = scanner_id as i32;
        if !self.scanners.promote_by_uuid(&uuid, id) {
            warn!("Scanner {} could not be activated", id);
            return;
        }

        match (&app.callback, &app.info) {
            (Some(cb), _) => {
                match link_to_death(cb.as_ref(), &self.tx, move || Message::ScannerDied(id)) {
                    Ok(link) => self.scanners.set_death_link(id, Some(link)),
                    Err(e) => {
                        // Nobody is left to use the scanner.
                        warn!("Scanner {} owner is gone: {}", id, e);
                        self.scanners.remove(id);
                        self.native.unregister(scanner_id);
                        return;
                    }
                }
                cb.on_scanner_registered(uuid, id, status);
            }
            (None, Some(info)) => {
                let client = ScanClient {
                    scanner_id: id,
                    settings: info.settings.clone(),
                    filters: info.filters.clone(),
                    uuids: vec![],
                };
                self.start_client(client);
            }
            (None, None) => warn!("Scanner {} has no way to report results", id),
        }
    }

    pub fn unregister_scanner(&mut self, scanner_id: i32) {
        debug!("unregister_scanner: scanner_id={}", scanner_id);
        if self.find_client(scanner_id).is_some() {
            self.stop_scan(scanner_id);
        }

        let app = match self.scanners.remove(scanner_id) {
            Some(app) => app,
            None => return,
        };
        if let Some(cb) = &app.callback {
            unlink_to_death(cb.as_ref(), app.death_link);
        }
        // A pending registration is cleaned up when its grant arrives.
        if !app.is_pending() {
            self.native.unregister(scanner_id as u8);
        }
    }

    pub fn start_scan(
        &mut self,
        scanner_id: i32,
        settings: ScanSettings,
        filters: Vec<ScanFilter>,
    ) {
        self.start_scan_with_uuids(scanner_id, settings, filters, vec![]);
    }

    /// Starts a scan that only reports advertisers of every one of `uuids`.
    pub fn start_scan_with_uuids(
        &mut self,
        scanner_id: i32,
        settings: ScanSettings,
        filters: Vec<ScanFilter>,
        uuids: Vec<Uuid128Bit>,
    ) {
        self.start_client(ScanClient { scanner_id, settings, filters, uuids });
    }

    fn start_client(&mut self, client: ScanClient) {
        let id = client.scanner_id;
        let app = match self.scanners.get_by_id(id) {
            Some(app) if !app.is_pending() => app,
            _ => {
                warn!("start_scan: scanner {} is not registered", id);
                return;
            }
        };

        if Self::is_rate_limited(&app) {
            error!("App '{}' is scanning too frequently", app.app_name);
            self.report_error(&app, ScanStatus::ScanningTooFrequently);
            return;
        }
        if self.find_client(id).is_some() {
            self.report_error(&app, ScanStatus::AlreadyStarted);
            return;
        }
        if self.used_filter_slots() + client.filters.len() > self.max_scan_filters {
            warn!("No filter slots left for scanner {}", id);
            self.report_error(&app, ScanStatus::OutOfHardwareResources);
            return;
        }

        if let Some(stats) = &app.app_scan_stats {
            stats.lock().unwrap().record_scan_start(
                &client.settings,
                !client.filters.is_empty(),
                id,
            );
        }

        info!("Starting scan {} for {}", id, app.app_name);
        self.native.start_scan(id as u8, client.settings.clone(), client.filters.clone());
        if client.settings.is_batch() {
            self.batch_queue.push(client);
        } else {
            self.regular_queue.push(client);
        }
    }

    /// Scans with a pending intent: registers a scanner that starts scanning once granted.
    pub fn start_scan_for_intent(
        &mut self,
        intent: Arc<dyn IScanIntent>,
        settings: ScanSettings,
        filters: Vec<ScanFilter>,
        caller: &CallerIdentity,
    ) -> anyhow::Result<()> {
        let uuid = UuidHelper::random();
        debug!("start_scan_for_intent: uuid={}", UuidHelper::to_string(&uuid));
        let info = PendingIntentInfo {
            intent: intent.clone(),
            settings,
            filters,
            calling_package: caller.app_name.clone(),
        };
        self.scanners.add(uuid, intent.get_object_id(), caller, None, Some(info))?;
        self.native.register_scanner(uuid);
        Ok(())
    }

    pub fn stop_scan_for_intent(&mut self, intent: &dyn IScanIntent) {
        let object_id = intent.get_object_id();
        match self.scanners.get_by_context_info(|info| info.intent.get_object_id() == object_id) {
            Some(app) => {
                self.stop_scan(app.id);
                self.unregister_scanner(app.id);
            }
            None => debug!("No scan for intent {}", object_id),
        }
    }

    fn take_client(&mut self, scanner_id: i32) -> Option<ScanClient> {
        for queue in [&mut self.regular_queue, &mut self.batch_queue, &mut self.suspended_queue] {
            if let Some(pos) = queue.iter().position(|c| c.scanner_id == scanner_id) {
                return Some(queue.remove(pos));
            }
        }
        None
    }

    pub fn stop_scan(&mut self, scanner_id: i32) {
        if self.take_client(scanner_id).is_none() {
            debug!("stop_scan: scanner {} is not scanning", scanner_id);
            return;
        }
        if let Some(stats) = self.scanners.app_scan_stats_by_id(scanner_id) {
            stats.lock().unwrap().record_scan_stop(scanner_id);
        }
        info!("Stopping scan {}", scanner_id);
        self.native.stop_scan(scanner_id as u8);
    }

    /// Asks the controller for the results a batch scan has collected so far.
    pub fn flush_pending_batch_results(&self, scanner_id: i32) {
        match self.batch_queue.iter().find(|c| c.scanner_id == scanner_id) {
            Some(client) => {
                self.native.batchscan_read_reports(scanner_id as u8, client.report_format())
            }
            None => debug!("flush: scanner {} has no batch scan", scanner_id),
        }
    }

    /// Pauses a regular scan without ending its session.
    pub fn suspend_scan(&mut self, scanner_id: i32) {
        let pos = match self.regular_queue.iter().position(|c| c.scanner_id == scanner_id) {
            Some(pos) => pos,
            None => {
                debug!("suspend: scanner {} has no regular scan", scanner_id);
                return;
            }
        };
        let client = self.regular_queue.remove(pos);
        if let Some(stats) = self.scanners.app_scan_stats_by_id(scanner_id) {
            stats.lock().unwrap().record_scan_suspend(scanner_id);
        }
        self.native.stop_scan(scanner_id as u8);
        self.suspended_queue.push(client);
    }

    pub fn resume_scan(&mut self, scanner_id: i32) {
        let pos = match self.suspended_queue.iter().position(|c| c.scanner_id == scanner_id) {
            Some(pos) => pos,
            None => {
                debug!("resume: scanner {} is not suspended", scanner_id);
                return;
            }
        };
        let client = self.suspended_queue.remove(pos);
        if let Some(stats) = self.scanners.app_scan_stats_by_id(scanner_id) {
            stats.lock().unwrap().record_scan_resume(scanner_id);
        }
        self.native.start_scan(scanner_id as u8, client.settings.clone(), client.filters.clone());
        self.regular_queue.push(client);
    }

    /// Downgrades scans that ran past the scan timeout to opportunistic mode.
    pub fn check_scan_durations(&mut self) {
        let mut expired = vec![];
        for client in self.regular_queue.iter().chain(self.batch_queue.iter()) {
            if client.settings.scan_mode == ScanMode::Opportunistic {
                continue;
            }
            let stats = match self.scanners.app_scan_stats_by_id(client.scanner_id) {
                Some(stats) => stats,
                None => continue,
            };
            let too_long =
                stats.lock().unwrap().scanners_running_too_long().any(|id| id == client.scanner_id);
            if too_long {
                expired.push(client.scanner_id);
            }
        }

        for client in self.regular_queue.iter_mut().chain(self.batch_queue.iter_mut()) {
            if !expired.contains(&client.scanner_id) {
                continue;
            }
            warn!("Scan {} ran too long, moving it to opportunistic mode", client.scanner_id);
            client.settings.scan_mode = ScanMode::Opportunistic;
            self.native.stop_scan(client.scanner_id as u8);
            self.native.start_scan(
                client.scanner_id as u8,
                client.settings.clone(),
                client.filters.clone(),
            );
        }
    }

    fn report_error(&self, app: &ScannerApp, error: ScanStatus) {
        if let Some(cb) = &app.callback {
            cb.on_scan_manager_error(error);
        } else if let Some(info) = &app.info {
            if let Err(e) = info.intent.send_error(error) {
                error!("Error sending {:?} to intent: {}", error, e);
            }
        }
    }

    pub fn on_scan_result(&mut self, result: ScanResult) {
        let raw = &result.scan_record.bytes;
        let record = ScanRecord::parse(raw);
        let mut legacy_bytes = raw.clone();
        legacy_bytes.resize(LEGACY_SCAN_DATA_LEN, 0);
        let legacy_record = ScanRecord::parse(&legacy_bytes);
        let remote_uuids: Vec<&Uuid128Bit> =
            record.service_uuids.iter().filter(|u| UuidHelper::in_16bit_uuid_range(u)).collect();
        let timestamp_nanos = self.now_nanos();

        for client in self.regular_queue.clone() {
            if !client.uuids.iter().all(|u| remote_uuids.contains(&u)) {
                continue;
            }
            let app = match self.scanners.get_by_id(client.scanner_id) {
                Some(app) => app,
                None => continue,
            };

            let scan_record = if client.settings.legacy {
                if result.event_type & EVENT_TYPE_LEGACY == 0 {
                    continue;
                }
                legacy_record.clone()
            } else {
                record.clone()
            };
            let client_result =
                ScanResult { scan_record, timestamp_nanos, ..result.clone() };

            if !client.matches_filters(&client_result)
                || !client.settings.callback_type.contains(CallbackType::ALL_MATCHES)
            {
                continue;
            }

            if let Some(stats) = &app.app_scan_stats {
                stats.lock().unwrap().add_result(client.scanner_id);
            }
            if let Some(cb) = &app.callback {
                cb.on_scan_result(client_result);
            } else if let Some(info) = &app.info {
                if let Err(e) =
                    info.intent.send_results(vec![client_result], CallbackType::ALL_MATCHES)
                {
                    error!("Dropping scanner {}: {}", client.scanner_id, e);
                    self.unregister_scanner(client.scanner_id);
                }
            }
        }
    }

    pub fn on_batch_scan_reports(
        &mut self,
        status: u8,
        scanner_id: u8,
        report_format: i32,
        num_records: i32,
        data: Vec<u8>,
    ) {
        debug!(
            "on_batch_scan_reports: scanner_id={} status={} format={} records={}",
            scanner_id, status, report_format, num_records
        );
        let results = parse_batch_scan_results(num_records, report_format, &data, self.now_nanos());

        if report_format == REPORT_FORMAT_TRUNCATED {
            // Truncated reports only ever belong to the scanner that asked.
            let app = match self.scanners.get_by_id(scanner_id as i32) {
                Some(app) => app,
                None => return,
            };
            if let Some(cb) = &app.callback {
                cb.on_batch_scan_results(results);
            } else if let Some(info) = &app.info {
                if let Err(e) = info.intent.send_results(results, CallbackType::ALL_MATCHES) {
                    warn!("Failed to deliver truncated batch to scanner {}: {}", scanner_id, e);
                }
            }
            return;
        }

        let clients: Vec<ScanClient> = self.full_batch_scan_queue().cloned().collect();
        for client in clients {
            self.deliver_batch_scan(&client, &results);
        }
    }

    // Scanners without filters get every result. The result set is sent once to them.
    fn deliver_batch_scan(&mut self, client: &ScanClient, all_results: &[ScanResult]) {
        let app = match self.scanners.get_by_id(client.scanner_id) {
            Some(app) => app,
            None => return,
        };
        if client.filters.is_empty() {
            self.send_batch_scan_results(&app, client, all_results.to_vec());
            return;
        }
        let results =
            all_results.iter().filter(|r| client.matches_filters(r)).cloned().collect();
        self.send_batch_scan_results(&app, client, results);
    }

    fn send_batch_scan_results(
        &mut self,
        app: &ScannerApp,
        client: &ScanClient,
        results: Vec<ScanResult>,
    ) {
        if let Some(cb) = &app.callback {
            cb.on_batch_scan_results(results);
        } else if let Some(info) = &app.info {
            if let Err(e) = info.intent.send_results(results, CallbackType::ALL_MATCHES) {
                error!("Dropping scanner {}: {}", client.scanner_id, e);
                self.unregister_scanner(client.scanner_id);
            }
        }
    }

    pub fn on_batch_scan_threshold_crossed(&self, scanner_id: u8) {
        debug!("on_batch_scan_threshold_crossed: scanner_id={}", scanner_id);
        self.flush_pending_batch_results(scanner_id as i32);
    }

    pub fn on_track_adv_found_lost(&mut self, info: AdvertisingTrackInfo) {
        let id = info.scanner_id as i32;
        debug!(
            "on_track_adv_found_lost: scanner_id={} address={} state={}",
            id, info.address, info.advertiser_state
        );
        let app = match self.scanners.get_by_id(id) {
            Some(app) if app.callback.is_some() || app.info.is_some() => app,
            _ => {
                error!("No scanner {} to report found/lost to", id);
                return;
            }
        };

        let adv_data = [&info.adv_packet[..], &info.scan_response[..]].concat();
        let result = ScanResult {
            address: info.address,
            address_type: info.address_type,
            tx_power: info.tx_power,
            rssi: info.rssi,
            scan_record: ScanRecord::parse(&adv_data),
            timestamp_nanos: self.now_nanos(),
            ..Default::default()
        };

        let clients: Vec<ScanClient> =
            self.regular_queue.iter().filter(|c| c.scanner_id == id).cloned().collect();
        for client in clients {
            let callback_type = client.settings.callback_type;
            let (on_found, reported_type) = if info.advertiser_state == ADV_STATE_ON_FOUND
                && callback_type.contains(CallbackType::FIRST_MATCH)
            {
                (true, CallbackType::FIRST_MATCH)
            } else if info.advertiser_state == ADV_STATE_ON_LOST
                && callback_type.contains(CallbackType::MATCH_LOST)
            {
                (false, CallbackType::MATCH_LOST)
            } else {
                debug!(
                    "Not reporting state {} to scanner {} with callback type {:?}",
                    info.advertiser_state, id, callback_type
                );
                continue;
            };

            if let Some(cb) = &app.callback {
                cb.on_found_or_lost(on_found, result.clone());
            } else if let Some(pi) = &app.info {
                if let Err(e) = pi.intent.send_results(vec![result.clone()], reported_type) {
                    warn!("Intent of scanner {} canceled: {}", id, e);
                    self.unregister_scanner(id);
                }
            }
        }
    }

    pub fn on_scan_manager_error(&self, scanner_id: u8, error: u8) {
        match self.scanners.get_by_id(scanner_id as i32) {
            Some(app) => self.report_error(&app, ScanStatus::from_raw(error)),
            None => error!("No scanner {} to report error {} to", scanner_id, error),
        }
    }

    /// Owner of a scanner died.
    pub fn scanner_died(&mut self, scanner_id: i32) {
        info!("Scanner {} died, unregistering", scanner_id);
        self.stop_scan(scanner_id);
        self.unregister_scanner(scanner_id);
    }

    pub fn dispatch_callbacks(&mut self, callback: ScannerCallbacks) {
        match callback {
            ScannerCallbacks::OnScannerRegistered(uuid, scanner_id, status) => {
                self.on_scanner_registered(uuid, scanner_id, status)
            }
            ScannerCallbacks::OnScanResult(result) => self.on_scan_result(result),
            ScannerCallbacks::OnBatchScanReports(
                status,
                scanner_id,
                report_format,
                num_records,
                data,
            ) => self.on_batch_scan_reports(status, scanner_id, report_format, num_records, data),
            ScannerCallbacks::OnBatchScanThresholdCrossed(scanner_id) => {
                self.on_batch_scan_threshold_crossed(scanner_id)
            }
            ScannerCallbacks::OnTrackAdvFoundLost(info) => self.on_track_adv_found_lost(info),
            ScannerCallbacks::OnScanManagerError(scanner_id, error) => {
                self.on_scan_manager_error(scanner_id, error)
            }
        }
    }

    /// Forgets every scanner and scan, e.g. when the adapter goes down.
    pub fn cleanup(&mut self) {
        self.regular_queue.clear();
        self.batch_queue.clear();
        self.suspended_queue.clear();
        for app in self.scanners.clear() {
            if let Some(cb) = &app.callback {
                unlink_to_death(cb.as_ref(), app.death_link);
            }
        }
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "Scanners: {} regular, {} batch, {} suspended, {}/{} filter slots used",
            self.regular_queue.len(),
            self.batch_queue.len(),
            self.suspended_queue.len(),
            self.used_filter_slots(),
            self.max_scan_filters
        );
        for client in self.all_clients() {
            let _ = writeln!(
                out,
                "  scanner {}: {:?} delay={}ms filters={}",
                client.scanner_id,
                client.settings.scan_mode,
                client.settings.report_delay_millis,
                client.filters.len()
            );
        }
        self.scanners.dump(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::RawAddress;
    use crate::gatt::mocks::mock_battery_stats::{BatteryEvents, MockBatteryStats};
    use crate::gatt::mocks::mock_callbacks::{
        CallbackEvents, IntentEvents, MockCallbacks, MockScanIntent,
    };
    use crate::gatt::mocks::mock_scanner::{MockScanner, ScannerEvents};
    use crate::utils::task::block_on_locally;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::advance;

    const SCANNER_ID: u8 = 5;

    struct Harness {
        manager: ScanManager,
        native_rx: UnboundedReceiver<ScannerEvents>,
        msg_rx: UnboundedReceiver<Message>,
        _battery_rx: UnboundedReceiver<BatteryEvents>,
    }

    fn harness_with_slots(max_scan_filters: usize) -> Harness {
        let (native, native_rx) = MockScanner::new();
        let (battery, battery_rx) = MockBatteryStats::new();
        let (tx, msg_rx) = unbounded_channel();
        let manager = ScanManager::new(
            Arc::new(native),
            tx,
            ScanLimits::default(),
            Arc::new(battery),
            max_scan_filters,
        );
        Harness { manager, native_rx, msg_rx, _battery_rx: battery_rx }
    }

    fn harness() -> Harness {
        harness_with_slots(16)
    }

    fn caller() -> CallerIdentity {
        CallerIdentity { uid: 1000, app_name: "scanner.app".into(), is_privileged: false }
    }

    // Registers a callback scanner and grants it `scanner_id`.
    fn register(h: &mut Harness, callback: &Arc<MockCallbacks>, scanner_id: u8) {
        let uuid = h.manager.register_scanner(callback.clone(), &caller()).unwrap();
        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::RegisterScanner(uuid));
        h.manager.on_scanner_registered(uuid, scanner_id, 0);
    }

    fn adv_result(event_type: u16, adv: &[u8]) -> ScanResult {
        ScanResult {
            address: RawAddress::from([1, 2, 3, 4, 5, 6]),
            event_type,
            rssi: -60,
            scan_record: ScanRecord { bytes: adv.to_vec(), ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn test_registration_promotes_and_links() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");

        let uuid = h.manager.register_scanner(callback.clone(), &caller()).unwrap();
        assert!(h.manager.scanners().get_by_uuid(&uuid).unwrap().is_pending());
        h.native_rx.try_recv().unwrap();
        h.manager.on_scanner_registered(uuid, SCANNER_ID, 0);

        assert_eq!(
            cb_rx.try_recv().unwrap(),
            CallbackEvents::ScannerRegistered(uuid, SCANNER_ID as i32, ScanStatus::Success)
        );
        assert_eq!(h.manager.scanners().get_by_uuid(&uuid).unwrap().id, SCANNER_ID as i32);
        assert_eq!(callback.active_links(), 1);
    }

    #[test]
    fn test_failed_registration_removed() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        let uuid = h.manager.register_scanner(callback.clone(), &caller()).unwrap();

        h.manager.on_scanner_registered(uuid, 0, ScanStatus::InternalError as u8);

        assert!(h.manager.scanners().is_empty());
        assert_eq!(
            cb_rx.try_recv().unwrap(),
            CallbackEvents::ScannerRegistered(uuid, -1, ScanStatus::InternalError)
        );
    }

    #[test]
    fn test_orphan_grant_is_unregistered() {
        let mut h = harness();
        let (callback, _cb_rx) = MockCallbacks::new("a");
        let uuid = h.manager.register_scanner(callback.clone(), &caller()).unwrap();
        h.native_rx.try_recv().unwrap();
        let temp_id = h.manager.scanners().get_by_uuid(&uuid).unwrap().id;

        h.manager.unregister_scanner(temp_id);
        assert!(h.native_rx.try_recv().is_err());
        h.manager.on_scanner_registered(uuid, SCANNER_ID, 0);

        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::Unregister(SCANNER_ID));
    }

    #[test]
    fn test_start_and_stop_scan() {
        let mut h = harness();
        let (callback, _cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);

        h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);
        assert_eq!(
            h.native_rx.try_recv().unwrap(),
            ScannerEvents::StartScan(SCANNER_ID, ScanSettings::default(), vec![])
        );
        assert_eq!(h.manager.regular_scan_queue().len(), 1);

        h.manager.stop_scan(SCANNER_ID as i32);
        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::StopScan(SCANNER_ID));
        assert!(h.manager.regular_scan_queue().is_empty());

        let stats = h.manager.scanners().app_scan_stats_by_uid(1000).unwrap();
        assert_eq!(stats.lock().unwrap().scans_stopped(), 1);
    }

    #[test]
    fn test_rate_limit_on_registration_and_start() {
        block_on_locally(async {
            let mut h = harness();
            let (callback, mut cb_rx) = MockCallbacks::new("a");
            register(&mut h, &callback, SCANNER_ID);
            cb_rx.try_recv().unwrap();

            for _ in 0..5 {
                h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);
                h.manager.stop_scan(SCANNER_ID as i32);
                advance(Duration::from_secs(2)).await;
            }

            // the sixth start is refused
            h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);
            assert_eq!(
                cb_rx.try_recv().unwrap(),
                CallbackEvents::ScanManagerError(ScanStatus::ScanningTooFrequently)
            );
            assert!(h.manager.regular_scan_queue().is_empty());

            // so is a new registration from the same app
            let (other, mut other_rx) = MockCallbacks::new("b");
            let uuid = h.manager.register_scanner(other.clone(), &caller()).unwrap();
            assert_eq!(
                other_rx.try_recv().unwrap(),
                CallbackEvents::ScannerRegistered(uuid, -1, ScanStatus::ScanningTooFrequently)
            );
            assert!(h.manager.scanners().get_by_uuid(&uuid).is_none());

            // privileged callers are exempt
            let privileged = CallerIdentity { is_privileged: true, ..caller() };
            h.manager.register_scanner(other.clone(), &privileged).unwrap();
            while let Ok(event) = h.native_rx.try_recv() {
                if let ScannerEvents::RegisterScanner(_) = event {
                    break;
                }
            }

            // the window clears 30s after the oldest scan started
            advance(Duration::from_secs(21)).await;
            h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);
            assert_eq!(h.manager.regular_scan_queue().len(), 1);
        });
    }

    #[test]
    fn test_filter_slot_exhaustion() {
        let mut h = harness_with_slots(2);
        let (first, _rx1) = MockCallbacks::new("a");
        let (second, mut rx2) = MockCallbacks::new("b");
        register(&mut h, &first, 1);
        register(&mut h, &second, 2);
        rx2.try_recv().unwrap();

        let filters = vec![ScanFilter::default(), ScanFilter::default()];
        h.manager.start_scan(1, ScanSettings::default(), filters);
        h.manager.start_scan(2, ScanSettings::default(), vec![ScanFilter::default()]);

        assert_eq!(
            rx2.try_recv().unwrap(),
            CallbackEvents::ScanManagerError(ScanStatus::OutOfHardwareResources)
        );
        assert_eq!(h.manager.regular_scan_queue().len(), 1);
    }

    #[test]
    fn test_duplicate_start_reports_already_started() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        cb_rx.try_recv().unwrap();

        h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);
        h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);

        assert_eq!(
            cb_rx.try_recv().unwrap(),
            CallbackEvents::ScanManagerError(ScanStatus::AlreadyStarted)
        );
    }

    #[test]
    fn test_scan_result_filtering() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        cb_rx.try_recv().unwrap();
        let filter = ScanFilter { name: Some("abc".into()), ..Default::default() };
        h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![filter]);

        h.manager.on_scan_result(adv_result(0x1b, &[4, 0x09, b'x', b'y', b'z']));
        assert!(cb_rx.try_recv().is_err());

        h.manager.on_scan_result(adv_result(0x1b, &[4, 0x09, b'a', b'b', b'c']));
        match cb_rx.try_recv() {
            Ok(CallbackEvents::ScanResult(result)) => {
                assert_eq!(result.scan_record.device_name.as_deref(), Some("abc"));
                assert_eq!(result.scan_record.bytes.len(), 5);
            }
            other => panic!("unexpected {:?}", other),
        }

        let stats = h.manager.scanners().app_scan_stats_by_uid(1000).unwrap();
        assert_eq!(stats.lock().unwrap().results_count(), 1);
    }

    #[test]
    fn test_legacy_scan_gets_fixed_size_record() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        cb_rx.try_recv().unwrap();
        let settings = ScanSettings { legacy: true, ..Default::default() };
        h.manager.start_scan(SCANNER_ID as i32, settings, vec![]);

        // extended advertisement: skipped
        h.manager.on_scan_result(adv_result(0x01, &[2, 0x01, 0x06]));
        assert!(cb_rx.try_recv().is_err());

        h.manager.on_scan_result(adv_result(0x13, &[2, 0x01, 0x06]));
        match cb_rx.try_recv() {
            Ok(CallbackEvents::ScanResult(result)) => {
                let mut expected = vec![2, 0x01, 0x06];
                expected.resize(62, 0);
                assert_eq!(result.scan_record.bytes, expected);
                assert_eq!(result.scan_record.advertise_flags, Some(6));
            }
            other => panic!("unexpected {:?}", other),
        }

        let long = vec![0u8; 80];
        h.manager.on_scan_result(adv_result(0x13, &long));
        match cb_rx.try_recv() {
            Ok(CallbackEvents::ScanResult(result)) => {
                assert_eq!(result.scan_record.bytes.len(), 62)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_uuid_list_must_all_be_advertised() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        cb_rx.try_recv().unwrap();
        h.manager.start_scan_with_uuids(
            SCANNER_ID as i32,
            ScanSettings::default(),
            vec![],
            vec![UuidHelper::from_u16(0x180d), UuidHelper::from_u16(0x180f)],
        );

        h.manager.on_scan_result(adv_result(0x1b, &[3, 0x03, 0x0d, 0x18]));
        assert!(cb_rx.try_recv().is_err());

        h.manager.on_scan_result(adv_result(0x1b, &[5, 0x03, 0x0f, 0x18, 0x0d, 0x18]));
        assert!(matches!(cb_rx.try_recv(), Ok(CallbackEvents::ScanResult(_))));
    }

    #[test]
    fn test_first_match_only_scan_gets_no_results() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        cb_rx.try_recv().unwrap();
        let settings = ScanSettings {
            callback_type: CallbackType::FIRST_MATCH | CallbackType::MATCH_LOST,
            ..Default::default()
        };
        h.manager.start_scan(SCANNER_ID as i32, settings, vec![]);

        h.manager.on_scan_result(adv_result(0x1b, &[]));
        assert!(cb_rx.try_recv().is_err());

        let info = AdvertisingTrackInfo {
            scanner_id: SCANNER_ID,
            advertiser_state: ADV_STATE_ON_FOUND,
            address: RawAddress::from([1, 2, 3, 4, 5, 6]),
            rssi: -42,
            adv_packet: vec![2, 0x01, 0x06],
            ..Default::default()
        };
        h.manager.on_track_adv_found_lost(info.clone());
        match cb_rx.try_recv() {
            Ok(CallbackEvents::FoundOrLost(true, result)) => {
                assert_eq!(result.rssi, -42);
                assert_eq!(result.scan_record.advertise_flags, Some(6));
            }
            other => panic!("unexpected {:?}", other),
        }

        h.manager.on_track_adv_found_lost(AdvertisingTrackInfo {
            advertiser_state: ADV_STATE_ON_LOST,
            ..info
        });
        assert!(matches!(cb_rx.try_recv(), Ok(CallbackEvents::FoundOrLost(false, _))));
    }

    fn truncated_record(last_addr_byte: u8) -> Vec<u8> {
        vec![last_addr_byte, 5, 4, 3, 2, 1, 0, 0, 0xc4, 0, 0]
    }

    fn full_record(last_addr_byte: u8, adv: &[u8]) -> Vec<u8> {
        let mut bytes = truncated_record(last_addr_byte);
        bytes.push(adv.len() as u8);
        bytes.extend(adv);
        bytes.push(0);
        bytes
    }

    #[test]
    fn test_truncated_batch_goes_to_owner_only() {
        let mut h = harness();
        let (first, mut rx1) = MockCallbacks::new("a");
        let (second, mut rx2) = MockCallbacks::new("b");
        register(&mut h, &first, 1);
        register(&mut h, &second, 2);
        rx1.try_recv().unwrap();
        rx2.try_recv().unwrap();

        let mut data = truncated_record(6);
        data.extend(truncated_record(7));
        h.manager.on_batch_scan_reports(0, 1, REPORT_FORMAT_TRUNCATED, 2, data);

        match rx1.try_recv() {
            Ok(CallbackEvents::BatchScanResults(results)) => assert_eq!(results.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_full_batch_delivered_to_every_full_batch_scanner() {
        let mut h = harness();
        let (unfiltered, mut rx1) = MockCallbacks::new("a");
        let (filtered, mut rx2) = MockCallbacks::new("b");
        register(&mut h, &unfiltered, 1);
        register(&mut h, &filtered, 2);
        rx1.try_recv().unwrap();
        rx2.try_recv().unwrap();
        let batch = ScanSettings { report_delay_millis: 5000, ..Default::default() };
        h.manager.start_scan(1, batch.clone(), vec![]);
        let filter = ScanFilter { name: Some("b".into()), ..Default::default() };
        h.manager.start_scan(2, batch, vec![filter]);

        let mut data = full_record(6, &[2, 0x09, b'a']);
        data.extend(full_record(7, &[2, 0x09, b'b']));
        h.manager.on_batch_scan_reports(0, 1, REPORT_FORMAT_FULL, 2, data);

        // Unfiltered scanners get the whole set exactly once. Sending it a second time after
        // the unfiltered delivery is treated as unintended.
        match rx1.try_recv() {
            Ok(CallbackEvents::BatchScanResults(results)) => assert_eq!(results.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx1.try_recv().is_err());

        match rx2.try_recv() {
            Ok(CallbackEvents::BatchScanResults(results)) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].address, RawAddress::from([1, 2, 3, 4, 5, 7]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flush_and_threshold_read_reports() {
        let mut h = harness();
        let (callback, _cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        let settings = ScanSettings {
            report_delay_millis: 1000,
            scan_result_type: ScanResultType::Abbreviated,
            ..Default::default()
        };
        h.manager.start_scan(SCANNER_ID as i32, settings, vec![]);
        h.native_rx.try_recv().unwrap();

        h.manager.flush_pending_batch_results(SCANNER_ID as i32);
        assert_eq!(
            h.native_rx.try_recv().unwrap(),
            ScannerEvents::BatchscanReadReports(SCANNER_ID, REPORT_FORMAT_TRUNCATED)
        );

        h.manager.dispatch_callbacks(ScannerCallbacks::OnBatchScanThresholdCrossed(SCANNER_ID));
        assert_eq!(
            h.native_rx.try_recv().unwrap(),
            ScannerEvents::BatchscanReadReports(SCANNER_ID, REPORT_FORMAT_TRUNCATED)
        );

        // regular scans have nothing to flush
        h.manager.flush_pending_batch_results(9);
        assert!(h.native_rx.try_recv().is_err());
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        cb_rx.try_recv().unwrap();
        h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);
        h.native_rx.try_recv().unwrap();

        h.manager.suspend_scan(SCANNER_ID as i32);
        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::StopScan(SCANNER_ID));
        assert_eq!(h.manager.suspended_scan_queue().len(), 1);
        h.manager.on_scan_result(adv_result(0x1b, &[]));
        assert!(cb_rx.try_recv().is_err());

        let stats = h.manager.scanners().app_scan_stats_by_uid(1000).unwrap();
        assert!(stats.lock().unwrap().ongoing_scan(SCANNER_ID as i32).unwrap().is_suspended());

        h.manager.resume_scan(SCANNER_ID as i32);
        assert!(matches!(h.native_rx.try_recv(), Ok(ScannerEvents::StartScan(SCANNER_ID, ..))));
        assert_eq!(h.manager.regular_scan_queue().len(), 1);
        h.manager.on_scan_result(adv_result(0x1b, &[]));
        assert!(matches!(cb_rx.try_recv(), Ok(CallbackEvents::ScanResult(_))));
    }

    #[test]
    fn test_long_scans_downgraded_to_opportunistic() {
        block_on_locally(async {
            let mut h = harness();
            let (callback, _cb_rx) = MockCallbacks::new("a");
            register(&mut h, &callback, SCANNER_ID);
            h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);
            h.native_rx.try_recv().unwrap();

            advance(Duration::from_secs(29 * 60)).await;
            h.manager.check_scan_durations();
            assert!(h.native_rx.try_recv().is_err());

            advance(Duration::from_secs(2 * 60)).await;
            h.manager.check_scan_durations();
            assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::StopScan(SCANNER_ID));
            match h.native_rx.try_recv() {
                Ok(ScannerEvents::StartScan(SCANNER_ID, settings, _)) => {
                    assert_eq!(settings.scan_mode, ScanMode::Opportunistic)
                }
                other => panic!("unexpected {:?}", other),
            }

            // already downgraded
            h.manager.check_scan_durations();
            assert!(h.native_rx.try_recv().is_err());
        });
    }

    #[test]
    fn test_intent_scan_starts_on_registration() {
        let mut h = harness();
        let (intent, mut intent_rx) = MockScanIntent::new("intent");
        let settings = ScanSettings::default();

        h.manager
            .start_scan_for_intent(intent.clone(), settings.clone(), vec![], &caller())
            .unwrap();
        let uuid = match h.native_rx.try_recv() {
            Ok(ScannerEvents::RegisterScanner(uuid)) => uuid,
            other => panic!("unexpected {:?}", other),
        };
        h.manager.on_scanner_registered(uuid, SCANNER_ID, 0);
        assert_eq!(
            h.native_rx.try_recv().unwrap(),
            ScannerEvents::StartScan(SCANNER_ID, settings, vec![])
        );

        h.manager.on_scan_result(adv_result(0x1b, &[]));
        match intent_rx.try_recv() {
            Ok(IntentEvents::Results(results, callback_type)) => {
                assert_eq!(results.len(), 1);
                assert_eq!(callback_type, CallbackType::ALL_MATCHES);
            }
            other => panic!("unexpected {:?}", other),
        }

        h.manager.stop_scan_for_intent(intent.as_ref());
        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::StopScan(SCANNER_ID));
        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::Unregister(SCANNER_ID));
        assert!(h.manager.scanners().is_empty());
    }

    #[test]
    fn test_canceled_intent_drops_scanner() {
        let mut h = harness();
        let (intent, _intent_rx) = MockScanIntent::new("intent");
        h.manager
            .start_scan_for_intent(intent.clone(), ScanSettings::default(), vec![], &caller())
            .unwrap();
        let uuid = match h.native_rx.try_recv() {
            Ok(ScannerEvents::RegisterScanner(uuid)) => uuid,
            other => panic!("unexpected {:?}", other),
        };
        h.manager.on_scanner_registered(uuid, SCANNER_ID, 0);
        h.native_rx.try_recv().unwrap();

        intent.cancel();
        h.manager.on_scan_result(adv_result(0x1b, &[]));

        assert!(h.manager.scanners().is_empty());
        assert!(h.manager.regular_scan_queue().is_empty());
        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::StopScan(SCANNER_ID));
        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::Unregister(SCANNER_ID));
    }

    #[test]
    fn test_scanner_death_stops_and_unregisters() {
        let mut h = harness();
        let (callback, _cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        h.manager.start_scan(SCANNER_ID as i32, ScanSettings::default(), vec![]);
        h.native_rx.try_recv().unwrap();

        callback.die();
        match h.msg_rx.try_recv() {
            Ok(Message::ScannerDied(id)) => h.manager.scanner_died(id),
            _ => panic!("expected a death notice"),
        }

        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::StopScan(SCANNER_ID));
        assert_eq!(h.native_rx.try_recv().unwrap(), ScannerEvents::Unregister(SCANNER_ID));
        assert!(h.manager.scanners().is_empty());
        assert_eq!(callback.active_links(), 0);
    }

    #[test]
    fn test_scan_manager_error_forwarded() {
        let mut h = harness();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        register(&mut h, &callback, SCANNER_ID);
        cb_rx.try_recv().unwrap();

        h.manager.dispatch_callbacks(ScannerCallbacks::OnScanManagerError(SCANNER_ID, 4));
        assert_eq!(
            cb_rx.try_recv().unwrap(),
            CallbackEvents::ScanManagerError(ScanStatus::FeatureUnsupported)
        );
    }
}
