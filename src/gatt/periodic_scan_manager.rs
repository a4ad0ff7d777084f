//! Synchronization to the periodic advertising trains of remote devices.

use log::{debug, info, warn};
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::address::RawAddress;
use crate::core::liveness::{link_to_death, unlink_to_death, RPCProxy};
use crate::core::uuid::UuidHelper;
use crate::gatt::context_map::{App, CallerIdentity, ContextMap};
use crate::gatt::native::{PeriodicSyncCallbacks, PeriodicSyncInterface};
use crate::gatt::scan_settings::ScanResult;
use crate::gatt::status::GattStatus;
use crate::Message;

pub trait IPeriodicAdvertisingCallback: RPCProxy + Send + Sync {
    /// Outcome of `start_sync`. `sync_handle` is -1 unless `status` is success.
    fn on_sync_established(
        &self,
        sync_handle: i32,
        sid: i32,
        address_type: i32,
        address: RawAddress,
        phy: i32,
        interval: i32,
        status: GattStatus,
    );

    fn on_periodic_advertising_report(
        &self,
        sync_handle: i32,
        tx_power: i32,
        rssi: i32,
        data_status: i32,
        data: Vec<u8>,
    );

    /// The train was lost. The sync is gone and its handle is no longer valid.
    fn on_sync_lost(&self, sync_handle: i32);
}

/// The train a sync follows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncInfo {
    pub address: RawAddress,
    pub sid: u8,
    pub skip: u16,
    pub timeout: u16,
}

pub type SyncMap = ContextMap<dyn IPeriodicAdvertisingCallback, SyncInfo>;
type SyncApp = App<dyn IPeriodicAdvertisingCallback, SyncInfo>;

const INVALID_SYNC_HANDLE: i32 = -1;

pub struct PeriodicScanManager {
    syncs: SyncMap,
    native: Arc<dyn PeriodicSyncInterface>,
    tx: UnboundedSender<Message>,
}

impl PeriodicScanManager {
    pub fn new(native: Arc<dyn PeriodicSyncInterface>, tx: UnboundedSender<Message>) -> Self {
        PeriodicScanManager { syncs: ContextMap::new(), native, tx }
    }

    pub fn syncs(&self) -> &SyncMap {
        &self.syncs
    }

    /// Syncs to the train advertised in `scan_result`. Returns the temporary registration id.
    ///
    /// `skip` is the number of periodic events that may be skipped, `timeout` the supervision
    /// timeout in units of 10ms.
    pub fn start_sync(
        &mut self,
        scan_result: &ScanResult,
        skip: u16,
        timeout: u16,
        callback: Arc<dyn IPeriodicAdvertisingCallback>,
        caller: &CallerIdentity,
    ) -> anyhow::Result<i32> {
        let caller_id = callback.get_object_id();
        let info = SyncInfo {
            address: scan_result.address,
            sid: scan_result.advertising_sid,
            skip,
            timeout,
        };

        if self.syncs.get_by_caller_id(&caller_id).is_some() {
            let reg_id = self.syncs.allocate_temp_id();
            warn!("{} already has a periodic sync", caller.app_name);
            callback.on_sync_established(
                INVALID_SYNC_HANDLE,
                info.sid as i32,
                scan_result.address_type as i32,
                info.address,
                0,
                0,
                GattStatus::Busy,
            );
            return Ok(reg_id);
        }

        let death_caller_id = caller_id.clone();
        let link = link_to_death(callback.as_ref(), &self.tx, move || {
            Message::PeriodicSyncDied(death_caller_id.clone())
        })?;

        let app = match self.syncs.add(
            UuidHelper::random(),
            caller_id,
            caller,
            Some(callback.clone()),
            Some(info.clone()),
        ) {
            Ok(app) => app,
            Err(e) => {
                unlink_to_death(callback.as_ref(), Some(link));
                return Err(e);
            }
        };
        self.syncs.set_death_link(app.id, Some(link));

        debug!("Starting sync {} to {} sid {}", app.id, info.address, info.sid);
        self.native.start_sync(info.sid, info.address, skip, timeout, app.id);
        Ok(app.id)
    }

    pub fn on_sync_started(
        &mut self,
        reg_id: i32,
        sync_handle: u16,
        sid: u8,
        address_type: u8,
        address: RawAddress,
        phy: u8,
        interval: u16,
        status: u8,
    ) {
        let status = GattStatus::from_raw(status as u32);
        debug!(
            "on_sync_started: reg_id={} sync_handle={} status={:?}",
            reg_id, sync_handle, status
        );

        let app = match self.syncs.get_by_id(reg_id) {
            Some(app) => app,
            None => {
                warn!("No callback found for sync registration {}", reg_id);
                if status == GattStatus::Success {
                    self.native.stop_sync(sync_handle);
                }
                return;
            }
        };

        let (sync_handle, status) = if status != GattStatus::Success {
            self.release(&app);
            (INVALID_SYNC_HANDLE, status)
        } else if !self.syncs.promote(reg_id, sync_handle as i32) {
            // The handle is held by another sync, or the record is no longer pending.
            warn!("Sync {} could not be activated", sync_handle);
            self.release(&app);
            self.native.stop_sync(sync_handle);
            (INVALID_SYNC_HANDLE, GattStatus::InternalError)
        } else {
            (sync_handle as i32, status)
        };

        if let Some(cb) = &app.callback {
            cb.on_sync_established(
                sync_handle,
                sid as i32,
                address_type as i32,
                address,
                phy as i32,
                interval as i32,
                status,
            );
        }
    }

    pub fn on_sync_report(
        &self,
        sync_handle: u16,
        tx_power: i8,
        rssi: i8,
        data_status: u8,
        data: Vec<u8>,
    ) {
        match self.syncs.get_by_id(sync_handle as i32).and_then(|app| app.callback) {
            Some(cb) => cb.on_periodic_advertising_report(
                sync_handle as i32,
                tx_power as i32,
                rssi as i32,
                data_status as i32,
                data,
            ),
            None => debug!("Report for unknown sync {}", sync_handle),
        }
    }

    pub fn on_sync_lost(&mut self, sync_handle: u16) {
        let app = match self.syncs.get_by_id(sync_handle as i32) {
            Some(app) => app,
            None => {
                debug!("Unknown sync {} lost", sync_handle);
                return;
            }
        };
        info!("Sync {} lost", sync_handle);
        self.release(&app);
        if let Some(cb) = &app.callback {
            cb.on_sync_lost(sync_handle as i32);
        }
    }

    pub fn stop_sync(&mut self, callback: &dyn IPeriodicAdvertisingCallback) {
        self.stop_by_caller(&callback.get_object_id());
    }

    pub fn caller_died(&mut self, caller_id: &str) {
        info!("Periodic sync owner {} died", caller_id);
        self.stop_by_caller(caller_id);
    }

    fn stop_by_caller(&mut self, caller_id: &str) {
        let app = match self.syncs.get_by_caller_id(caller_id) {
            Some(app) => app,
            None => {
                debug!("No periodic sync owned by {}", caller_id);
                return;
            }
        };
        self.release(&app);
        if !app.is_pending() {
            self.native.stop_sync(app.id as u16);
        }
    }

    fn release(&self, app: &SyncApp) {
        if let Some(cb) = &app.callback {
            unlink_to_death(cb.as_ref(), app.death_link);
        }
        self.syncs.remove(app.id);
    }

    pub fn dispatch_callbacks(&mut self, callback: PeriodicSyncCallbacks) {
        match callback {
            PeriodicSyncCallbacks::OnSyncStarted(
                reg_id,
                sync_handle,
                sid,
                address_type,
                address,
                phy,
                interval,
                status,
            ) => self.on_sync_started(
                reg_id,
                sync_handle,
                sid,
                address_type,
                address,
                phy,
                interval,
                status,
            ),
            PeriodicSyncCallbacks::OnSyncReport(sync_handle, tx_power, rssi, data_status, data) => {
                self.on_sync_report(sync_handle, tx_power, rssi, data_status, data)
            }
            PeriodicSyncCallbacks::OnSyncLost(sync_handle) => self.on_sync_lost(sync_handle),
        }
    }

    pub fn cleanup(&mut self) {
        for app in self.syncs.clear() {
            if let Some(cb) = &app.callback {
                unlink_to_death(cb.as_ref(), app.death_link);
            }
        }
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(out, "Periodic syncs:");
        self.syncs.dump(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::mocks::mock_callbacks::{CallbackEvents, MockCallbacks};
    use crate::gatt::mocks::mock_periodic_sync::{MockPeriodicSync, PeriodicSyncEvents};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const HANDLE: u16 = 0x21;

    fn address() -> RawAddress {
        RawAddress::from([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
    }

    fn new_manager(
    ) -> (PeriodicScanManager, UnboundedReceiver<PeriodicSyncEvents>, UnboundedReceiver<Message>)
    {
        let (native, native_rx) = MockPeriodicSync::new();
        let (tx, msg_rx) = unbounded_channel();
        (PeriodicScanManager::new(Arc::new(native), tx), native_rx, msg_rx)
    }

    fn start(manager: &mut PeriodicScanManager, callback: &Arc<MockCallbacks>) -> i32 {
        let result = ScanResult { address: address(), advertising_sid: 4, ..Default::default() };
        manager
            .start_sync(&result, 0, 100, callback.clone(), &CallerIdentity::default())
            .unwrap()
    }

    fn confirm(manager: &mut PeriodicScanManager, reg_id: i32, status: u8) {
        manager.on_sync_started(reg_id, HANDLE, 4, 0, address(), 1, 80, status);
    }

    #[test]
    fn test_start_keys_by_sid_and_address() {
        let (mut manager, mut native_rx, _msg_rx) = new_manager();
        let (callback, _cb_rx) = MockCallbacks::new("a");

        let reg_id = start(&mut manager, &callback);

        assert_eq!(
            native_rx.try_recv().unwrap(),
            PeriodicSyncEvents::StartSync(4, address(), 0, 100, reg_id)
        );
        let info = manager.syncs().get_by_id(reg_id).unwrap().info.unwrap();
        assert_eq!(info, SyncInfo { address: address(), sid: 4, skip: 0, timeout: 100 });
    }

    #[test]
    fn test_established_and_reports_forwarded() {
        let (mut manager, _native_rx, _msg_rx) = new_manager();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        let reg_id = start(&mut manager, &callback);

        confirm(&mut manager, reg_id, 0);
        assert_eq!(
            cb_rx.try_recv().unwrap(),
            CallbackEvents::SyncEstablished(HANDLE as i32, 4, address(), GattStatus::Success)
        );

        manager.dispatch_callbacks(PeriodicSyncCallbacks::OnSyncReport(
            HANDLE,
            -3,
            -70,
            0,
            vec![1, 2],
        ));
        assert_eq!(
            cb_rx.try_recv().unwrap(),
            CallbackEvents::PeriodicAdvertisingReport(HANDLE as i32, -70, vec![1, 2])
        );
    }

    #[test]
    fn test_failure_removes_record() {
        let (mut manager, mut native_rx, _msg_rx) = new_manager();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        let reg_id = start(&mut manager, &callback);
        native_rx.try_recv().unwrap();

        confirm(&mut manager, reg_id, GattStatus::Error as u8);

        assert!(manager.syncs().is_empty());
        assert_eq!(callback.active_links(), 0);
        assert_eq!(
            cb_rx.try_recv().unwrap(),
            CallbackEvents::SyncEstablished(-1, 4, address(), GattStatus::Error)
        );
        assert!(native_rx.try_recv().is_err());
    }

    #[test]
    fn test_orphan_confirmation_stops_sync() {
        let (mut manager, mut native_rx, _msg_rx) = new_manager();
        let (callback, _cb_rx) = MockCallbacks::new("a");
        let reg_id = start(&mut manager, &callback);
        native_rx.try_recv().unwrap();

        manager.stop_sync(callback.as_ref());
        assert!(native_rx.try_recv().is_err());
        confirm(&mut manager, reg_id, 0);

        assert_eq!(native_rx.try_recv().unwrap(), PeriodicSyncEvents::StopSync(HANDLE));
    }

    #[test]
    fn test_death_of_active_sync_stops_it() {
        let (mut manager, mut native_rx, mut msg_rx) = new_manager();
        let (callback, _cb_rx) = MockCallbacks::new("a");
        let reg_id = start(&mut manager, &callback);
        confirm(&mut manager, reg_id, 0);
        native_rx.try_recv().unwrap();

        callback.die();
        match msg_rx.try_recv() {
            Ok(Message::PeriodicSyncDied(caller_id)) => manager.caller_died(&caller_id),
            _ => panic!("expected a death notice"),
        }

        assert_eq!(native_rx.try_recv().unwrap(), PeriodicSyncEvents::StopSync(HANDLE));
        assert!(manager.syncs().is_empty());
    }

    #[test]
    fn test_grant_of_handle_in_use_is_refused() {
        let (mut manager, mut native_rx, _msg_rx) = new_manager();
        let (first, _first_rx) = MockCallbacks::new("a");
        let first_reg = start(&mut manager, &first);
        confirm(&mut manager, first_reg, 0);
        let (second, mut second_rx) = MockCallbacks::new("b");
        let second_reg = start(&mut manager, &second);
        native_rx.try_recv().unwrap();
        native_rx.try_recv().unwrap();

        confirm(&mut manager, second_reg, 0);

        assert_eq!(
            second_rx.try_recv().unwrap(),
            CallbackEvents::SyncEstablished(-1, 4, address(), GattStatus::InternalError)
        );
        assert_eq!(native_rx.try_recv().unwrap(), PeriodicSyncEvents::StopSync(HANDLE));
        assert!(manager.syncs().get_by_id(second_reg).is_none());
        assert_eq!(second.active_links(), 0);
        assert_eq!(manager.syncs().get_by_caller_id("a").unwrap().id, HANDLE as i32);

        manager.caller_died("b");
        assert!(native_rx.try_recv().is_err());
    }

    #[test]
    fn test_death_while_pending_stops_on_grant() {
        let (mut manager, mut native_rx, mut msg_rx) = new_manager();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        let reg_id = start(&mut manager, &callback);
        native_rx.try_recv().unwrap();

        callback.die();
        match msg_rx.try_recv() {
            Ok(Message::PeriodicSyncDied(caller_id)) => manager.caller_died(&caller_id),
            _ => panic!("expected a death notice"),
        }
        assert!(manager.syncs().is_empty());
        assert!(native_rx.try_recv().is_err());

        confirm(&mut manager, reg_id, 0);
        assert_eq!(native_rx.try_recv().unwrap(), PeriodicSyncEvents::StopSync(HANDLE));
        assert!(cb_rx.try_recv().is_err());
    }

    #[test]
    fn test_sync_lost_removes_record() {
        let (mut manager, mut native_rx, _msg_rx) = new_manager();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        let reg_id = start(&mut manager, &callback);
        confirm(&mut manager, reg_id, 0);
        native_rx.try_recv().unwrap();
        cb_rx.try_recv().unwrap();

        manager.on_sync_lost(HANDLE);

        assert_eq!(cb_rx.try_recv().unwrap(), CallbackEvents::SyncLost(HANDLE as i32));
        assert!(manager.syncs().is_empty());
        assert_eq!(callback.active_links(), 0);

        // stopping afterwards has nothing to do
        manager.stop_sync(callback.as_ref());
        assert!(native_rx.try_recv().is_err());
    }

    #[test]
    fn test_second_sync_for_same_caller_refused() {
        let (mut manager, mut native_rx, _msg_rx) = new_manager();
        let (callback, mut cb_rx) = MockCallbacks::new("a");
        start(&mut manager, &callback);
        native_rx.try_recv().unwrap();

        start(&mut manager, &callback);

        assert_eq!(
            cb_rx.try_recv().unwrap(),
            CallbackEvents::SyncEstablished(-1, 4, address(), GattStatus::Busy)
        );
        assert!(native_rx.try_recv().is_err());
        assert_eq!(manager.syncs().len(), 1);
    }
}
