//! Mocked caller callbacks for use in test. One object serves every callback interface, so a
//! single event stream shows everything a caller was told.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

use crate::core::address::RawAddress;
use crate::core::liveness::RPCProxy;
use crate::core::uuid::Uuid128Bit;
use crate::gatt::advertise_manager::IAdvertisingSetCallback;
use crate::gatt::native::GattDbElement;
use crate::gatt::periodic_scan_manager::IPeriodicAdvertisingCallback;
use crate::gatt::scan_manager::{IScanIntent, IScannerCallback};
use crate::gatt::scan_settings::{CallbackType, ScanResult};
use crate::gatt::service::{IBluetoothGattCallback, IBluetoothGattServerCallback};
use crate::gatt::status::{AdvertisingStatus, GattStatus, ScanStatus};

/// Routes callback invocations into a channel of CallbackEvents, and plays the remote object
/// for death notification.
pub struct MockCallbacks {
    object_id: String,
    tx: mpsc::UnboundedSender<CallbackEvents>,
    observers: Mutex<HashMap<u32, Box<dyn Fn() + Send>>>,
    next_observer: AtomicU32,
    dead: AtomicBool,
}

impl MockCallbacks {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new(object_id: &str) -> (Arc<Self>, UnboundedReceiver<CallbackEvents>) {
        let (tx, rx) = unbounded_channel();
        let callbacks = MockCallbacks {
            object_id: object_id.to_string(),
            tx,
            observers: Mutex::new(HashMap::new()),
            next_observer: AtomicU32::new(1),
            dead: AtomicBool::new(false),
        };
        (Arc::new(callbacks), rx)
    }

    /// A remote object that is gone before anyone watches it.
    pub fn new_dead(object_id: &str) -> (Arc<Self>, UnboundedReceiver<CallbackEvents>) {
        let (callbacks, rx) = Self::new(object_id);
        callbacks.dead.store(true, Ordering::SeqCst);
        (callbacks, rx)
    }

    /// Simulates the owning process dying: every observer fires once.
    pub fn die(&self) {
        self.dead.store(true, Ordering::SeqCst);
        let observers: Vec<_> = self.observers.lock().unwrap().drain().collect();
        for (_, observer) in observers {
            observer();
        }
    }

    /// Number of death observers currently registered.
    pub fn active_links(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    fn send(&self, event: CallbackEvents) {
        self.tx.send(event).unwrap();
    }
}

impl RPCProxy for MockCallbacks {
    fn register_disconnect(&self, f: Box<dyn Fn() + Send>) -> anyhow::Result<u32> {
        if self.dead.load(Ordering::SeqCst) {
            bail!("{} is disconnected", self.object_id);
        }
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().unwrap().insert(id, f);
        Ok(id)
    }

    fn unregister(&self, id: u32) -> bool {
        self.observers.lock().unwrap().remove(&id).is_some()
    }

    fn get_object_id(&self) -> String {
        self.object_id.clone()
    }
}

/// Events representing calls to the callback interfaces
#[derive(Debug, PartialEq)]
pub enum CallbackEvents {
    /// reg_id, advertiser_id, tx_power, status
    AdvertisingSetStarted(i32, i32, i32, AdvertisingStatus),
    /// advertiser_id, address_type, address
    OwnAddressRead(i32, i32, RawAddress),
    AdvertisingSetStopped(i32),
    AdvertisingEnabled(i32, bool, AdvertisingStatus),
    AdvertisingDataSet(i32, AdvertisingStatus),
    ScanResponseDataSet(i32, AdvertisingStatus),
    /// advertiser_id, tx_power, status
    AdvertisingParametersUpdated(i32, i32, AdvertisingStatus),
    PeriodicAdvertisingParametersUpdated(i32, AdvertisingStatus),
    PeriodicAdvertisingDataSet(i32, AdvertisingStatus),
    PeriodicAdvertisingEnabled(i32, bool, AdvertisingStatus),

    /// sync_handle, sid, address, status
    SyncEstablished(i32, i32, RawAddress, GattStatus),
    /// sync_handle, rssi, data
    PeriodicAdvertisingReport(i32, i32, Vec<u8>),
    SyncLost(i32),

    ScannerRegistered(Uuid128Bit, i32, ScanStatus),
    ScanResult(ScanResult),
    BatchScanResults(Vec<ScanResult>),
    FoundOrLost(bool, ScanResult),
    ScanManagerError(ScanStatus),

    /// status, client_if
    ClientRegistered(GattStatus, i32),
    /// status, client_if, connected, address
    ClientConnectionState(GattStatus, i32, bool, RawAddress),
    SearchComplete(RawAddress, Vec<GattDbElement>, GattStatus),
    /// address, status, handle, value
    CharacteristicRead(RawAddress, GattStatus, i32, Vec<u8>),
    /// address, status, handle
    CharacteristicWrite(RawAddress, GattStatus, i32),
    DescriptorRead(RawAddress, GattStatus, i32, Vec<u8>),
    DescriptorWrite(RawAddress, GattStatus, i32),
    ExecuteWrite(RawAddress, GattStatus),
    /// address, handle, value
    Notify(RawAddress, i32, Vec<u8>),
    /// address, rssi, status
    ReadRemoteRssi(RawAddress, i32, GattStatus),
    /// address, mtu, status
    ConfigureMtu(RawAddress, i32, GattStatus),
    /// status, server_if
    ServerRegistered(GattStatus, i32),
    /// server_if, connected, address
    ServerConnectionState(i32, bool, RawAddress),
    ServiceAdded(GattStatus, Vec<GattDbElement>),
    /// address, trans_id, offset, is_long, handle
    CharacteristicReadRequest(RawAddress, i32, i32, bool, i32),
    DescriptorReadRequest(RawAddress, i32, i32, bool, i32),
    /// address, trans_id, offset, is_prep, need_rsp, handle, value
    CharacteristicWriteRequest(RawAddress, i32, i32, bool, bool, i32, Vec<u8>),
    DescriptorWriteRequest(RawAddress, i32, i32, bool, bool, i32, Vec<u8>),
    /// address, trans_id, exec_write
    ServerExecuteWrite(RawAddress, i32, bool),
    NotificationSent(RawAddress, GattStatus),
    MtuChanged(RawAddress, i32),
}

impl IAdvertisingSetCallback for MockCallbacks {
    fn on_advertising_set_started(
        &self,
        reg_id: i32,
        advertiser_id: i32,
        tx_power: i32,
        status: AdvertisingStatus,
    ) {
        self.send(CallbackEvents::AdvertisingSetStarted(reg_id, advertiser_id, tx_power, status));
    }

    fn on_own_address_read(&self, advertiser_id: i32, address_type: i32, address: RawAddress) {
        self.send(CallbackEvents::OwnAddressRead(advertiser_id, address_type, address));
    }

    fn on_advertising_set_stopped(&self, advertiser_id: i32) {
        self.send(CallbackEvents::AdvertisingSetStopped(advertiser_id));
    }

    fn on_advertising_enabled(&self, advertiser_id: i32, enable: bool, status: AdvertisingStatus) {
        self.send(CallbackEvents::AdvertisingEnabled(advertiser_id, enable, status));
    }

    fn on_advertising_data_set(&self, advertiser_id: i32, status: AdvertisingStatus) {
        self.send(CallbackEvents::AdvertisingDataSet(advertiser_id, status));
    }

    fn on_scan_response_data_set(&self, advertiser_id: i32, status: AdvertisingStatus) {
        self.send(CallbackEvents::ScanResponseDataSet(advertiser_id, status));
    }

    fn on_advertising_parameters_updated(
        &self,
        advertiser_id: i32,
        tx_power: i32,
        status: AdvertisingStatus,
    ) {
        self.send(CallbackEvents::AdvertisingParametersUpdated(advertiser_id, tx_power, status));
    }

    fn on_periodic_advertising_parameters_updated(
        &self,
        advertiser_id: i32,
        status: AdvertisingStatus,
    ) {
        self.send(CallbackEvents::PeriodicAdvertisingParametersUpdated(advertiser_id, status));
    }

    fn on_periodic_advertising_data_set(&self, advertiser_id: i32, status: AdvertisingStatus) {
        self.send(CallbackEvents::PeriodicAdvertisingDataSet(advertiser_id, status));
    }

    fn on_periodic_advertising_enabled(
        &self,
        advertiser_id: i32,
        enable: bool,
        status: AdvertisingStatus,
    ) {
        self.send(CallbackEvents::PeriodicAdvertisingEnabled(advertiser_id, enable, status));
    }
}

impl IPeriodicAdvertisingCallback for MockCallbacks {
    fn on_sync_established(
        &self,
        sync_handle: i32,
        sid: i32,
        _address_type: i32,
        address: RawAddress,
        _phy: i32,
        _interval: i32,
        status: GattStatus,
    ) {
        self.send(CallbackEvents::SyncEstablished(sync_handle, sid, address, status));
    }

    fn on_periodic_advertising_report(
        &self,
        sync_handle: i32,
        _tx_power: i32,
        rssi: i32,
        _data_status: i32,
        data: Vec<u8>,
    ) {
        self.send(CallbackEvents::PeriodicAdvertisingReport(sync_handle, rssi, data));
    }

    fn on_sync_lost(&self, sync_handle: i32) {
        self.send(CallbackEvents::SyncLost(sync_handle));
    }
}

impl IScannerCallback for MockCallbacks {
    fn on_scanner_registered(&self, uuid: Uuid128Bit, scanner_id: i32, status: ScanStatus) {
        self.send(CallbackEvents::ScannerRegistered(uuid, scanner_id, status));
    }

    fn on_scan_result(&self, result: ScanResult) {
        self.send(CallbackEvents::ScanResult(result));
    }

    fn on_batch_scan_results(&self, results: Vec<ScanResult>) {
        self.send(CallbackEvents::BatchScanResults(results));
    }

    fn on_found_or_lost(&self, on_found: bool, result: ScanResult) {
        self.send(CallbackEvents::FoundOrLost(on_found, result));
    }

    fn on_scan_manager_error(&self, error: ScanStatus) {
        self.send(CallbackEvents::ScanManagerError(error));
    }
}

impl IBluetoothGattCallback for MockCallbacks {
    fn on_client_registered(&self, status: GattStatus, client_if: i32) {
        self.send(CallbackEvents::ClientRegistered(status, client_if));
    }

    fn on_client_connection_state(
        &self,
        status: GattStatus,
        client_if: i32,
        connected: bool,
        address: RawAddress,
    ) {
        self.send(CallbackEvents::ClientConnectionState(status, client_if, connected, address));
    }

    fn on_search_complete(
        &self,
        address: RawAddress,
        services: Vec<GattDbElement>,
        status: GattStatus,
    ) {
        self.send(CallbackEvents::SearchComplete(address, services, status));
    }

    fn on_characteristic_read(
        &self,
        address: RawAddress,
        status: GattStatus,
        handle: i32,
        value: Vec<u8>,
    ) {
        self.send(CallbackEvents::CharacteristicRead(address, status, handle, value));
    }

    fn on_characteristic_write(&self, address: RawAddress, status: GattStatus, handle: i32) {
        self.send(CallbackEvents::CharacteristicWrite(address, status, handle));
    }

    fn on_descriptor_read(
        &self,
        address: RawAddress,
        status: GattStatus,
        handle: i32,
        value: Vec<u8>,
    ) {
        self.send(CallbackEvents::DescriptorRead(address, status, handle, value));
    }

    fn on_descriptor_write(&self, address: RawAddress, status: GattStatus, handle: i32) {
        self.send(CallbackEvents::DescriptorWrite(address, status, handle));
    }

    fn on_execute_write(&self, address: RawAddress, status: GattStatus) {
        self.send(CallbackEvents::ExecuteWrite(address, status));
    }

    fn on_notify(&self, address: RawAddress, handle: i32, value: Vec<u8>) {
        self.send(CallbackEvents::Notify(address, handle, value));
    }

    fn on_read_remote_rssi(&self, address: RawAddress, rssi: i32, status: GattStatus) {
        self.send(CallbackEvents::ReadRemoteRssi(address, rssi, status));
    }

    fn on_configure_mtu(&self, address: RawAddress, mtu: i32, status: GattStatus) {
        self.send(CallbackEvents::ConfigureMtu(address, mtu, status));
    }
}

impl IBluetoothGattServerCallback for MockCallbacks {
    fn on_server_registered(&self, status: GattStatus, server_if: i32) {
        self.send(CallbackEvents::ServerRegistered(status, server_if));
    }

    fn on_server_connection_state(&self, server_if: i32, connected: bool, address: RawAddress) {
        self.send(CallbackEvents::ServerConnectionState(server_if, connected, address));
    }

    fn on_service_added(&self, status: GattStatus, service: Vec<GattDbElement>) {
        self.send(CallbackEvents::ServiceAdded(status, service));
    }

    fn on_characteristic_read_request(
        &self,
        address: RawAddress,
        trans_id: i32,
        offset: i32,
        is_long: bool,
        handle: i32,
    ) {
        self.send(CallbackEvents::CharacteristicReadRequest(
            address, trans_id, offset, is_long, handle,
        ));
    }

    fn on_descriptor_read_request(
        &self,
        address: RawAddress,
        trans_id: i32,
        offset: i32,
        is_long: bool,
        handle: i32,
    ) {
        self.send(CallbackEvents::DescriptorReadRequest(
            address, trans_id, offset, is_long, handle,
        ));
    }

    #[allow(clippy::too_many_arguments)]
    fn on_characteristic_write_request(
        &self,
        address: RawAddress,
        trans_id: i32,
        offset: i32,
        is_prep: bool,
        need_rsp: bool,
        handle: i32,
        value: Vec<u8>,
    ) {
        self.send(CallbackEvents::CharacteristicWriteRequest(
            address, trans_id, offset, is_prep, need_rsp, handle, value,
        ));
    }

    #[allow(clippy::too_many_arguments)]
    fn on_descriptor_write_request(
        &self,
        address: RawAddress,
        trans_id: i32,
        offset: i32,
        is_prep: bool,
        need_rsp: bool,
        handle: i32,
        value: Vec<u8>,
    ) {
        self.send(CallbackEvents::DescriptorWriteRequest(
            address, trans_id, offset, is_prep, need_rsp, handle, value,
        ));
    }

    fn on_execute_write(&self, address: RawAddress, trans_id: i32, exec_write: bool) {
        self.send(CallbackEvents::ServerExecuteWrite(address, trans_id, exec_write));
    }

    fn on_notification_sent(&self, address: RawAddress, status: GattStatus) {
        self.send(CallbackEvents::NotificationSent(address, status));
    }

    fn on_mtu_changed(&self, address: RawAddress, mtu: i32) {
        self.send(CallbackEvents::MtuChanged(address, mtu));
    }
}

/// Routes intent deliveries into a channel of IntentEvents. A canceled intent refuses them.
pub struct MockScanIntent {
    object_id: String,
    tx: mpsc::UnboundedSender<IntentEvents>,
    canceled: AtomicBool,
}

impl MockScanIntent {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new(object_id: &str) -> (Arc<Self>, UnboundedReceiver<IntentEvents>) {
        let (tx, rx) = unbounded_channel();
        let intent = MockScanIntent {
            object_id: object_id.to_string(),
            tx,
            canceled: AtomicBool::new(false),
        };
        (Arc::new(intent), rx)
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn deliver(&self, event: IntentEvents) -> anyhow::Result<()> {
        if self.canceled.load(Ordering::SeqCst) {
            bail!("intent {} was canceled", self.object_id);
        }
        self.tx.send(event).unwrap();
        Ok(())
    }
}

/// Events representing deliveries to IScanIntent
#[derive(Debug, PartialEq)]
pub enum IntentEvents {
    Results(Vec<ScanResult>, CallbackType),
    Error(ScanStatus),
}

impl IScanIntent for MockScanIntent {
    fn get_object_id(&self) -> String {
        self.object_id.clone()
    }

    fn send_results(
        &self,
        results: Vec<ScanResult>,
        callback_type: CallbackType,
    ) -> anyhow::Result<()> {
        self.deliver(IntentEvents::Results(results, callback_type))
    }

    fn send_error(&self, error: ScanStatus) -> anyhow::Result<()> {
        self.deliver(IntentEvents::Error(error))
    }
}
