//! Boundary to the native controller stack.
//!
//! Commands go down through the `*Interface` traits and return immediately. Their outcomes come
//! back up, together with unsolicited events, as the `*Callbacks` enums carried on the dispatch
//! channel (see `Message`).

use std::sync::Arc;

use crate::core::address::RawAddress;
use crate::core::uuid::Uuid128Bit;
use crate::gatt::scan_settings::{ScanFilter, ScanResult, ScanSettings};

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum LePhy {
    Invalid = 0,
    Phy1m = 1,
    Phy2m = 2,
    PhyCoded = 3,
}

impl Default for LePhy {
    fn default() -> Self {
        LePhy::Phy1m
    }
}

/// Advertising parameters as the controller takes them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdvertiseParameters {
    pub advertising_event_properties: u16,
    pub min_interval: u32,
    pub max_interval: u32,
    pub channel_map: u8,
    pub tx_power: i8,
    pub primary_advertising_phy: u8,
    pub secondary_advertising_phy: u8,
    pub scan_request_notification_enable: bool,
    pub own_address_type: i8,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeriodicAdvertiseParameters {
    pub enable: bool,
    pub min_interval: u16,
    pub max_interval: u16,
    pub periodic_advertising_properties: u16,
}

pub trait BleAdvertiserInterface: Send + Sync {
    fn start_advertising_set(
        &self,
        reg_id: i32,
        params: AdvertiseParameters,
        adv_data: Vec<u8>,
        scan_response: Vec<u8>,
        periodic_params: PeriodicAdvertiseParameters,
        periodic_data: Vec<u8>,
        duration: u16,
        max_ext_adv_events: u8,
    );
    fn stop_advertising_set(&self, advertiser_id: u8);
    fn get_own_address(&self, advertiser_id: u8);
    fn enable(&self, advertiser_id: u8, enable: bool, duration: u16, max_ext_adv_events: u8);
    fn set_data(&self, advertiser_id: u8, set_scan_rsp: bool, data: Vec<u8>);
    fn set_parameters(&self, advertiser_id: u8, params: AdvertiseParameters);
    fn set_periodic_advertising_parameters(
        &self,
        advertiser_id: u8,
        params: PeriodicAdvertiseParameters,
    );
    fn set_periodic_advertising_data(&self, advertiser_id: u8, data: Vec<u8>);
    fn set_periodic_advertising_enable(&self, advertiser_id: u8, enable: bool);
}

pub trait PeriodicSyncInterface: Send + Sync {
    fn start_sync(&self, sid: u8, address: RawAddress, skip: u16, timeout: u16, reg_id: i32);
    fn stop_sync(&self, sync_handle: u16);
}

pub trait BleScannerInterface: Send + Sync {
    fn register_scanner(&self, app_uuid: Uuid128Bit);
    fn unregister(&self, scanner_id: u8);
    fn start_scan(&self, scanner_id: u8, settings: ScanSettings, filters: Vec<ScanFilter>);
    fn stop_scan(&self, scanner_id: u8);
    fn batchscan_read_reports(&self, scanner_id: u8, report_format: i32);
}

pub trait GattClientInterface: Send + Sync {
    fn register_client(&self, app_uuid: Uuid128Bit);
    fn unregister_client(&self, client_if: i32);
    fn connect(&self, client_if: i32, address: RawAddress, is_direct: bool, transport: i32);
    fn disconnect(&self, client_if: i32, address: RawAddress, conn_id: i32);
    fn search_service(&self, conn_id: i32, filter_uuid: Option<Uuid128Bit>);
    fn get_gatt_db(&self, conn_id: i32);
    fn read_characteristic(&self, conn_id: i32, handle: u16, auth_req: i32);
    fn write_characteristic(
        &self,
        conn_id: i32,
        handle: u16,
        write_type: i32,
        auth_req: i32,
        value: Vec<u8>,
    );
    fn read_descriptor(&self, conn_id: i32, handle: u16, auth_req: i32);
    fn write_descriptor(&self, conn_id: i32, handle: u16, auth_req: i32, value: Vec<u8>);
    fn execute_write(&self, conn_id: i32, execute: bool);
    fn register_for_notification(
        &self,
        client_if: i32,
        address: RawAddress,
        handle: u16,
        enable: bool,
    );
    fn read_remote_rssi(&self, client_if: i32, address: RawAddress);
    fn configure_mtu(&self, conn_id: i32, mtu: i32);
    fn conn_parameter_update(
        &self,
        address: RawAddress,
        min_interval: i32,
        max_interval: i32,
        latency: i32,
        timeout: i32,
    );
    fn refresh(&self, client_if: i32, address: RawAddress);
}

pub trait GattServerInterface: Send + Sync {
    fn register_server(&self, app_uuid: Uuid128Bit);
    fn unregister_server(&self, server_if: i32);
    fn connect(&self, server_if: i32, address: RawAddress, is_direct: bool, transport: i32);
    fn disconnect(&self, server_if: i32, address: RawAddress, conn_id: i32);
    fn add_service(&self, server_if: i32, service: Vec<GattDbElement>);
    fn delete_service(&self, server_if: i32, service_handle: u16);
    /// Sends an indication when `confirm` is set, a notification otherwise.
    fn send_indication(
        &self,
        server_if: i32,
        handle: u16,
        conn_id: i32,
        confirm: bool,
        value: Vec<u8>,
    );
    fn send_response(
        &self,
        server_if: i32,
        conn_id: i32,
        trans_id: i32,
        status: u32,
        handle: u16,
        offset: i32,
        value: Vec<u8>,
    );
}

/// Every native interface the managers talk to.
#[derive(Clone)]
pub struct Gatt {
    pub advertiser: Arc<dyn BleAdvertiserInterface>,
    pub periodic_sync: Arc<dyn PeriodicSyncInterface>,
    pub scanner: Arc<dyn BleScannerInterface>,
    pub client: Arc<dyn GattClientInterface>,
    pub server: Arc<dyn GattServerInterface>,
}

#[derive(Debug)]
pub enum AdvertiserCallbacks {
    /// reg_id, advertiser_id, tx_power, status
    OnAdvertisingSetStarted(i32, u8, i8, u8),
    /// advertiser_id, address_type, address
    OnOwnAddressRead(u8, u8, RawAddress),
    /// advertiser_id, enable, status
    OnAdvertisingEnabled(u8, bool, u8),
    /// advertiser_id, status
    OnAdvertisingDataSet(u8, u8),
    OnScanResponseDataSet(u8, u8),
    /// advertiser_id, tx_power, status
    OnAdvertisingParametersUpdated(u8, i8, u8),
    OnPeriodicAdvertisingParametersUpdated(u8, u8),
    OnPeriodicAdvertisingDataSet(u8, u8),
    /// advertiser_id, enable, status
    OnPeriodicAdvertisingEnabled(u8, bool, u8),
}

#[derive(Debug)]
pub enum PeriodicSyncCallbacks {
    /// reg_id, sync_handle, sid, address_type, address, phy, interval, status
    OnSyncStarted(i32, u16, u8, u8, RawAddress, u8, u16, u8),
    /// sync_handle, tx_power, rssi, data_status, data
    OnSyncReport(u16, i8, i8, u8, Vec<u8>),
    /// sync_handle
    OnSyncLost(u16),
}

/// A filter hit or loss reported by the controller's advertisement tracking.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdvertisingTrackInfo {
    pub scanner_id: u8,
    pub filter_index: u8,
    pub advertiser_state: u8,
    pub address: RawAddress,
    pub address_type: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub timestamp: u16,
    pub adv_packet: Vec<u8>,
    pub scan_response: Vec<u8>,
}

#[derive(Debug)]
pub enum ScannerCallbacks {
    /// app_uuid, scanner_id, status
    OnScannerRegistered(Uuid128Bit, u8, u8),
    OnScanResult(ScanResult),
    /// status, scanner_id, report_format, num_records, data
    OnBatchScanReports(u8, u8, i32, i32, Vec<u8>),
    OnBatchScanThresholdCrossed(u8),
    OnTrackAdvFoundLost(AdvertisingTrackInfo),
    /// scanner_id, error
    OnScanManagerError(u8, u8),
}

/// Kinds of `GattDbElement`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum GattDbElementType {
    PrimaryService = 0,
    SecondaryService = 1,
    IncludedService = 2,
    Characteristic = 3,
    Descriptor = 4,
}

/// One attribute of a GATT database, remote or hosted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GattDbElement {
    pub id: u16,
    pub uuid: Uuid128Bit,
    pub element_type: u32,
    pub attribute_handle: u16,
    pub start_handle: u16,
    pub end_handle: u16,
    pub properties: u8,
}

#[derive(Debug)]
pub enum GattClientCallbacks {
    /// status, client_if, app_uuid
    RegisterClient(u32, i32, Uuid128Bit),
    /// conn_id, status, client_if, address
    Connect(i32, u32, i32, RawAddress),
    Disconnect(i32, u32, i32, RawAddress),
    /// conn_id, status
    SearchComplete(i32, u32),
    /// conn_id, elements
    GetGattDb(i32, Vec<GattDbElement>),
    /// conn_id, address, handle, is_notify, value
    Notify(i32, RawAddress, u16, bool, Vec<u8>),
    /// conn_id, status, handle, value
    ReadCharacteristic(i32, u32, u16, Vec<u8>),
    /// conn_id, status, handle
    WriteCharacteristic(i32, u32, u16),
    ReadDescriptor(i32, u32, u16, Vec<u8>),
    WriteDescriptor(i32, u32, u16),
    /// conn_id, status
    ExecuteWrite(i32, u32),
    /// conn_id, status, registered, handle
    RegisterForNotification(i32, u32, bool, u16),
    /// client_if, address, rssi, status
    ReadRemoteRssi(i32, RawAddress, i32, u32),
    /// conn_id, status, mtu
    ConfigureMtu(i32, u32, i32),
    /// conn_id, congested
    Congestion(i32, bool),
}

#[derive(Debug)]
pub enum GattServerCallbacks {
    /// status, server_if, app_uuid
    RegisterServer(u32, i32, Uuid128Bit),
    /// conn_id, server_if, connected, address
    Connection(i32, i32, bool, RawAddress),
    /// status, server_if, elements with their assigned handles
    ServiceAdded(u32, i32, Vec<GattDbElement>),
    /// status, server_if, service_handle
    ServiceDeleted(u32, i32, u16),
    /// conn_id, trans_id, address, handle, offset, is_long
    RequestReadCharacteristic(i32, i32, RawAddress, u16, i32, bool),
    RequestReadDescriptor(i32, i32, RawAddress, u16, i32, bool),
    /// conn_id, trans_id, address, handle, offset, need_rsp, is_prep, value
    RequestWriteCharacteristic(i32, i32, RawAddress, u16, i32, bool, bool, Vec<u8>),
    RequestWriteDescriptor(i32, i32, RawAddress, u16, i32, bool, bool, Vec<u8>),
    /// conn_id, trans_id, address, exec_write
    RequestExecWrite(i32, i32, RawAddress, bool),
    /// conn_id, status
    IndicationSent(i32, u32),
    /// conn_id, congested
    Congestion(i32, bool),
    /// conn_id, mtu
    MtuChanged(i32, i32),
}
