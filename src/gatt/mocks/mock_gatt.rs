//! Mocked implementations of the GATT client and server interfaces, and a full mocked `Gatt`.

use std::sync::Arc;
use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

use crate::core::address::RawAddress;
use crate::core::uuid::Uuid128Bit;
use crate::gatt::mocks::mock_advertiser::{AdvertiserEvents, MockAdvertiser};
use crate::gatt::mocks::mock_periodic_sync::{MockPeriodicSync, PeriodicSyncEvents};
use crate::gatt::mocks::mock_scanner::{MockScanner, ScannerEvents};
use crate::gatt::native::{Gatt, GattClientInterface, GattDbElement, GattServerInterface};

/// Routes calls to GattClientInterface into a channel of GattClientEvents
pub struct MockGattClient(mpsc::UnboundedSender<GattClientEvents>);

impl MockGattClient {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<GattClientEvents>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

/// Events representing calls to GattClientInterface
#[derive(Debug, PartialEq, Eq)]
pub enum GattClientEvents {
    RegisterClient(Uuid128Bit),
    UnregisterClient(i32),
    /// client_if, address, is_direct, transport
    Connect(i32, RawAddress, bool, i32),
    /// client_if, address, conn_id
    Disconnect(i32, RawAddress, i32),
    SearchService(i32, Option<Uuid128Bit>),
    GetGattDb(i32),
    /// conn_id, handle, auth_req
    ReadCharacteristic(i32, u16, i32),
    /// conn_id, handle, write_type, auth_req, value
    WriteCharacteristic(i32, u16, i32, i32, Vec<u8>),
    ReadDescriptor(i32, u16, i32),
    /// conn_id, handle, auth_req, value
    WriteDescriptor(i32, u16, i32, Vec<u8>),
    ExecuteWrite(i32, bool),
    /// client_if, address, handle, enable
    RegisterForNotification(i32, RawAddress, u16, bool),
    ReadRemoteRssi(i32, RawAddress),
    ConfigureMtu(i32, i32),
    /// address, min_interval, max_interval, latency, timeout
    ConnParameterUpdate(RawAddress, i32, i32, i32, i32),
    Refresh(i32, RawAddress),
}

impl GattClientInterface for MockGattClient {
    fn register_client(&self, app_uuid: Uuid128Bit) {
        self.0.send(GattClientEvents::RegisterClient(app_uuid)).unwrap();
    }

    fn unregister_client(&self, client_if: i32) {
        self.0.send(GattClientEvents::UnregisterClient(client_if)).unwrap();
    }

    fn connect(&self, client_if: i32, address: RawAddress, is_direct: bool, transport: i32) {
        self.0.send(GattClientEvents::Connect(client_if, address, is_direct, transport)).unwrap();
    }

    fn disconnect(&self, client_if: i32, address: RawAddress, conn_id: i32) {
        self.0.send(GattClientEvents::Disconnect(client_if, address, conn_id)).unwrap();
    }

    fn search_service(&self, conn_id: i32, filter_uuid: Option<Uuid128Bit>) {
        self.0.send(GattClientEvents::SearchService(conn_id, filter_uuid)).unwrap();
    }

    fn get_gatt_db(&self, conn_id: i32) {
        self.0.send(GattClientEvents::GetGattDb(conn_id)).unwrap();
    }

    fn read_characteristic(&self, conn_id: i32, handle: u16, auth_req: i32) {
        self.0.send(GattClientEvents::ReadCharacteristic(conn_id, handle, auth_req)).unwrap();
    }

    fn write_characteristic(
        &self,
        conn_id: i32,
        handle: u16,
        write_type: i32,
        auth_req: i32,
        value: Vec<u8>,
    ) {
        self.0
            .send(GattClientEvents::WriteCharacteristic(
                conn_id, handle, write_type, auth_req, value,
            ))
            .unwrap();
    }

    fn read_descriptor(&self, conn_id: i32, handle: u16, auth_req: i32) {
        self.0.send(GattClientEvents::ReadDescriptor(conn_id, handle, auth_req)).unwrap();
    }

    fn write_descriptor(&self, conn_id: i32, handle: u16, auth_req: i32, value: Vec<u8>) {
        self.0.send(GattClientEvents::WriteDescriptor(conn_id, handle, auth_req, value)).unwrap();
    }

    fn execute_write(&self, conn_id: i32, execute: bool) {
        self.0.send(GattClientEvents::ExecuteWrite(conn_id, execute)).unwrap();
    }

    fn register_for_notification(
        &self,
        client_if: i32,
        address: RawAddress,
        handle: u16,
        enable: bool,
    ) {
        self.0
            .send(GattClientEvents::RegisterForNotification(client_if, address, handle, enable))
            .unwrap();
    }

    fn read_remote_rssi(&self, client_if: i32, address: RawAddress) {
        self.0.send(GattClientEvents::ReadRemoteRssi(client_if, address)).unwrap();
    }

    fn configure_mtu(&self, conn_id: i32, mtu: i32) {
        self.0.send(GattClientEvents::ConfigureMtu(conn_id, mtu)).unwrap();
    }

    fn conn_parameter_update(
        &self,
        address: RawAddress,
        min_interval: i32,
        max_interval: i32,
        latency: i32,
        timeout: i32,
    ) {
        self.0
            .send(GattClientEvents::ConnParameterUpdate(
                address,
                min_interval,
                max_interval,
                latency,
                timeout,
            ))
            .unwrap();
    }

    fn refresh(&self, client_if: i32, address: RawAddress) {
        self.0.send(GattClientEvents::Refresh(client_if, address)).unwrap();
    }
}

/// Routes calls to GattServerInterface into a channel of GattServerEvents
pub struct MockGattServer(mpsc::UnboundedSender<GattServerEvents>);

impl MockGattServer {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<GattServerEvents>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

/// Events representing calls to GattServerInterface
#[derive(Debug, PartialEq, Eq)]
pub enum GattServerEvents {
    RegisterServer(Uuid128Bit),
    UnregisterServer(i32),
    /// server_if, address, is_direct, transport
    Connect(i32, RawAddress, bool, i32),
    /// server_if, address, conn_id
    Disconnect(i32, RawAddress, i32),
    AddService(i32, Vec<GattDbElement>),
    /// server_if, service_handle
    DeleteService(i32, u16),
    /// server_if, handle, conn_id, confirm, value
    SendIndication(i32, u16, i32, bool, Vec<u8>),
    /// server_if, conn_id, trans_id, status, handle, offset, value
    SendResponse(i32, i32, i32, u32, u16, i32, Vec<u8>),
}

impl GattServerInterface for MockGattServer {
    fn register_server(&self, app_uuid: Uuid128Bit) {
        self.0.send(GattServerEvents::RegisterServer(app_uuid)).unwrap();
    }

    fn unregister_server(&self, server_if: i32) {
        self.0.send(GattServerEvents::UnregisterServer(server_if)).unwrap();
    }

    fn connect(&self, server_if: i32, address: RawAddress, is_direct: bool, transport: i32) {
        self.0.send(GattServerEvents::Connect(server_if, address, is_direct, transport)).unwrap();
    }

    fn disconnect(&self, server_if: i32, address: RawAddress, conn_id: i32) {
        self.0.send(GattServerEvents::Disconnect(server_if, address, conn_id)).unwrap();
    }

    fn add_service(&self, server_if: i32, service: Vec<GattDbElement>) {
        self.0.send(GattServerEvents::AddService(server_if, service)).unwrap();
    }

    fn delete_service(&self, server_if: i32, service_handle: u16) {
        self.0.send(GattServerEvents::DeleteService(server_if, service_handle)).unwrap();
    }

    fn send_indication(
        &self,
        server_if: i32,
        handle: u16,
        conn_id: i32,
        confirm: bool,
        value: Vec<u8>,
    ) {
        self.0
            .send(GattServerEvents::SendIndication(server_if, handle, conn_id, confirm, value))
            .unwrap();
    }

    fn send_response(
        &self,
        server_if: i32,
        conn_id: i32,
        trans_id: i32,
        status: u32,
        handle: u16,
        offset: i32,
        value: Vec<u8>,
    ) {
        self.0
            .send(GattServerEvents::SendResponse(
                server_if, conn_id, trans_id, status, handle, offset, value,
            ))
            .unwrap();
    }
}

/// RX sides of every interface of a mocked `Gatt`.
pub struct MockGattEvents {
    pub advertiser: UnboundedReceiver<AdvertiserEvents>,
    pub periodic_sync: UnboundedReceiver<PeriodicSyncEvents>,
    pub scanner: UnboundedReceiver<ScannerEvents>,
    pub client: UnboundedReceiver<GattClientEvents>,
    pub server: UnboundedReceiver<GattServerEvents>,
}

/// Builds a `Gatt` whose interfaces are all mocked.
pub fn mock_gatt() -> (Gatt, MockGattEvents) {
    let (advertiser, advertiser_rx) = MockAdvertiser::new();
    let (periodic_sync, periodic_sync_rx) = MockPeriodicSync::new();
    let (scanner, scanner_rx) = MockScanner::new();
    let (client, client_rx) = MockGattClient::new();
    let (server, server_rx) = MockGattServer::new();
    (
        Gatt {
            advertiser: Arc::new(advertiser),
            periodic_sync: Arc::new(periodic_sync),
            scanner: Arc::new(scanner),
            client: Arc::new(client),
            server: Arc::new(server),
        },
        MockGattEvents {
            advertiser: advertiser_rx,
            periodic_sync: periodic_sync_rx,
            scanner: scanner_rx,
            client: client_rx,
            server: server_rx,
        },
    )
}
