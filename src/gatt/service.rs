//! The GATT service: client and server registrations with their connections, plus the LE
//! managers for advertising, periodic sync, and scanning.
//!
//! Everything here runs under the service lock. Native outcomes reach the service through
//! `Stack::dispatch`, which calls back into `dispatch_*_callbacks`.

use log::{debug, error, info, warn};
use num_traits::FromPrimitive;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{self, GattConfig};
use crate::core::address::RawAddress;
use crate::core::liveness::{link_to_death, unlink_to_death, RPCProxy};
use crate::core::uuid::{Uuid128Bit, UuidHelper};
use crate::gatt::advertise_manager::AdvertiseManager;
use crate::gatt::context_map::{CallerIdentity, ContextMap};
use crate::gatt::handle_map::HandleMap;
use crate::gatt::native::{
    Gatt, GattClientCallbacks, GattDbElement, GattDbElementType, GattServerCallbacks,
};
use crate::gatt::periodic_scan_manager::PeriodicScanManager;
use crate::gatt::scan_manager::ScanManager;
use crate::gatt::scan_stats::{BatteryStatsReporter, ScanLimits};
use crate::gatt::status::GattStatus;
use crate::Message;

/// Callback for GATT Client API.
pub trait IBluetoothGattCallback: RPCProxy + Send + Sync {
    /// When the `register_client` request is done.
    fn on_client_registered(&self, status: GattStatus, client_if: i32);

    /// A connection of this client went up or down.
    fn on_client_connection_state(
        &self,
        status: GattStatus,
        client_if: i32,
        connected: bool,
        address: RawAddress,
    );

    /// When the `discover_services` request is done.
    fn on_search_complete(
        &self,
        address: RawAddress,
        services: Vec<GattDbElement>,
        status: GattStatus,
    );

    fn on_characteristic_read(
        &self,
        address: RawAddress,
        status: GattStatus,
        handle: i32,
        value: Vec<u8>,
    );

    fn on_characteristic_write(&self, address: RawAddress, status: GattStatus, handle: i32);

    fn on_descriptor_read(
        &self,
        address: RawAddress,
        status: GattStatus,
        handle: i32,
        value: Vec<u8>,
    );

    fn on_descriptor_write(&self, address: RawAddress, status: GattStatus, handle: i32);

    /// When a reliable write transaction is executed or aborted.
    fn on_execute_write(&self, address: RawAddress, status: GattStatus);

    /// A notification or indication from the remote device.
    fn on_notify(&self, address: RawAddress, handle: i32, value: Vec<u8>);

    fn on_read_remote_rssi(&self, address: RawAddress, rssi: i32, status: GattStatus);

    fn on_configure_mtu(&self, address: RawAddress, mtu: i32, status: GattStatus);
}

/// Callback for GATT Server API.
pub trait IBluetoothGattServerCallback: RPCProxy + Send + Sync {
    fn on_server_registered(&self, status: GattStatus, server_if: i32);

    fn on_server_connection_state(&self, server_if: i32, connected: bool, address: RawAddress);

    /// When an `add_service` request is done. The elements carry their assigned handles.
    fn on_service_added(&self, status: GattStatus, service: Vec<GattDbElement>);

    fn on_characteristic_read_request(
        &self,
        address: RawAddress,
        trans_id: i32,
        offset: i32,
        is_long: bool,
        handle: i32,
    );

    fn on_descriptor_read_request(
        &self,
        address: RawAddress,
        trans_id: i32,
        offset: i32,
        is_long: bool,
        handle: i32,
    );

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
    );

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
    );

    fn on_execute_write(&self, address: RawAddress, trans_id: i32, exec_write: bool);

    fn on_notification_sent(&self, address: RawAddress, status: GattStatus);

    fn on_mtu_changed(&self, address: RawAddress, mtu: i32);
}

pub type ClientMap = ContextMap<dyn IBluetoothGattCallback, ()>;
pub type ServerMap = ContextMap<dyn IBluetoothGattServerCallback, ()>;

/// HID report characteristics. Only privileged apps may touch them.
const RESTRICTED_CHARACTERISTICS: [u16; 4] = [0x2a4a, 0x2a4b, 0x2a4c, 0x2a4d];

/// FIDO U2F. Everything under it is restricted.
const RESTRICTED_SERVICE: u16 = 0xfffd;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum GattWriteType {
    Invalid = 0,
    WriteNoRsp = 1,
    Write = 2,
    WritePrepare = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum ConnectionPriority {
    Balanced = 0,
    High = 1,
    LowPower = 2,
}

impl ConnectionPriority {
    /// (min_interval, max_interval, latency)
    fn params(&self) -> (i32, i32, i32) {
        match self {
            ConnectionPriority::High => (
                config::GATT_HIGH_PRIORITY_MIN_INTERVAL,
                config::GATT_HIGH_PRIORITY_MAX_INTERVAL,
                config::GATT_HIGH_PRIORITY_LATENCY,
            ),
            ConnectionPriority::Balanced => (
                config::GATT_BALANCED_PRIORITY_MIN_INTERVAL,
                config::GATT_BALANCED_PRIORITY_MAX_INTERVAL,
                config::GATT_BALANCED_PRIORITY_LATENCY,
            ),
            ConnectionPriority::LowPower => (
                config::GATT_LOW_POWER_MIN_INTERVAL,
                config::GATT_LOW_POWER_MAX_INTERVAL,
                config::GATT_LOW_POWER_LATENCY,
            ),
        }
    }
}

/// Completions held back per app while its link is congested.
struct CongestionQueue<T> {
    queues: HashMap<i32, VecDeque<T>>,
}

impl<T> CongestionQueue<T> {
    fn new() -> Self {
        CongestionQueue { queues: HashMap::new() }
    }

    fn is_congested(&self, app_id: i32) -> bool {
        self.queues.contains_key(&app_id)
    }

    fn push(&mut self, app_id: i32, item: T) {
        self.queues.entry(app_id).or_default().push_back(item);
    }

    /// Returns what was held back once the app is no longer congested.
    fn set_congested(&mut self, app_id: i32, congested: bool) -> VecDeque<T> {
        if congested {
            self.queues.entry(app_id).or_default();
            VecDeque::new()
        } else {
            self.queues.remove(&app_id).unwrap_or_default()
        }
    }

    fn remove(&mut self, app_id: i32) {
        self.queues.remove(&app_id);
    }

    fn clear(&mut self) {
        self.queues.clear();
    }
}

/// Attribute handles of a remote database that only privileged apps may access.
fn restricted_handles(db: &[GattDbElement]) -> HashSet<u16> {
    let fido = UuidHelper::from_u16(RESTRICTED_SERVICE);
    let mut restricted = HashSet::new();
    let mut in_restricted_service = false;
    let mut in_restricted_characteristic = false;

    for el in db {
        match GattDbElementType::from_u32(el.element_type) {
            Some(GattDbElementType::PrimaryService) | Some(GattDbElementType::SecondaryService) => {
                in_restricted_service = el.uuid == fido;
                in_restricted_characteristic = false;
            }
            Some(GattDbElementType::Characteristic) => {
                in_restricted_characteristic = in_restricted_service
                    || RESTRICTED_CHARACTERISTICS
                        .iter()
                        .any(|short| UuidHelper::from_u16(*short) == el.uuid);
                if in_restricted_characteristic {
                    restricted.insert(el.attribute_handle);
                }
            }
            Some(GattDbElementType::Descriptor) => {
                if in_restricted_characteristic {
                    restricted.insert(el.attribute_handle);
                }
            }
            _ => {}
        }
    }
    restricted
}

pub struct GattService {
    gatt: Gatt,
    tx: UnboundedSender<Message>,
    clients: ClientMap,
    servers: ServerMap,
    handle_map: HandleMap,
    /// Remotes with an open reliable write transaction.
    reliable_queue: HashSet<RawAddress>,
    /// conn_id -> handles gated on privilege
    restricted_handles: HashMap<i32, HashSet<u16>>,
    /// (address, status, handle) of characteristic writes, per client_if
    client_congestion: CongestionQueue<(RawAddress, GattStatus, i32)>,
    /// (address, status) of sent notifications, per server_if
    server_congestion: CongestionQueue<(RawAddress, GattStatus)>,
    advertise_manager: AdvertiseManager,
    periodic_scan_manager: PeriodicScanManager,
    scan_manager: ScanManager,
}

impl GattService {
    pub fn new(
        gatt: Gatt,
        tx: UnboundedSender<Message>,
        config: &GattConfig,
        battery_stats: Arc<dyn BatteryStatsReporter>,
    ) -> Self {
        GattService {
            advertise_manager: AdvertiseManager::new(
                gatt.advertiser.clone(),
                tx.clone(),
                config.max_advertisers,
            ),
            periodic_scan_manager: PeriodicScanManager::new(gatt.periodic_sync.clone(), tx.clone()),
            scan_manager: ScanManager::new(
                gatt.scanner.clone(),
                tx.clone(),
                ScanLimits::from(config),
                battery_stats,
                config.max_scan_filters,
            ),
            clients: ContextMap::new(),
            servers: ContextMap::new(),
            handle_map: HandleMap::new(),
            reliable_queue: HashSet::new(),
            restricted_handles: HashMap::new(),
            client_congestion: CongestionQueue::new(),
            server_congestion: CongestionQueue::new(),
            gatt,
            tx,
        }
    }

    pub fn clients(&self) -> &ClientMap {
        &self.clients
    }

    pub fn servers(&self) -> &ServerMap {
        &self.servers
    }

    pub fn advertise_manager(&mut self) -> &mut AdvertiseManager {
        &mut self.advertise_manager
    }

    pub fn periodic_scan_manager(&mut self) -> &mut PeriodicScanManager {
        &mut self.periodic_scan_manager
    }

    pub fn scan_manager(&mut self) -> &mut ScanManager {
        &mut self.scan_manager
    }

    /// Registers a GATT client. Returns the uuid the registration is correlated with.
    pub fn register_client(
        &mut self,
        callback: Arc<dyn IBluetoothGattCallback>,
        caller: &CallerIdentity,
    ) -> anyhow::Result<Uuid128Bit> {
        let uuid = UuidHelper::random();
        debug!("register_client: uuid={}", UuidHelper::to_string(&uuid));
        self.clients.add(uuid, callback.get_object_id(), caller, Some(callback), None)?;
        self.gatt.client.register_client(uuid);
        Ok(uuid)
    }

    pub fn on_client_registered(&mut self, status: u32, client_if: i32, uuid: Uuid128Bit) {
        let status = GattStatus::from_raw(status);
        debug!(
            "on_client_registered: uuid={} client_if={} status={:?}",
            UuidHelper::to_string(&uuid),
            client_if,
            status
        );

        let app = match self.clients.get_by_uuid(&uuid) {
            Some(app) => app,
            None => {
                warn!("No client registration for {}", UuidHelper::to_string(&uuid));
                if status == GattStatus::Success {
                    self.gatt.client.unregister_client(client_if);
                }
                return;
            }
        };
        let callback = match &app.callback {
            Some(cb) => cb.clone(),
            None => return,
        };

        if status != GattStatus::Success {
            self.clients.remove_by_uuid(&uuid);
            callback.on_client_registered(status, client_if);
            return;
        }

        if !self.clients.promote_by_uuid(&uuid, client_if) {
            warn!("Client {} could not be activated", client_if);
            return;
        }
        match link_to_death(callback.as_ref(), &self.tx, move || Message::ClientDied(client_if)) {
            Ok(link) => self.clients.set_death_link(client_if, Some(link)),
            Err(e) => {
                warn!("Client {} owner is gone: {}", client_if, e);
                self.clients.remove(client_if);
                self.gatt.client.unregister_client(client_if);
                return;
            }
        }
        callback.on_client_registered(status, client_if);
    }

    /// Unregisters a GATT client and forgets its connections.
    pub fn unregister_client(&mut self, client_if: i32) {
        debug!("unregister_client: client_if={}", client_if);
        let connections = self.clients.remove_connections_by_app(client_if);
        let app = match self.clients.remove(client_if) {
            Some(app) => app,
            None => {
                error!("unregister_client: invalid client_if {}", client_if);
                return;
            }
        };
        if let Some(cb) = &app.callback {
            unlink_to_death(cb.as_ref(), app.death_link);
        }
        for conn in connections {
            debug!("Dropping connection {} to {}", conn.conn_id, conn.address);
            self.restricted_handles.remove(&conn.conn_id);
        }
        self.client_congestion.remove(client_if);
        if !app.is_pending() {
            self.gatt.client.unregister_client(client_if);
        }
    }

    pub fn client_connect(
        &self,
        client_if: i32,
        address: RawAddress,
        is_direct: bool,
        transport: i32,
    ) {
        debug!("client_connect: client_if={} address={}", client_if, address);
        self.gatt.client.connect(client_if, address, is_direct, transport);
    }

    pub fn client_disconnect(&self, client_if: i32, address: RawAddress) {
        let conn_id = self.clients.conn_id_by_address(client_if, &address);
        debug!("client_disconnect: address={} conn_id={:?}", address, conn_id);
        self.gatt.client.disconnect(client_if, address, conn_id.unwrap_or(0));
    }

    pub fn on_connected(&mut self, conn_id: i32, status: u32, client_if: i32, address: RawAddress) {
        let status = GattStatus::from_raw(status);
        debug!(
            "on_connected: conn_id={} client_if={} address={} status={:?}",
            conn_id, client_if, address, status
        );
        if status == GattStatus::Success {
            self.clients.add_connection(client_if, conn_id, address);
        }
        if let Some(cb) = self.clients.get_by_id(client_if).and_then(|app| app.callback) {
            cb.on_client_connection_state(
                status,
                client_if,
                status == GattStatus::Success,
                address,
            );
        }
    }

    pub fn on_disconnected(
        &mut self,
        conn_id: i32,
        status: u32,
        client_if: i32,
        address: RawAddress,
    ) {
        let status = GattStatus::from_raw(status);
        debug!(
            "on_disconnected: conn_id={} client_if={} address={} status={:?}",
            conn_id, client_if, address, status
        );
        self.clients.remove_connection(client_if, conn_id);
        self.restricted_handles.remove(&conn_id);
        if let Some(cb) = self.clients.get_by_id(client_if).and_then(|app| app.callback) {
            cb.on_client_connection_state(status, client_if, false, address);
        }
    }

    pub fn discover_services(&self, client_if: i32, address: RawAddress) {
        match self.clients.conn_id_by_address(client_if, &address) {
            Some(conn_id) => {
                debug!("discover_services: address={} conn_id={}", address, conn_id);
                self.gatt.client.search_service(conn_id, None);
            }
            None => error!("discover_services: no connection for {}", address),
        }
    }

    /// The database is fetched off the dispatch loop; its contents arrive as `GetGattDb`.
    pub fn on_search_completed(&self, conn_id: i32, status: u32) {
        debug!("on_search_completed: conn_id={} status={}", conn_id, status);
        let client = self.gatt.client.clone();
        thread::spawn(move || client.get_gatt_db(conn_id));
    }

    pub fn on_get_gatt_db(&mut self, conn_id: i32, db: Vec<GattDbElement>) {
        let address = match self.clients.address_by_conn_id(conn_id) {
            Some(address) => address,
            None => {
                warn!("on_get_gatt_db: unknown conn_id {}", conn_id);
                return;
            }
        };
        debug!("on_get_gatt_db: {} has {} attributes", address, db.len());
        self.restricted_handles.insert(conn_id, restricted_handles(&db));
        match self.clients.get_by_conn_id(conn_id).and_then(|app| app.callback) {
            Some(cb) => cb.on_search_complete(address, db, GattStatus::Success),
            None => warn!("on_get_gatt_db: no client for conn_id {}", conn_id),
        }
    }

    pub fn discover_service_by_uuid(&self, client_if: i32, address: RawAddress, uuid: Uuid128Bit) {
        match self.clients.conn_id_by_address(client_if, &address) {
            Some(conn_id) => self.gatt.client.search_service(conn_id, Some(uuid)),
            None => error!("discover_service_by_uuid: no connection for {}", address),
        }
    }

    /// Clears the stack's cache of the remote database.
    pub fn refresh_device(&self, client_if: i32, address: RawAddress) {
        debug!("refresh_device: address={}", address);
        self.gatt.client.refresh(client_if, address);
    }

    fn permission_check(&self, conn_id: i32, handle: u16, is_privileged: bool) -> bool {
        is_privileged
            || !self.restricted_handles.get(&conn_id).map_or(false, |h| h.contains(&handle))
    }

    /// Resolves the connection an attribute operation goes over, gating restricted handles.
    fn attribute_target(
        &self,
        op: &str,
        client_if: i32,
        address: &RawAddress,
        handle: i32,
    ) -> Option<(i32, u16)> {
        let handle = match u16::try_from(handle) {
            Ok(handle) => handle,
            Err(_) => {
                error!("{}: invalid handle {}", op, handle);
                return None;
            }
        };
        let conn_id = match self.clients.conn_id_by_address(client_if, address) {
            Some(conn_id) => conn_id,
            None => {
                error!("{}: no connection for {}", op, address);
                return None;
            }
        };
        let is_privileged = self.clients.get_by_id(client_if).map_or(false, |a| a.is_privileged);
        if !self.permission_check(conn_id, handle, is_privileged) {
            warn!("{}: permission check failed for handle {}", op, handle);
            return None;
        }
        Some((conn_id, handle))
    }

    pub fn read_characteristic(
        &self,
        client_if: i32,
        address: RawAddress,
        handle: i32,
        auth_req: i32,
    ) {
        debug!("read_characteristic: address={} handle={}", address, handle);
        if let Some((conn_id, handle)) =
            self.attribute_target("read_characteristic", client_if, &address, handle)
        {
            self.gatt.client.read_characteristic(conn_id, handle, auth_req);
        }
    }

    /// Inside a reliable write transaction every write becomes a prepared write.
    pub fn write_characteristic(
        &self,
        client_if: i32,
        address: RawAddress,
        handle: i32,
        write_type: GattWriteType,
        auth_req: i32,
        value: Vec<u8>,
    ) {
        debug!("write_characteristic: address={} handle={}", address, handle);
        let write_type = if self.reliable_queue.contains(&address) {
            GattWriteType::WritePrepare
        } else {
            write_type
        };
        if let Some((conn_id, handle)) =
            self.attribute_target("write_characteristic", client_if, &address, handle)
        {
            self.gatt.client.write_characteristic(
                conn_id,
                handle,
                write_type as i32,
                auth_req,
                value,
            );
        }
    }

    pub fn read_descriptor(&self, client_if: i32, address: RawAddress, handle: i32, auth_req: i32) {
        debug!("read_descriptor: address={} handle={}", address, handle);
        if let Some((conn_id, handle)) =
            self.attribute_target("read_descriptor", client_if, &address, handle)
        {
            self.gatt.client.read_descriptor(conn_id, handle, auth_req);
        }
    }

    pub fn write_descriptor(
        &self,
        client_if: i32,
        address: RawAddress,
        handle: i32,
        auth_req: i32,
        value: Vec<u8>,
    ) {
        debug!("write_descriptor: address={} handle={}", address, handle);
        if let Some((conn_id, handle)) =
            self.attribute_target("write_descriptor", client_if, &address, handle)
        {
            self.gatt.client.write_descriptor(conn_id, handle, auth_req, value);
        }
    }

    pub fn begin_reliable_write(&mut self, client_if: i32, address: RawAddress) {
        debug!("begin_reliable_write: client_if={} address={}", client_if, address);
        self.reliable_queue.insert(address);
    }

    /// Closes the transaction, executing or aborting the prepared writes on the remote.
    pub fn end_reliable_write(&mut self, client_if: i32, address: RawAddress, execute: bool) {
        debug!("end_reliable_write: address={} execute={}", address, execute);
        self.reliable_queue.remove(&address);
        if let Some(conn_id) = self.clients.conn_id_by_address(client_if, &address) {
            self.gatt.client.execute_write(conn_id, execute);
        }
    }

    pub fn register_for_notification(
        &self,
        client_if: i32,
        address: RawAddress,
        handle: i32,
        enable: bool,
    ) {
        debug!("register_for_notification: address={} enable={}", address, enable);
        if let Some((_, handle)) =
            self.attribute_target("register_for_notification", client_if, &address, handle)
        {
            self.gatt.client.register_for_notification(client_if, address, handle, enable);
        }
    }

    pub fn read_remote_rssi(&self, client_if: i32, address: RawAddress) {
        debug!("read_remote_rssi: address={}", address);
        self.gatt.client.read_remote_rssi(client_if, address);
    }

    pub fn configure_mtu(&self, client_if: i32, address: RawAddress, mtu: i32) {
        debug!("configure_mtu: address={} mtu={}", address, mtu);
        match self.clients.conn_id_by_address(client_if, &address) {
            Some(conn_id) => self.gatt.client.configure_mtu(conn_id, mtu),
            None => error!("configure_mtu: no connection for {}", address),
        }
    }

    pub fn connection_parameter_update(
        &self,
        client_if: i32,
        address: RawAddress,
        priority: ConnectionPriority,
    ) {
        let (min_interval, max_interval, latency) = priority.params();
        debug!(
            "connection_parameter_update: client_if={} address={} priority={:?}",
            client_if, address, priority
        );
        self.gatt.client.conn_parameter_update(
            address,
            min_interval,
            max_interval,
            latency,
            config::GATT_SUPERVISION_TIMEOUT,
        );
    }

    /// The client that owns `conn_id`, with the remote's address.
    fn client_for_conn(
        &self,
        conn_id: i32,
    ) -> Option<(i32, RawAddress, Arc<dyn IBluetoothGattCallback>)> {
        let address = self.clients.address_by_conn_id(conn_id)?;
        let app = self.clients.get_by_conn_id(conn_id)?;
        Some((app.id, address, app.callback?))
    }

    pub fn on_notify(
        &self,
        conn_id: i32,
        address: RawAddress,
        handle: u16,
        is_notify: bool,
        value: Vec<u8>,
    ) {
        debug!(
            "on_notify: address={} handle={} notify={} len={}",
            address,
            handle,
            is_notify,
            value.len()
        );
        let app = match self.clients.get_by_conn_id(conn_id) {
            Some(app) => app,
            None => return,
        };
        if !self.permission_check(conn_id, handle, app.is_privileged) {
            warn!("on_notify: permission check failed for handle {}", handle);
            return;
        }
        if let Some(cb) = app.callback {
            cb.on_notify(address, handle as i32, value);
        }
    }

    pub fn on_characteristic_read(&self, conn_id: i32, status: u32, handle: u16, value: Vec<u8>) {
        let status = GattStatus::from_raw(status);
        debug!("on_characteristic_read: conn_id={} status={:?}", conn_id, status);
        if let Some((_, address, cb)) = self.client_for_conn(conn_id) {
            cb.on_characteristic_read(address, status, handle as i32, value);
        }
    }

    /// Held back while the client's link is congested.
    pub fn on_characteristic_write(&mut self, conn_id: i32, status: u32, handle: u16) {
        let status = GattStatus::from_raw(status);
        debug!("on_characteristic_write: conn_id={} status={:?}", conn_id, status);
        let (client_if, address, cb) = match self.client_for_conn(conn_id) {
            Some(target) => target,
            None => return,
        };
        if !self.client_congestion.is_congested(client_if) {
            cb.on_characteristic_write(address, status, handle as i32);
            return;
        }
        let status = if status == GattStatus::Congested { GattStatus::Success } else { status };
        self.client_congestion.push(client_if, (address, status, handle as i32));
    }

    pub fn on_descriptor_read(&self, conn_id: i32, status: u32, handle: u16, value: Vec<u8>) {
        let status = GattStatus::from_raw(status);
        debug!("on_descriptor_read: conn_id={} status={:?}", conn_id, status);
        if let Some((_, address, cb)) = self.client_for_conn(conn_id) {
            cb.on_descriptor_read(address, status, handle as i32, value);
        }
    }

    pub fn on_descriptor_write(&self, conn_id: i32, status: u32, handle: u16) {
        let status = GattStatus::from_raw(status);
        debug!("on_descriptor_write: conn_id={} status={:?}", conn_id, status);
        if let Some((_, address, cb)) = self.client_for_conn(conn_id) {
            cb.on_descriptor_write(address, status, handle as i32);
        }
    }

    pub fn on_execute_write(&self, conn_id: i32, status: u32) {
        let status = GattStatus::from_raw(status);
        debug!("on_execute_write: conn_id={} status={:?}", conn_id, status);
        if let Some((_, address, cb)) = self.client_for_conn(conn_id) {
            cb.on_execute_write(address, status);
        }
    }

    pub fn on_registered_for_notification(
        &self,
        conn_id: i32,
        status: u32,
        registered: bool,
        handle: u16,
    ) {
        debug!(
            "on_registered_for_notification: conn_id={} status={} registered={} handle={}",
            conn_id, status, registered, handle
        );
    }

    pub fn on_read_remote_rssi(&self, client_if: i32, address: RawAddress, rssi: i32, status: u32) {
        let status = GattStatus::from_raw(status);
        debug!("on_read_remote_rssi: address={} rssi={} status={:?}", address, rssi, status);
        if let Some(cb) = self.clients.get_by_id(client_if).and_then(|app| app.callback) {
            cb.on_read_remote_rssi(address, rssi, status);
        }
    }

    pub fn on_configure_mtu(&self, conn_id: i32, status: u32, mtu: i32) {
        let status = GattStatus::from_raw(status);
        debug!("on_configure_mtu: conn_id={} mtu={} status={:?}", conn_id, mtu, status);
        if let Some((_, address, cb)) = self.client_for_conn(conn_id) {
            cb.on_configure_mtu(address, mtu, status);
        }
    }

    /// Once the link clears, the held back write completions are delivered in order.
    pub fn on_client_congestion(&mut self, conn_id: i32, congested: bool) {
        debug!("on_client_congestion: conn_id={} congested={}", conn_id, congested);
        let app = match self.clients.get_by_conn_id(conn_id) {
            Some(app) => app,
            None => return,
        };
        let held = self.client_congestion.set_congested(app.id, congested);
        if let Some(cb) = app.callback {
            for (address, status, handle) in held {
                cb.on_characteristic_write(address, status, handle);
            }
        }
    }

    pub fn register_server(
        &mut self,
        callback: Arc<dyn IBluetoothGattServerCallback>,
        caller: &CallerIdentity,
    ) -> anyhow::Result<Uuid128Bit> {
        let uuid = UuidHelper::random();
        debug!("register_server: uuid={}", UuidHelper::to_string(&uuid));
        self.servers.add(uuid, callback.get_object_id(), caller, Some(callback), None)?;
        self.gatt.server.register_server(uuid);
        Ok(uuid)
    }

    pub fn on_server_registered(&mut self, status: u32, server_if: i32, uuid: Uuid128Bit) {
        let status = GattStatus::from_raw(status);
        debug!(
            "on_server_registered: uuid={} server_if={} status={:?}",
            UuidHelper::to_string(&uuid),
            server_if,
            status
        );

        let app = match self.servers.get_by_uuid(&uuid) {
            Some(app) => app,
            None => {
                warn!("No server registration for {}", UuidHelper::to_string(&uuid));
                if status == GattStatus::Success {
                    self.gatt.server.unregister_server(server_if);
                }
                return;
            }
        };
        let callback = match &app.callback {
            Some(cb) => cb.clone(),
            None => return,
        };

        if status != GattStatus::Success {
            self.servers.remove_by_uuid(&uuid);
            callback.on_server_registered(status, server_if);
            return;
        }

        if !self.servers.promote_by_uuid(&uuid, server_if) {
            warn!("Server {} could not be activated", server_if);
            return;
        }
        match link_to_death(callback.as_ref(), &self.tx, move || Message::ServerDied(server_if)) {
            Ok(link) => self.servers.set_death_link(server_if, Some(link)),
            Err(e) => {
                warn!("Server {} owner is gone: {}", server_if, e);
                self.servers.remove(server_if);
                self.gatt.server.unregister_server(server_if);
                return;
            }
        }
        callback.on_server_registered(status, server_if);
    }

    pub fn unregister_server(&mut self, server_if: i32) {
        let app = match self.servers.remove(server_if) {
            Some(app) => app,
            None => {
                error!("unregister_server: invalid server_if {}", server_if);
                return;
            }
        };
        debug!("unregister_server: server_if={}", server_if);
        if let Some(cb) = &app.callback {
            unlink_to_death(cb.as_ref(), app.death_link);
        }
        self.server_congestion.remove(server_if);
        if !app.is_pending() {
            self.delete_services(server_if);
            self.gatt.server.unregister_server(server_if);
        }
        self.handle_map.delete_server(server_if);
    }

    pub fn server_connect(
        &self,
        server_if: i32,
        address: RawAddress,
        is_direct: bool,
        transport: i32,
    ) {
        debug!("server_connect: address={}", address);
        self.gatt.server.connect(server_if, address, is_direct, transport);
    }

    pub fn server_disconnect(&self, server_if: i32, address: RawAddress) {
        let conn_id = self.servers.conn_id_by_address(server_if, &address);
        debug!("server_disconnect: address={} conn_id={:?}", address, conn_id);
        self.gatt.server.disconnect(server_if, address, conn_id.unwrap_or(0));
    }

    /// A remote client connected to, or disconnected from, one of our servers.
    pub fn on_client_connected(
        &mut self,
        address: RawAddress,
        connected: bool,
        conn_id: i32,
        server_if: i32,
    ) {
        debug!(
            "on_client_connected: conn_id={} address={} connected={}",
            conn_id, address, connected
        );
        let app = match self.servers.get_by_id(server_if) {
            Some(app) => app,
            None => return,
        };
        if connected {
            self.servers.add_connection(server_if, conn_id, address);
        } else {
            self.servers.remove_connection(server_if, conn_id);
        }
        if let Some(cb) = &app.callback {
            cb.on_server_connection_state(server_if, connected, address);
        }
    }

    /// Publishes a service. `service` starts with the service declaration; handles are
    /// assigned by the stack and come back with `ServiceAdded`.
    pub fn add_service(&self, server_if: i32, service: Vec<GattDbElement>) {
        let first = service.first().and_then(|el| GattDbElementType::from_u32(el.element_type));
        match first {
            Some(GattDbElementType::PrimaryService)
            | Some(GattDbElementType::SecondaryService) => {}
            _ => {
                error!("add_service: database does not start with a service");
                return;
            }
        }
        let mut db = Vec::with_capacity(service.len());
        for el in service {
            if GattDbElementType::from_u32(el.element_type)
                == Some(GattDbElementType::IncludedService)
                && !self.handle_map.check_service_exists(&el.uuid, el.attribute_handle)
            {
                error!(
                    "add_service: included service {} not found",
                    UuidHelper::to_string(&el.uuid)
                );
                continue;
            }
            db.push(el);
        }
        debug!("add_service: server_if={} attributes={}", server_if, db.len());
        self.gatt.server.add_service(server_if, db);
    }

    pub fn remove_service(&self, server_if: i32, handle: u16) {
        debug!("remove_service: server_if={} handle={}", server_if, handle);
        self.gatt.server.delete_service(server_if, handle);
    }

    pub fn clear_services(&self, server_if: i32) {
        debug!("clear_services: server_if={}", server_if);
        self.delete_services(server_if);
    }

    fn delete_services(&self, server_if: i32) {
        for handle in self.handle_map.service_handles(server_if) {
            self.gatt.server.delete_service(server_if, handle);
        }
    }

    pub fn on_service_added(&mut self, status: u32, server_if: i32, service: Vec<GattDbElement>) {
        let status = GattStatus::from_raw(status);
        debug!("on_service_added: server_if={} status={:?}", server_if, status);
        if status != GattStatus::Success {
            return;
        }
        let service_handle = match service.first() {
            Some(el) => el.attribute_handle,
            None => return,
        };

        for el in &service {
            match GattDbElementType::from_u32(el.element_type) {
                Some(GattDbElementType::PrimaryService)
                | Some(GattDbElementType::SecondaryService) => {
                    self.handle_map.add_service(server_if, el.attribute_handle, el.uuid)
                }
                Some(GattDbElementType::Characteristic) => self.handle_map.add_characteristic(
                    server_if,
                    el.attribute_handle,
                    el.uuid,
                    service_handle,
                ),
                Some(GattDbElementType::Descriptor) => self.handle_map.add_descriptor(
                    server_if,
                    el.attribute_handle,
                    el.uuid,
                    service_handle,
                ),
                _ => {}
            }
        }
        self.handle_map.set_started(server_if, service_handle, true);

        if let Some(cb) = self.servers.get_by_id(server_if).and_then(|app| app.callback) {
            cb.on_service_added(status, service);
        }
    }

    pub fn on_service_deleted(&mut self, status: u32, server_if: i32, handle: u16) {
        debug!("on_service_deleted: handle={} status={}", handle, status);
        self.handle_map.delete_service(server_if, handle);
    }

    /// The server hosting `handle`. The request is recorded so a response can find the
    /// attribute again.
    fn server_for_request(
        &mut self,
        trans_id: i32,
        handle: u16,
    ) -> Option<Arc<dyn IBluetoothGattServerCallback>> {
        let server_if = self.handle_map.get_by_handle(handle)?.server_if;
        self.handle_map.add_request(trans_id, handle);
        self.servers.get_by_id(server_if)?.callback
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_read_request(
        &mut self,
        is_descriptor: bool,
        conn_id: i32,
        trans_id: i32,
        address: RawAddress,
        handle: u16,
        offset: i32,
        is_long: bool,
    ) {
        debug!(
            "on_read_request: conn_id={} address={} handle={} trans_id={} offset={}",
            conn_id, address, handle, trans_id, offset
        );
        let cb = match self.server_for_request(trans_id, handle) {
            Some(cb) => cb,
            None => return,
        };
        if is_descriptor {
            cb.on_descriptor_read_request(address, trans_id, offset, is_long, handle as i32);
        } else {
            cb.on_characteristic_read_request(address, trans_id, offset, is_long, handle as i32);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_write_request(
        &mut self,
        is_descriptor: bool,
        conn_id: i32,
        trans_id: i32,
        address: RawAddress,
        handle: u16,
        offset: i32,
        need_rsp: bool,
        is_prep: bool,
        value: Vec<u8>,
    ) {
        debug!(
            "on_write_request: conn_id={} address={} handle={} trans_id={} prep={}",
            conn_id, address, handle, trans_id, is_prep
        );
        let cb = match self.server_for_request(trans_id, handle) {
            Some(cb) => cb,
            None => return,
        };
        let handle = handle as i32;
        if is_descriptor {
            cb.on_descriptor_write_request(
                address, trans_id, offset, is_prep, need_rsp, handle, value,
            );
        } else {
            cb.on_characteristic_write_request(
                address, trans_id, offset, is_prep, need_rsp, handle, value,
            );
        }
    }

    pub fn on_exec_write_request(
        &self,
        conn_id: i32,
        trans_id: i32,
        address: RawAddress,
        exec_write: bool,
    ) {
        debug!("on_exec_write_request: conn_id={} trans_id={}", conn_id, trans_id);
        if let Some(cb) = self.servers.get_by_conn_id(conn_id).and_then(|app| app.callback) {
            cb.on_execute_write(address, trans_id, exec_write);
        }
    }

    /// Answers a read or write request. The request is forgotten either way.
    pub fn send_response(
        &mut self,
        server_if: i32,
        address: RawAddress,
        trans_id: i32,
        status: GattStatus,
        offset: i32,
        value: Vec<u8>,
    ) {
        debug!("send_response: address={} trans_id={}", address, trans_id);
        let handle = self.handle_map.get_by_request_id(trans_id).map_or(0, |e| e.handle);
        self.handle_map.delete_request(trans_id);
        match self.servers.conn_id_by_address(server_if, &address) {
            Some(conn_id) => self.gatt.server.send_response(
                server_if,
                conn_id,
                trans_id,
                status as u32,
                handle,
                offset,
                value,
            ),
            None => error!("send_response: no connection for {}", address),
        }
    }

    /// Sends an indication when `confirm` is set, a notification otherwise.
    pub fn send_notification(
        &self,
        server_if: i32,
        address: RawAddress,
        handle: u16,
        confirm: bool,
        value: Vec<u8>,
    ) {
        debug!("send_notification: address={} handle={}", address, handle);
        match self.servers.conn_id_by_address(server_if, &address) {
            Some(conn_id) => {
                self.gatt.server.send_indication(server_if, handle, conn_id, confirm, value)
            }
            None => warn!("send_notification: no connection for {}", address),
        }
    }

    /// The server that owns `conn_id`, with the remote's address.
    fn server_for_conn(
        &self,
        conn_id: i32,
    ) -> Option<(i32, RawAddress, Arc<dyn IBluetoothGattServerCallback>)> {
        let address = self.servers.address_by_conn_id(conn_id)?;
        let app = self.servers.get_by_conn_id(conn_id)?;
        Some((app.id, address, app.callback?))
    }

    /// Held back while the server's link is congested.
    pub fn on_notification_sent(&mut self, conn_id: i32, status: u32) {
        let status = GattStatus::from_raw(status);
        debug!("on_notification_sent: conn_id={} status={:?}", conn_id, status);
        let (server_if, address, cb) = match self.server_for_conn(conn_id) {
            Some(target) => target,
            None => return,
        };
        if !self.server_congestion.is_congested(server_if) {
            cb.on_notification_sent(address, status);
            return;
        }
        let status = if status == GattStatus::Congested { GattStatus::Success } else { status };
        self.server_congestion.push(server_if, (address, status));
    }

    pub fn on_server_congestion(&mut self, conn_id: i32, congested: bool) {
        debug!("on_server_congestion: conn_id={} congested={}", conn_id, congested);
        let app = match self.servers.get_by_conn_id(conn_id) {
            Some(app) => app,
            None => return,
        };
        let held = self.server_congestion.set_congested(app.id, congested);
        if let Some(cb) = app.callback {
            for (address, status) in held {
                cb.on_notification_sent(address, status);
            }
        }
    }

    pub fn on_mtu_changed(&self, conn_id: i32, mtu: i32) {
        debug!("on_mtu_changed: conn_id={} mtu={}", conn_id, mtu);
        if let Some((_, address, cb)) = self.server_for_conn(conn_id) {
            cb.on_mtu_changed(address, mtu);
        }
    }

    /// Devices connected through any client or server.
    pub fn get_connected_devices(&self) -> Vec<RawAddress> {
        let mut devices: Vec<RawAddress> = self
            .clients
            .get_connected_devices()
            .union(&self.servers.get_connected_devices())
            .copied()
            .collect();
        devices.sort();
        devices
    }

    /// Asks the stack to drop every client connection. Bookkeeping follows the disconnect
    /// events.
    pub fn disconnect_all(&self) {
        debug!("disconnect_all");
        for conn in self.clients.get_connections() {
            debug!("Disconnecting {}", conn.address);
            self.client_disconnect(conn.app_id, conn.address);
        }
    }

    pub fn unreg_all(&mut self) {
        for client_if in self.clients.get_all_app_ids() {
            debug!("unreg: {}", client_if);
            self.unregister_client(client_if);
        }
    }

    pub fn client_died(&mut self, client_if: i32) {
        info!("Client {} died, unregistering", client_if);
        self.unregister_client(client_if);
    }

    pub fn server_died(&mut self, server_if: i32) {
        info!("Server {} died, unregistering", server_if);
        self.unregister_server(server_if);
    }

    pub fn dispatch_gatt_client_callbacks(&mut self, callback: GattClientCallbacks) {
        match callback {
            GattClientCallbacks::RegisterClient(status, client_if, uuid) => {
                self.on_client_registered(status, client_if, uuid)
            }
            GattClientCallbacks::Connect(conn_id, status, client_if, address) => {
                self.on_connected(conn_id, status, client_if, address)
            }
            GattClientCallbacks::Disconnect(conn_id, status, client_if, address) => {
                self.on_disconnected(conn_id, status, client_if, address)
            }
            GattClientCallbacks::SearchComplete(conn_id, status) => {
                self.on_search_completed(conn_id, status)
            }
            GattClientCallbacks::GetGattDb(conn_id, db) => self.on_get_gatt_db(conn_id, db),
            GattClientCallbacks::Notify(conn_id, address, handle, is_notify, value) => {
                self.on_notify(conn_id, address, handle, is_notify, value)
            }
            GattClientCallbacks::ReadCharacteristic(conn_id, status, handle, value) => {
                self.on_characteristic_read(conn_id, status, handle, value)
            }
            GattClientCallbacks::WriteCharacteristic(conn_id, status, handle) => {
                self.on_characteristic_write(conn_id, status, handle)
            }
            GattClientCallbacks::ReadDescriptor(conn_id, status, handle, value) => {
                self.on_descriptor_read(conn_id, status, handle, value)
            }
            GattClientCallbacks::WriteDescriptor(conn_id, status, handle) => {
                self.on_descriptor_write(conn_id, status, handle)
            }
            GattClientCallbacks::ExecuteWrite(conn_id, status) => {
                self.on_execute_write(conn_id, status)
            }
            GattClientCallbacks::RegisterForNotification(conn_id, status, registered, handle) => {
                self.on_registered_for_notification(conn_id, status, registered, handle)
            }
            GattClientCallbacks::ReadRemoteRssi(client_if, address, rssi, status) => {
                self.on_read_remote_rssi(client_if, address, rssi, status)
            }
            GattClientCallbacks::ConfigureMtu(conn_id, status, mtu) => {
                self.on_configure_mtu(conn_id, status, mtu)
            }
            GattClientCallbacks::Congestion(conn_id, congested) => {
                self.on_client_congestion(conn_id, congested)
            }
        }
    }

    pub fn dispatch_gatt_server_callbacks(&mut self, callback: GattServerCallbacks) {
        match callback {
            GattServerCallbacks::RegisterServer(status, server_if, uuid) => {
                self.on_server_registered(status, server_if, uuid)
            }
            GattServerCallbacks::Connection(conn_id, server_if, connected, address) => {
                self.on_client_connected(address, connected, conn_id, server_if)
            }
            GattServerCallbacks::ServiceAdded(status, server_if, service) => {
                self.on_service_added(status, server_if, service)
            }
            GattServerCallbacks::ServiceDeleted(status, server_if, handle) => {
                self.on_service_deleted(status, server_if, handle)
            }
            GattServerCallbacks::RequestReadCharacteristic(
                conn_id,
                trans_id,
                address,
                handle,
                offset,
                is_long,
            ) => self.on_read_request(false, conn_id, trans_id, address, handle, offset, is_long),
            GattServerCallbacks::RequestReadDescriptor(
                conn_id,
                trans_id,
                address,
                handle,
                offset,
                is_long,
            ) => self.on_read_request(true, conn_id, trans_id, address, handle, offset, is_long),
            GattServerCallbacks::RequestWriteCharacteristic(
                conn_id,
                trans_id,
                address,
                handle,
                offset,
                need_rsp,
                is_prep,
                value,
            ) => self.on_write_request(
                false, conn_id, trans_id, address, handle, offset, need_rsp, is_prep, value,
            ),
            GattServerCallbacks::RequestWriteDescriptor(
                conn_id,
                trans_id,
                address,
                handle,
                offset,
                need_rsp,
                is_prep,
                value,
            ) => self.on_write_request(
                true, conn_id, trans_id, address, handle, offset, need_rsp, is_prep, value,
            ),
            GattServerCallbacks::RequestExecWrite(conn_id, trans_id, address, exec_write) => {
                self.on_exec_write_request(conn_id, trans_id, address, exec_write)
            }
            GattServerCallbacks::IndicationSent(conn_id, status) => {
                self.on_notification_sent(conn_id, status)
            }
            GattServerCallbacks::Congestion(conn_id, congested) => {
                self.on_server_congestion(conn_id, congested)
            }
            GattServerCallbacks::MtuChanged(conn_id, mtu) => self.on_mtu_changed(conn_id, mtu),
        }
    }

    /// Forgets every registration, e.g. when the adapter goes down.
    pub fn cleanup(&mut self) {
        for app in self.clients.clear() {
            if let Some(cb) = &app.callback {
                unlink_to_death(cb.as_ref(), app.death_link);
            }
        }
        for app in self.servers.clear() {
            if let Some(cb) = &app.callback {
                unlink_to_death(cb.as_ref(), app.death_link);
            }
        }
        self.handle_map.clear();
        self.reliable_queue.clear();
        self.restricted_handles.clear();
        self.client_congestion.clear();
        self.server_congestion.clear();
        self.advertise_manager.cleanup();
        self.periodic_scan_manager.cleanup();
        self.scan_manager.cleanup();
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "GATT clients:");
        self.clients.dump(&mut out);
        let _ = writeln!(out, "GATT servers:");
        self.servers.dump(&mut out);
        self.handle_map.dump(&mut out);
        self.advertise_manager.dump(&mut out);
        self.periodic_scan_manager.dump(&mut out);
        self.scan_manager.dump(&mut out);
        out
    }
}
