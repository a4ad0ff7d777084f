//! Registry of applications registered with one of the GATT managers, and of the connections
//! they own.
//!
//! The same registry type backs scanners, GATT clients, GATT servers, advertising sets and
//! periodic syncs. A record starts out pending under a negative temporary id and is promoted to
//! the id handed out by the controller once registration completes. Lookups are linear and the
//! first match wins; unknown keys are reported as `None` because controller callbacks routinely
//! race with unregistration.

use anyhow::bail;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::core::address::RawAddress;
use crate::core::uuid::{Uuid128Bit, UuidHelper};
use crate::gatt::scan_stats::{AppScanStats, BatteryStatsReporter, ScanLimits};

/// Who is asking. Supplied by the IPC layer with every registration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub uid: u32,
    pub app_name: String,
    /// Privileged callers bypass scan rate limiting and may reach restricted attributes.
    pub is_privileged: bool,
}

/// One registered application.
pub struct App<C: ?Sized, I> {
    /// Correlates the registration request with its grant.
    pub uuid: Uuid128Bit,
    /// Negative while pending, controller-assigned once active.
    pub id: i32,
    pub callback: Option<Arc<C>>,
    pub info: Option<I>,
    /// Liveness token of the caller, the object id of its callback proxy.
    pub caller_id: String,
    pub uid: u32,
    pub app_name: String,
    pub is_privileged: bool,
    /// Death watch registered on the callback, if any.
    pub death_link: Option<u32>,
    pub app_scan_stats: Option<Arc<Mutex<AppScanStats>>>,
}

impl<C: ?Sized, I: Clone> Clone for App<C, I> {
    fn clone(&self) -> Self {
        App {
            uuid: self.uuid,
            id: self.id,
            callback: self.callback.clone(),
            info: self.info.clone(),
            caller_id: self.caller_id.clone(),
            uid: self.uid,
            app_name: self.app_name.clone(),
            is_privileged: self.is_privileged,
            death_link: self.death_link,
            app_scan_stats: self.app_scan_stats.clone(),
        }
    }
}

impl<C: ?Sized, I> App<C, I> {
    pub fn is_pending(&self) -> bool {
        self.id < 0
    }
}

/// An open connection owned by an application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub conn_id: i32,
    pub address: RawAddress,
    pub app_id: i32,
    pub start_time: Instant,
}

struct Inner<C: ?Sized, I> {
    apps: Vec<App<C, I>>,
    connections: Vec<Connection>,
    app_scan_stats: HashMap<u32, Arc<Mutex<AppScanStats>>>,
}

pub struct ContextMap<C: ?Sized, I> {
    inner: Mutex<Inner<C, I>>,
    last_temp_id: AtomicI32,
    scan_stats: Option<(ScanLimits, Arc<dyn BatteryStatsReporter>)>,
}

impl<C: ?Sized, I: Clone> ContextMap<C, I> {
    pub fn new() -> Self {
        ContextMap {
            inner: Mutex::new(Inner {
                apps: vec![],
                connections: vec![],
                app_scan_stats: HashMap::new(),
            }),
            last_temp_id: AtomicI32::new(0),
            scan_stats: None,
        }
    }

    /// A registry that also keeps per-uid scan statistics for its apps.
    pub fn with_scan_stats(limits: ScanLimits, reporter: Arc<dyn BatteryStatsReporter>) -> Self {
        let mut map = Self::new();
        map.scan_stats = Some((limits, reporter));
        map
    }

    /// Hands out the next temporary id: -1, -2, ... Never collides with controller ids and is
    /// not reused until the counter wraps.
    pub fn allocate_temp_id(&self) -> i32 {
        let prev = self
            .last_temp_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(if v == i32::MIN { -1 } else { v - 1 })
            })
            .unwrap_or(-1);
        if prev == i32::MIN {
            -1
        } else {
            prev - 1
        }
    }

    /// Adds a pending record under a fresh temporary id.
    pub fn add(
        &self,
        uuid: Uuid128Bit,
        caller_id: String,
        identity: &CallerIdentity,
        callback: Option<Arc<C>>,
        info: Option<I>,
    ) -> anyhow::Result<App<C, I>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.apps.iter().any(|app| app.uuid == uuid) {
            bail!("App with uuid {} is already registered", UuidHelper::to_string(&uuid));
        }

        let app_scan_stats = self.scan_stats.as_ref().map(|(limits, reporter)| {
            inner
                .app_scan_stats
                .entry(identity.uid)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(AppScanStats::new(
                        identity.app_name.clone(),
                        identity.uid,
                        limits.clone(),
                        reporter.clone(),
                    )))
                })
                .clone()
        });

        let app = App {
            uuid,
            id: self.allocate_temp_id(),
            callback,
            info,
            caller_id,
            uid: identity.uid,
            app_name: identity.app_name.clone(),
            is_privileged: identity.is_privileged,
            death_link: None,
            app_scan_stats,
        };
        inner.apps.push(app.clone());
        Ok(app)
    }

    fn promote_where<F: Fn(&App<C, I>) -> bool>(&self, matches: F, id: i32) -> bool {
        if id < 0 {
            debug!("Refusing to promote to invalid id {}", id);
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.apps.iter().any(|app| app.id == id) {
            debug!("Id {} is already in use", id);
            return false;
        }
        match inner.apps.iter_mut().find(|app| matches(&**app)) {
            Some(app) if app.is_pending() => {
                app.id = id;
                true
            }
            Some(app) => {
                debug!("App {} is already active", app.id);
                false
            }
            None => false,
        }
    }

    /// Moves the pending record `temp_id` to the active id `id`. One-way: active records are
    /// never touched.
    pub fn promote(&self, temp_id: i32, id: i32) -> bool {
        self.promote_where(|app| app.id == temp_id, id)
    }

    /// Same as `promote`, for registrations correlated by uuid.
    pub fn promote_by_uuid(&self, uuid: &Uuid128Bit, id: i32) -> bool {
        self.promote_where(|app| &app.uuid == uuid, id)
    }

    pub fn set_death_link(&self, id: i32, link: Option<u32>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(app) = inner.apps.iter_mut().find(|app| app.id == id) {
            app.death_link = link;
        }
    }

    fn find<F: Fn(&App<C, I>) -> bool>(&self, what: &str, matches: F) -> Option<App<C, I>> {
        let found = self.inner.lock().unwrap().apps.iter().find(|app| matches(*app)).cloned();
        if found.is_none() {
            debug!("Context not found for {}", what);
        }
        found
    }

    pub fn get_by_id(&self, id: i32) -> Option<App<C, I>> {
        self.find(&format!("id {}", id), |app| app.id == id)
    }

    pub fn get_by_uuid(&self, uuid: &Uuid128Bit) -> Option<App<C, I>> {
        self.find(&format!("uuid {}", UuidHelper::to_string(uuid)), |app| &app.uuid == uuid)
    }

    pub fn get_by_caller_id(&self, caller_id: &str) -> Option<App<C, I>> {
        self.find(&format!("caller {}", caller_id), |app| app.caller_id == caller_id)
    }

    /// First app whose context info satisfies `matches`.
    pub fn get_by_context_info<F: Fn(&I) -> bool>(&self, matches: F) -> Option<App<C, I>> {
        self.find("context info", |app| app.info.as_ref().map_or(false, |i| matches(i)))
    }

    pub fn get_by_conn_id(&self, conn_id: i32) -> Option<App<C, I>> {
        let app_id = self
            .inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .find(|c| c.conn_id == conn_id)
            .map(|c| c.app_id);
        match app_id {
            Some(id) => self.get_by_id(id),
            None => {
                debug!("No connection with conn_id {}", conn_id);
                None
            }
        }
    }

    fn remove_where<F: Fn(&App<C, I>) -> bool>(&self, what: &str, matches: F) -> Option<App<C, I>> {
        let mut inner = self.inner.lock().unwrap();
        let pos = match inner.apps.iter().position(|app| matches(app)) {
            Some(pos) => pos,
            None => {
                debug!("Nothing to remove for {}", what);
                return None;
            }
        };
        let app = inner.apps.remove(pos);
        inner.connections.retain(|c| c.app_id != app.id);
        Some(app)
    }

    /// Removes the app with `id` along with every connection it owns.
    pub fn remove(&self, id: i32) -> Option<App<C, I>> {
        self.remove_where(&format!("id {}", id), |app| app.id == id)
    }

    pub fn remove_by_uuid(&self, uuid: &Uuid128Bit) -> Option<App<C, I>> {
        self.remove_where(&format!("uuid {}", UuidHelper::to_string(uuid)), |app| &app.uuid == uuid)
    }

    /// Empties the registry, returning what was in it.
    pub fn clear(&self) -> Vec<App<C, I>> {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.clear();
        inner.apps.drain(..).collect()
    }

    /// Records a connection. Ignored if `id` is not registered.
    pub fn add_connection(&self, id: i32, conn_id: i32, address: RawAddress) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.apps.iter().any(|app| app.id == id) {
            debug!("Ignoring connection {} for unknown app {}", conn_id, id);
            return;
        }
        let start_time = Instant::now();
        inner.connections.push(Connection { conn_id, address, app_id: id, start_time });
    }

    pub fn remove_connection(&self, id: i32, conn_id: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.retain(|c| !(c.app_id == id && c.conn_id == conn_id));
    }

    /// Drops every connection owned by `id`, returning them.
    pub fn remove_connections_by_app(&self, id: i32) -> Vec<Connection> {
        let mut inner = self.inner.lock().unwrap();
        let (removed, kept): (Vec<Connection>, Vec<Connection>) =
            inner.connections.drain(..).partition(|c| c.app_id == id);
        inner.connections = kept;
        removed
    }

    pub fn get_connections(&self) -> Vec<Connection> {
        self.inner.lock().unwrap().connections.clone()
    }

    pub fn get_connected_devices(&self) -> HashSet<RawAddress> {
        self.inner.lock().unwrap().connections.iter().map(|c| c.address).collect()
    }

    pub fn conn_id_by_address(&self, id: i32, address: &RawAddress) -> Option<i32> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .find(|c| c.app_id == id && &c.address == address)
            .map(|c| c.conn_id)
    }

    pub fn address_by_conn_id(&self, conn_id: i32) -> Option<RawAddress> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .find(|c| c.conn_id == conn_id)
            .map(|c| c.address)
    }

    pub fn get_all_app_ids(&self) -> Vec<i32> {
        self.inner.lock().unwrap().apps.iter().map(|app| app.id).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn app_scan_stats_by_uid(&self, uid: u32) -> Option<Arc<Mutex<AppScanStats>>> {
        self.inner.lock().unwrap().app_scan_stats.get(&uid).cloned()
    }

    pub fn app_scan_stats_by_id(&self, id: i32) -> Option<Arc<Mutex<AppScanStats>>> {
        self.get_by_id(id).and_then(|app| app.app_scan_stats)
    }

    pub fn dump(&self, out: &mut String) {
        let inner = self.inner.lock().unwrap();
        let _ = writeln!(out, "  Entries: {}", inner.apps.len());
        for app in &inner.apps {
            let _ = writeln!(
                out,
                "    {} ({}): id={} uid={} caller={}",
                app.app_name,
                UuidHelper::to_string(&app.uuid),
                app.id,
                app.uid,
                app.caller_id
            );
        }
        let _ = writeln!(out, "  Connections: {}", inner.connections.len());
        for c in &inner.connections {
            let _ = writeln!(
                out,
                "    conn_id={} app={} address={} for {:?}",
                c.conn_id,
                c.app_id,
                c.address,
                c.start_time.elapsed()
            );
        }
        for stats in inner.app_scan_stats.values() {
            stats.lock().unwrap().dump(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::mocks::mock_battery_stats::MockBatteryStats;
    use std::collections::HashSet;

    type TestMap = ContextMap<dyn Fn() + Send + Sync, String>;

    fn caller(uid: u32) -> CallerIdentity {
        CallerIdentity { uid, app_name: format!("app{}", uid), is_privileged: false }
    }

    fn addr(last: u8) -> RawAddress {
        RawAddress::from([0, 1, 2, 3, 4, last])
    }

    #[test]
    fn test_temp_ids_are_unique_and_negative() {
        let map = TestMap::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let app =
                map.add(UuidHelper::random(), "caller".into(), &caller(1), None, None).unwrap();
            assert!(app.id < 0);
            assert!(seen.insert(app.id));
        }
    }

    #[test]
    fn test_temp_id_wraps_back_to_minus_one() {
        let map = TestMap::new();
        map.last_temp_id.store(i32::MIN + 1, Ordering::SeqCst);
        assert_eq!(map.allocate_temp_id(), i32::MIN);
        assert_eq!(map.allocate_temp_id(), -1);
        assert_eq!(map.allocate_temp_id(), -2);
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let map = TestMap::new();
        let uuid = UuidHelper::random();
        map.add(uuid, "a".into(), &caller(1), None, None).unwrap();
        assert!(map.add(uuid, "b".into(), &caller(1), None, None).is_err());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_promotion_is_one_way() {
        let map = TestMap::new();
        let app = map.add(UuidHelper::random(), "a".into(), &caller(1), None, None).unwrap();

        assert!(map.promote(app.id, 7));
        assert!(map.get_by_id(app.id).is_none());
        assert!(!map.get_by_id(7).unwrap().is_pending());

        // an active record can't be promoted again, nor pushed back to a negative id
        assert!(!map.promote(7, 8));
        assert!(!map.promote(7, -3));
        assert_eq!(map.get_by_id(7).unwrap().uuid, app.uuid);
    }

    #[test]
    fn test_promote_refuses_id_in_use() {
        let map = TestMap::new();
        let a = map.add(UuidHelper::random(), "a".into(), &caller(1), None, None).unwrap();
        let b = map.add(UuidHelper::random(), "b".into(), &caller(1), None, None).unwrap();
        assert!(map.promote_by_uuid(&a.uuid, 3));
        assert!(!map.promote_by_uuid(&b.uuid, 3));
        assert!(map.get_by_id(b.id).unwrap().is_pending());
    }

    #[test]
    fn test_lookups() {
        let map = TestMap::new();
        let app = map
            .add(UuidHelper::random(), "caller-a".into(), &caller(1), None, Some("intent".into()))
            .unwrap();
        map.promote(app.id, 4);
        map.add_connection(4, 40, addr(1));

        assert_eq!(map.get_by_uuid(&app.uuid).unwrap().id, 4);
        assert_eq!(map.get_by_caller_id("caller-a").unwrap().id, 4);
        assert_eq!(map.get_by_context_info(|i| i == "intent").unwrap().id, 4);
        assert_eq!(map.get_by_conn_id(40).unwrap().id, 4);
        assert_eq!(map.conn_id_by_address(4, &addr(1)), Some(40));
        assert_eq!(map.address_by_conn_id(40), Some(addr(1)));

        assert!(map.get_by_caller_id("nobody").is_none());
        assert!(map.get_by_context_info(|i| i == "other").is_none());
        assert!(map.get_by_conn_id(41).is_none());
        assert!(map.remove(99).is_none());
    }

    #[test]
    fn test_connection_for_unknown_app_ignored() {
        let map = TestMap::new();
        map.add_connection(5, 50, addr(1));
        assert!(map.get_connections().is_empty());
    }

    #[test]
    fn test_remove_cascades_connections() {
        // arrange
        let map = TestMap::new();
        let a = map.add(UuidHelper::random(), "a".into(), &caller(1), None, None).unwrap();
        let b = map.add(UuidHelper::random(), "b".into(), &caller(2), None, None).unwrap();
        map.promote(a.id, 1);
        map.promote(b.id, 2);
        map.add_connection(1, 10, addr(1));
        map.add_connection(1, 11, addr(2));
        map.add_connection(2, 20, addr(3));

        // act
        map.remove(1);

        // assert
        let devices = map.get_connected_devices();
        assert!(!devices.contains(&addr(1)));
        assert!(!devices.contains(&addr(2)));
        assert!(devices.contains(&addr(3)));
        assert_eq!(map.get_connections().len(), 1);
    }

    #[test]
    fn test_remove_connections_by_app() {
        let map = TestMap::new();
        let a = map.add(UuidHelper::random(), "a".into(), &caller(1), None, None).unwrap();
        map.promote(a.id, 1);
        map.add_connection(1, 10, addr(1));
        map.add_connection(1, 11, addr(2));
        map.remove_connection(1, 10);
        assert_eq!(map.get_connections().len(), 1);

        let removed = map.remove_connections_by_app(1);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].conn_id, 11);
        assert!(map.get_connections().is_empty());
        assert!(map.get_by_id(1).is_some());
    }

    #[test]
    fn test_scan_stats_shared_per_uid() {
        let (battery, _rx) = MockBatteryStats::new();
        let map = TestMap::with_scan_stats(ScanLimits::default(), Arc::new(battery));
        let a = map.add(UuidHelper::random(), "a".into(), &caller(10), None, None).unwrap();
        let b = map.add(UuidHelper::random(), "b".into(), &caller(10), None, None).unwrap();
        let c = map.add(UuidHelper::random(), "c".into(), &caller(11), None, None).unwrap();

        let stats_a = map.app_scan_stats_by_id(a.id).unwrap();
        let stats_b = map.app_scan_stats_by_id(b.id).unwrap();
        let stats_c = map.app_scan_stats_by_id(c.id).unwrap();
        assert!(Arc::ptr_eq(&stats_a, &stats_b));
        assert!(!Arc::ptr_eq(&stats_a, &stats_c));
        assert!(Arc::ptr_eq(&stats_a, &map.app_scan_stats_by_uid(10).unwrap()));

        // stats outlive the registration
        map.remove(a.id);
        map.remove(b.id);
        assert!(map.app_scan_stats_by_uid(10).is_some());
    }

    #[test]
    fn test_no_scan_stats_without_limits() {
        let map = TestMap::new();
        let a = map.add(UuidHelper::random(), "a".into(), &caller(10), None, None).unwrap();
        assert!(a.app_scan_stats.is_none());
        assert!(map.app_scan_stats_by_uid(10).is_none());
    }

    #[test]
    fn test_clear() {
        let map = TestMap::new();
        let a = map.add(UuidHelper::random(), "a".into(), &caller(1), None, None).unwrap();
        map.promote(a.id, 1);
        map.add_connection(1, 10, addr(1));
        assert_eq!(map.clear().len(), 1);
        assert!(map.is_empty());
        assert!(map.get_connections().is_empty());
    }
}
