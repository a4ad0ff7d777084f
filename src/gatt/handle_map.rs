//! Attributes of the services hosted by local GATT servers, and the in-flight requests against
//! them.

use std::collections::HashMap;
use std::fmt::Write;

use crate::core::uuid::{Uuid128Bit, UuidHelper};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Service,
    Characteristic,
    Descriptor,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub server_if: i32,
    pub entry_type: EntryType,
    pub handle: u16,
    pub uuid: Uuid128Bit,
    /// Handle of the owning service. Services point at themselves.
    pub service_handle: u16,
    pub started: bool,
}

#[derive(Default)]
pub struct HandleMap {
    entries: Vec<Entry>,
    /// trans_id -> attribute handle
    requests: HashMap<i32, u16>,
}

impl HandleMap {
    pub fn new() -> Self {
        HandleMap::default()
    }

    pub fn add_service(&mut self, server_if: i32, handle: u16, uuid: Uuid128Bit) {
        self.entries.push(Entry {
            server_if,
            entry_type: EntryType::Service,
            handle,
            uuid,
            service_handle: handle,
            started: false,
        });
    }

    pub fn add_characteristic(
        &mut self,
        server_if: i32,
        handle: u16,
        uuid: Uuid128Bit,
        service_handle: u16,
    ) {
        self.add_attribute(server_if, EntryType::Characteristic, handle, uuid, service_handle);
    }

    pub fn add_descriptor(
        &mut self,
        server_if: i32,
        handle: u16,
        uuid: Uuid128Bit,
        service_handle: u16,
    ) {
        self.add_attribute(server_if, EntryType::Descriptor, handle, uuid, service_handle);
    }

    fn add_attribute(
        &mut self,
        server_if: i32,
        entry_type: EntryType,
        handle: u16,
        uuid: Uuid128Bit,
        service_handle: u16,
    ) {
        self.entries.push(Entry {
            server_if,
            entry_type,
            handle,
            uuid,
            service_handle,
            started: false,
        });
    }

    pub fn set_started(&mut self, server_if: i32, service_handle: u16, started: bool) {
        for entry in self.entries.iter_mut() {
            if entry.server_if == server_if
                && entry.entry_type == EntryType::Service
                && entry.handle == service_handle
            {
                entry.started = started;
            }
        }
    }

    pub fn get_by_handle(&self, handle: u16) -> Option<&Entry> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    pub fn check_service_exists(&self, uuid: &Uuid128Bit, handle: u16) -> bool {
        self.entries.iter().any(|e| {
            e.entry_type == EntryType::Service && e.handle == handle && &e.uuid == uuid
        })
    }

    /// Handles of every service `server_if` hosts.
    pub fn service_handles(&self, server_if: i32) -> Vec<u16> {
        self.entries
            .iter()
            .filter(|e| e.server_if == server_if && e.entry_type == EntryType::Service)
            .map(|e| e.handle)
            .collect()
    }

    /// Drops a service together with its characteristics and descriptors.
    pub fn delete_service(&mut self, server_if: i32, service_handle: u16) {
        self.entries
            .retain(|e| !(e.server_if == server_if && e.service_handle == service_handle));
    }

    /// Drops every attribute of `server_if`, and the requests made against them.
    pub fn delete_server(&mut self, server_if: i32) {
        self.entries.retain(|e| e.server_if != server_if);
        let entries = &self.entries;
        self.requests.retain(|_, handle| entries.iter().any(|e| e.handle == *handle));
    }

    pub fn add_request(&mut self, trans_id: i32, handle: u16) {
        self.requests.insert(trans_id, handle);
    }

    pub fn delete_request(&mut self, trans_id: i32) {
        self.requests.remove(&trans_id);
    }

    pub fn get_by_request_id(&self, trans_id: i32) -> Option<&Entry> {
        let handle = self.requests.get(&trans_id)?;
        self.get_by_handle(*handle)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.requests.clear();
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(out, "  Attributes: {}", self.entries.len());
        for e in &self.entries {
            let _ = writeln!(
                out,
                "    {:?} handle={} service={} server_if={} uuid={} started={}",
                e.entry_type,
                e.handle,
                e.service_handle,
                e.server_if,
                UuidHelper::to_string(&e.uuid),
                e.started
            );
        }
        let _ = writeln!(out, "  Pending requests: {}", self.requests.len());
    }
}
