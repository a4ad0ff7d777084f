//! Mocked implementation of PeriodicSyncInterface for use in test

use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

use crate::core::address::RawAddress;
use crate::gatt::native::PeriodicSyncInterface;

/// Routes calls to PeriodicSyncInterface into a channel of PeriodicSyncEvents
pub struct MockPeriodicSync(mpsc::UnboundedSender<PeriodicSyncEvents>);

impl MockPeriodicSync {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<PeriodicSyncEvents>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

/// Events representing calls to PeriodicSyncInterface
#[derive(Debug, PartialEq, Eq)]
pub enum PeriodicSyncEvents {
    /// sid, address, skip, timeout, reg_id
    StartSync(u8, RawAddress, u16, u16, i32),
    StopSync(u16),
}

impl PeriodicSyncInterface for MockPeriodicSync {
    fn start_sync(&self, sid: u8, address: RawAddress, skip: u16, timeout: u16, reg_id: i32) {
        self.0.send(PeriodicSyncEvents::StartSync(sid, address, skip, timeout, reg_id)).unwrap();
    }

    fn stop_sync(&self, sync_handle: u16) {
        self.0.send(PeriodicSyncEvents::StopSync(sync_handle)).unwrap();
    }
}
