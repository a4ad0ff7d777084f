// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! LE GATT session management.
//!
//! Callers register clients, servers, scanners, advertising sets, and periodic syncs with the
//! `GattService`. Commands go to the native stack right away; their outcomes, unsolicited events
//! and the deaths of callers all come back as `Message`s, which `Stack::dispatch` applies one at
//! a time.

#[macro_use]
extern crate num_derive;

pub mod config;
pub mod core;
pub mod gatt;
pub mod logging;
pub mod utils;

use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::gatt::native::{
    AdvertiserCallbacks, GattClientCallbacks, GattServerCallbacks, PeriodicSyncCallbacks,
    ScannerCallbacks,
};
use crate::gatt::service::GattService;

/// Message types that are sent to the stack main dispatch loop.
#[derive(Debug)]
pub enum Message {
    Advertiser(AdvertiserCallbacks),
    PeriodicSync(PeriodicSyncCallbacks),
    Scanner(ScannerCallbacks),
    GattClient(GattClientCallbacks),
    GattServer(GattServerCallbacks),

    /// The owner of an advertising set went away. Carries the caller id.
    AdvertiserDied(String),
    /// The owner of a periodic sync went away. Carries the caller id.
    PeriodicSyncDied(String),
    ScannerDied(i32),
    ClientDied(i32),
    ServerDied(i32),

    /// Periodic sweep for scans that ran too long.
    CheckScanDurations,
}

/// Umbrella class for the stack.
pub struct Stack {}

impl Stack {
    /// Creates an mpsc channel for passing messages to the main dispatch loop.
    pub fn create_channel() -> (UnboundedSender<Message>, UnboundedReceiver<Message>) {
        unbounded_channel::<Message>()
    }

    /// Runs the main dispatch loop until every sender is gone.
    pub async fn dispatch(mut rx: UnboundedReceiver<Message>, service: Arc<Mutex<GattService>>) {
        while let Some(m) = rx.recv().await {
            Stack::handle(&mut service.lock().unwrap(), m);
        }
        info!("Message dispatch loop quit");
    }

    /// Applies a single message.
    pub fn handle(service: &mut GattService, m: Message) {
        debug!("dispatch: {:?}", m);
        match m {
            Message::Advertiser(cb) => service.advertise_manager().dispatch_callbacks(cb),
            Message::PeriodicSync(cb) => service.periodic_scan_manager().dispatch_callbacks(cb),
            Message::Scanner(cb) => service.scan_manager().dispatch_callbacks(cb),
            Message::GattClient(cb) => service.dispatch_gatt_client_callbacks(cb),
            Message::GattServer(cb) => service.dispatch_gatt_server_callbacks(cb),

            Message::AdvertiserDied(caller_id) => {
                service.advertise_manager().caller_died(&caller_id)
            }
            Message::PeriodicSyncDied(caller_id) => {
                service.periodic_scan_manager().caller_died(&caller_id)
            }
            Message::ScannerDied(scanner_id) => service.scan_manager().scanner_died(scanner_id),
            Message::ClientDied(client_if) => service.client_died(client_if),
            Message::ServerDied(server_if) => service.server_died(server_if),

            Message::CheckScanDurations => service.scan_manager().check_scan_durations(),
        }
    }

    /// Posts `CheckScanDurations` every `period` until the dispatch loop goes away.
    pub fn spawn_scan_duration_checks(
        tx: UnboundedSender<Message>,
        period: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(Message::CheckScanDurations).is_err() {
                    break;
                }
            }
        })
    }
}
