//! Lifecycle of LE advertising sets.
//!
//! A set is requested under a negative temporary registration id. The controller answers with
//! `on_advertising_set_started`, which either promotes the record to the advertiser id it
//! assigned or tears it down. Each set is owned by the callback object that started it and is
//! stopped automatically when that object dies.

use log::{debug, info, warn};
use num_traits::clamp;
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::address::RawAddress;
use crate::core::liveness::{link_to_death, unlink_to_death, RPCProxy};
use crate::core::uuid::UuidHelper;
use crate::gatt::advertise_data::{
    AdvertiseData, AdvertisingSetParameters, PeriodicAdvertisingParameters,
};
use crate::gatt::context_map::{App, CallerIdentity, ContextMap};
use crate::gatt::native::{AdvertiserCallbacks, BleAdvertiserInterface};
use crate::gatt::status::AdvertisingStatus;
use crate::Message;

/// Interface for advertiser callbacks to clients, passed to
/// `AdvertiseManager::start_advertising_set`.
pub trait IAdvertisingSetCallback: RPCProxy + Send + Sync {
    /// Result of `start_advertising_set`.
    ///
    /// * `reg_id` - Temporary id the set was registered under.
    /// * `advertiser_id` - ID for the advertising set, -1 on failure. It is used in the other
    ///     advertising methods and callbacks.
    /// * `tx_power` - Transmit power that will be used for this advertising set.
    fn on_advertising_set_started(
        &self,
        reg_id: i32,
        advertiser_id: i32,
        tx_power: i32,
        status: AdvertisingStatus,
    );

    fn on_own_address_read(&self, advertiser_id: i32, address_type: i32, address: RawAddress);

    /// The set was stopped. Acknowledged locally, without waiting for the controller.
    fn on_advertising_set_stopped(&self, advertiser_id: i32);

    fn on_advertising_enabled(&self, advertiser_id: i32, enable: bool, status: AdvertisingStatus);

    fn on_advertising_data_set(&self, advertiser_id: i32, status: AdvertisingStatus);

    fn on_scan_response_data_set(&self, advertiser_id: i32, status: AdvertisingStatus);

    fn on_advertising_parameters_updated(
        &self,
        advertiser_id: i32,
        tx_power: i32,
        status: AdvertisingStatus,
    );

    fn on_periodic_advertising_parameters_updated(
        &self,
        advertiser_id: i32,
        status: AdvertisingStatus,
    );

    fn on_periodic_advertising_data_set(&self, advertiser_id: i32, status: AdvertisingStatus);

    fn on_periodic_advertising_enabled(
        &self,
        advertiser_id: i32,
        enable: bool,
        status: AdvertisingStatus,
    );
}

pub type AdvertiserMap = ContextMap<dyn IAdvertisingSetCallback, ()>;
type AdvertiserApp = App<dyn IAdvertisingSetCallback, ()>;

const INVALID_ADV_ID: i32 = -1;

pub struct AdvertiseManager {
    advertisers: AdvertiserMap,
    native: Arc<dyn BleAdvertiserInterface>,
    tx: UnboundedSender<Message>,
    max_advertisers: usize,
    device_name: String,
}

impl AdvertiseManager {
    pub fn new(
        native: Arc<dyn BleAdvertiserInterface>,
        tx: UnboundedSender<Message>,
        max_advertisers: usize,
    ) -> Self {
        AdvertiseManager {
            advertisers: ContextMap::new(),
            native,
            tx,
            max_advertisers,
            device_name: String::new(),
        }
    }

    /// Name placed in advertisements that ask for it.
    pub fn set_device_name(&mut self, name: String) {
        self.device_name = name;
    }

    pub fn advertisers(&self) -> &AdvertiserMap {
        &self.advertisers
    }

    /// Requests a new advertising set. Returns the temporary registration id; the outcome is
    /// reported through `callback`.
    ///
    /// Fails only if `callback` can't be watched for death.
    pub fn start_advertising_set(
        &mut self,
        parameters: AdvertisingSetParameters,
        advertise_data: AdvertiseData,
        scan_response: Option<AdvertiseData>,
        periodic_parameters: Option<PeriodicAdvertisingParameters>,
        periodic_data: Option<AdvertiseData>,
        duration: i32,
        max_ext_adv_events: i32,
        callback: Arc<dyn IAdvertisingSetCallback>,
        caller: &CallerIdentity,
    ) -> anyhow::Result<i32> {
        let caller_id = callback.get_object_id();

        let adv_bytes = advertise_data.make_with(&self.device_name);
        let scan_bytes =
            scan_response.map(|d| d.make_with(&self.device_name)).unwrap_or_default();
        let periodic_bytes =
            periodic_data.map(|d| d.make_with(&self.device_name)).unwrap_or_default();

        let status = if self.advertisers.get_by_caller_id(&caller_id).is_some() {
            AdvertisingStatus::AlreadyStarted
        } else if self.advertisers.len() >= self.max_advertisers {
            AdvertisingStatus::TooManyAdvertisers
        } else if !AdvertiseData::validate_raw_data(parameters.is_legacy, &adv_bytes)
            || !AdvertiseData::validate_raw_data(parameters.is_legacy, &scan_bytes)
            || !AdvertiseData::validate_raw_data(false, &periodic_bytes)
        {
            AdvertisingStatus::DataTooLarge
        } else {
            AdvertisingStatus::Success
        };

        if status != AdvertisingStatus::Success {
            let reg_id = self.advertisers.allocate_temp_id();
            warn!("Advertising set for {} refused: {:?}", caller.app_name, status);
            callback.on_advertising_set_started(reg_id, INVALID_ADV_ID, 0, status);
            return Ok(reg_id);
        }

        let death_caller_id = caller_id.clone();
        let link = link_to_death(callback.as_ref(), &self.tx, move || {
            Message::AdvertiserDied(death_caller_id.clone())
        })?;

        let app = match self.advertisers.add(
            UuidHelper::random(),
            caller_id,
            caller,
            Some(callback.clone()),
            None,
        ) {
            Ok(app) => app,
            Err(e) => {
                unlink_to_death(callback.as_ref(), Some(link));
                return Err(e);
            }
        };
        self.advertisers.set_death_link(app.id, Some(link));

        debug!("Starting advertising set {} for {}", app.id, caller.app_name);
        self.native.start_advertising_set(
            app.id,
            parameters.into(),
            adv_bytes,
            scan_bytes,
            periodic_parameters.unwrap_or_default().into(),
            periodic_bytes,
            clamp(duration, 0, u16::MAX as i32) as u16,
            clamp(max_ext_adv_events, 0, u8::MAX as i32) as u8,
        );

        Ok(app.id)
    }

    /// Controller confirmation of `start_advertising_set`.
    pub fn on_advertising_set_started(
        &mut self,
        reg_id: i32,
        advertiser_id: u8,
        tx_power: i8,
        status: u8,
    ) {
        let status = AdvertisingStatus::from_raw(status);
        debug!(
            "on_advertising_set_started: reg_id={} advertiser_id={} status={:?}",
            reg_id, advertiser_id, status
        );

        let app = match self.advertisers.get_by_id(reg_id) {
            Some(app) => app,
            None => {
                warn!("No callback found for advertiser registration {}", reg_id);
                if status == AdvertisingStatus::Success {
                    // The owner gave up before the controller answered.
                    self.native.stop_advertising_set(advertiser_id);
                }
                return;
            }
        };

        let (advertiser_id, status) = if status != AdvertisingStatus::Success {
            self.release(&app);
            (INVALID_ADV_ID, status)
        } else if !self.advertisers.promote(reg_id, advertiser_id as i32) {
            // The handle is held by another set, or the record is no longer pending.
            warn!("Advertiser {} could not be activated", advertiser_id);
            self.release(&app);
            self.native.stop_advertising_set(advertiser_id);
            (INVALID_ADV_ID, AdvertisingStatus::InternalError)
        } else {
            (advertiser_id as i32, status)
        };

        if let Some(cb) = &app.callback {
            cb.on_advertising_set_started(reg_id, advertiser_id, tx_power as i32, status);
        }
    }

    /// Stops the set owned by `callback`.
    pub fn stop_advertising_set(&mut self, callback: &dyn IAdvertisingSetCallback) {
        self.stop_by_caller(&callback.get_object_id());
    }

    /// Owner of a set died.
    pub fn caller_died(&mut self, caller_id: &str) {
        info!("Advertiser {} died", caller_id);
        self.stop_by_caller(caller_id);
    }

    fn stop_by_caller(&mut self, caller_id: &str) {
        let app = match self.advertisers.get_by_caller_id(caller_id) {
            Some(app) => app,
            None => {
                debug!("No advertising set owned by {}", caller_id);
                return;
            }
        };

        self.release(&app);
        if app.is_pending() {
            // The confirmation for the temporary id will find no record and clean up.
            debug!("Advertising set {} dropped before start completed", app.id);
            return;
        }

        self.native.stop_advertising_set(app.id as u8);
        if let Some(cb) = &app.callback {
            cb.on_advertising_set_stopped(app.id);
        }
    }

    fn release(&self, app: &AdvertiserApp) {
        if let Some(cb) = &app.callback {
            unlink_to_death(cb.as_ref(), app.death_link);
        }
        self.advertisers.remove(app.id);
    }

    fn active_id(&self, advertiser_id: i32) -> Option<u8> {
        match self.advertisers.get_by_id(advertiser_id) {
            Some(app) if !app.is_pending() => Some(app.id as u8),
            _ => {
                warn!("Advertiser {} is not active", advertiser_id);
                None
            }
        }
    }

    fn callback_of(&self, advertiser_id: u8) -> Option<Arc<dyn IAdvertisingSetCallback>> {
        self.advertisers.get_by_id(advertiser_id as i32).and_then(|app| app.callback)
    }

    pub fn get_own_address(&self, advertiser_id: i32) {
        if let Some(id) = self.active_id(advertiser_id) {
            self.native.get_own_address(id);
        }
    }

    pub fn enable_advertising_set(
        &self,
        advertiser_id: i32,
        enable: bool,
        duration: i32,
        max_ext_adv_events: i32,
    ) {
        if let Some(id) = self.active_id(advertiser_id) {
            self.native.enable(
                id,
                enable,
                clamp(duration, 0, u16::MAX as i32) as u16,
                clamp(max_ext_adv_events, 0, u8::MAX as i32) as u8,
            );
        }
    }

    pub fn set_advertising_data(&self, advertiser_id: i32, data: AdvertiseData) {
        if let Some(id) = self.active_id(advertiser_id) {
            self.native.set_data(id, false, data.make_with(&self.device_name));
        }
    }

    pub fn set_scan_response_data(&self, advertiser_id: i32, data: AdvertiseData) {
        if let Some(id) = self.active_id(advertiser_id) {
            self.native.set_data(id, true, data.make_with(&self.device_name));
        }
    }

    pub fn set_advertising_parameters(
        &self,
        advertiser_id: i32,
        parameters: AdvertisingSetParameters,
    ) {
        if let Some(id) = self.active_id(advertiser_id) {
            self.native.set_parameters(id, parameters.into());
        }
    }

    pub fn set_periodic_advertising_parameters(
        &self,
        advertiser_id: i32,
        parameters: PeriodicAdvertisingParameters,
    ) {
        if let Some(id) = self.active_id(advertiser_id) {
            self.native.set_periodic_advertising_parameters(id, parameters.into());
        }
    }

    pub fn set_periodic_advertising_data(&self, advertiser_id: i32, data: AdvertiseData) {
        if let Some(id) = self.active_id(advertiser_id) {
            self.native.set_periodic_advertising_data(id, data.make_with(&self.device_name));
        }
    }

    pub fn set_periodic_advertising_enable(&self, advertiser_id: i32, enable: bool) {
        if let Some(id) = self.active_id(advertiser_id) {
            self.native.set_periodic_advertising_enable(id, enable);
        }
    }

    /// Routes a controller callback.
    pub fn dispatch_callbacks(&mut self, callback: AdvertiserCallbacks) {
        match callback {
            AdvertiserCallbacks::OnAdvertisingSetStarted(reg_id, adv_id, tx_power, status) => {
                self.on_advertising_set_started(reg_id, adv_id, tx_power, status)
            }
            AdvertiserCallbacks::OnOwnAddressRead(adv_id, address_type, address) => {
                if let Some(cb) = self.callback_of(adv_id) {
                    cb.on_own_address_read(adv_id as i32, address_type as i32, address);
                }
            }
            AdvertiserCallbacks::OnAdvertisingEnabled(adv_id, enable, status) => {
                if let Some(cb) = self.callback_of(adv_id) {
                    cb.on_advertising_enabled(
                        adv_id as i32,
                        enable,
                        AdvertisingStatus::from_raw(status),
                    );
                }
            }
            AdvertiserCallbacks::OnAdvertisingDataSet(adv_id, status) => {
                if let Some(cb) = self.callback_of(adv_id) {
                    cb.on_advertising_data_set(adv_id as i32, AdvertisingStatus::from_raw(status));
                }
            }
            AdvertiserCallbacks::OnScanResponseDataSet(adv_id, status) => {
                if let Some(cb) = self.callback_of(adv_id) {
                    cb.on_scan_response_data_set(
                        adv_id as i32,
                        AdvertisingStatus::from_raw(status),
                    );
                }
            }
            AdvertiserCallbacks::OnAdvertisingParametersUpdated(adv_id, tx_power, status) => {
                if let Some(cb) = self.callback_of(adv_id) {
                    cb.on_advertising_parameters_updated(
                        adv_id as i32,
                        tx_power as i32,
                        AdvertisingStatus::from_raw(status),
                    );
                }
            }
            AdvertiserCallbacks::OnPeriodicAdvertisingParametersUpdated(adv_id, status) => {
                if let Some(cb) = self.callback_of(adv_id) {
                    cb.on_periodic_advertising_parameters_updated(
                        adv_id as i32,
                        AdvertisingStatus::from_raw(status),
                    );
                }
            }
            AdvertiserCallbacks::OnPeriodicAdvertisingDataSet(adv_id, status) => {
                if let Some(cb) = self.callback_of(adv_id) {
                    cb.on_periodic_advertising_data_set(
                        adv_id as i32,
                        AdvertisingStatus::from_raw(status),
                    );
                }
            }
            AdvertiserCallbacks::OnPeriodicAdvertisingEnabled(adv_id, enable, status) => {
                if let Some(cb) = self.callback_of(adv_id) {
                    cb.on_periodic_advertising_enabled(
                        adv_id as i32,
                        enable,
                        AdvertisingStatus::from_raw(status),
                    );
                }
            }
        }
    }

    /// Drops every set, e.g. when the adapter goes down. Controller state is not touched.
    pub fn cleanup(&mut self) {
        for app in self.advertisers.clear() {
            if let Some(cb) = &app.callback {
                unlink_to_death(cb.as_ref(), app.death_link);
            }
        }
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(out, "Advertisers (max {}):", self.max_advertisers);
        self.advertisers.dump(out);
    }
}
