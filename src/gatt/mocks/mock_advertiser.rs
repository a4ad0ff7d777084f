//! Mocked implementation of BleAdvertiserInterface for use in test

use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

use crate::gatt::native::{
    AdvertiseParameters, BleAdvertiserInterface, PeriodicAdvertiseParameters,
};

/// Routes calls to BleAdvertiserInterface into a channel of AdvertiserEvents
pub struct MockAdvertiser(mpsc::UnboundedSender<AdvertiserEvents>);

impl MockAdvertiser {
    /// Constructor. Returns self and the RX side of the associated channel.
    pub fn new() -> (Self, UnboundedReceiver<AdvertiserEvents>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }
}

/// Events representing calls to BleAdvertiserInterface
#[derive(Debug, PartialEq)]
pub enum AdvertiserEvents {
    /// reg_id, params, adv_data, scan_response, periodic_params, periodic_data, duration,
    /// max_ext_adv_events
    StartAdvertisingSet(
        i32,
        AdvertiseParameters,
        Vec<u8>,
        Vec<u8>,
        PeriodicAdvertiseParameters,
        Vec<u8>,
        u16,
        u8,
    ),
    StopAdvertisingSet(u8),
    GetOwnAddress(u8),
    /// advertiser_id, enable, duration, max_ext_adv_events
    Enable(u8, bool, u16, u8),
    /// advertiser_id, set_scan_rsp, data
    SetData(u8, bool, Vec<u8>),
    SetParameters(u8, AdvertiseParameters),
    SetPeriodicAdvertisingParameters(u8, PeriodicAdvertiseParameters),
    SetPeriodicAdvertisingData(u8, Vec<u8>),
    SetPeriodicAdvertisingEnable(u8, bool),
}

impl BleAdvertiserInterface for MockAdvertiser {
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
    ) {
        self.0
            .send(AdvertiserEvents::StartAdvertisingSet(
                reg_id,
                params,
                adv_data,
                scan_response,
                periodic_params,
                periodic_data,
                duration,
                max_ext_adv_events,
            ))
            .unwrap();
    }

    fn stop_advertising_set(&self, advertiser_id: u8) {
        self.0.send(AdvertiserEvents::StopAdvertisingSet(advertiser_id)).unwrap();
    }

    fn get_own_address(&self, advertiser_id: u8) {
        self.0.send(AdvertiserEvents::GetOwnAddress(advertiser_id)).unwrap();
    }

    fn enable(&self, advertiser_id: u8, enable: bool, duration: u16, max_ext_adv_events: u8) {
        self.0
            .send(AdvertiserEvents::Enable(advertiser_id, enable, duration, max_ext_adv_events))
            .unwrap();
    }

    fn set_data(&self, advertiser_id: u8, set_scan_rsp: bool, data: Vec<u8>) {
        self.0.send(AdvertiserEvents::SetData(advertiser_id, set_scan_rsp, data)).unwrap();
    }

    fn set_parameters(&self, advertiser_id: u8, params: AdvertiseParameters) {
        self.0.send(AdvertiserEvents::SetParameters(advertiser_id, params)).unwrap();
    }

    fn set_periodic_advertising_parameters(
        &self,
        advertiser_id: u8,
        params: PeriodicAdvertiseParameters,
    ) {
        self.0
            .send(AdvertiserEvents::SetPeriodicAdvertisingParameters(advertiser_id, params))
            .unwrap();
    }

    fn set_periodic_advertising_data(&self, advertiser_id: u8, data: Vec<u8>) {
        self.0.send(AdvertiserEvents::SetPeriodicAdvertisingData(advertiser_id, data)).unwrap();
    }

    fn set_periodic_advertising_enable(&self, advertiser_id: u8, enable: bool) {
        self.0
            .send(AdvertiserEvents::SetPeriodicAdvertisingEnable(advertiser_id, enable))
            .unwrap();
    }
}
