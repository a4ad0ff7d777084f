//! BLE advertising parameters and the AD structure encoding of advertising data.

use itertools::Itertools;
use num_traits::clamp;
use std::collections::HashMap;

use crate::core::uuid::{Uuid128Bit, UuidHelper};
use crate::gatt::native::{AdvertiseParameters, LePhy, PeriodicAdvertiseParameters};

/// Advertising parameters for each BLE advertising set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdvertisingSetParameters {
    /// Whether the advertisement will be connectable.
    pub connectable: bool,
    /// Whether the advertisement will be scannable.
    pub scannable: bool,
    /// Whether the legacy advertisement will be used.
    pub is_legacy: bool,
    /// Whether the advertisement will be anonymous.
    pub is_anonymous: bool,
    /// Whether the TX Power will be included.
    pub include_tx_power: bool,
    /// Primary advertising phy. Valid values are: 1 (1M), 2 (2M), 3 (Coded).
    pub primary_phy: LePhy,
    /// Secondary advertising phy. Valid values are: 1 (1M), 2 (2M), 3 (Coded).
    pub secondary_phy: LePhy,
    /// The advertising interval. Bluetooth LE Advertising interval, in 0.625 ms unit.
    /// The valid range is from 160 (100 ms) to 16777215 (10485.759375 sec).
    pub interval: i32,
    /// Transmission power of Bluetooth LE Advertising, in dBm. The valid range is [-127, 1].
    pub tx_power_level: i32,
    /// Own address type for advertising to control public or privacy mode.
    /// The valid types are: -1 (default), 0 (public), 1 (random).
    pub own_address_type: i32,
}

/// Represents the data to be advertised and the scan response data for active scans.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdvertiseData {
    /// Service UUIDs that identify the GATT services of the advertiser.
    pub service_uuids: Vec<Uuid128Bit>,
    /// Service solicitation UUIDs, inviting peers offering them to connect.
    pub solicit_uuids: Vec<Uuid128Bit>,
    pub transport_discovery_data: Vec<Vec<u8>>,
    /// Manufacturer id and the corresponding manufacturer specific data.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service UUID and its corresponding service data.
    pub service_data: HashMap<Uuid128Bit, Vec<u8>>,
    /// Whether TX Power level will be included in the advertising packet.
    pub include_tx_power_level: bool,
    /// Whether the device name will be included in the advertisement packet.
    pub include_device_name: bool,
}

/// Parameters of the periodic advertising packet for BLE advertising set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeriodicAdvertisingParameters {
    /// Whether TX Power level will be included.
    pub include_tx_power: bool,
    /// Periodic advertising interval in 1.25 ms unit. Valid values are from 80 (100 ms) to
    /// 65519 (81.89875 sec).
    pub interval: i32,
}

// Advertising interval range.
const INTERVAL_MAX: i32 = 0xff_ffff; // 10485.759375 sec
const INTERVAL_MIN: i32 = 160; // 100 ms
const INTERVAL_DELTA: i32 = 50; // 31.25 ms gap between min and max

// Periodic advertising interval range.
const PERIODIC_INTERVAL_MAX: i32 = 65519; // 81.89875 sec
const PERIODIC_INTERVAL_MIN: i32 = 80; // 100 ms
const PERIODIC_INTERVAL_DELTA: i32 = 16; // 20 ms gap between min and max

// Device name length.
const DEVICE_NAME_MAX: usize = 26;

// Payload limits of a single advertisement.
const LEGACY_ADV_DATA_LEN_MAX: usize = 31;
const EXT_ADV_DATA_LEN_MAX: usize = 1650;

// Advertising data types.
pub(crate) const FLAGS: u8 = 0x01;
pub(crate) const INCOMPLETE_LIST_16_BIT_SERVICE_UUIDS: u8 = 0x02;
pub(crate) const COMPLETE_LIST_16_BIT_SERVICE_UUIDS: u8 = 0x03;
pub(crate) const INCOMPLETE_LIST_32_BIT_SERVICE_UUIDS: u8 = 0x04;
pub(crate) const COMPLETE_LIST_32_BIT_SERVICE_UUIDS: u8 = 0x05;
pub(crate) const INCOMPLETE_LIST_128_BIT_SERVICE_UUIDS: u8 = 0x06;
pub(crate) const COMPLETE_LIST_128_BIT_SERVICE_UUIDS: u8 = 0x07;
pub(crate) const SHORTENED_LOCAL_NAME: u8 = 0x08;
pub(crate) const COMPLETE_LOCAL_NAME: u8 = 0x09;
pub(crate) const TX_POWER_LEVEL: u8 = 0x0a;
pub(crate) const LIST_16_BIT_SERVICE_SOLICITATION_UUIDS: u8 = 0x14;
pub(crate) const LIST_128_BIT_SERVICE_SOLICITATION_UUIDS: u8 = 0x15;
pub(crate) const SERVICE_DATA_16_BIT_UUID: u8 = 0x16;
pub(crate) const LIST_32_BIT_SERVICE_SOLICITATION_UUIDS: u8 = 0x1f;
pub(crate) const SERVICE_DATA_32_BIT_UUID: u8 = 0x20;
pub(crate) const SERVICE_DATA_128_BIT_UUID: u8 = 0x21;
pub(crate) const TRANSPORT_DISCOVERY_DATA: u8 = 0x26;
pub(crate) const MANUFACTURER_SPECIFIC_DATA: u8 = 0xff;

impl From<AdvertisingSetParameters> for AdvertiseParameters {
    fn from(p: AdvertisingSetParameters) -> Self {
        let mut props: u16 = 0;
        if p.connectable {
            props |= 0x01;
        }
        if p.scannable {
            props |= 0x02;
        }
        if p.is_legacy {
            props |= 0x10;
        }
        if p.is_anonymous {
            props |= 0x20;
        }
        if p.include_tx_power {
            props |= 0x40;
        }

        let interval = clamp(p.interval, INTERVAL_MIN, INTERVAL_MAX - INTERVAL_DELTA);

        AdvertiseParameters {
            advertising_event_properties: props,
            min_interval: interval as u32,
            max_interval: (interval + INTERVAL_DELTA) as u32,
            channel_map: 0x07, // all channels
            tx_power: clamp(p.tx_power_level, -127, 1) as i8,
            primary_advertising_phy: p.primary_phy as u8,
            secondary_advertising_phy: p.secondary_phy as u8,
            scan_request_notification_enable: false,
            own_address_type: p.own_address_type as i8,
        }
    }
}

impl From<PeriodicAdvertisingParameters> for PeriodicAdvertiseParameters {
    fn from(p: PeriodicAdvertisingParameters) -> Self {
        let interval = clamp(
            p.interval,
            PERIODIC_INTERVAL_MIN,
            PERIODIC_INTERVAL_MAX - PERIODIC_INTERVAL_DELTA,
        );

        PeriodicAdvertiseParameters {
            enable: true,
            min_interval: interval as u16,
            max_interval: (interval + PERIODIC_INTERVAL_DELTA) as u16,
            periodic_advertising_properties: if p.include_tx_power { 0x40 } else { 0 },
        }
    }
}

impl AdvertiseData {
    fn append_adv_data(dest: &mut Vec<u8>, ad_type: u8, ad_payload: &[u8]) {
        let len = clamp(ad_payload.len(), 0, 254);
        dest.push((len + 1) as u8);
        dest.push(ad_type);
        dest.extend(&ad_payload[..len]);
    }

    /// Appends one list per UUID width, in 16, 32, 128-bit order. Empty lists are skipped.
    fn append_uuids(dest: &mut Vec<u8>, ad_types: [u8; 3], uuids: &[Uuid128Bit]) {
        let mut buckets: [Vec<u8>; 3] = Default::default();
        for uuid in uuids {
            let bytes = UuidHelper::to_little_endian(uuid);
            let bucket = match bytes.len() {
                2 => 0,
                4 => 1,
                _ => 2,
            };
            buckets[bucket].extend(bytes);
        }

        for (ad_type, bytes) in ad_types.iter().zip(buckets.iter()) {
            if !bytes.is_empty() {
                AdvertiseData::append_adv_data(dest, *ad_type, bytes);
            }
        }
    }

    fn append_service_data(dest: &mut Vec<u8>, service_data: &HashMap<Uuid128Bit, Vec<u8>>) {
        for uuid in service_data.keys().sorted() {
            let mut concated = UuidHelper::to_little_endian(uuid);
            let ad_type = match concated.len() {
                2 => SERVICE_DATA_16_BIT_UUID,
                4 => SERVICE_DATA_32_BIT_UUID,
                _ => SERVICE_DATA_128_BIT_UUID,
            };
            concated.extend(&service_data[uuid]);
            AdvertiseData::append_adv_data(dest, ad_type, &concated);
        }
    }

    /// Creates raw data from the AdvertiseData. Flags are left to the lower layers.
    pub fn make_with(&self, device_name: &str) -> Vec<u8> {
        let mut bytes = Vec::<u8>::new();

        if self.include_device_name {
            let name = device_name.as_bytes();
            if name.len() > DEVICE_NAME_MAX {
                AdvertiseData::append_adv_data(
                    &mut bytes,
                    SHORTENED_LOCAL_NAME,
                    &name[..DEVICE_NAME_MAX],
                );
            } else {
                AdvertiseData::append_adv_data(&mut bytes, COMPLETE_LOCAL_NAME, name);
            }
        }

        for m in self.manufacturer_data.keys().sorted() {
            let mut concated = m.to_le_bytes().to_vec();
            concated.extend(&self.manufacturer_data[m]);
            AdvertiseData::append_adv_data(&mut bytes, MANUFACTURER_SPECIFIC_DATA, &concated);
        }

        if self.include_tx_power_level {
            // Lower layers will fill tx power level.
            AdvertiseData::append_adv_data(&mut bytes, TX_POWER_LEVEL, &[0]);
        }

        AdvertiseData::append_uuids(
            &mut bytes,
            [
                COMPLETE_LIST_16_BIT_SERVICE_UUIDS,
                COMPLETE_LIST_32_BIT_SERVICE_UUIDS,
                COMPLETE_LIST_128_BIT_SERVICE_UUIDS,
            ],
            &self.service_uuids,
        );

        AdvertiseData::append_service_data(&mut bytes, &self.service_data);

        AdvertiseData::append_uuids(
            &mut bytes,
            [
                LIST_16_BIT_SERVICE_SOLICITATION_UUIDS,
                LIST_32_BIT_SERVICE_SOLICITATION_UUIDS,
                LIST_128_BIT_SERVICE_SOLICITATION_UUIDS,
            ],
            &self.solicit_uuids,
        );

        for tdd in &self.transport_discovery_data {
            if !tdd.is_empty() {
                AdvertiseData::append_adv_data(&mut bytes, TRANSPORT_DISCOVERY_DATA, tdd);
            }
        }

        bytes
    }

    /// Checks whether the encoded data fits in one advertisement.
    pub fn validate_raw_data(is_legacy: bool, bytes: &[u8]) -> bool {
        bytes.len() <= AdvertiseData::max_data_len(is_legacy)
    }

    fn max_data_len(is_legacy: bool) -> usize {
        if is_legacy {
            LEGACY_ADV_DATA_LEN_MAX
        } else {
            EXT_ADV_DATA_LEN_MAX
        }
    }
}
