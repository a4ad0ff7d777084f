//! Scan settings, filters, and the results delivered to scanners.

use bitflags::bitflags;

use crate::core::address::RawAddress;
use crate::core::uuid::Uuid128Bit;
use crate::gatt::scan_record::ScanRecord;

/// Duty cycle of a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum ScanMode {
    /// Only piggybacks on scans started by others.
    Opportunistic = -1,
    LowPower = 0,
    Balanced = 1,
    LowLatency = 2,
    AmbientDiscovery = 3,
}

impl Default for ScanMode {
    fn default() -> Self {
        ScanMode::LowPower
    }
}

bitflags! {
    /// When results are delivered.
    pub struct CallbackType: i32 {
        const ALL_MATCHES = 1;
        const FIRST_MATCH = 2;
        const MATCH_LOST = 4;
    }
}

impl Default for CallbackType {
    fn default() -> Self {
        CallbackType::ALL_MATCHES
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum ScanResultType {
    Full = 0,
    Abbreviated = 1,
}

impl Default for ScanResultType {
    fn default() -> Self {
        ScanResultType::Full
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanSettings {
    pub scan_mode: ScanMode,
    pub callback_type: CallbackType,
    pub scan_result_type: ScanResultType,
    /// Zero for immediate delivery, otherwise results are batched by the controller.
    pub report_delay_millis: u64,
    /// Only legacy advertisements, delivered as fixed-size records.
    pub legacy: bool,
}

impl ScanSettings {
    /// Batched scans are serviced by the controller without waking the host.
    pub fn is_batch(&self) -> bool {
        self.report_delay_millis > 0
    }

    pub fn is_background(&self) -> bool {
        self.is_batch()
    }
}

/// Criteria a result must meet to be delivered. Unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanFilter {
    pub address: Option<RawAddress>,
    pub name: Option<String>,
    pub service_uuid: Option<Uuid128Bit>,
    pub service_uuid_mask: Option<Uuid128Bit>,
    pub service_data_uuid: Option<Uuid128Bit>,
    pub service_data: Option<Vec<u8>>,
    pub service_data_mask: Option<Vec<u8>>,
    pub manufacturer_id: Option<u16>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub manufacturer_data_mask: Option<Vec<u8>>,
}

impl ScanFilter {
    pub fn matches(&self, result: &ScanResult) -> bool {
        if let Some(address) = &self.address {
            if address != &result.address {
                return false;
            }
        }

        let record = &result.scan_record;
        if let Some(name) = &self.name {
            if record.device_name.as_ref() != Some(name) {
                return false;
            }
        }

        if let Some(uuid) = &self.service_uuid {
            let found = record
                .service_uuids
                .iter()
                .any(|u| uuid_matches(uuid, u, self.service_uuid_mask.as_ref()));
            if !found {
                return false;
            }
        }

        if let Some(uuid) = &self.service_data_uuid {
            let data = match record.service_data.get(uuid) {
                Some(data) => data,
                None => return false,
            };
            if let Some(wanted) = &self.service_data {
                if !data_matches(wanted, self.service_data_mask.as_deref(), data) {
                    return false;
                }
            }
        }

        if let Some(id) = self.manufacturer_id {
            let data = match record.manufacturer_data.get(&id) {
                Some(data) => data,
                None => return false,
            };
            if let Some(wanted) = &self.manufacturer_data {
                if !data_matches(wanted, self.manufacturer_data_mask.as_deref(), data) {
                    return false;
                }
            }
        }

        true
    }
}

fn uuid_matches(wanted: &Uuid128Bit, actual: &Uuid128Bit, mask: Option<&Uuid128Bit>) -> bool {
    match mask {
        Some(mask) => wanted.iter().zip(actual).zip(mask).all(|((w, a), m)| w & m == a & m),
        None => wanted == actual,
    }
}

fn data_matches(wanted: &[u8], mask: Option<&[u8]>, actual: &[u8]) -> bool {
    if actual.len() < wanted.len() {
        return false;
    }
    match mask {
        Some(mask) if mask.len() == wanted.len() => {
            wanted.iter().zip(actual).zip(mask).all(|((w, a), m)| w & m == a & m)
        }
        _ => &actual[..wanted.len()] == wanted,
    }
}

/// An advertisement seen by the controller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanResult {
    pub address: RawAddress,
    pub address_type: u8,
    pub event_type: u16,
    pub primary_phy: u8,
    pub secondary_phy: u8,
    pub advertising_sid: u8,
    pub tx_power: i8,
    pub rssi: i8,
    pub periodic_adv_int: u16,
    pub scan_record: ScanRecord,
    /// Time since boot at which the advertisement was received.
    pub timestamp_nanos: u64,
}
