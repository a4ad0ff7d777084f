//! Parsing of received advertising data into its AD structures.

use std::collections::HashMap;

use crate::core::uuid::{Uuid128Bit, UuidHelper};
use crate::gatt::advertise_data::{
    COMPLETE_LIST_128_BIT_SERVICE_UUIDS, COMPLETE_LIST_16_BIT_SERVICE_UUIDS,
    COMPLETE_LIST_32_BIT_SERVICE_UUIDS, COMPLETE_LOCAL_NAME, FLAGS,
    INCOMPLETE_LIST_128_BIT_SERVICE_UUIDS, INCOMPLETE_LIST_16_BIT_SERVICE_UUIDS,
    INCOMPLETE_LIST_32_BIT_SERVICE_UUIDS, LIST_128_BIT_SERVICE_SOLICITATION_UUIDS,
    LIST_16_BIT_SERVICE_SOLICITATION_UUIDS, LIST_32_BIT_SERVICE_SOLICITATION_UUIDS,
    MANUFACTURER_SPECIFIC_DATA, SERVICE_DATA_128_BIT_UUID, SERVICE_DATA_16_BIT_UUID,
    SERVICE_DATA_32_BIT_UUID, SHORTENED_LOCAL_NAME, TX_POWER_LEVEL,
};

struct AdvDataIterator<'a> {
    data: &'a [u8],
    cur: usize,
}

// Yields (type, payload) for each AD structure. A zero length or an element running past the
// end of the buffer terminates the walk.
impl<'a> Iterator for AdvDataIterator<'a> {
    type Item = (u8, &'a [u8]);
    fn next(&mut self) -> Option<(u8, &'a [u8])> {
        let i = self.cur;
        if i >= self.data.len() {
            return None;
        }
        let len: usize = self.data[i].into();
        if len == 0 || i + len >= self.data.len() {
            self.cur = self.data.len();
            return None;
        }
        self.cur = i + len + 1;
        Some((self.data[i + 1], &self.data[i + 2..self.cur]))
    }
}

fn iterate_adv_data(data: &[u8]) -> AdvDataIterator {
    AdvDataIterator { data, cur: 0 }
}

/// Decoded contents of an advertisement plus its scan response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanRecord {
    pub advertise_flags: Option<u8>,
    pub service_uuids: Vec<Uuid128Bit>,
    pub service_solicitation_uuids: Vec<Uuid128Bit>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid128Bit, Vec<u8>>,
    pub tx_power_level: Option<i8>,
    pub device_name: Option<String>,
    /// The raw bytes the record was parsed from.
    pub bytes: Vec<u8>,
}

impl ScanRecord {
    pub fn parse(bytes: &[u8]) -> ScanRecord {
        let mut record = ScanRecord { bytes: bytes.to_vec(), ..Default::default() };
        let mut shortened_name = None;

        for (ad_type, payload) in iterate_adv_data(bytes) {
            match ad_type {
                FLAGS => record.advertise_flags = payload.first().copied(),
                INCOMPLETE_LIST_16_BIT_SERVICE_UUIDS | COMPLETE_LIST_16_BIT_SERVICE_UUIDS => {
                    extend_uuids(&mut record.service_uuids, payload, 2)
                }
                INCOMPLETE_LIST_32_BIT_SERVICE_UUIDS | COMPLETE_LIST_32_BIT_SERVICE_UUIDS => {
                    extend_uuids(&mut record.service_uuids, payload, 4)
                }
                INCOMPLETE_LIST_128_BIT_SERVICE_UUIDS | COMPLETE_LIST_128_BIT_SERVICE_UUIDS => {
                    extend_uuids(&mut record.service_uuids, payload, 16)
                }
                LIST_16_BIT_SERVICE_SOLICITATION_UUIDS => {
                    extend_uuids(&mut record.service_solicitation_uuids, payload, 2)
                }
                LIST_32_BIT_SERVICE_SOLICITATION_UUIDS => {
                    extend_uuids(&mut record.service_solicitation_uuids, payload, 4)
                }
                LIST_128_BIT_SERVICE_SOLICITATION_UUIDS => {
                    extend_uuids(&mut record.service_solicitation_uuids, payload, 16)
                }
                COMPLETE_LOCAL_NAME => {
                    record.device_name = Some(String::from_utf8_lossy(payload).to_string())
                }
                SHORTENED_LOCAL_NAME => {
                    shortened_name = Some(String::from_utf8_lossy(payload).to_string())
                }
                TX_POWER_LEVEL => record.tx_power_level = payload.first().map(|p| *p as i8),
                SERVICE_DATA_16_BIT_UUID => insert_service_data(&mut record, payload, 2),
                SERVICE_DATA_32_BIT_UUID => insert_service_data(&mut record, payload, 4),
                SERVICE_DATA_128_BIT_UUID => insert_service_data(&mut record, payload, 16),
                MANUFACTURER_SPECIFIC_DATA => {
                    if payload.len() >= 2 {
                        let id = u16::from_le_bytes([payload[0], payload[1]]);
                        record.manufacturer_data.insert(id, payload[2..].to_vec());
                    }
                }
                _ => (),
            }
        }

        if record.device_name.is_none() {
            record.device_name = shortened_name;
        }
        record
    }
}

fn extend_uuids(dest: &mut Vec<Uuid128Bit>, payload: &[u8], width: usize) {
    dest.extend(payload.chunks_exact(width).filter_map(UuidHelper::from_little_endian));
}

fn insert_service_data(record: &mut ScanRecord, payload: &[u8], width: usize) {
    if let Some(uuid) = payload.get(0..width).and_then(UuidHelper::from_little_endian) {
        record.service_data.insert(uuid, payload[width..].to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_name() {
        let record =
            ScanRecord::parse(&[2, FLAGS, 6, 5, COMPLETE_LOCAL_NAME, b't', b'e', b's', b't']);
        assert_eq!(record.advertise_flags, Some(6));
        assert_eq!(record.device_name.as_deref(), Some("test"));

        let record = ScanRecord::parse(&[3, SHORTENED_LOCAL_NAME, b't', b'e']);
        assert_eq!(record.device_name.as_deref(), Some("te"));

        let record = ScanRecord::parse(&[2, FLAGS, 6]);
        assert_eq!(record.device_name, None);
    }

    #[test]
    fn test_service_uuids_of_every_width() {
        let mut payload = vec![3, COMPLETE_LIST_16_BIT_SERVICE_UUIDS, 0x2c, 0xfe];
        payload.extend([5, COMPLETE_LIST_32_BIT_SERVICE_UUIDS, 2, 3, 4, 5]);
        payload.extend([17, COMPLETE_LIST_128_BIT_SERVICE_UUIDS]);
        payload.extend(0..16u8);

        let record = ScanRecord::parse(&payload);
        assert_eq!(record.service_uuids.len(), 3);
        assert_eq!(record.service_uuids[0], UuidHelper::from_u16(0xfe2c));
        assert_eq!(record.service_uuids[1], UuidHelper::from_u32(0x05040302));
        assert_eq!(
            record.service_uuids[2],
            [15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0]
        );
    }

    #[test]
    fn test_service_and_manufacturer_data() {
        let record = ScanRecord::parse(&[
            4,
            SERVICE_DATA_16_BIT_UUID,
            0x2c,
            0xfe,
            0xff,
            5,
            MANUFACTURER_SPECIFIC_DATA,
            0xe0,
            0x00,
            1,
            2,
            2,
            TX_POWER_LEVEL,
            0xf6,
        ]);
        assert_eq!(record.service_data.get(&UuidHelper::from_u16(0xfe2c)), Some(&vec![0xff]));
        assert_eq!(record.manufacturer_data.get(&0x00e0), Some(&vec![1, 2]));
        assert_eq!(record.tx_power_level, Some(-10));
    }

    #[test]
    fn test_truncated_input_stops_parsing() {
        // second element claims more bytes than remain
        let record = ScanRecord::parse(&[2, FLAGS, 1, 9, COMPLETE_LOCAL_NAME, b'a']);
        assert_eq!(record.advertise_flags, Some(1));
        assert_eq!(record.device_name, None);

        // zero padding terminates the walk
        let mut padded = vec![2, FLAGS, 1];
        padded.resize(62, 0);
        let record = ScanRecord::parse(&padded);
        assert_eq!(record.advertise_flags, Some(1));
        assert_eq!(record.bytes.len(), 62);
    }
}
