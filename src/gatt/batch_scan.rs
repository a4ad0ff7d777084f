//! Decoding of the packed result buffers the controller returns for batch scans.

use log::{debug, warn};
use std::time::Duration;

use crate::core::address::RawAddress;
use crate::gatt::scan_record::ScanRecord;
use crate::gatt::scan_settings::ScanResult;

/// Report formats of `OnBatchScanReports`.
pub const REPORT_FORMAT_TRUNCATED: i32 = 1;
pub const REPORT_FORMAT_FULL: i32 = 2;

/// Size of a truncated record, which is also the header of a full record.
const RECORD_HEADER_LEN: usize = 11;
const TIMESTAMP_TICK: Duration = Duration::from_millis(50);

struct RecordHeader {
    address: RawAddress,
    address_type: u8,
    tx_power: i8,
    rssi: i8,
    age: Duration,
}

fn parse_header(bytes: &[u8]) -> Option<RecordHeader> {
    if bytes.len() < RECORD_HEADER_LEN {
        return None;
    }
    let ticks = u16::from_le_bytes([bytes[9], bytes[10]]);
    Some(RecordHeader {
        address: RawAddress::from_reversed_bytes(&bytes[0..6])?,
        address_type: bytes[6],
        tx_power: bytes[7] as i8,
        rssi: bytes[8] as i8,
        age: TIMESTAMP_TICK * ticks as u32,
    })
}

impl RecordHeader {
    fn into_result(self, scan_record: ScanRecord, now_nanos: u64) -> ScanResult {
        ScanResult {
            address: self.address,
            address_type: self.address_type,
            tx_power: self.tx_power,
            rssi: self.rssi,
            scan_record,
            timestamp_nanos: now_nanos.saturating_sub(self.age.as_nanos() as u64),
            ..Default::default()
        }
    }
}

/// Decodes `num_records` results from `data`. Decoding stops at the first record that does not
/// fit in the buffer; whatever was decoded up to that point is returned.
///
/// Record timestamps count back from `now_nanos`.
pub fn parse_batch_scan_results(
    num_records: i32,
    report_format: i32,
    data: &[u8],
    now_nanos: u64,
) -> Vec<ScanResult> {
    if num_records <= 0 {
        return vec![];
    }
    debug!("Decoding {} batch records, format {}", num_records, report_format);
    if report_format == REPORT_FORMAT_TRUNCATED {
        parse_truncated(num_records as usize, data, now_nanos)
    } else {
        parse_full(data, now_nanos)
    }
}

fn parse_truncated(num_records: usize, data: &[u8], now_nanos: u64) -> Vec<ScanResult> {
    let results: Vec<ScanResult> = data
        .chunks(RECORD_HEADER_LEN)
        .take(num_records)
        .map_while(parse_header)
        .map(|header| header.into_result(ScanRecord::default(), now_nanos))
        .collect();
    if results.len() < num_records {
        warn!(
            "Truncated batch report holds {} of {} records ({} bytes)",
            results.len(),
            num_records,
            data.len()
        );
    }
    results
}

// Full records run until the end of the buffer; the record count is not trusted.
fn parse_full(data: &[u8], now_nanos: u64) -> Vec<ScanResult> {
    let mut results = vec![];
    let mut pos = 0;
    while pos < data.len() {
        match parse_full_record(&data[pos..]) {
            Some((header, scan_record, len)) => {
                results.push(header.into_result(scan_record, now_nanos));
                pos += len;
            }
            None => {
                warn!("Malformed full batch record at offset {} of {}", pos, data.len());
                break;
            }
        }
    }
    results
}

fn parse_full_record(bytes: &[u8]) -> Option<(RecordHeader, ScanRecord, usize)> {
    let header = parse_header(bytes)?;
    let mut pos = RECORD_HEADER_LEN;

    let adv_len = *bytes.get(pos)? as usize;
    let adv = bytes.get(pos + 1..pos + 1 + adv_len)?;
    pos += 1 + adv_len;

    let scan_rsp_len = *bytes.get(pos)? as usize;
    let scan_rsp = bytes.get(pos + 1..pos + 1 + scan_rsp_len)?;
    pos += 1 + scan_rsp_len;

    Some((header, ScanRecord::parse(&[adv, scan_rsp].concat()), pos))
}
