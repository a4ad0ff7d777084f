//! UUID helpers for the Bluetooth base UUID and its shortened forms.

use std::fmt::{Display, Formatter};

/// Raw big-endian bytes of a 128-bit UUID.
pub type Uuid128Bit = [u8; 16];

pub const BASE_UUID: &str = "00000000-0000-1000-8000-00805F9B34FB";

// Unsigned integer representation of UUIDs.
pub const BASE_UUID_NUM: u128 = 0x0000000000001000800000805f9b34fbu128;
pub const BASE_UUID_MASK: u128 = !(0xffffffffu128 << 96);

/// Wraps a reference of Uuid128Bit so it can be formatted.
pub struct UuidWrapper<'a>(pub &'a Uuid128Bit);

impl<'a> Display for UuidWrapper<'a> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let u = self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-\
             {:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u[0], u[1], u[2], u[3], u[4], u[5], u[6], u[7], u[8], u[9], u[10], u[11], u[12],
            u[13], u[14], u[15]
        )
    }
}

pub struct UuidHelper {}

impl UuidHelper {
    /// Converts a UUID byte array into a formatted string.
    pub fn to_string(uuid: &Uuid128Bit) -> String {
        UuidWrapper(uuid).to_string()
    }

    /// Converts a well-formatted UUID string to a UUID byte array.
    /// The UUID string should be in the format:
    /// 12345678-1234-1234-1234-1234567890ab
    pub fn from_string<S: Into<String>>(raw: S) -> Option<Uuid128Bit> {
        let raw: String = raw.into();

        let s = raw.split('-').collect::<Vec<&str>>();
        if s.len() != 5 || raw.len() != 36 || !raw.is_ascii() {
            return None;
        }

        let mut uuid: Uuid128Bit = [0; 16];
        let mut idx = 0;
        for section in s.iter() {
            if section.len() % 2 != 0 {
                return None;
            }
            for i in (0..section.len()).step_by(2) {
                uuid[idx] = u8::from_str_radix(&section[i..i + 2], 16).ok()?;
                idx += 1;
            }
        }

        Some(uuid)
    }

    /// Expands a 16-bit assigned number onto the base UUID.
    pub fn from_u16(short: u16) -> Uuid128Bit {
        Self::from_u32(short as u32)
    }

    /// Expands a 32-bit assigned number onto the base UUID.
    pub fn from_u32(short: u32) -> Uuid128Bit {
        (BASE_UUID_NUM | ((short as u128) << 96)).to_be_bytes()
    }

    /// Decodes a 2, 4 or 16 byte little-endian UUID as found in advertising data.
    pub fn from_little_endian(bytes: &[u8]) -> Option<Uuid128Bit> {
        match bytes.len() {
            2 => Some(Self::from_u16(u16::from_le_bytes([bytes[0], bytes[1]]))),
            4 => Some(Self::from_u32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))),
            16 => {
                let mut raw: Uuid128Bit = bytes.try_into().ok()?;
                raw.reverse();
                Some(raw)
            }
            _ => None,
        }
    }

    /// Shortest little-endian encoding of `uuid`, ready to be written into advertising data.
    pub fn to_little_endian(uuid: &Uuid128Bit) -> Vec<u8> {
        let mut bytes = Self::get_shortest_slice(uuid).to_vec();
        bytes.reverse();
        bytes
    }

    /// Parses an 128-bit UUID into a byte array of shortest representation.
    pub fn get_shortest_slice(uuid: &Uuid128Bit) -> &[u8] {
        if UuidHelper::in_16bit_uuid_range(uuid) {
            &uuid[2..4]
        } else if UuidHelper::in_32bit_uuid_range(uuid) {
            &uuid[0..4]
        } else {
            &uuid[..]
        }
    }

    /// Checks whether the UUID value is in the 16-bit Bluetooth UUID range.
    pub fn in_16bit_uuid_range(uuid: &Uuid128Bit) -> bool {
        if !UuidHelper::in_32bit_uuid_range(uuid) {
            return false;
        }
        uuid[0] == 0 && uuid[1] == 0
    }

    /// Checks whether the UUID value is in the 32-bit Bluetooth UUID range.
    fn in_32bit_uuid_range(uuid: &Uuid128Bit) -> bool {
        let num = u128::from_be_bytes(*uuid);
        (num & BASE_UUID_MASK) == BASE_UUID_NUM
    }

    /// A fresh random (version 4) UUID used to correlate registrations with their grants.
    pub fn random() -> Uuid128Bit {
        uuid::Uuid::new_v4().into_bytes()
    }
}
