//! Bluetooth device addresses as they cross the controller boundary.

use std::fmt::{Debug, Display, Formatter, Result};

/// A 48-bit Bluetooth address, most significant byte first.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawAddress {
    /// Address bytes in display order.
    pub address: [u8; 6],
}

impl Debug for RawAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        Display::fmt(self, f)
    }
}

impl Display for RawAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let a = &self.address;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl From<[u8; 6]> for RawAddress {
    fn from(address: [u8; 6]) -> Self {
        Self { address }
    }
}

impl RawAddress {
    /// Parses an address of the form `AA:BB:CC:DD:EE:FF`.
    pub fn from_string<S: AsRef<str>>(addr: S) -> Option<RawAddress> {
        let s = addr.as_ref().split(':').collect::<Vec<&str>>();
        if s.len() != 6 {
            return None;
        }

        let mut raw = [0u8; 6];
        for (i, part) in s.iter().enumerate() {
            if part.len() != 2 {
                return None;
            }
            raw[i] = u8::from_str_radix(part, 16).ok()?;
        }

        Some(RawAddress { address: raw })
    }

    /// Builds an address from controller byte order (least significant byte first).
    pub fn from_reversed_bytes(bytes: &[u8]) -> Option<RawAddress> {
        let mut raw: [u8; 6] = bytes.try_into().ok()?;
        raw.reverse();
        Some(RawAddress { address: raw })
    }
}

/// The kind of address a remote used when advertising.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum AddressType {
    Public = 0,
    Random = 1,
    PublicIdentity = 2,
    RandomIdentity = 3,
    Anonymous = 0xff,
}
