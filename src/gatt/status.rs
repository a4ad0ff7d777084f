//! Status codes reported to callers. None of these cross the API as errors.

/// Status of GATT client/server and periodic sync operations, as reported by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum GattStatus {
    Success = 0x00,
    InvalidHandle = 0x01,
    ReadNotPermit = 0x02,
    WriteNotPermit = 0x03,
    InvalidPdu = 0x04,
    InsufAuthentication = 0x05,
    ReqNotSupported = 0x06,
    NoResources = 0x80,
    InternalError = 0x81,
    WrongState = 0x82,
    DbFull = 0x83,
    Busy = 0x84,
    Error = 0x85,
    CmdStarted = 0x86,
    IllegalParameter = 0x87,
    Pending = 0x88,
    AuthFail = 0x89,
    More = 0x8a,
    InvalidCfg = 0x8b,
    ServiceStarted = 0x8c,
    EncryptedNoMitm = 0x8d,
    NotEncrypted = 0x8e,
    Congested = 0x8f,
    Failure = 0x101,
}

impl GattStatus {
    /// Maps a raw controller status, folding unknown values into `Error`.
    pub fn from_raw(status: u32) -> GattStatus {
        num_traits::FromPrimitive::from_u32(status).unwrap_or(GattStatus::Error)
    }
}

/// Outcome of advertising set operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum AdvertisingStatus {
    Success = 0x0,
    DataTooLarge = 0x1,
    TooManyAdvertisers = 0x2,
    AlreadyStarted = 0x3,
    InternalError = 0x4,
    FeatureUnsupported = 0x5,
}

impl AdvertisingStatus {
    pub fn from_raw(status: u8) -> AdvertisingStatus {
        num_traits::FromPrimitive::from_u8(status).unwrap_or(AdvertisingStatus::InternalError)
    }
}

/// Outcome of scanner registration and scan start requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ScanStatus {
    Success = 0,
    AlreadyStarted = 1,
    ApplicationRegistrationFailed = 2,
    InternalError = 3,
    FeatureUnsupported = 4,
    OutOfHardwareResources = 5,
    ScanningTooFrequently = 6,
}

impl ScanStatus {
    pub fn from_raw(status: u8) -> ScanStatus {
        num_traits::FromPrimitive::from_u8(status).unwrap_or(ScanStatus::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_codes_fold() {
        assert_eq!(GattStatus::from_raw(0x85), GattStatus::Error);
        assert_eq!(GattStatus::from_raw(0x1234), GattStatus::Error);
        assert_eq!(GattStatus::from_raw(0), GattStatus::Success);
        assert_eq!(AdvertisingStatus::from_raw(2), AdvertisingStatus::TooManyAdvertisers);
        assert_eq!(AdvertisingStatus::from_raw(42), AdvertisingStatus::InternalError);
        assert_eq!(ScanStatus::from_raw(6), ScanStatus::ScanningTooFrequently);
        assert_eq!(ScanStatus::from_raw(99), ScanStatus::InternalError);
    }
}
