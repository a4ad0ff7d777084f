//! Mocked implementations of the native interfaces, the battery collaborator and caller
//! callbacks, for use in test. Every call is routed into a channel of events.

pub mod mock_advertiser;
pub mod mock_battery_stats;
pub mod mock_callbacks;
pub mod mock_gatt;
pub mod mock_periodic_sync;
pub mod mock_scanner;
