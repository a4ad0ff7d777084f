//! LE session management: GATT client/server registrations, advertising sets, periodic syncs,
//! and scanners, each tracked in a registry keyed by the caller that owns it.

pub mod advertise_data;
pub mod advertise_manager;
pub mod batch_scan;
pub mod context_map;
pub mod handle_map;
pub mod mocks;
pub mod native;
pub mod periodic_scan_manager;
pub mod scan_manager;
pub mod scan_record;
pub mod scan_settings;
pub mod scan_stats;
pub mod service;
pub mod status;
