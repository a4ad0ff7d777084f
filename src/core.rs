//! Shared types used by every session manager.

pub mod address;
pub mod liveness;
pub mod uuid;
