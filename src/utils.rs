//! Utilities shared across the crate

#[cfg(test)]
pub mod task;
