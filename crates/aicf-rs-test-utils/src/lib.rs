//! Test helpers shared across AICF crates.

pub mod fixtures;
pub mod store;

pub use fixtures::{NEGATIVE_SAMPLES, SENSITIVE_SAMPLES, fixed_time, record};
pub use store::TempStore;
