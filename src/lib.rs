//! Garage license plate recognition: workspace umbrella crate.

pub use common;
pub use lpr_service;
pub use telemetry;
