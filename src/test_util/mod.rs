//! Utilities for testing code that talks to a device over a link. They are used for testing the
//!  link layer itself, but they are also exported for application testing, which is why they are
//!  part of the crate's regular (non-#[cfg(test)]) code.

pub mod simulated;

pub use simulated::{SimulatedConnector, SimulatedDevice};
