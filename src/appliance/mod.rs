//! Appliance adapters
//!
//! Implementations of [`crate::domain::ManagementClient`]. The wire client for
//! a real appliance lives outside this crate; the simulated appliance backs
//! standalone runs and the test suite.

pub mod memory;

pub use memory::{SimulatedAppliance, VolumeRecord};
