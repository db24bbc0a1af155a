#![cfg_attr(not(feature = "std"), no_std)]

//! # Thermal Control Crate
//!
//! `thermal` provides the control mathematics for a high-temperature furnace,
//! usable both on the target hardware and on host systems for simulation and
//! testing.
//!
//! ## Features
//!
//! - **PID Regulator**: A clamped PI-D controller with an anti-windup integral
//!   clamp, an optional proportional auto-adjust, and a bounded error history
//!   for diagnostics.
//! - **Thermocouple Fusion**: Combines two redundant thermocouple channels into
//!   a single reading and escalates persistent bilateral sensor loss.
//! - **`no_std` support**: Can be used in bare-metal environments.
//! - **Optional `serde` support**: For serializing samples and fault kinds.

// Re-export the main components for easier access.
pub mod fusion;
pub mod pid;

// Re-export key types
pub use fusion::{Fused, Fusion, Sample, SensorFault};
pub use pid::Pid;
