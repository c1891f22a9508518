//! Virtual gear shifting for smart trainers.
//!
//! Gears are emulated by changing the wheel circumference the trainer uses to
//! compute speed, written to a vendor characteristic over BLE.

pub mod domain;
pub mod infrastructure;
