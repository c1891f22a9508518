//! Bluetooth Module
//!
//! Talks to the trainer's wheel configuration characteristic over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     TrainerService                        │
//! │  (owns the session, runs the event loop)                  │
//! └───────┬──────────────────┬──────────────────┬────────────┘
//!         │                  │                  │
//!         ▼                  ▼                  ▼
//! ┌──────────────┐  ┌─────────────────┐  ┌──────────────┐
//! │  Connection  │  │ WriteCoordinator│  │   Protocol   │
//! │              │  │                 │  │              │
//! │ - scan       │  │ - one write     │  │ - UUIDs      │
//! │ - GATT walk  │  │ - ack / timeout │  │ - 0x48 codec │
//! └──────┬───────┘  └────────┬────────┘  └──────────────┘
//!        └─────────┬─────────┘
//!                  ▼
//!          DeviceTransport
//!      (btleplug or simulated)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs and the circumference command codec
//! - [`transport`] - transport trait and its notifications
//! - [`connection`] - discovery and GATT state machine
//! - [`writer`] - the single in-flight write
//! - [`service`] - session coordinator
//! - [`btleplug_backend`] - hardware transport
//! - [`mock`] - recording transport and simulated trainer

pub mod btleplug_backend;
pub mod connection;
pub mod mock;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod writer;

pub use service::TrainerService;
