//! Error types shared by the trainer session and the gear controller.

use std::time::Duration;
use thiserror::Error;

/// Why the Bluetooth adapter cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdapterFault {
    #[error("Please turn on Bluetooth")]
    PoweredOff,
    #[error("Please allow Bluetooth access in Settings for this app")]
    Unauthorized,
    #[error("No usable Bluetooth LE adapter found")]
    Unsupported,
}

/// Rejection raised by the circumference codec.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum EncodeError {
    #[error("circumference {meters}m is outside the encodable range [0, 6.5535)")]
    OutOfRange { meters: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShiftError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(AdapterFault),

    #[error("no trainer found after {attempts} scan attempt(s)")]
    DiscoveryTimeout { attempts: u32 },

    #[error("failed to connect to {device}: {reason}")]
    ConnectFailed { device: String, reason: String },

    #[error(transparent)]
    EncodeOutOfRange(#[from] EncodeError),

    #[error("trainer rejected circumference write: {0}")]
    WriteFailed(String),

    #[error("trainer did not acknowledge the write within {0:?}")]
    WriteTimeout(Duration),

    #[error("a circumference write is already in flight")]
    WriteBusy,

    #[error("trainer is not ready for writes")]
    NotReady,

    #[error("gear changes are locked until the current write resolves")]
    NotEditable,

    #[error("circumference already at its limit ({circumference:.4}m)")]
    GearLimit { circumference: f64 },

    #[error("gear ratio {0} is outside [1.0, 2.5]")]
    InvalidRatio(f64),

    #[error("trainer disconnected")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<AdapterFault> for ShiftError {
    fn from(fault: AdapterFault) -> Self {
        Self::AdapterUnavailable(fault)
    }
}
