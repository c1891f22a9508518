use crate::domain::error::ShiftError;
use uuid::Uuid;

/// Sentinel reported by `device_name()` while no trainer is latched.
pub const UNKNOWN_DEVICE_NAME: &str = "<unknown>";

/// A peripheral seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Transport-specific identifier (address or platform id)
    pub id: String,
    /// Advertised local name, if any
    pub name: Option<String>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Owning service
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Snapshot of the virtual gearbox.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GearState {
    /// Circumference in meters currently applied (or being applied)
    pub current: f64,
    /// Value restored if the in-flight write fails
    pub previous: f64,
    /// False while a write is in flight or the trainer is not ready
    pub editable: bool,
}

impl GearState {
    pub fn new(circumference: f64) -> Self {
        Self {
            current: circumference,
            previous: circumference,
            editable: false,
        }
    }
}

/// Events published to whatever presents the session
#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionStatus),
    GearChanged(GearState),
    LogMessage(StatusMessage),
}

/// Commands accepted from the control surface
#[derive(Debug, Clone, PartialEq)]
pub enum ShiftCommand {
    ShiftUp(u32),
    ShiftDown(u32),
    SetCircumference(f64),
    SetRatio(f64),
    /// Publish a summary of the session as a log message
    Status,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Searching,
    Connecting,
    Connected(String),
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Info,
        }
    }

    pub fn from_error(err: &ShiftError, severity: MessageSeverity) -> Self {
        Self {
            message: err.to_string(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
