//! Device Transport Capability
//!
//! The narrow slice of a BLE central API the trainer session needs. Commands
//! never block; their outcomes come back as [`TransportEvent`]s on a single
//! ordered channel.

use crate::domain::models::{CharacteristicHandle, DeviceHandle, ServiceHandle};
use anyhow::Result;
use uuid::Uuid;

/// Adapter power / permission state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Unknown,
}

/// Asynchronous notifications from the transport, delivered in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AdapterState(AdapterState),
    Discovered {
        device: DeviceHandle,
        rssi: Option<i16>,
    },
    Connected {
        device_id: String,
    },
    ConnectFailed {
        device_id: String,
        reason: String,
    },
    Disconnected {
        device_id: String,
    },
    ServicesDiscovered {
        device_id: String,
        services: Vec<ServiceHandle>,
    },
    CharacteristicsDiscovered {
        device_id: String,
        service: ServiceHandle,
        characteristics: Vec<CharacteristicHandle>,
    },
    WriteCompleted {
        device_id: String,
        characteristic: CharacteristicHandle,
        error: Option<String>,
    },
}

/// Commands the session issues to the platform BLE stack
///
/// An `Err` means the command could not be dispatched at all; protocol level
/// failures are reported later through [`TransportEvent`].
pub trait DeviceTransport {
    fn scan(&mut self, service_filter: &[Uuid]) -> Result<()>;

    fn stop_scan(&mut self) -> Result<()>;

    fn connect(&mut self, device: &DeviceHandle) -> Result<()>;

    fn disconnect(&mut self, device: &DeviceHandle) -> Result<()>;

    fn discover_services(&mut self, device: &DeviceHandle, service_filter: &[Uuid])
        -> Result<()>;

    fn discover_characteristics(
        &mut self,
        device: &DeviceHandle,
        service: &ServiceHandle,
        uuid_filter: &[Uuid],
    ) -> Result<()>;

    fn write_characteristic(
        &mut self,
        device: &DeviceHandle,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()>;
}
