//! BLE Connection State Machine
//!
//! Drives the trainer session from adapter power-on to a latched
//! configuration characteristic. Each [`TransportEvent`] maps to at most one
//! transition; the machine owns the device and characteristic handles.

use crate::domain::error::{AdapterFault, ShiftError};
use crate::domain::models::{CharacteristicHandle, DeviceHandle, UNKNOWN_DEVICE_NAME};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{
    self, CYCLING_POWER_SERVICE_UUID, DEVICE_NAME_TOKEN, WHEEL_CONFIG_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{AdapterState, DeviceTransport, TransportEvent};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Substring of the advertised name that identifies a trainer
    pub name_token: String,
    /// Services used both as scan filter and service discovery filter
    pub service_filter: Vec<Uuid>,
    /// Configuration characteristic to latch
    pub config_char_uuid: Uuid,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name_token: DEVICE_NAME_TOKEN.to_string(),
            service_filter: vec![CYCLING_POWER_SERVICE_UUID],
            config_char_uuid: WHEEL_CONFIG_CHAR_UUID,
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            name_token: settings.device_name_token.clone(),
            config_char_uuid: protocol::parse_uuid(&settings.config_char_uuid)?,
            ..Self::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    AdapterUnavailable(AdapterFault),
    Scanning,
    Connecting,
    ServicesDiscovering,
    CharacteristicsDiscovering,
    Ready,
    Disconnected,
}

pub struct ConnectionStateMachine {
    config: ConnectionConfig,
    state: ConnectionState,
    adapter_powered: bool,
    device: Option<DeviceHandle>,
    connected: bool,
    characteristic: Option<CharacteristicHandle>,
}

impl ConnectionStateMachine {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            adapter_powered: false,
            device: None,
            connected: false,
            characteristic: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn has_characteristic(&self) -> bool {
        self.characteristic.is_some()
    }

    pub fn device_name(&self) -> String {
        self.device
            .as_ref()
            .map(|d| d.display_name().to_string())
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string())
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    /// Device and characteristic to write to, present only when `Ready`
    pub fn write_target(&self) -> Option<(&DeviceHandle, &CharacteristicHandle)> {
        if self.state != ConnectionState::Ready || !self.connected {
            return None;
        }
        self.device.as_ref().zip(self.characteristic.as_ref())
    }

    /// Apply one transport notification
    ///
    /// Write acknowledgements are not handled here. Errors are returned for the
    /// failures the caller must surface (adapter faults, connect failures); the
    /// transition has already been applied when they are returned.
    pub fn handle_event<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        event: &TransportEvent,
    ) -> Result<(), ShiftError> {
        match event {
            TransportEvent::AdapterState(adapter) => self.on_adapter_state(transport, *adapter),
            TransportEvent::Discovered { device, rssi } => {
                self.on_discovered(transport, device, *rssi)
            }
            TransportEvent::Connected { device_id } => self.on_connected(transport, device_id),
            TransportEvent::ConnectFailed { device_id, reason } => {
                self.on_connect_failed(transport, device_id, reason)
            }
            TransportEvent::Disconnected { device_id } => {
                self.on_disconnected(device_id);
                Ok(())
            }
            TransportEvent::ServicesDiscovered {
                device_id,
                services,
            } => {
                if !self.is_latched(device_id) || self.state != ConnectionState::ServicesDiscovering
                {
                    debug!("Ignoring service list for {}", device_id);
                    return Ok(());
                }
                let Some(device) = self.device.clone() else {
                    return Ok(());
                };

                info!("Discovered {} service(s) on {}", services.len(), device.display_name());
                if services.is_empty() {
                    warn!("Trainer reported no matching services");
                }
                // The owning service is not assumed, ask every one of them
                let filter = [self.config.config_char_uuid];
                for service in services {
                    debug!("    Service uuid: {}", service.uuid);
                    if let Err(e) = transport.discover_characteristics(&device, service, &filter) {
                        warn!("Characteristic discovery for {} failed: {}", service.uuid, e);
                    }
                }
                self.state = ConnectionState::CharacteristicsDiscovering;
                Ok(())
            }
            TransportEvent::CharacteristicsDiscovered {
                device_id,
                service,
                characteristics,
            } => {
                let accepting = matches!(
                    self.state,
                    ConnectionState::CharacteristicsDiscovering | ConnectionState::Ready
                );
                if !self.is_latched(device_id) || !accepting {
                    debug!("Ignoring characteristics for {}", device_id);
                    return Ok(());
                }

                for c in characteristics {
                    debug!("    Characteristic uuid: {} (service {})", c.uuid, service.uuid);
                    if c.uuid == self.config.config_char_uuid {
                        self.characteristic = Some(*c);
                    }
                }

                if self.characteristic.is_some() && self.state != ConnectionState::Ready {
                    info!("Connection to {} functional", self.device_name());
                    self.state = ConnectionState::Ready;
                }
                Ok(())
            }
            TransportEvent::WriteCompleted { .. } => Ok(()),
        }
    }

    fn on_adapter_state<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        adapter: AdapterState,
    ) -> Result<(), ShiftError> {
        let fault = match adapter {
            AdapterState::PoweredOn => {
                self.adapter_powered = true;
                if matches!(
                    self.state,
                    ConnectionState::Idle | ConnectionState::AdapterUnavailable(_)
                ) {
                    self.start_scan(transport)?;
                }
                return Ok(());
            }
            AdapterState::PoweredOff => AdapterFault::PoweredOff,
            AdapterState::Unauthorized => AdapterFault::Unauthorized,
            AdapterState::Unsupported => AdapterFault::Unsupported,
            AdapterState::Unknown => {
                debug!("Adapter state unknown, waiting");
                return Ok(());
            }
        };

        error!("Error when initializing Bluetooth: {}", fault);
        self.adapter_powered = false;
        self.drop_device();
        self.state = ConnectionState::AdapterUnavailable(fault);
        Err(ShiftError::AdapterUnavailable(fault))
    }

    fn on_discovered<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        device: &DeviceHandle,
        rssi: Option<i16>,
    ) -> Result<(), ShiftError> {
        debug!(
            "Found peripheral {} {} {:?}",
            device.display_name(),
            device.id,
            rssi
        );

        if self.state != ConnectionState::Scanning || self.device.is_some() {
            return Ok(());
        }
        let matches = device
            .name
            .as_deref()
            .is_some_and(|name| name.contains(&self.config.name_token));
        if !matches {
            return Ok(());
        }

        info!("Connecting to {} ({})", device.display_name(), device.id);
        if let Err(e) = transport.stop_scan() {
            warn!("Failed to stop scan: {}", e);
        }
        self.device = Some(device.clone());
        self.state = ConnectionState::Connecting;

        if let Err(e) = transport.connect(device) {
            return self.fail_connect(transport, e.to_string());
        }
        Ok(())
    }

    fn on_connected<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        device_id: &str,
    ) -> Result<(), ShiftError> {
        if !self.is_latched(device_id) || self.state != ConnectionState::Connecting {
            debug!("Ignoring connection event for {}", device_id);
            return Ok(());
        }
        let Some(device) = self.device.clone() else {
            return Ok(());
        };

        info!("Device connected: {}", device.display_name());
        self.connected = true;
        self.state = ConnectionState::ServicesDiscovering;
        if let Err(e) = transport.discover_services(&device, &self.config.service_filter) {
            warn!("Service discovery request failed: {}", e);
        }
        Ok(())
    }

    fn on_connect_failed<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        device_id: &str,
        reason: &str,
    ) -> Result<(), ShiftError> {
        if !self.is_latched(device_id) || self.state != ConnectionState::Connecting {
            debug!("Ignoring connect failure for {}", device_id);
            return Ok(());
        }
        self.fail_connect(transport, reason.to_string())
    }

    fn fail_connect<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        reason: String,
    ) -> Result<(), ShiftError> {
        let device = self.device_name();
        warn!("Failed to connect to {}: {}", device, reason);
        self.drop_device();
        self.start_scan(transport)?;
        Err(ShiftError::ConnectFailed { device, reason })
    }

    fn on_disconnected(&mut self, device_id: &str) {
        if !self.is_latched(device_id) || self.state == ConnectionState::Idle {
            debug!("Ignoring disconnect of {}", device_id);
            return;
        }
        info!("Disconnected from {}", self.device_name());
        self.drop_device();
        self.state = ConnectionState::Disconnected;
    }

    /// Resume discovery after a disconnect or a fruitless scan
    pub fn restart_scan<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), ShiftError> {
        if !self.adapter_powered
            || !matches!(
                self.state,
                ConnectionState::Scanning | ConnectionState::Disconnected
            )
        {
            return Ok(());
        }
        if self.state == ConnectionState::Scanning {
            if let Err(e) = transport.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
        }
        self.start_scan(transport)
    }

    /// Give up on discovery
    pub fn abandon_scan<T: DeviceTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        if let Err(e) = transport.stop_scan() {
            warn!("Failed to stop scan: {}", e);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Tear the session down, disconnecting a live device first
    pub fn release<T: DeviceTransport + ?Sized>(&mut self, transport: &mut T) {
        if let Some(device) = self.device.as_ref() {
            if self.connected {
                info!("Disconnecting from {}", device.display_name());
                if let Err(e) = transport.disconnect(device) {
                    warn!("Disconnect request failed: {}", e);
                }
            }
        }
        if self.state == ConnectionState::Scanning {
            if let Err(e) = transport.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
        }
        self.drop_device();
        self.state = ConnectionState::Idle;
    }

    fn start_scan<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), ShiftError> {
        info!("Scanning for '{}' trainers", self.config.name_token);
        transport
            .scan(&self.config.service_filter)
            .map_err(|e| ShiftError::Transport(e.to_string()))?;
        self.state = ConnectionState::Scanning;
        Ok(())
    }

    fn drop_device(&mut self) {
        self.device = None;
        self.connected = false;
        self.characteristic = None;
    }

    fn is_latched(&self, device_id: &str) -> bool {
        self.device.as_ref().is_some_and(|d| d.id == device_id)
    }
}
