//! btleplug Transport
//!
//! [`DeviceTransport`] backed by the platform BLE stack through btleplug. A
//! worker task owns the adapter; commands are queued to it and every outcome
//! is reported back as a [`TransportEvent`].

use crate::domain::models::{CharacteristicHandle, DeviceHandle, ServiceHandle};
use crate::infrastructure::bluetooth::transport::{AdapterState, DeviceTransport, TransportEvent};
use anyhow::Result;
use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BtleplugConfig {
    pub connect_timeout: Duration,
}

impl Default for BtleplugConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum BackendCommand {
    Scan(Vec<Uuid>),
    StopScan,
    Connect(String),
    Disconnect(String),
    DiscoverServices(String, Vec<Uuid>),
    DiscoverCharacteristics {
        device_id: String,
        service: Uuid,
        filter: Vec<Uuid>,
    },
    Write {
        device_id: String,
        characteristic: CharacteristicHandle,
        payload: Vec<u8>,
        with_response: bool,
    },
}

pub struct BtleplugTransport {
    command_tx: mpsc::UnboundedSender<BackendCommand>,
}

impl BtleplugTransport {
    /// Start the adapter worker on the current tokio runtime
    ///
    /// The worker exits once the transport is dropped and its queued commands
    /// (typically the final disconnect) have run.
    pub fn spawn(
        events: mpsc::UnboundedSender<TransportEvent>,
        config: BtleplugConfig,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(config, command_rx, events));
        (Self { command_tx }, worker)
    }

    fn send(&self, command: BackendCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| anyhow::anyhow!("Bluetooth worker has stopped"))
    }
}

impl DeviceTransport for BtleplugTransport {
    fn scan(&mut self, service_filter: &[Uuid]) -> Result<()> {
        self.send(BackendCommand::Scan(service_filter.to_vec()))
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.send(BackendCommand::StopScan)
    }

    fn connect(&mut self, device: &DeviceHandle) -> Result<()> {
        self.send(BackendCommand::Connect(device.id.clone()))
    }

    fn disconnect(&mut self, device: &DeviceHandle) -> Result<()> {
        self.send(BackendCommand::Disconnect(device.id.clone()))
    }

    fn discover_services(
        &mut self,
        device: &DeviceHandle,
        service_filter: &[Uuid],
    ) -> Result<()> {
        self.send(BackendCommand::DiscoverServices(
            device.id.clone(),
            service_filter.to_vec(),
        ))
    }

    fn discover_characteristics(
        &mut self,
        device: &DeviceHandle,
        service: &ServiceHandle,
        uuid_filter: &[Uuid],
    ) -> Result<()> {
        self.send(BackendCommand::DiscoverCharacteristics {
            device_id: device.id.clone(),
            service: service.uuid,
            filter: uuid_filter.to_vec(),
        })
    }

    fn write_characteristic(
        &mut self,
        device: &DeviceHandle,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.send(BackendCommand::Write {
            device_id: device.id.clone(),
            characteristic: *characteristic,
            payload: payload.to_vec(),
            with_response,
        })
    }
}

struct Worker {
    adapter: Adapter,
    config: BtleplugConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    peripherals: HashMap<String, Peripheral>,
}

async fn run_worker(
    config: BtleplugConfig,
    mut commands: mpsc::UnboundedReceiver<BackendCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let adapter = match open_adapter().await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Failed to open Bluetooth adapter: {}", e);
            let _ = events.send(TransportEvent::AdapterState(adapter_fault(&e)));
            return;
        }
    };

    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to subscribe to adapter events: {}", e);
            let _ = events.send(TransportEvent::AdapterState(adapter_fault(&e)));
            return;
        }
    };

    let state = match adapter.adapter_state().await {
        Ok(state) => map_central_state(state),
        Err(e) => {
            debug!("Adapter state unavailable ({}), assuming powered on", e);
            AdapterState::PoweredOn
        }
    };
    info!("Bluetooth adapter state: {:?}", state);
    let _ = events.send(TransportEvent::AdapterState(state));

    let mut worker = Worker {
        adapter,
        config,
        events,
        peripherals: HashMap::new(),
    };

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => worker.handle_command(command).await,
                None => break,
            },
            event = central_events.next() => match event {
                Some(event) => worker.handle_central_event(event).await,
                None => {
                    warn!("Adapter event stream ended");
                    break;
                }
            },
        }
    }

    debug!("Bluetooth worker stopped");
}

async fn open_adapter() -> btleplug::Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| btleplug::Error::NotSupported("No Bluetooth adapter found".into()))
}

fn adapter_fault(e: &btleplug::Error) -> AdapterState {
    match e {
        btleplug::Error::PermissionDenied => AdapterState::Unauthorized,
        _ => AdapterState::Unsupported,
    }
}

fn map_central_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

impl Worker {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let peripheral = match self.adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("Discovered peripheral vanished: {}", e);
                        return;
                    }
                };
                let properties = peripheral.properties().await.ok().flatten();
                let name = properties.as_ref().and_then(|p| p.local_name.clone());
                let rssi = properties.as_ref().and_then(|p| p.rssi);

                let key = id.to_string();
                self.peripherals.insert(key.clone(), peripheral);
                if name.is_some() {
                    self.emit(TransportEvent::Discovered {
                        device: DeviceHandle { id: key, name },
                        rssi,
                    });
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                self.emit(TransportEvent::Disconnected {
                    device_id: id.to_string(),
                });
            }
            CentralEvent::StateUpdate(state) => {
                self.emit(TransportEvent::AdapterState(map_central_state(state)));
            }
            _ => {}
        }
    }

    async fn handle_command(&mut self, command: BackendCommand) {
        match command {
            BackendCommand::Scan(services) => {
                if let Err(e) = self.adapter.start_scan(ScanFilter { services }).await {
                    error!("Failed to start scan: {}", e);
                    self.emit(TransportEvent::AdapterState(adapter_fault(&e)));
                }
            }
            BackendCommand::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            BackendCommand::Connect(device_id) => self.connect(device_id).await,
            BackendCommand::Disconnect(device_id) => {
                if let Some(peripheral) = self.peripherals.get(&device_id) {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Disconnect from {} failed: {}", device_id, e);
                    }
                }
                self.emit(TransportEvent::Disconnected { device_id });
            }
            BackendCommand::DiscoverServices(device_id, filter) => {
                self.discover_services(device_id, filter).await
            }
            BackendCommand::DiscoverCharacteristics {
                device_id,
                service,
                filter,
            } => self.discover_characteristics(device_id, service, filter),
            BackendCommand::Write {
                device_id,
                characteristic,
                payload,
                with_response,
            } => {
                self.write(device_id, characteristic, payload, with_response)
                    .await
            }
        }
    }

    async fn connect(&mut self, device_id: String) {
        let Some(peripheral) = self.peripherals.get(&device_id) else {
            self.emit(TransportEvent::ConnectFailed {
                device_id,
                reason: "unknown peripheral".to_string(),
            });
            return;
        };

        let event = match tokio::time::timeout(self.config.connect_timeout, peripheral.connect())
            .await
        {
            Ok(Ok(())) => TransportEvent::Connected { device_id },
            Ok(Err(e)) => TransportEvent::ConnectFailed {
                device_id,
                reason: e.to_string(),
            },
            Err(_) => TransportEvent::ConnectFailed {
                device_id,
                reason: format!("timed out after {:?}", self.config.connect_timeout),
            },
        };
        self.emit(event);
    }

    async fn discover_services(&mut self, device_id: String, filter: Vec<Uuid>) {
        let Some(peripheral) = self.peripherals.get(&device_id) else {
            warn!("Service discovery for unknown peripheral {}", device_id);
            return;
        };
        if let Err(e) = peripheral.discover_services().await {
            warn!("Service discovery on {} failed: {}", device_id, e);
            return;
        }

        let services = peripheral
            .services()
            .into_iter()
            .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
            .map(|s| ServiceHandle { uuid: s.uuid })
            .collect();
        self.emit(TransportEvent::ServicesDiscovered {
            device_id,
            services,
        });
    }

    fn discover_characteristics(&mut self, device_id: String, service: Uuid, filter: Vec<Uuid>) {
        let Some(peripheral) = self.peripherals.get(&device_id) else {
            warn!("Characteristic discovery for unknown peripheral {}", device_id);
            return;
        };

        // btleplug resolves characteristics together with services
        let characteristics = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter())
            .filter(|c| filter.is_empty() || filter.contains(&c.uuid))
            .map(|c| CharacteristicHandle {
                service: c.service_uuid,
                uuid: c.uuid,
            })
            .collect();
        self.emit(TransportEvent::CharacteristicsDiscovered {
            device_id,
            service: ServiceHandle { uuid: service },
            characteristics,
        });
    }

    async fn write(
        &mut self,
        device_id: String,
        characteristic: CharacteristicHandle,
        payload: Vec<u8>,
        with_response: bool,
    ) {
        let target = self.peripherals.get(&device_id).and_then(|p| {
            p.characteristics()
                .into_iter()
                .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
                .map(|c| (p, c))
        });

        let error = match target {
            Some((peripheral, c)) => {
                let write_type = if with_response {
                    WriteType::WithResponse
                } else {
                    WriteType::WithoutResponse
                };
                peripheral
                    .write(&c, &payload, write_type)
                    .await
                    .err()
                    .map(|e| e.to_string())
            }
            None => Some(format!("characteristic {} not available", characteristic.uuid)),
        };

        if with_response {
            self.emit(TransportEvent::WriteCompleted {
                device_id,
                characteristic,
                error,
            });
        } else if let Some(e) = error {
            warn!("Write without response failed: {}", e);
        }
    }
}
