//! Mock Transport
//!
//! A second [`DeviceTransport`] implementation. It records every command and,
//! when built with [`MockTransport::simulated`], plays the part of a trainer by
//! answering each command with the notification real hardware would send.

use crate::domain::models::{CharacteristicHandle, DeviceHandle, ServiceHandle};
use crate::infrastructure::bluetooth::protocol::{
    self, CYCLING_POWER_SERVICE_UUID, WHEEL_CONFIG_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{AdapterState, DeviceTransport, TransportEvent};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

pub const SIMULATED_DEVICE_ID: &str = "mock-0001";
pub const SIMULATED_DEVICE_NAME: &str = "MOCK KICKR CORE 42";

/// A command as seen by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
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
        characteristic: Uuid,
        payload: Vec<u8>,
        with_response: bool,
    },
}

#[derive(Clone)]
struct Simulator {
    events: mpsc::UnboundedSender<TransportEvent>,
    latency: Duration,
    fail_writes: Arc<AtomicBool>,
    circumference: Arc<Mutex<Option<f64>>>,
}

impl Simulator {
    fn emit(&self, event: TransportEvent) {
        if self.latency.is_zero() {
            let _ = self.events.send(event);
            return;
        }
        let events = self.events.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = events.send(event);
        });
    }

    fn device() -> DeviceHandle {
        DeviceHandle::new(SIMULATED_DEVICE_ID, Some(SIMULATED_DEVICE_NAME))
    }
}

/// Recording transport with an optional simulated trainer behind it
#[derive(Clone, Default)]
pub struct MockTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    simulator: Option<Simulator>,
}

impl MockTransport {
    /// A transport that only records commands
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport backed by a simulated trainer
    ///
    /// Reports the adapter as powered on immediately. Responses are delayed by
    /// `latency`; a non-zero latency requires a running tokio runtime.
    pub fn simulated(events: mpsc::UnboundedSender<TransportEvent>, latency: Duration) -> Self {
        let simulator = Simulator {
            events,
            latency,
            fail_writes: Arc::new(AtomicBool::new(false)),
            circumference: Arc::new(Mutex::new(None)),
        };
        simulator.emit(TransportEvent::AdapterState(AdapterState::PoweredOn));
        info!("Simulated trainer '{}' ready", SIMULATED_DEVICE_NAME);

        Self {
            calls: Arc::default(),
            simulator: Some(simulator),
        }
    }

    /// Make the simulated trainer reject (or accept again) subsequent writes
    pub fn set_fail_writes(&self, fail: bool) {
        if let Some(sim) = &self.simulator {
            sim.fail_writes.store(fail, Ordering::SeqCst);
        }
    }

    /// Circumference last accepted by the simulated trainer
    pub fn trainer_circumference(&self) -> Option<f64> {
        self.simulator.as_ref().and_then(|sim| {
            *sim.circumference
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
        })
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Payloads of every write issued so far
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Write { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        debug!("Mock transport: {:?}", call);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl DeviceTransport for MockTransport {
    fn scan(&mut self, service_filter: &[Uuid]) -> Result<()> {
        self.record(TransportCall::Scan(service_filter.to_vec()));
        if let Some(sim) = &self.simulator {
            sim.emit(TransportEvent::Discovered {
                device: Simulator::device(),
                rssi: Some(-42),
            });
        }
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.record(TransportCall::StopScan);
        Ok(())
    }

    fn connect(&mut self, device: &DeviceHandle) -> Result<()> {
        self.record(TransportCall::Connect(device.id.clone()));
        if let Some(sim) = &self.simulator {
            sim.emit(TransportEvent::Connected {
                device_id: device.id.clone(),
            });
        }
        Ok(())
    }

    fn disconnect(&mut self, device: &DeviceHandle) -> Result<()> {
        self.record(TransportCall::Disconnect(device.id.clone()));
        if let Some(sim) = &self.simulator {
            sim.emit(TransportEvent::Disconnected {
                device_id: device.id.clone(),
            });
        }
        Ok(())
    }

    fn discover_services(
        &mut self,
        device: &DeviceHandle,
        service_filter: &[Uuid],
    ) -> Result<()> {
        self.record(TransportCall::DiscoverServices(
            device.id.clone(),
            service_filter.to_vec(),
        ));
        if let Some(sim) = &self.simulator {
            sim.emit(TransportEvent::ServicesDiscovered {
                device_id: device.id.clone(),
                services: vec![ServiceHandle {
                    uuid: CYCLING_POWER_SERVICE_UUID,
                }],
            });
        }
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        device: &DeviceHandle,
        service: &ServiceHandle,
        uuid_filter: &[Uuid],
    ) -> Result<()> {
        self.record(TransportCall::DiscoverCharacteristics {
            device_id: device.id.clone(),
            service: service.uuid,
            filter: uuid_filter.to_vec(),
        });
        if let Some(sim) = &self.simulator {
            let characteristics = if uuid_filter.is_empty()
                || uuid_filter.contains(&WHEEL_CONFIG_CHAR_UUID)
            {
                vec![CharacteristicHandle {
                    service: service.uuid,
                    uuid: WHEEL_CONFIG_CHAR_UUID,
                }]
            } else {
                Vec::new()
            };
            sim.emit(TransportEvent::CharacteristicsDiscovered {
                device_id: device.id.clone(),
                service: *service,
                characteristics,
            });
        }
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        device: &DeviceHandle,
        characteristic: &CharacteristicHandle,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.record(TransportCall::Write {
            device_id: device.id.clone(),
            characteristic: characteristic.uuid,
            payload: payload.to_vec(),
            with_response,
        });

        let Some(sim) = &self.simulator else {
            return Ok(());
        };

        let error = if sim.fail_writes.load(Ordering::SeqCst) {
            Some("simulated write failure".to_string())
        } else {
            match protocol::decode_circumference(payload) {
                Some(meters) => {
                    info!("Simulated trainer: circumference set to {:.4}m", meters);
                    *sim.circumference
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(meters);
                    None
                }
                None => Some(format!("unrecognized payload {:02X?}", payload)),
            }
        };

        if with_response {
            sim.emit(TransportEvent::WriteCompleted {
                device_id: device.id.clone(),
                characteristic: *characteristic,
                error,
            });
        }
        Ok(())
    }
}
