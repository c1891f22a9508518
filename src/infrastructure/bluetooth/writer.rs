//! Circumference Write Coordinator
//!
//! Issues one acknowledged write at a time and resolves its completion
//! callback exactly once: on acknowledgement, timeout or cancellation.

use crate::domain::error::ShiftError;
use crate::domain::gears::WriteCallback;
use crate::domain::models::CharacteristicHandle;
use crate::infrastructure::bluetooth::connection::ConnectionStateMachine;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::DeviceTransport;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The single outstanding write
pub struct PendingWrite {
    pub value: f64,
    pub characteristic: CharacteristicHandle,
    pub issued_at: Instant,
    on_complete: WriteCallback,
}

impl PendingWrite {
    fn resolve(self, error: Option<ShiftError>) {
        (self.on_complete)(error)
    }
}

pub struct WriteCoordinator {
    pending: Option<PendingWrite>,
    timeout: Duration,
}

impl WriteCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: None,
            timeout,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_value(&self) -> Option<f64> {
        self.pending.as_ref().map(|p| p.value)
    }

    /// When the in-flight write times out, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.issued_at + self.timeout)
    }

    /// Encode `value` and write it to the latched characteristic
    ///
    /// Returns the payload that was sent. Nothing is sent, and `on_complete` is
    /// dropped uncalled, when an error is returned.
    pub fn submit_write<T: DeviceTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        connection: &ConnectionStateMachine,
        value: f64,
        now: Instant,
        on_complete: WriteCallback,
    ) -> Result<[u8; 3], ShiftError> {
        if self.pending.is_some() {
            return Err(ShiftError::WriteBusy);
        }
        let (device, characteristic) = connection.write_target().ok_or(ShiftError::NotReady)?;
        let payload = protocol::encode_circumference(value)?;

        info!("Setting circumference to {:.4}m: {:02X?}", value, payload);
        transport
            .write_characteristic(device, characteristic, &payload, true)
            .map_err(|e| ShiftError::Transport(e.to_string()))?;

        self.pending = Some(PendingWrite {
            value,
            characteristic: *characteristic,
            issued_at: now,
            on_complete,
        });
        Ok(payload)
    }

    /// Resolve the pending write with the transport's acknowledgement
    ///
    /// Returns false when nothing was pending.
    pub fn acknowledge(&mut self, error: Option<String>) -> bool {
        let Some(pending) = self.pending.take() else {
            debug!("Ignoring write acknowledgement with nothing pending");
            return false;
        };

        match &error {
            Some(e) => warn!("Issue while writing {:.4}m: {}", pending.value, e),
            None => info!("Circumference {:.4}m acknowledged", pending.value),
        }
        pending.resolve(error.map(ShiftError::WriteFailed));
        true
    }

    /// Time out the pending write once its deadline has passed
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                warn!("Write not acknowledged within {:?}", self.timeout);
                self.cancel(ShiftError::WriteTimeout(self.timeout))
            }
            _ => false,
        }
    }

    /// Resolve the pending write with `reason` without waiting for the transport
    pub fn cancel(&mut self, reason: ShiftError) -> bool {
        match self.pending.take() {
            Some(pending) => {
                debug!("Cancelling write of {:.4}m: {}", pending.value, reason);
                pending.resolve(Some(reason));
                true
            }
            None => false,
        }
    }
}
