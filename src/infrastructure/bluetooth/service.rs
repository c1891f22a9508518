//! Trainer Service Module
//!
//! Owns the transport and feeds its notifications, in arrival order, into the
//! connection state machine and the write coordinator. Shift requests from the
//! control surface go through the gear controller, which is wired to the write
//! coordinator here.

use crate::domain::error::ShiftError;
use crate::domain::gears::{GearConfig, GearShiftController, WriteCallback, WriteSubmitter};
use crate::domain::models::{
    AppEvent, ConnectionStatus, GearState, MessageSeverity, ShiftCommand, StatusMessage,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{
    ConnectionConfig, ConnectionState, ConnectionStateMachine,
};
use crate::infrastructure::bluetooth::transport::{DeviceTransport, TransportEvent};
use crate::infrastructure::bluetooth::writer::WriteCoordinator;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How often timers (write timeout, discovery timeout) are checked
const TIMER_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub connection: ConnectionConfig,
    pub gears: GearConfig,
    pub write_timeout: Duration,
    pub scan_timeout: Duration,
    /// Zero retries forever
    pub max_scan_attempts: u32,
    pub auto_reconnect: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            connection: ConnectionConfig::default(),
            gears: GearConfig::from_settings(&settings),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            scan_timeout: Duration::from_secs(settings.scan_timeout_secs),
            max_scan_attempts: settings.max_scan_attempts,
            auto_reconnect: settings.auto_reconnect,
        }
    }
}

impl ServiceConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let gears = GearConfig::from_settings(settings);
        gears.validate()?;
        Ok(Self {
            connection: ConnectionConfig::from_settings(settings)?,
            gears,
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            scan_timeout: Duration::from_secs(settings.scan_timeout_secs),
            max_scan_attempts: settings.max_scan_attempts,
            auto_reconnect: settings.auto_reconnect,
        })
    }
}

/// Borrowed view of the session that the gear controller writes through
struct SessionWriter<'a, T: DeviceTransport> {
    transport: &'a mut T,
    connection: &'a ConnectionStateMachine,
    writer: &'a mut WriteCoordinator,
    now: Instant,
}

impl<T: DeviceTransport> WriteSubmitter for SessionWriter<'_, T> {
    fn submit_write(&mut self, value: f64, on_complete: WriteCallback) -> Result<(), ShiftError> {
        self.writer
            .submit_write(&mut *self.transport, self.connection, value, self.now, on_complete)
            .map(|_| ())
    }
}

/// Main service coordinating the trainer session
pub struct TrainerService<T: DeviceTransport> {
    transport: T,
    connection: ConnectionStateMachine,
    writer: WriteCoordinator,
    gears: GearShiftController,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    scan_timeout: Duration,
    max_scan_attempts: u32,
    auto_reconnect: bool,
    scan_deadline: Option<Instant>,
    scan_attempts: u32,
    status: ConnectionStatus,
}

impl<T: DeviceTransport> TrainerService<T> {
    pub fn new(
        transport: T,
        config: ServiceConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            connection: ConnectionStateMachine::new(config.connection),
            writer: WriteCoordinator::new(config.write_timeout),
            gears: GearShiftController::new(config.gears).with_events(event_sender.clone()),
            event_sender,
            scan_timeout: config.scan_timeout,
            max_scan_attempts: config.max_scan_attempts,
            auto_reconnect: config.auto_reconnect,
            scan_deadline: None,
            scan_attempts: 0,
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn has_characteristic(&self) -> bool {
        self.connection.has_characteristic()
    }

    pub fn device_name(&self) -> String {
        self.connection.device_name()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn current_circumference(&self) -> f64 {
        self.gears.current()
    }

    pub fn gear_state(&self) -> GearState {
        self.gears.state()
    }

    pub fn ratio(&self) -> f64 {
        self.gears.ratio()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Process one transport notification
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if let TransportEvent::WriteCompleted {
            device_id, error, ..
        } = &event
        {
            let latched = self.connection.device().is_some_and(|d| d.id == *device_id);
            if !latched {
                debug!("Ignoring write acknowledgement from {}", device_id);
                return;
            }
            self.writer.acknowledge(error.clone());
            return;
        }

        let before = self.connection.state();
        if let Err(e) = self.connection.handle_event(&mut self.transport, &event) {
            let severity = match &e {
                ShiftError::AdapterUnavailable(_) => MessageSeverity::Error,
                _ => MessageSeverity::Warning,
            };
            self.report(&e, severity);
        }
        self.after_transition(before, now);
    }

    /// Run write and discovery timeouts
    pub fn poll_timers(&mut self, now: Instant) {
        self.writer.expire(now);

        let expired = self.scan_deadline.is_some_and(|deadline| now >= deadline);
        if !expired || self.connection.state() != ConnectionState::Scanning {
            return;
        }

        self.scan_attempts += 1;
        let timeout = ShiftError::DiscoveryTimeout {
            attempts: self.scan_attempts,
        };
        if self.max_scan_attempts > 0 && self.scan_attempts >= self.max_scan_attempts {
            self.report(&timeout, MessageSeverity::Error);
            self.connection.abandon_scan(&mut self.transport);
            self.after_transition(ConnectionState::Scanning, now);
            return;
        }

        self.report(&timeout, MessageSeverity::Warning);
        if let Err(e) = self.connection.restart_scan(&mut self.transport) {
            self.report(&e, MessageSeverity::Error);
        }
        self.scan_deadline = Some(now + self.scan_timeout);
    }

    pub fn request_shift(&mut self, value: f64, now: Instant) -> Result<(), ShiftError> {
        let mut session = SessionWriter {
            transport: &mut self.transport,
            connection: &self.connection,
            writer: &mut self.writer,
            now,
        };
        self.gears.request_shift(&mut session, value)
    }

    pub fn shift_up(&mut self, factor: u32, now: Instant) -> Result<f64, ShiftError> {
        let mut session = SessionWriter {
            transport: &mut self.transport,
            connection: &self.connection,
            writer: &mut self.writer,
            now,
        };
        self.gears.shift_up(&mut session, factor)
    }

    pub fn shift_down(&mut self, factor: u32, now: Instant) -> Result<f64, ShiftError> {
        let mut session = SessionWriter {
            transport: &mut self.transport,
            connection: &self.connection,
            writer: &mut self.writer,
            now,
        };
        self.gears.shift_down(&mut session, factor)
    }

    pub fn set_ratio(&mut self, ratio: f64) -> Result<(), ShiftError> {
        self.gears.set_ratio(ratio)
    }

    /// Apply a command from the control surface; false once shutdown is requested
    pub fn handle_command(&mut self, command: ShiftCommand, now: Instant) -> bool {
        let result = match command {
            ShiftCommand::ShiftUp(factor) => self.shift_up(factor, now).map(|_| ()),
            ShiftCommand::ShiftDown(factor) => self.shift_down(factor, now).map(|_| ()),
            ShiftCommand::SetCircumference(value) => self.request_shift(value, now),
            ShiftCommand::SetRatio(ratio) => self.set_ratio(ratio),
            ShiftCommand::Status => {
                self.publish_summary();
                Ok(())
            }
            ShiftCommand::Shutdown => return false,
        };
        if let Err(e) = result {
            self.report(&e, MessageSeverity::Warning);
        }
        true
    }

    /// Resolve any pending write and release the device
    pub fn shutdown(&mut self) {
        self.writer.cancel(ShiftError::Disconnected);
        self.gears.set_editable(false);
        self.connection.release(&mut self.transport);
        self.scan_deadline = None;
        self.publish_status();
    }

    /// Event loop: transport notifications, commands and timers until shutdown
    pub async fn run(
        mut self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut command_rx: mpsc::UnboundedReceiver<ShiftCommand>,
    ) {
        let mut tick = tokio::time::interval(TIMER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = transport_rx.recv() => match event {
                    Some(event) => self.handle_transport_event(event, Instant::now()),
                    None => {
                        warn!("Transport event channel closed");
                        break;
                    }
                },
                command = command_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command, Instant::now()) {
                            info!("Shutdown requested");
                            break;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.poll_timers(Instant::now()),
            }
        }

        self.shutdown();
    }

    fn after_transition(&mut self, before: ConnectionState, now: Instant) {
        let after = self.connection.state();
        if before == after {
            return;
        }
        info!("Connection state {:?} -> {:?}", before, after);

        if after == ConnectionState::Scanning {
            self.scan_deadline = Some(now + self.scan_timeout);
        } else {
            self.scan_deadline = None;
        }

        if after == ConnectionState::Ready {
            self.scan_attempts = 0;
            if !self.writer.is_pending() {
                self.gears.set_editable(true);
            }
        } else {
            // The pending write can no longer be acknowledged
            let reason = match after {
                ConnectionState::AdapterUnavailable(fault) => ShiftError::AdapterUnavailable(fault),
                _ => ShiftError::Disconnected,
            };
            self.writer.cancel(reason);
            self.gears.set_editable(false);
        }

        self.publish_status();

        let was_linked = matches!(
            before,
            ConnectionState::Connecting
                | ConnectionState::ServicesDiscovering
                | ConnectionState::CharacteristicsDiscovering
                | ConnectionState::Ready
        );
        if after == ConnectionState::Disconnected && was_linked && self.auto_reconnect {
            info!("Trainer lost, searching again");
            if let Err(e) = self.connection.restart_scan(&mut self.transport) {
                self.report(&e, MessageSeverity::Error);
            }
            self.after_transition(ConnectionState::Disconnected, now);
        }
    }

    fn publish_status(&mut self) {
        let status = match self.connection.state() {
            ConnectionState::Idle | ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Scanning => ConnectionStatus::Searching,
            ConnectionState::Connecting
            | ConnectionState::ServicesDiscovering
            | ConnectionState::CharacteristicsDiscovering => ConnectionStatus::Connecting,
            ConnectionState::Ready => ConnectionStatus::Connected(self.connection.device_name()),
            ConnectionState::AdapterUnavailable(_) => ConnectionStatus::Error,
        };
        if status != self.status {
            self.status = status.clone();
            let _ = self.event_sender.send(AppEvent::ConnectionStatus(status));
        }
    }

    fn publish_summary(&self) {
        let gear = self.gears.state();
        let mut summary = format!(
            "{:?}: {:.4}m, ratio {:.2}",
            self.connection.state(),
            gear.current,
            self.gears.ratio()
        );
        if !gear.editable {
            summary.push_str(", locked");
        }
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::info(summary)));
    }

    fn report(&self, error: &ShiftError, severity: MessageSeverity) {
        match severity {
            MessageSeverity::Error => warn!("{}", error),
            _ => debug!("{}", error),
        }
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::from_error(error, severity)));
    }
}

impl<T: DeviceTransport> Drop for TrainerService<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::AdapterFault;
    use crate::domain::models::{CharacteristicHandle, DeviceHandle, ServiceHandle};
    use crate::infrastructure::bluetooth::mock::{MockTransport, TransportCall};
    use crate::infrastructure::bluetooth::protocol::{
        CYCLING_POWER_SERVICE_UUID, WHEEL_CONFIG_CHAR_UUID,
    };
    use crate::infrastructure::bluetooth::transport::AdapterState;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    /// Deliver simulated notifications until the trainer goes quiet
    fn drain(
        service: &mut TrainerService<MockTransport>,
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        now: Instant,
    ) {
        while let Ok(event) = rx.try_recv() {
            service.handle_transport_event(event, now);
        }
    }

    fn simulated() -> (
        TrainerService<MockTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedReceiver<AppEvent>,
    ) {
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let transport = MockTransport::simulated(transport_tx, Duration::ZERO);
        let mut service = TrainerService::new(transport, ServiceConfig::default(), app_tx);
        drain(&mut service, &mut transport_rx, Instant::now());
        (service, transport_rx, app_rx)
    }

    /// A service driven by hand-written notifications
    fn manual(config: ServiceConfig) -> TrainerService<MockTransport> {
        let (app_tx, _app_rx) = mpsc::unbounded_channel();
        TrainerService::new(MockTransport::new(), config, app_tx)
    }

    fn bring_up(service: &mut TrainerService<MockTransport>, now: Instant) {
        let service_handle = ServiceHandle {
            uuid: CYCLING_POWER_SERVICE_UUID,
        };
        for event in [
            TransportEvent::AdapterState(AdapterState::PoweredOn),
            TransportEvent::Discovered {
                device: DeviceHandle::new("AA:BB", Some("KICKR CORE")),
                rssi: None,
            },
            TransportEvent::Connected {
                device_id: "AA:BB".into(),
            },
            TransportEvent::ServicesDiscovered {
                device_id: "AA:BB".into(),
                services: vec![service_handle],
            },
            TransportEvent::CharacteristicsDiscovered {
                device_id: "AA:BB".into(),
                service: service_handle,
                characteristics: vec![CharacteristicHandle {
                    service: CYCLING_POWER_SERVICE_UUID,
                    uuid: WHEEL_CONFIG_CHAR_UUID,
                }],
            },
        ] {
            service.handle_transport_event(event, now);
        }
    }

    fn ack(service: &mut TrainerService<MockTransport>, error: Option<&str>, now: Instant) {
        service.handle_transport_event(
            TransportEvent::WriteCompleted {
                device_id: "AA:BB".into(),
                characteristic: CharacteristicHandle {
                    service: CYCLING_POWER_SERVICE_UUID,
                    uuid: WHEEL_CONFIG_CHAR_UUID,
                },
                error: error.map(str::to_string),
            },
            now,
        );
    }

    #[test]
    fn test_simulated_trainer_reaches_ready() {
        let (service, _rx, mut app_rx) = simulated();

        assert_eq!(service.connection_state(), ConnectionState::Ready);
        assert!(service.is_connected());
        assert!(service.has_characteristic());
        assert_eq!(service.device_name(), "MOCK KICKR CORE 42");
        assert!(service.gear_state().editable);

        let mut statuses = Vec::new();
        while let Ok(event) = app_rx.try_recv() {
            if let AppEvent::ConnectionStatus(status) = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![
                ConnectionStatus::Searching,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected("MOCK KICKR CORE 42".into()),
            ]
        );
    }

    #[test]
    fn test_shift_up_commit_then_rollback() {
        let (mut service, mut rx, _app_rx) = simulated();
        let now = Instant::now();

        let target = service.shift_up(1, now).unwrap();
        assert_close(target, 2.3056);
        assert_close(service.current_circumference(), 2.3056);
        assert!(!service.gear_state().editable);
        assert_eq!(service.transport().writes(), vec![vec![0x48, 0x10, 0x5A]]);

        drain(&mut service, &mut rx, now);
        assert_close(service.current_circumference(), 2.3056);
        assert!(service.gear_state().editable);
        assert_eq!(service.transport().trainer_circumference(), Some(2.3056));

        service.transport().set_fail_writes(true);
        service.shift_up(1, now).unwrap();
        drain(&mut service, &mut rx, now);

        assert_close(service.current_circumference(), 2.3056);
        assert!(service.gear_state().editable);
    }

    #[test]
    fn test_shift_before_ready_is_rejected() {
        let mut service = manual(ServiceConfig::default());
        assert_eq!(
            service.shift_up(1, Instant::now()),
            Err(ShiftError::NotEditable)
        );
        assert!(service.transport().writes().is_empty());
        assert_eq!(service.current_circumference(), 2.096);
    }

    #[test]
    fn test_write_timeout_rolls_back() {
        let mut service = manual(ServiceConfig::default());
        let start = Instant::now();
        bring_up(&mut service, start);

        service.request_shift(2.5, start).unwrap();
        service.poll_timers(start + Duration::from_secs(1));
        assert!(!service.gear_state().editable);

        service.poll_timers(start + Duration::from_secs(3));
        let state = service.gear_state();
        assert_eq!(state.current, 2.096);
        assert!(state.editable);

        // Late acknowledgement changes nothing
        ack(&mut service, None, start + Duration::from_secs(4));
        assert_eq!(service.current_circumference(), 2.096);
    }

    #[test]
    fn test_disconnect_resolves_pending_write() {
        let config = ServiceConfig {
            auto_reconnect: false,
            ..ServiceConfig::default()
        };
        let mut service = manual(config);
        let now = Instant::now();
        bring_up(&mut service, now);
        service.request_shift(2.5, now).unwrap();

        service.handle_transport_event(
            TransportEvent::Disconnected {
                device_id: "AA:BB".into(),
            },
            now,
        );

        let state = service.gear_state();
        assert_eq!(state.current, 2.096);
        assert!(!state.editable);
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);
        assert_eq!(service.device_name(), "<unknown>");
    }

    #[test]
    fn test_auto_reconnect_rescans() {
        let mut service = manual(ServiceConfig::default());
        let now = Instant::now();
        bring_up(&mut service, now);
        service.transport().clear_calls();

        service.handle_transport_event(
            TransportEvent::Disconnected {
                device_id: "AA:BB".into(),
            },
            now,
        );

        assert_eq!(service.connection_state(), ConnectionState::Scanning);
        assert_eq!(
            service.transport().calls(),
            vec![TransportCall::Scan(vec![CYCLING_POWER_SERVICE_UUID])]
        );
    }

    #[test]
    fn test_adapter_loss_cancels_write() {
        let mut service = manual(ServiceConfig::default());
        let now = Instant::now();
        bring_up(&mut service, now);
        service.request_shift(2.5, now).unwrap();

        service.handle_transport_event(
            TransportEvent::AdapterState(AdapterState::PoweredOff),
            now,
        );

        assert_eq!(
            service.connection_state(),
            ConnectionState::AdapterUnavailable(AdapterFault::PoweredOff)
        );
        assert_eq!(service.current_circumference(), 2.096);
        assert!(!service.gear_state().editable);
    }

    #[test]
    fn test_discovery_timeout_retries_then_gives_up() {
        let config = ServiceConfig {
            scan_timeout: Duration::from_secs(10),
            max_scan_attempts: 2,
            ..ServiceConfig::default()
        };
        let mut service = manual(config);
        let start = Instant::now();
        service.handle_transport_event(TransportEvent::AdapterState(AdapterState::PoweredOn), start);
        service.transport().clear_calls();

        service.poll_timers(start + Duration::from_secs(5));
        assert!(service.transport().calls().is_empty());

        service.poll_timers(start + Duration::from_secs(10));
        assert_eq!(service.connection_state(), ConnectionState::Scanning);
        assert_eq!(
            service.transport().calls(),
            vec![
                TransportCall::StopScan,
                TransportCall::Scan(vec![CYCLING_POWER_SERVICE_UUID])
            ]
        );

        service.poll_timers(start + Duration::from_secs(20));
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_foreign_acknowledgement_ignored() {
        let mut service = manual(ServiceConfig::default());
        let now = Instant::now();
        bring_up(&mut service, now);
        service.request_shift(2.5, now).unwrap();

        service.handle_transport_event(
            TransportEvent::WriteCompleted {
                device_id: "ZZ:ZZ".into(),
                characteristic: CharacteristicHandle {
                    service: CYCLING_POWER_SERVICE_UUID,
                    uuid: WHEEL_CONFIG_CHAR_UUID,
                },
                error: Some("other".into()),
            },
            now,
        );
        assert!(!service.gear_state().editable);

        ack(&mut service, None, now);
        assert_eq!(service.current_circumference(), 2.5);
        assert!(service.gear_state().editable);
    }

    #[test]
    fn test_commands() {
        let mut service = manual(ServiceConfig::default());
        let now = Instant::now();
        bring_up(&mut service, now);

        assert!(service.handle_command(ShiftCommand::SetRatio(1.5), now));
        assert_eq!(service.ratio(), 1.5);
        assert!(service.handle_command(ShiftCommand::SetCircumference(2.2), now));
        assert_eq!(service.transport().writes(), vec![vec![0x48, 0xF0, 0x55]]);
        assert!(!service.handle_command(ShiftCommand::Shutdown, now));
    }

    #[test]
    fn test_config_rejects_bad_circumference_settings() {
        assert!(ServiceConfig::from_settings(&Settings::default()).is_ok());

        let mut settings = Settings::default();
        settings.min_circumference = 3.0;
        settings.max_circumference = 2.0;
        assert!(ServiceConfig::from_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.max_circumference = 7.0;
        assert!(ServiceConfig::from_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.default_circumference = 8.0;
        assert!(ServiceConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn test_status_command_publishes_summary() {
        let (mut service, _transport_rx, mut app_rx) = simulated();
        while app_rx.try_recv().is_ok() {}

        assert!(service.handle_command(ShiftCommand::Status, Instant::now()));

        match app_rx.try_recv() {
            Ok(AppEvent::LogMessage(msg)) => {
                assert_eq!(msg.severity, MessageSeverity::Info);
                assert!(msg.message.starts_with("Ready: 2.0960m"), "{}", msg.message);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_shutdown_disconnects() {
        let mut service = manual(ServiceConfig::default());
        let now = Instant::now();
        bring_up(&mut service, now);
        service.transport().clear_calls();

        service.shutdown();

        assert_eq!(
            service.transport().calls(),
            vec![TransportCall::Disconnect("AA:BB".into())]
        );
        assert_eq!(service.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_run_loop_with_simulated_trainer() {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (app_tx, mut app_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let transport = MockTransport::simulated(transport_tx, Duration::from_millis(5));
        let probe = transport.clone();
        let service = TrainerService::new(transport, ServiceConfig::default(), app_tx);
        let handle = tokio::spawn(service.run(transport_rx, command_rx));

        // Wait until the trainer is ready before shifting
        while let Some(event) = app_rx.recv().await {
            if matches!(event, AppEvent::ConnectionStatus(ConnectionStatus::Connected(_))) {
                break;
            }
        }
        command_tx.send(ShiftCommand::ShiftDown(1)).unwrap();

        loop {
            match app_rx.recv().await {
                Some(AppEvent::GearChanged(state)) if state.editable => {
                    assert_close(state.current, 2.096 / 1.1);
                    break;
                }
                Some(_) => {}
                None => panic!("service stopped early"),
            }
        }

        command_tx.send(ShiftCommand::Shutdown).unwrap();
        handle.await.unwrap();
        assert!(probe
            .calls()
            .contains(&TransportCall::Disconnect("mock-0001".into())));
    }
}
