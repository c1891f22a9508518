//! Virtual gearbox on top of the wheel circumference setting.
//!
//! Shifts are applied optimistically and rolled back if the trainer rejects
//! the write. Only one shift may be in flight; `editable` reflects that.

use crate::domain::error::ShiftError;
use crate::domain::models::{AppEvent, GearState, MessageSeverity, StatusMessage};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Completion handler for a circumference write
pub type WriteCallback = Box<dyn FnOnce(Option<ShiftError>) + Send>;

pub const MIN_GEAR_RATIO: f64 = 1.0;
pub const MAX_GEAR_RATIO: f64 = 2.5;

/// Something that can put a circumference on the wire
pub trait WriteSubmitter {
    fn submit_write(&mut self, value: f64, on_complete: WriteCallback) -> Result<(), ShiftError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GearConfig {
    pub initial_circumference: f64,
    pub ratio: f64,
    pub min_circumference: f64,
    pub max_circumference: f64,
}

impl Default for GearConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl GearConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            initial_circumference: settings.default_circumference,
            ratio: settings.gear_ratio,
            min_circumference: settings.min_circumference,
            max_circumference: settings.max_circumference,
        }
    }

    /// Reject ranges the codec cannot carry and a start outside the range
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_ratio(self.ratio)?;
        let (min, max) = (self.min_circumference, self.max_circumference);
        if !(0.0 <= min && min < max && max < protocol::MAX_CIRCUMFERENCE_M) {
            anyhow::bail!(
                "circumference range [{}, {}] must satisfy 0 <= min < max < {}",
                min,
                max,
                protocol::MAX_CIRCUMFERENCE_M
            );
        }
        if !(min..=max).contains(&self.initial_circumference) {
            anyhow::bail!(
                "default circumference {} is outside [{}, {}]",
                self.initial_circumference,
                min,
                max
            );
        }
        Ok(())
    }
}

pub fn validate_ratio(ratio: f64) -> Result<(), ShiftError> {
    if (MIN_GEAR_RATIO..=MAX_GEAR_RATIO).contains(&ratio) {
        Ok(())
    } else {
        Err(ShiftError::InvalidRatio(ratio))
    }
}

pub struct GearShiftController {
    state: Arc<Mutex<GearState>>,
    ratio: f64,
    min_circumference: f64,
    max_circumference: f64,
    event_sender: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl GearShiftController {
    pub fn new(config: GearConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(GearState::new(config.initial_circumference))),
            ratio: config.ratio,
            min_circumference: config.min_circumference,
            max_circumference: config.max_circumference,
            event_sender: None,
        }
    }

    /// Publish gear changes and rollbacks on `sender`
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn state(&self) -> GearState {
        *lock(&self.state)
    }

    pub fn current(&self) -> f64 {
        self.state().current
    }

    pub fn is_editable(&self) -> bool {
        self.state().editable
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn set_ratio(&mut self, ratio: f64) -> Result<(), ShiftError> {
        validate_ratio(ratio)?;
        self.ratio = ratio;
        Ok(())
    }

    /// Allow or block shifting, e.g. when the trainer becomes ready or is lost
    pub fn set_editable(&self, editable: bool) {
        let snapshot = {
            let mut state = lock(&self.state);
            if state.editable == editable {
                return;
            }
            state.editable = editable;
            *state
        };
        self.publish(snapshot);
    }

    /// Apply `value` and write it to the trainer
    ///
    /// A no-op returning `NotEditable` while another write is unresolved.
    pub fn request_shift<S: WriteSubmitter + ?Sized>(
        &self,
        submitter: &mut S,
        value: f64,
    ) -> Result<(), ShiftError> {
        protocol::validate_circumference(value)?;

        let before = {
            let mut state = lock(&self.state);
            if !state.editable {
                return Err(ShiftError::NotEditable);
            }
            let before = *state;
            state.editable = false;
            state.previous = state.current;
            state.current = value;
            before
        };

        let state = self.state.clone();
        let sender = self.event_sender.clone();
        let on_complete: WriteCallback = Box::new(move |error| {
            let snapshot = resolve(&state, error.as_ref());
            if let Some(sender) = sender {
                if let Some(e) = &error {
                    let _ = sender.send(AppEvent::LogMessage(StatusMessage::from_error(
                        e,
                        MessageSeverity::Error,
                    )));
                }
                let _ = sender.send(AppEvent::GearChanged(snapshot));
            }
        });

        if let Err(e) = submitter.submit_write(value, on_complete) {
            warn!("Circumference {:.4}m not submitted: {}", value, e);
            *lock(&self.state) = before;
            return Err(e);
        }

        info!("Shifting {:.4}m -> {:.4}m", before.current, value);
        self.publish(self.state());
        Ok(())
    }

    /// Resolve the in-flight shift; an error rolls back to the previous value
    pub fn on_result(&self, error: Option<ShiftError>) {
        let snapshot = resolve(&self.state, error.as_ref());
        self.publish(snapshot);
    }

    /// Longer circumference, higher speed for the same cadence
    pub fn shift_up<S: WriteSubmitter + ?Sized>(
        &self,
        submitter: &mut S,
        factor: u32,
    ) -> Result<f64, ShiftError> {
        let current = self.state().current;
        let target = current * self.step(factor);
        self.shift_to(submitter, current, target, true)
    }

    pub fn shift_down<S: WriteSubmitter + ?Sized>(
        &self,
        submitter: &mut S,
        factor: u32,
    ) -> Result<f64, ShiftError> {
        let current = self.state().current;
        let target = current / self.step(factor);
        self.shift_to(submitter, current, target, false)
    }

    fn step(&self, factor: u32) -> f64 {
        self.ratio.powi(factor.min(i32::MAX as u32) as i32)
    }

    fn shift_to<S: WriteSubmitter + ?Sized>(
        &self,
        submitter: &mut S,
        current: f64,
        target: f64,
        up: bool,
    ) -> Result<f64, ShiftError> {
        if !self.is_editable() {
            return Err(ShiftError::NotEditable);
        }

        // Inverted ranges must not panic here
        let clamped = target
            .max(self.min_circumference)
            .min(self.max_circumference);
        let forward = if up { clamped > current } else { clamped < current };
        if clamped != target && !forward {
            return Err(ShiftError::GearLimit {
                circumference: current,
            });
        }

        self.request_shift(submitter, clamped)?;
        Ok(clamped)
    }

    fn publish(&self, snapshot: GearState) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(AppEvent::GearChanged(snapshot));
        }
    }
}

fn lock(state: &Mutex<GearState>) -> MutexGuard<'_, GearState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn resolve(state: &Mutex<GearState>, error: Option<&ShiftError>) -> GearState {
    let mut state = lock(state);
    if let Some(e) = error {
        warn!(
            "Error while changing circumference. Rolling back to {:.4}m. error: {}",
            state.previous, e
        );
        state.current = state.previous;
    }
    state.editable = true;
    *state
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Holds on to callbacks so tests decide when the "trainer" answers
    #[derive(Default)]
    struct FakeSubmitter {
        submitted: Vec<f64>,
        callbacks: Vec<WriteCallback>,
        reject_with: Option<ShiftError>,
    }

    impl WriteSubmitter for FakeSubmitter {
        fn submit_write(
            &mut self,
            value: f64,
            on_complete: WriteCallback,
        ) -> Result<(), ShiftError> {
            if let Some(e) = self.reject_with.clone() {
                return Err(e);
            }
            self.submitted.push(value);
            self.callbacks.push(on_complete);
            Ok(())
        }
    }

    impl FakeSubmitter {
        fn answer(&mut self, error: Option<ShiftError>) {
            let callback = self.callbacks.remove(0);
            callback(error);
        }
    }

    fn controller(circumference: f64, ratio: f64) -> GearShiftController {
        let controller = GearShiftController::new(GearConfig {
            initial_circumference: circumference,
            ratio,
            ..GearConfig::default()
        });
        controller.set_editable(true);
        controller
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_starts_locked() {
        let controller = GearShiftController::new(GearConfig::default());
        assert!(!controller.is_editable());
        assert_eq!(controller.current(), 2.096);

        let mut submitter = FakeSubmitter::default();
        assert_eq!(
            controller.request_shift(&mut submitter, 2.2),
            Err(ShiftError::NotEditable)
        );
        assert!(submitter.submitted.is_empty());
    }

    #[test]
    fn test_request_while_in_flight_is_noop() {
        let controller = controller(2.0, 1.1);
        let mut submitter = FakeSubmitter::default();
        controller.request_shift(&mut submitter, 2.2).unwrap();
        let during = controller.state();

        assert_eq!(
            controller.request_shift(&mut submitter, 2.4),
            Err(ShiftError::NotEditable)
        );
        assert_eq!(controller.state(), during);
        assert_eq!(submitter.submitted, vec![2.2]);
    }

    #[test]
    fn test_failure_rolls_back() {
        let controller = controller(2.0, 1.1);
        let mut submitter = FakeSubmitter::default();
        controller.request_shift(&mut submitter, 2.2).unwrap();
        assert_eq!(controller.current(), 2.2);
        assert!(!controller.is_editable());

        submitter.answer(Some(ShiftError::WriteFailed("nope".into())));

        let state = controller.state();
        assert_eq!(state.current, 2.0);
        assert_eq!(state.current, state.previous);
        assert!(state.editable);
    }

    #[test]
    fn test_success_commits() {
        let controller = controller(2.0, 1.1);
        let mut submitter = FakeSubmitter::default();
        controller.request_shift(&mut submitter, 2.2).unwrap();
        submitter.answer(None);

        let state = controller.state();
        assert_eq!(state.current, 2.2);
        assert_eq!(state.previous, 2.0);
        assert!(state.editable);
    }

    #[test]
    fn test_on_result_resolves_directly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = controller(2.0, 1.1).with_events(tx);
        let mut submitter = FakeSubmitter::default();
        controller.request_shift(&mut submitter, 2.2).unwrap();

        controller.on_result(Some(ShiftError::Disconnected));
        assert_eq!(controller.current(), 2.0);
        assert!(controller.is_editable());

        controller.request_shift(&mut submitter, 2.4).unwrap();
        controller.on_result(None);
        assert_eq!(controller.current(), 2.4);
        assert!(controller.is_editable());

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::GearChanged(state) = event {
                last = Some(state);
            }
        }
        assert_eq!(last, Some(controller.state()));
    }

    #[test]
    fn test_synchronous_rejection_restores_state() {
        let controller = controller(2.0, 1.1);
        let before = controller.state();
        let mut submitter = FakeSubmitter {
            reject_with: Some(ShiftError::NotReady),
            ..FakeSubmitter::default()
        };

        assert_eq!(
            controller.request_shift(&mut submitter, 2.2),
            Err(ShiftError::NotReady)
        );
        assert_eq!(controller.state(), before);
    }

    #[test]
    fn test_out_of_range_request_is_rejected() {
        let controller = controller(2.0, 1.1);
        let mut submitter = FakeSubmitter::default();
        let result = controller.request_shift(&mut submitter, 6.6);

        assert!(matches!(result, Err(ShiftError::EncodeOutOfRange(_))));
        assert!(controller.is_editable());
        assert_eq!(controller.current(), 2.0);
    }

    #[test]
    fn test_shift_up_then_failed_shift() {
        let controller = controller(2.096, 1.1);
        let mut submitter = FakeSubmitter::default();

        let target = controller.shift_up(&mut submitter, 1).unwrap();
        assert_close(target, 2.3056);
        assert_close(controller.current(), 2.3056);
        assert!(!controller.is_editable());
        assert_close(submitter.submitted[0], 2.3056);

        submitter.answer(None);
        assert_close(controller.current(), 2.3056);
        assert!(controller.is_editable());

        controller.shift_up(&mut submitter, 1).unwrap();
        submitter.answer(Some(ShiftError::WriteFailed("busy".into())));
        assert_close(controller.current(), 2.3056);
        assert!(controller.is_editable());
    }

    #[test]
    fn test_shift_factor_uses_exponent() {
        let controller = controller(2.096, 1.1);
        let mut submitter = FakeSubmitter::default();
        let target = controller.shift_up(&mut submitter, 2).unwrap();
        assert_eq!(target, 2.096 * 1.1f64.powi(2));
    }

    #[test]
    fn test_shift_down() {
        let controller = controller(2.2, 1.1);
        let mut submitter = FakeSubmitter::default();
        let target = controller.shift_down(&mut submitter, 1).unwrap();
        assert_close(target, 2.0);
    }

    #[test]
    fn test_shift_clamps_to_range() {
        let controller = controller(6.0, 1.5);
        let mut submitter = FakeSubmitter::default();
        let target = controller.shift_up(&mut submitter, 1).unwrap();
        assert_eq!(target, 6.5534);
        submitter.answer(None);

        assert_eq!(
            controller.shift_up(&mut submitter, 1),
            Err(ShiftError::GearLimit {
                circumference: 6.5534
            })
        );
        assert_eq!(submitter.submitted.len(), 1);
        assert!(controller.is_editable());
    }

    #[test]
    fn test_shift_down_clamps_to_minimum() {
        let controller = controller(0.6, 2.0);
        let mut submitter = FakeSubmitter::default();
        assert_eq!(controller.shift_down(&mut submitter, 1).unwrap(), 0.5);
    }

    #[test]
    fn test_shift_below_minimum_never_moves_up() {
        let controller = controller(2.0, 1.1);
        let mut submitter = FakeSubmitter::default();
        controller.request_shift(&mut submitter, 0.3).unwrap();
        controller.on_result(None);

        assert_eq!(
            controller.shift_down(&mut submitter, 1),
            Err(ShiftError::GearLimit { circumference: 0.3 })
        );
        assert_eq!(submitter.submitted, vec![0.3]);

        // Shifting up from there lands inside the range
        assert_eq!(controller.shift_up(&mut submitter, 1).unwrap(), 0.5);
    }

    #[test]
    fn test_shift_above_maximum_never_moves_down() {
        let controller = GearShiftController::new(GearConfig {
            initial_circumference: 6.0,
            max_circumference: 5.0,
            ..GearConfig::default()
        });
        controller.set_editable(true);
        let mut submitter = FakeSubmitter::default();

        assert_eq!(
            controller.shift_up(&mut submitter, 1),
            Err(ShiftError::GearLimit { circumference: 6.0 })
        );
        assert!(submitter.submitted.is_empty());
        assert_eq!(controller.shift_down(&mut submitter, 1).unwrap(), 5.0);
    }

    #[test]
    fn test_inverted_range_does_not_panic() {
        let controller = GearShiftController::new(GearConfig {
            initial_circumference: 2.5,
            min_circumference: 3.0,
            max_circumference: 2.0,
            ..GearConfig::default()
        });
        controller.set_editable(true);
        let mut submitter = FakeSubmitter::default();

        assert!(matches!(
            controller.shift_up(&mut submitter, 1),
            Err(ShiftError::GearLimit { .. })
        ));
        assert!(submitter.submitted.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(GearConfig::default().validate().is_ok());

        let inverted = GearConfig {
            min_circumference: 3.0,
            max_circumference: 2.0,
            ..GearConfig::default()
        };
        assert!(inverted.validate().is_err());

        let beyond_codec = GearConfig {
            max_circumference: 6.5535,
            ..GearConfig::default()
        };
        assert!(beyond_codec.validate().is_err());

        let start_outside = GearConfig {
            initial_circumference: 8.0,
            ..GearConfig::default()
        };
        assert!(start_outside.validate().is_err());

        let steep = GearConfig {
            ratio: 3.0,
            ..GearConfig::default()
        };
        assert!(steep.validate().is_err());
    }

    #[test]
    fn test_ratio_bounds() {
        let mut controller = controller(2.0, 1.1);
        assert_eq!(controller.set_ratio(0.9), Err(ShiftError::InvalidRatio(0.9)));
        assert_eq!(controller.set_ratio(2.6), Err(ShiftError::InvalidRatio(2.6)));
        controller.set_ratio(2.5).unwrap();
        assert_eq!(controller.ratio(), 2.5);
    }

    #[test]
    fn test_rollback_is_published() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let controller = controller(2.0, 1.1).with_events(tx);
        let mut submitter = FakeSubmitter::default();
        controller.request_shift(&mut submitter, 2.2).unwrap();
        submitter.answer(Some(ShiftError::WriteTimeout(std::time::Duration::from_secs(3))));

        let mut saw_error = false;
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                AppEvent::LogMessage(msg) => {
                    saw_error |= msg.severity == MessageSeverity::Error;
                }
                AppEvent::GearChanged(state) => last = Some(state),
                AppEvent::ConnectionStatus(_) => {}
            }
        }
        assert!(saw_error);
        assert_eq!(last.map(|s| s.current), Some(2.0));
    }
}
