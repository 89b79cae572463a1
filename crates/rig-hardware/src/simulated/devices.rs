//! Simulated serial instruments.
//!
//! Both devices acknowledge instantly and keep a shared log of what they were
//! asked to do, so a test can hand the device to a worker thread and still
//! inspect it.

use std::sync::Arc;

use parking_lot::Mutex;
use rig_core::error::{MoveError, RigResult};

use crate::drivers::az_motor::MotorDevice;
use crate::drivers::filter_wheel::{FilterCommand, FilterDevice, FilterReport, PositionSource};

/// Shared view of a simulated motor.
#[derive(Debug, Clone, Default)]
pub struct MotorLog {
    inner: Arc<Mutex<MotorLogInner>>,
}

#[derive(Debug, Default)]
struct MotorLogInner {
    moves: Vec<f64>,
    fail_next: usize,
}

impl MotorLog {
    /// Every acknowledged target, in order.
    pub fn moves(&self) -> Vec<f64> {
        self.inner.lock().moves.clone()
    }

    /// Refuse to acknowledge the next `n` moves.
    pub fn fail_next(&self, n: usize) {
        self.inner.lock().fail_next = n;
    }
}

/// A motor that acknowledges every move.
#[derive(Debug, Default)]
pub struct SimulatedMotor {
    log: MotorLog,
}

impl SimulatedMotor {
    /// New motor and its log.
    pub fn new() -> (Self, MotorLog) {
        let log = MotorLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl MotorDevice for SimulatedMotor {
    fn move_to(&mut self, angle_deg: f64) -> Result<(), MoveError> {
        let mut inner = self.log.inner.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(MoveError::NoAck);
        }
        inner.moves.push(angle_deg);
        Ok(())
    }

    fn baud(&self) -> Option<u32> {
        None
    }
}

/// Shared view of a simulated filter wheel.
#[derive(Debug, Clone, Default)]
pub struct FilterLog {
    inner: Arc<Mutex<Vec<FilterCommand>>>,
}

impl FilterLog {
    /// Every command received, in order.
    pub fn commands(&self) -> Vec<FilterCommand> {
        self.inner.lock().clone()
    }
}

/// A filter wheel that reports exactly the requested slot.
#[derive(Debug, Default)]
pub struct SimulatedFilterWheel {
    position: Option<u8>,
    log: FilterLog,
}

impl SimulatedFilterWheel {
    /// New wheel and its log.
    pub fn new() -> (Self, FilterLog) {
        let log = FilterLog::default();
        (
            Self {
                position: None,
                log: log.clone(),
            },
            log,
        )
    }
}

impl FilterDevice for SimulatedFilterWheel {
    fn execute(&mut self, command: FilterCommand) -> RigResult<FilterReport> {
        self.log.inner.lock().push(command);
        if let Some(position) = command.implied_position() {
            self.position = Some(position);
        }
        Ok(FilterReport {
            position: self.position,
            source: PositionSource::Reported,
            response: self.position.map(|p| p.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::filter_wheel::move_to;

    #[test]
    fn motor_log_sees_moves_and_failures() {
        let (mut motor, log) = SimulatedMotor::new();
        motor.move_to(10.0).unwrap();
        log.fail_next(1);
        assert_eq!(motor.move_to(20.0), Err(MoveError::NoAck));
        motor.move_to(30.0).unwrap();
        assert_eq!(log.moves(), vec![10.0, 30.0]);
    }

    #[test]
    fn wheel_tracks_position() {
        let (mut wheel, log) = SimulatedFilterWheel::new();
        assert_eq!(wheel.execute(FilterCommand::Query).unwrap().position, None);
        assert_eq!(move_to(&mut wheel, 4).unwrap().position, Some(4));
        assert_eq!(wheel.execute(FilterCommand::Reset).unwrap().position, Some(1));
        assert_eq!(log.commands().len(), 3);
    }
}
