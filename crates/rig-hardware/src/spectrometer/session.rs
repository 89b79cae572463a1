//! Per-device acquisition session and the recovery tracker.

use chrono::{DateTime, Local};
use serde::Serialize;

use super::config::MeasurementConfig;
use super::sdk::{DeviceHandle, DeviceInfo};

/// One scan as stored by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scan {
    /// Intensities, `min(2048, pixels)` long.
    pub intensities: Vec<f64>,
    /// Wall-clock time the scan was fetched.
    pub acquired_at: DateTime<Local>,
    /// Any sample above the saturation threshold.
    pub saturated: bool,
}

impl Scan {
    /// Largest intensity, or 0 for an empty scan.
    pub fn peak(&self) -> f64 {
        self.intensities.iter().copied().fold(0.0, f64::max)
    }
}

/// State bound to one open device handle.
///
/// Created on connect and on every full reset, dropped on disconnect.
#[derive(Debug, Clone)]
pub struct AcquisitionSession {
    device: DeviceInfo,
    config: Option<MeasurementConfig>,
    latest: Option<Scan>,
}

impl AcquisitionSession {
    /// Fresh session for an opened device.
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device,
            config: None,
            latest: None,
        }
    }

    /// Device handle.
    pub fn handle(&self) -> DeviceHandle {
        self.device.handle
    }

    /// Opened device and calibration.
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Detector pixel count.
    pub fn pixels(&self) -> usize {
        self.device.pixels
    }

    /// Wavelength per pixel.
    pub fn wavelengths(&self) -> &[f64] {
        &self.device.wavelengths
    }

    /// Configuration last loaded into the device.
    pub fn config(&self) -> Option<&MeasurementConfig> {
        self.config.as_ref()
    }

    pub(crate) fn set_config(&mut self, config: MeasurementConfig) {
        self.config = Some(config);
    }

    /// Most recent successful scan.
    pub fn latest_scan(&self) -> Option<&Scan> {
        self.latest.as_ref()
    }

    pub(crate) fn store_scan(&mut self, scan: Scan) {
        self.latest = Some(scan);
    }

    /// Saturation flag of the most recent scan.
    pub fn is_saturated(&self) -> bool {
        self.latest.as_ref().is_some_and(|s| s.saturated)
    }
}

/// Remediation chosen for a recovery level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryAction {
    /// Restart measuring with the same configuration.
    RestartMeasurement,
    /// Drop and reopen the device handle, then restart measuring.
    FullReset,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryAction::RestartMeasurement => write!(f, "restart measurement"),
            RecoveryAction::FullReset => write!(f, "full reset"),
        }
    }
}

/// One entry of the recovery history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAttempt {
    /// Level after escalation (1-5).
    pub level: u8,
    /// Remediation performed.
    pub action: RecoveryAction,
    /// When it was attempted.
    pub at: DateTime<Local>,
}

/// Escalation counter for measurement failures.
///
/// Level 1 restarts the measurement; every level from 2 up performs a full
/// reset. The device offers no power-cycle primitive, so levels 3-5 repeat
/// the level 2 remediation. Reaching level 5 wraps the counter back to 0.
/// The tracker outlives full resets so the level keeps climbing while the
/// fault persists.
#[derive(Debug, Clone, Default)]
pub struct RecoveryTracker {
    level: u8,
    history: Vec<RecoveryAttempt>,
}

impl RecoveryTracker {
    /// Level at which the counter wraps.
    pub const MAX_LEVEL: u8 = 5;

    /// Current level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Every attempt so far, oldest first.
    pub fn history(&self) -> &[RecoveryAttempt] {
        &self.history
    }

    /// Remediation for a level.
    pub fn action_for(level: u8) -> RecoveryAction {
        if level <= 1 {
            RecoveryAction::RestartMeasurement
        } else {
            RecoveryAction::FullReset
        }
    }

    /// The remediation for the current level, without recording it.
    pub fn current_attempt(&self) -> RecoveryAttempt {
        RecoveryAttempt {
            level: self.level,
            action: Self::action_for(self.level),
            at: Local::now(),
        }
    }

    /// Record one failure and return the attempt to perform.
    pub fn escalate(&mut self) -> RecoveryAttempt {
        self.level = self.level.saturating_add(1);
        let attempt = RecoveryAttempt {
            level: self.level,
            action: Self::action_for(self.level),
            at: Local::now(),
        };
        self.history.push(attempt.clone());
        if self.level >= Self::MAX_LEVEL {
            self.level = 0;
        }
        attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_escalate_and_wrap_at_five() {
        let mut tracker = RecoveryTracker::default();
        let actions: Vec<_> = (0..5).map(|_| tracker.escalate()).collect();

        assert_eq!(
            actions.iter().map(|a| a.level).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(actions[0].action, RecoveryAction::RestartMeasurement);
        assert!(actions[1..]
            .iter()
            .all(|a| a.action == RecoveryAction::FullReset));
        assert_eq!(tracker.level(), 0);
        assert_eq!(tracker.history().len(), 5);

        assert_eq!(tracker.escalate().level, 1);
    }

    #[test]
    fn current_attempt_is_not_recorded() {
        let mut tracker = RecoveryTracker::default();
        tracker.escalate();
        tracker.escalate();

        let retry = tracker.current_attempt();
        assert_eq!((retry.level, retry.action), (2, RecoveryAction::FullReset));
        assert_eq!(tracker.level(), 2);
        assert_eq!(tracker.history().len(), 2);
    }

    #[test]
    fn peak_of_scan() {
        let scan = Scan {
            intensities: vec![1.0, 7.5, 3.0],
            acquired_at: Local::now(),
            saturated: false,
        };
        assert_eq!(scan.peak(), 7.5);
    }
}
