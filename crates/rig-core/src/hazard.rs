//! Shared acquisition hazard.
//!
//! A hazard marks an interval during which scans must not be averaged: the
//! motor or filter moved mid-window, or the integration time is being changed.
//! It is a single object with explicit transitions:
//!
//! ```text
//!            raise(cause, hold)
//!   ┌───────┐ ───────────────▶ ┌────────────────────┐
//!   │ Clear │                  │ Active{cause,until}│ ◀─┐ raise() extends
//!   └───────┘ ◀─────────────── └────────────────────┘ ──┘
//!              poll(now >= until) reports the cleared cause once
//! ```

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Why acquisition is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardCause {
    /// Motor angle changed by more than the threshold.
    MotorMoved,
    /// Filter slot changed.
    FilterChanged,
    /// New integration time is being applied.
    IntegrationChanged,
}

impl fmt::Display for HazardCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HazardCause::MotorMoved => "Motor moved",
            HazardCause::FilterChanged => "Filter changed",
            HazardCause::IntegrationChanged => "Integration time changed",
        };
        write!(f, "{}", label)
    }
}

/// Hazard lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardState {
    /// Acquisition may proceed.
    Clear,
    /// Acquisition suspended until `until`.
    Active {
        /// Most recent cause.
        cause: HazardCause,
        /// Instant at which the hazard lapses.
        until: Instant,
    },
}

/// Hazard shared by the spectrometer engine and the averaging pipeline.
#[derive(Debug, Clone, Copy)]
pub struct AcquisitionHazard {
    state: HazardState,
}

impl Default for AcquisitionHazard {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionHazard {
    /// A clear hazard.
    pub fn new() -> Self {
        Self {
            state: HazardState::Clear,
        }
    }

    /// Current state.
    pub fn state(&self) -> HazardState {
        self.state
    }

    /// Suspend acquisition for `hold` starting at `now`.
    ///
    /// Raising while active keeps the later deadline and records the new
    /// cause. Returns `true` when the hazard was previously clear.
    pub fn raise(&mut self, cause: HazardCause, now: Instant, hold: Duration) -> bool {
        let until = now + hold;
        match self.state {
            HazardState::Clear => {
                self.state = HazardState::Active { cause, until };
                true
            }
            HazardState::Active { until: current, .. } => {
                self.state = HazardState::Active {
                    cause,
                    until: current.max(until),
                };
                false
            }
        }
    }

    /// Whether acquisition is suspended at `now`.
    pub fn is_active(&self, now: Instant) -> bool {
        matches!(self.state, HazardState::Active { until, .. } if now < until)
    }

    /// Deadline of the active hazard.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            HazardState::Active { until, .. } => Some(until),
            HazardState::Clear => None,
        }
    }

    /// Transition to `Clear` once the deadline has passed.
    ///
    /// Returns the cause exactly once, on the poll that observes expiry.
    pub fn poll(&mut self, now: Instant) -> Option<HazardCause> {
        match self.state {
            HazardState::Active { cause, until } if now >= until => {
                self.state = HazardState::Clear;
                Some(cause)
            }
            _ => None,
        }
    }

    /// Drop any active hazard without reporting it.
    pub fn clear(&mut self) {
        self.state = HazardState::Clear;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_then_expire_reports_once() {
        let t0 = Instant::now();
        let mut hazard = AcquisitionHazard::new();
        assert!(hazard.raise(HazardCause::MotorMoved, t0, Duration::from_secs(2)));
        assert!(hazard.is_active(t0 + Duration::from_millis(1999)));
        assert_eq!(hazard.poll(t0 + Duration::from_millis(1999)), None);
        assert_eq!(
            hazard.poll(t0 + Duration::from_secs(2)),
            Some(HazardCause::MotorMoved)
        );
        assert_eq!(hazard.poll(t0 + Duration::from_secs(3)), None);
        assert_eq!(hazard.state(), HazardState::Clear);
    }

    #[test]
    fn raising_while_active_keeps_later_deadline() {
        let t0 = Instant::now();
        let mut hazard = AcquisitionHazard::new();
        hazard.raise(HazardCause::IntegrationChanged, t0, Duration::from_secs(5));
        assert!(!hazard.raise(HazardCause::FilterChanged, t0, Duration::from_secs(2)));
        assert_eq!(hazard.deadline(), Some(t0 + Duration::from_secs(5)));
        match hazard.state() {
            HazardState::Active { cause, .. } => assert_eq!(cause, HazardCause::FilterChanged),
            HazardState::Clear => panic!("hazard should be active"),
        }
    }
}
