//! Spectrometer vendor boundary and acquisition engine.
//!
//! - [`sdk`]: the vendor primitives as a trait, plus device opening
//! - [`config`]: measurement request validation and derived averages
//! - [`session`]: per-handle session state and the recovery tracker
//! - [`engine`]: the acquisition state machine

pub mod config;
pub mod engine;
pub mod sdk;
pub mod session;

pub use config::{MeasurementConfig, MeasurementRequest, PixelRange};
pub use engine::{
    AcquisitionState, AfterStop, ConnectOrigin, SettingsChange, SpectrometerEngine,
    SpectrometerEvent, SpectrometerUpdate, MAX_WATCHDOG_RETRIES,
};
pub use sdk::{DeviceHandle, DeviceInfo, ScanCallback, ScanNotification, SpectrometerSdk};
pub use session::{AcquisitionSession, RecoveryAction, RecoveryAttempt, RecoveryTracker, Scan};
