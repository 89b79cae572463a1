//! Simulated hardware for `--simulate` runs and tests.

pub mod devices;
pub mod spectrometer;

pub use devices::{FilterLog, MotorLog, SimulatedFilterWheel, SimulatedMotor};
pub use spectrometer::{SimCounters, SimulatedConfig, SimulatedSpectrometer};
