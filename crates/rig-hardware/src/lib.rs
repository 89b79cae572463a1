//! Device drivers and the spectrometer acquisition engine.
//!
//! # Layout
//!
//! - [`drivers`]: Modbus RTU codec, AZ motor, filter wheel, THP sensor
//! - [`workers`]: one thread per serial device, results as [`workers::DeviceEvent`]
//! - [`spectrometer`]: vendor SDK boundary, acquisition state machine, recovery
//! - [`simulated`]: in-process stand-ins for every device

pub mod drivers;
pub mod simulated;
pub mod spectrometer;
pub mod workers;
