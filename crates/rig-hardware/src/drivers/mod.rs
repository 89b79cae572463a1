//! Serial instrument drivers.
//!
//! - [`modbus`]: Modbus RTU framing and CRC16
//! - [`az_motor`]: AZ-series stepper (baud discovery, moves)
//! - [`filter_wheel`]: ASCII filter wheel
//! - [`thp_sensor`]: JSON temperature/humidity/pressure sensor

pub mod az_motor;
pub mod filter_wheel;
pub mod modbus;
pub mod thp_sensor;
