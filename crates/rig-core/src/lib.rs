//! Core types shared by every specrig crate.
//!
//! - [`error`]: the error taxonomy (`RigError` and its families)
//! - [`serial`]: blocking serial transport owned by device workers
//! - [`hardware_state`]: narrow accessors for motor, filter and environment state
//! - [`hazard`]: the shared `AcquisitionHazard`
//! - [`settings`]: layered Figment settings

pub mod error;
pub mod hardware_state;
pub mod hazard;
pub mod serial;
pub mod settings;

pub use error::{RigError, RigResult};
