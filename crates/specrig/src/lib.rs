//! # specrig
//!
//! Controller for the optical measurement rig: one actor task owns the
//! spectrometer engine, the averaging pipeline and the routine engine, and
//! serial devices run on worker threads that report back over channels.
//!
//! ```no_run
//! use rig_core::settings::RigSettings;
//! use rig_experiment::RoutineProgram;
//! use rig_hardware::simulated::SimulatedConfig;
//! use specrig::{Controller, DeviceSet};
//!
//! # tokio_test::block_on(async {
//! let (devices, _sim) = DeviceSet::simulated(SimulatedConfig::default());
//! let (handle, task) = Controller::spawn(RigSettings::default(), devices)?;
//! let program = RoutineProgram::parse("demo", "spectrometer start\nwait 1000\nplot\n");
//! handle.run_routine(program).await?;
//! handle.shutdown()?;
//! task.await?;
//! # Ok::<(), anyhow::Error>(())
//! # }).unwrap();
//! ```

pub mod controller;
pub mod devices;
pub mod status;

pub use controller::{Controller, ControllerCommand, ControllerHandle, ControllerSnapshot};
pub use devices::{DeviceSet, DeviceSpec, SimulatedRig};
pub use status::{StatusBus, StatusMessage, StatusSource};
