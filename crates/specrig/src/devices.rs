//! The set of device backends a controller runs against.
//!
//! Serial devices are described by connector closures; each closure runs on
//! its device's worker thread, so discovery never blocks the control loop.

use std::sync::Arc;
use std::time::Duration;

use rig_core::error::ConnectError;
use rig_hardware::drivers::az_motor::MotorDevice;
use rig_hardware::drivers::filter_wheel::FilterDevice;
use rig_hardware::drivers::thp_sensor::ThpSource;
use rig_hardware::simulated::{
    FilterLog, MotorLog, SimulatedConfig, SimulatedFilterWheel, SimulatedMotor,
    SimulatedSpectrometer,
};
use rig_hardware::spectrometer::SpectrometerSdk;

/// Opens the motor on its worker thread.
pub type MotorConnector =
    Box<dyn FnOnce() -> Result<Box<dyn MotorDevice>, ConnectError> + Send + 'static>;

/// Opens the filter wheel on its worker thread.
pub type FilterConnector =
    Box<dyn FnOnce() -> Result<Box<dyn FilterDevice>, ConnectError> + Send + 'static>;

/// A serial device to start: port label plus connector.
pub struct DeviceSpec<C> {
    /// Port name used in status lines.
    pub port: String,
    /// Connector run on the worker.
    pub connect: C,
}

/// Everything the controller needs to reach hardware.
pub struct DeviceSet {
    /// Spectrometer vendor boundary.
    pub spectrometer: Arc<dyn SpectrometerSdk>,
    /// Motor, if configured.
    pub motor: Option<DeviceSpec<MotorConnector>>,
    /// Filter wheel, if configured.
    pub filter: Option<DeviceSpec<FilterConnector>>,
    /// THP sensor and its poll interval, if configured.
    pub thp: Option<(Box<dyn ThpSource>, Duration)>,
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field("motor", &self.motor.as_ref().map(|m| &m.port))
            .field("filter", &self.filter.as_ref().map(|m| &m.port))
            .field("thp", &self.thp.is_some())
            .finish_non_exhaustive()
    }
}

/// Handles into the simulated devices of [`DeviceSet::simulated`].
#[derive(Clone)]
pub struct SimulatedRig {
    /// Spectrometer simulator.
    pub spectrometer: Arc<SimulatedSpectrometer>,
    /// Motor move log.
    pub motor: MotorLog,
    /// Filter command log.
    pub filter: FilterLog,
}

impl DeviceSet {
    /// Fully simulated rig.
    pub fn simulated(config: SimulatedConfig) -> (Self, SimulatedRig) {
        let spectrometer = Arc::new(SimulatedSpectrometer::new(config));
        let (motor, motor_log) = SimulatedMotor::new();
        let (wheel, filter_log) = SimulatedFilterWheel::new();

        let set = Self {
            spectrometer: spectrometer.clone(),
            motor: Some(DeviceSpec {
                port: "SIM-MOTOR".to_string(),
                connect: Box::new(move || Ok(Box::new(motor) as Box<dyn MotorDevice>)),
            }),
            filter: Some(DeviceSpec {
                port: "SIM-FILTER".to_string(),
                connect: Box::new(move || Ok(Box::new(wheel) as Box<dyn FilterDevice>)),
            }),
            thp: None,
        };
        let handles = SimulatedRig {
            spectrometer,
            motor: motor_log,
            filter: filter_log,
        };
        (set, handles)
    }

    /// Serial devices from the configured ports, with the given spectrometer
    /// backend. Devices without a port are left out.
    #[cfg(feature = "serial")]
    pub fn serial(
        settings: &rig_core::settings::RigSettings,
        spectrometer: Arc<dyn SpectrometerSdk>,
    ) -> Self {
        use rig_core::serial::SystemPortOpener;
        use rig_hardware::drivers::az_motor::AzMotor;
        use rig_hardware::drivers::filter_wheel::{FilterTiming, FilterWheel};
        use rig_hardware::drivers::thp_sensor::ThpSensor;

        let slave = settings.motor.slave_id;
        let motor = settings.ports.motor.clone().map(|port| DeviceSpec {
            port: port.clone(),
            connect: Box::new(move || {
                AzMotor::connect(&SystemPortOpener, &port, slave)
                    .map(|m| Box::new(m) as Box<dyn MotorDevice>)
            }) as MotorConnector,
        });
        let filter = settings.ports.filter_wheel.clone().map(|port| DeviceSpec {
            port: port.clone(),
            connect: Box::new(move || {
                FilterWheel::connect(&SystemPortOpener, &port, FilterTiming::default())
                    .map(|w| Box::new(w) as Box<dyn FilterDevice>)
            }) as FilterConnector,
        });
        let thp = settings.ports.thp_sensor.clone().map(|port| {
            (
                Box::new(ThpSensor::new(SystemPortOpener, port)) as Box<dyn ThpSource>,
                Duration::from_millis(settings.thp.poll_interval_ms),
            )
        });

        Self {
            spectrometer,
            motor,
            filter,
            thp,
        }
    }
}
