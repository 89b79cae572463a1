//! Narrow views of instrument state shared between components.
//!
//! Components never reach into each other's internals. The motor worker
//! reports acknowledged angles, the filter worker reports positions, pollers
//! report environment readings; the controller folds them into a
//! [`HardwareState`] and hands out copies through [`HardwareStateView`].

use serde::Serialize;

/// Last acknowledged motor angle. `None` until the first move succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MotorState {
    /// Angle in degrees.
    pub angle_deg: Option<f64>,
}

/// Last reported filter wheel slot. `None` while unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterState {
    /// Slot number (1-based).
    pub position: Option<u8>,
}

/// Orientation, motion and position from the inertial unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ImuReading {
    /// Roll, pitch, yaw in degrees.
    pub rpy_deg: [f64; 3],
    /// Acceleration in g.
    pub accel_g: [f64; 3],
    /// Magnetic field in microtesla.
    pub mag_ut: [f64; 3],
    /// Barometric pressure in hPa.
    pub pressure_hpa: f64,
    /// Board temperature in Celsius.
    pub temperature_c: f64,
    /// Latitude in degrees.
    pub latitude_deg: f64,
    /// Longitude in degrees.
    pub longitude_deg: f64,
}

/// Temperature controller channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TempControllerReading {
    /// Controlled temperature.
    pub current_c: f64,
    /// Setpoint.
    pub setpoint_c: f64,
    /// Auxiliary thermistor.
    pub auxiliary_c: f64,
}

/// Temperature / humidity / pressure sensor sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThpReading {
    /// Sensor identifier reported by the device.
    pub sensor_id: Option<String>,
    /// Temperature in Celsius.
    pub temperature_c: f64,
    /// Relative humidity in percent.
    pub humidity_pct: f64,
    /// Pressure in hPa.
    pub pressure_hpa: f64,
}

/// Latest environment readings; each source is absent until it reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnvironmentState {
    /// Inertial unit.
    pub imu: Option<ImuReading>,
    /// Temperature controller.
    pub temp_controller: Option<TempControllerReading>,
    /// THP sensor.
    pub thp: Option<ThpReading>,
}

/// The mechanical state the averaging pipeline tracks for hazards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HardwarePosition {
    /// Motor angle.
    pub motor: MotorState,
    /// Filter slot.
    pub filter: FilterState,
}

impl HardwarePosition {
    /// Position with both values known.
    pub fn new(angle_deg: f64, filter: u8) -> Self {
        Self {
            motor: MotorState {
                angle_deg: Some(angle_deg),
            },
            filter: FilterState {
                position: Some(filter),
            },
        }
    }
}

/// Everything read alongside an averaged record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HardwareSnapshot {
    /// Motor angle.
    pub motor: MotorState,
    /// Filter slot.
    pub filter: FilterState,
    /// Environment readings.
    pub environment: EnvironmentState,
    /// Integration time of the scans in the record, ms.
    pub integration_ms: f64,
}

/// Read-only accessor other components use instead of reaching into the
/// owners of hardware state.
pub trait HardwareStateView {
    /// Motor angle.
    fn motor_state(&self) -> MotorState;
    /// Filter slot.
    fn filter_state(&self) -> FilterState;
    /// Environment readings.
    fn environment(&self) -> EnvironmentState;

    /// Motor and filter together.
    fn position(&self) -> HardwarePosition {
        HardwarePosition {
            motor: self.motor_state(),
            filter: self.filter_state(),
        }
    }
}

/// Owned store of the latest reported hardware state.
///
/// Only the control thread writes to it, from worker result messages.
#[derive(Debug, Clone, Default)]
pub struct HardwareState {
    motor: MotorState,
    filter: FilterState,
    environment: EnvironmentState,
}

impl HardwareState {
    /// Record an acknowledged move.
    pub fn set_motor_angle(&mut self, angle_deg: f64) {
        self.motor.angle_deg = Some(angle_deg);
    }

    /// Record a filter slot (or `None` when the wheel lost track).
    pub fn set_filter_position(&mut self, position: Option<u8>) {
        self.filter.position = position;
    }

    /// Record an IMU sample.
    pub fn set_imu(&mut self, reading: ImuReading) {
        self.environment.imu = Some(reading);
    }

    /// Record a temperature controller sample.
    pub fn set_temp_controller(&mut self, reading: TempControllerReading) {
        self.environment.temp_controller = Some(reading);
    }

    /// Record a THP sample.
    pub fn set_thp(&mut self, reading: ThpReading) {
        self.environment.thp = Some(reading);
    }

    /// Copy everything for a record at the given integration time.
    pub fn snapshot(&self, integration_ms: f64) -> HardwareSnapshot {
        HardwareSnapshot {
            motor: self.motor,
            filter: self.filter,
            environment: self.environment.clone(),
            integration_ms,
        }
    }
}

impl HardwareStateView for HardwareState {
    fn motor_state(&self) -> MotorState {
        self.motor
    }

    fn filter_state(&self) -> FilterState {
        self.filter
    }

    fn environment(&self) -> EnvironmentState {
        self.environment.clone()
    }
}
