//! Vendor SDK boundary.
//!
//! The acquisition engine only sees this trait. The real vendor library and
//! the simulated one both implement it; neither is inspected beyond the
//! primitives listed here.
//!
//! Scan completions are delivered through a [`ScanCallback`] that the SDK
//! invokes on a thread it controls. The engine's callback only forwards the
//! notification into a channel, so nothing is processed on the vendor thread.

use std::sync::Arc;

use rig_core::error::{ConnectError, MeasurementError};
use tracing::{debug, warn};

use super::config::MeasurementConfig;

/// Vendor status code for success.
pub const STATUS_SUCCESS: i32 = 0;
/// Scan count meaning "measure until stopped".
pub const CONTINUOUS: i32 = -1;

/// Opaque device handle issued by `activate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i64);

/// Identity of an attached spectrometer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Serial number.
    pub serial: String,
    /// User-assigned name, possibly empty.
    pub friendly_name: String,
}

/// A scan-complete notification from the vendor runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanNotification {
    /// Device that produced the scan.
    pub handle: DeviceHandle,
    /// Vendor status; [`STATUS_SUCCESS`] when scope data is ready.
    pub status: i32,
}

impl ScanNotification {
    /// Whether the scan completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Callback registered with `measure`.
pub type ScanCallback = Arc<dyn Fn(ScanNotification) + Send + Sync>;

/// Primitives of the spectrometer vendor library.
pub trait SpectrometerSdk: Send + Sync {
    /// Initialise the library; returns the number of attached devices.
    fn init(&self) -> Result<usize, MeasurementError>;

    /// Enumerate attached devices.
    fn list_devices(&self) -> Result<Vec<DeviceIdentity>, MeasurementError>;

    /// Open a device.
    fn activate(&self, device: &DeviceIdentity) -> Result<DeviceHandle, MeasurementError>;

    /// Release a device handle.
    fn deactivate(&self, handle: DeviceHandle) -> Result<(), MeasurementError>;

    /// Number of detector pixels.
    fn detector_pixels(&self, handle: DeviceHandle) -> Result<usize, MeasurementError>;

    /// Wavelength calibration, one entry per pixel.
    fn wavelengths(&self, handle: DeviceHandle) -> Result<Vec<f64>, MeasurementError>;

    /// Load a measurement configuration.
    fn prepare_measure(
        &self,
        handle: DeviceHandle,
        config: &MeasurementConfig,
    ) -> Result<(), MeasurementError>;

    /// Start measuring `scans` times ([`CONTINUOUS`] for unbounded), invoking
    /// `callback` after each scan.
    fn measure(
        &self,
        handle: DeviceHandle,
        scans: i32,
        callback: ScanCallback,
    ) -> Result<(), MeasurementError>;

    /// Stop measuring. May block until the device is idle.
    fn stop_measure(&self, handle: DeviceHandle) -> Result<(), MeasurementError>;

    /// Intensities of the most recent scan.
    fn scope_data(&self, handle: DeviceHandle) -> Result<Vec<f64>, MeasurementError>;

    /// Shut the library down.
    fn done(&self);
}

/// An opened device with its calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Handle issued by `activate`.
    pub handle: DeviceHandle,
    /// Identity.
    pub identity: DeviceIdentity,
    /// Detector pixel count.
    pub pixels: usize,
    /// Wavelength per pixel.
    pub wavelengths: Vec<f64>,
}

fn unavailable(reason: impl Into<String>) -> ConnectError {
    ConnectError::DeviceUnavailable {
        device: "spectrometer".to_string(),
        reason: reason.into(),
    }
}

/// Initialise the library and open device `index`, reading pixel count and
/// calibration. A missing calibration falls back to pixel indices.
pub fn open_device(sdk: &dyn SpectrometerSdk, index: usize) -> Result<DeviceInfo, ConnectError> {
    let count = sdk.init().map_err(|e| unavailable(e.to_string()))?;
    if count == 0 {
        sdk.done();
        return Err(unavailable("no spectrometer found"));
    }

    let devices = match sdk.list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            sdk.done();
            return Err(unavailable(e.to_string()));
        }
    };
    let Some(identity) = devices.into_iter().nth(index) else {
        sdk.done();
        return Err(unavailable(format!("no spectrometer at index {}", index)));
    };

    let handle = match sdk.activate(&identity) {
        Ok(handle) => handle,
        Err(e) => {
            sdk.done();
            return Err(unavailable(format!(
                "activating {} failed: {}",
                identity.serial, e
            )));
        }
    };

    let pixels = match sdk.detector_pixels(handle) {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            let _ = sdk.deactivate(handle);
            return Err(unavailable("detector reports zero pixels"));
        }
        Err(e) => {
            let _ = sdk.deactivate(handle);
            return Err(unavailable(format!("reading parameters failed: {}", e)));
        }
    };

    let wavelengths = match sdk.wavelengths(handle) {
        Ok(table) if table.len() == pixels => table,
        Ok(table) => {
            warn!(expected = pixels, got = table.len(), "calibration length mismatch, using pixel indices");
            (0..pixels).map(|i| i as f64).collect()
        }
        Err(e) => {
            warn!(error = %e, "no wavelength calibration, using pixel indices");
            (0..pixels).map(|i| i as f64).collect()
        }
    };

    debug!(serial = %identity.serial, pixels, "spectrometer opened");
    Ok(DeviceInfo {
        handle,
        identity,
        pixels,
        wavelengths,
    })
}
