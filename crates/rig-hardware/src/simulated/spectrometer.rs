//! Simulated spectrometer SDK.
//!
//! Scans are generated by a tokio interval task started from `measure`, so
//! tests running with paused time see deterministic scan timing. A
//! [`SimulatedConfig::manual`] instance never generates scans on its own;
//! the test drives the callback with [`SimulatedSpectrometer::emit`].
//!
//! Failures can be injected per primitive and every call is counted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rig_core::error::MeasurementError;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::spectrometer::config::MeasurementConfig;
use crate::spectrometer::sdk::{
    DeviceHandle, DeviceIdentity, ScanCallback, ScanNotification, SpectrometerSdk, STATUS_SUCCESS,
};

/// Fixed parameters of the simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedConfig {
    /// Detector pixels.
    pub pixels: usize,
    /// Number of attached devices.
    pub devices: usize,
    /// Generate scans from a timer after `measure`.
    pub auto_scan: bool,
    /// Peak height of the synthetic spectrum.
    pub peak: f64,
    /// Constant background.
    pub baseline: f64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            pixels: 2048,
            devices: 1,
            auto_scan: true,
            peak: 40_000.0,
            baseline: 500.0,
        }
    }
}

impl SimulatedConfig {
    /// No timer-driven scans.
    pub fn manual() -> Self {
        Self {
            auto_scan: false,
            ..Self::default()
        }
    }

    /// Override the device count.
    #[must_use]
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Override the pixel count.
    #[must_use]
    pub fn with_pixels(mut self, pixels: usize) -> Self {
        self.pixels = pixels;
        self
    }
}

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    /// `init` calls.
    pub init: usize,
    /// `activate` calls.
    pub activate: usize,
    /// `deactivate` calls.
    pub deactivate: usize,
    /// `prepare_measure` calls.
    pub prepare: usize,
    /// `measure` calls.
    pub measure: usize,
    /// `stop_measure` calls.
    pub stop: usize,
    /// `scope_data` calls.
    pub scope: usize,
    /// Callback invocations.
    pub scans: usize,
}

#[derive(Default)]
struct Faults {
    measure: usize,
    scope: usize,
    activate: usize,
    deactivate: bool,
    statuses: VecDeque<i32>,
}

struct SimState {
    config: SimulatedConfig,
    next_handle: i64,
    active: Option<DeviceHandle>,
    prepared: Option<MeasurementConfig>,
    callback: Option<ScanCallback>,
    ticker: Option<JoinHandle<()>>,
    counters: SimCounters,
    faults: Faults,
}

impl SimState {
    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.callback = None;
    }

    fn check_handle(&self, operation: &str, handle: DeviceHandle) -> Result<(), MeasurementError> {
        if self.active == Some(handle) {
            Ok(())
        } else {
            Err(MeasurementError::new(operation, -3, "invalid device handle"))
        }
    }
}

/// In-process stand-in for the vendor library.
pub struct SimulatedSpectrometer {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSpectrometer {
    /// Create a simulator.
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                next_handle: 1,
                active: None,
                prepared: None,
                callback: None,
                ticker: None,
                counters: SimCounters::default(),
                faults: Faults::default(),
            })),
        }
    }

    /// Call counters so far.
    pub fn counters(&self) -> SimCounters {
        self.state.lock().counters
    }

    /// Configuration passed to the most recent `prepare_measure`.
    pub fn last_prepared(&self) -> Option<MeasurementConfig> {
        self.state.lock().prepared
    }

    /// Change the synthetic peak height.
    pub fn set_peak(&self, peak: f64) {
        self.state.lock().config.peak = peak;
    }

    /// Make the next `n` calls to `measure` fail.
    pub fn fail_measure_times(&self, n: usize) {
        self.state.lock().faults.measure = n;
    }

    /// Make the next `n` calls to `scope_data` fail.
    pub fn fail_scope_times(&self, n: usize) {
        self.state.lock().faults.scope = n;
    }

    /// Make the next `n` calls to `activate` fail.
    pub fn fail_activate_times(&self, n: usize) {
        self.state.lock().faults.activate = n;
    }

    /// Make `deactivate` fail (the handle is released anyway).
    pub fn fail_deactivate(&self, fail: bool) {
        self.state.lock().faults.deactivate = fail;
    }

    /// Statuses reported by the next timer-driven scans instead of success.
    pub fn queue_statuses(&self, statuses: impl IntoIterator<Item = i32>) {
        self.state.lock().faults.statuses.extend(statuses);
    }

    /// Invoke the registered callback once with `status`.
    ///
    /// Returns `false` when no measurement is running.
    pub fn emit(&self, status: i32) -> bool {
        let (callback, handle) = {
            let mut state = self.state.lock();
            match (state.callback.clone(), state.active) {
                (Some(callback), Some(handle)) => {
                    state.counters.scans += 1;
                    (callback, handle)
                }
                _ => return false,
            }
        };
        callback(ScanNotification { handle, status });
        true
    }

    fn spectrum(config: &SimulatedConfig, sequence: usize) -> Vec<f64> {
        let n = config.pixels;
        let center = n as f64 / 2.0;
        let width = (n as f64 / 20.0).max(1.0);
        let ripple = (sequence % 7) as f64 * 0.5;
        (0..n)
            .map(|i| {
                let x = (i as f64 - center) / width;
                config.baseline + config.peak * (-x * x).exp() + ripple
            })
            .collect()
    }
}

impl SpectrometerSdk for SimulatedSpectrometer {
    fn init(&self) -> Result<usize, MeasurementError> {
        let mut state = self.state.lock();
        state.counters.init += 1;
        Ok(state.config.devices)
    }

    fn list_devices(&self) -> Result<Vec<DeviceIdentity>, MeasurementError> {
        let state = self.state.lock();
        Ok((0..state.config.devices)
            .map(|i| DeviceIdentity {
                serial: format!("SIM{:05}", i + 1),
                friendly_name: format!("Simulated spectrometer {}", i + 1),
            })
            .collect())
    }

    fn activate(&self, device: &DeviceIdentity) -> Result<DeviceHandle, MeasurementError> {
        let mut state = self.state.lock();
        state.counters.activate += 1;
        if state.faults.activate > 0 {
            state.faults.activate -= 1;
            return Err(MeasurementError::new("activate", -2, "communication error"));
        }
        let handle = DeviceHandle(state.next_handle);
        state.next_handle += 1;
        state.active = Some(handle);
        debug!(serial = %device.serial, ?handle, "simulated device activated");
        Ok(handle)
    }

    fn deactivate(&self, handle: DeviceHandle) -> Result<(), MeasurementError> {
        let mut state = self.state.lock();
        state.counters.deactivate += 1;
        if state.active == Some(handle) {
            state.stop_ticker();
            state.active = None;
        }
        if state.faults.deactivate {
            return Err(MeasurementError::new("deactivate", -1, "device did not release"));
        }
        Ok(())
    }

    fn detector_pixels(&self, handle: DeviceHandle) -> Result<usize, MeasurementError> {
        let state = self.state.lock();
        state.check_handle("get parameter", handle)?;
        Ok(state.config.pixels)
    }

    fn wavelengths(&self, handle: DeviceHandle) -> Result<Vec<f64>, MeasurementError> {
        let state = self.state.lock();
        state.check_handle("get lambda", handle)?;
        Ok((0..state.config.pixels)
            .map(|i| 200.0 + i as f64 * 0.4)
            .collect())
    }

    fn prepare_measure(
        &self,
        handle: DeviceHandle,
        config: &MeasurementConfig,
    ) -> Result<(), MeasurementError> {
        let mut state = self.state.lock();
        state.counters.prepare += 1;
        state.check_handle("prepare", handle)?;
        state.prepared = Some(*config);
        Ok(())
    }

    fn measure(
        &self,
        handle: DeviceHandle,
        _scans: i32,
        callback: ScanCallback,
    ) -> Result<(), MeasurementError> {
        let mut state = self.state.lock();
        state.counters.measure += 1;
        state.check_handle("measure", handle)?;
        if state.faults.measure > 0 {
            state.faults.measure -= 1;
            return Err(MeasurementError::new("measure", -5, "measurement rejected"));
        }
        let Some(config) = state.prepared else {
            return Err(MeasurementError::new("measure", -4, "measurement not prepared"));
        };

        state.stop_ticker();
        state.callback = Some(Arc::clone(&callback));

        if state.config.auto_scan {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let period = Duration::from_secs_f64((config.integration_ms / 1000.0).max(0.001));
                let shared = Arc::clone(&self.state);
                state.ticker = Some(runtime.spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        let status = {
                            let mut s = shared.lock();
                            s.counters.scans += 1;
                            s.faults.statuses.pop_front().unwrap_or(STATUS_SUCCESS)
                        };
                        trace!(status, "simulated scan");
                        callback(ScanNotification { handle, status });
                    }
                }));
            }
        }
        Ok(())
    }

    fn stop_measure(&self, handle: DeviceHandle) -> Result<(), MeasurementError> {
        let mut state = self.state.lock();
        state.counters.stop += 1;
        state.check_handle("stop", handle)?;
        state.stop_ticker();
        Ok(())
    }

    fn scope_data(&self, handle: DeviceHandle) -> Result<Vec<f64>, MeasurementError> {
        let mut state = self.state.lock();
        state.counters.scope += 1;
        state.check_handle("get scope data", handle)?;
        if state.faults.scope > 0 {
            state.faults.scope -= 1;
            return Err(MeasurementError::new("get scope data", -2, "communication error"));
        }
        Ok(Self::spectrum(&state.config, state.counters.scope))
    }

    fn done(&self) {
        let mut state = self.state.lock();
        state.stop_ticker();
        state.active = None;
    }
}
