//! Spectrometer acquisition engine.
//!
//! The engine owns the device session and is driven from the control thread
//! only. Everything asynchronous reaches it as a [`SpectrometerEvent`] on one
//! channel:
//!
//! - scan notifications forwarded by the vendor callback
//! - completion of a connect running on the blocking pool
//! - completion of a stop running on the blocking pool
//! - completion of a full reset running on the blocking pool
//!
//! # State Machine
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─ok─▶ Ready ─start─▶ Measuring ◀──┐
//!      ▲                      │                             │  scan ok  │ watchdog
//!      │                      └─fail──▶ Disconnected        ▼           │
//!      │                                                 DataReady ─────┘
//!      │         Stopping{after} ◀─stop/update/disconnect─ Measuring
//!      └──────── (after = Disconnect)
//!
//! scan failure ─▶ Measuring            (level 1: restart in place)
//!              └─▶ Resetting{after} ─ok─▶ Measuring   (level 2+)
//!                   └── reset or restart failed: Error
//!
//! Error ─watchdog─▶ same-level retry, at most MAX_WATCHDOG_RETRIES times
//! ```
//!
//! Only scan failures escalate the recovery level. The watchdog retries the
//! current level without recording a new attempt.
//!
//! Stops are never assumed instantaneous: the state stays `Stopping` until
//! the blocking stop reports back, and only then is the follow-up action
//! (go idle, restart with new settings, release the handle) taken.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use rig_core::error::{ConnectError, MeasurementError, RigError, RigResult};
use rig_core::settings::SpectrometerSettings;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

use super::config::{fit_scan, is_saturated, MeasurementConfig, MeasurementRequest};
use super::sdk::{
    open_device, DeviceInfo, ScanCallback, ScanNotification, SpectrometerSdk, CONTINUOUS,
};
use super::session::{AcquisitionSession, RecoveryAction, RecoveryAttempt, RecoveryTracker, Scan};

// =============================================================================
// States and Events
// =============================================================================

/// Who asked for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOrigin {
    /// The automatic connection at startup. Retried once on failure.
    Initial,
    /// The single retry of a failed initial connection.
    Retry,
    /// An operator request. Never retried.
    Manual,
}

/// What happens once a pending stop is confirmed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AfterStop {
    /// Return to `Ready`.
    Idle,
    /// Start again with a new configuration.
    Restart(MeasurementConfig),
    /// Release the device handle.
    Disconnect,
}

/// Acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionState {
    /// No device handle.
    Disconnected,
    /// Opening the device on the blocking pool.
    Connecting,
    /// Handle open, not measuring.
    Ready,
    /// Measuring; waiting for the next scan.
    Measuring,
    /// A fresh scan is stored and not yet consumed by the watchdog.
    DataReady,
    /// A measurement failed and the last remediation did not succeed.
    Error,
    /// A stop is in flight.
    Stopping(AfterStop),
    /// A full reset is in flight; the old handle is already gone.
    Resetting(AfterStop),
}

impl AcquisitionState {
    /// Measuring or holding an unconsumed scan.
    pub fn is_measuring(&self) -> bool {
        matches!(self, AcquisitionState::Measuring | AcquisitionState::DataReady)
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionState::Disconnected => write!(f, "disconnected"),
            AcquisitionState::Connecting => write!(f, "connecting"),
            AcquisitionState::Ready => write!(f, "ready"),
            AcquisitionState::Measuring => write!(f, "measuring"),
            AcquisitionState::DataReady => write!(f, "data ready"),
            AcquisitionState::Error => write!(f, "in error"),
            AcquisitionState::Stopping(_) => write!(f, "stopping"),
            AcquisitionState::Resetting(_) => write!(f, "resetting"),
        }
    }
}

/// Inputs that arrive asynchronously.
#[derive(Debug)]
pub enum SpectrometerEvent {
    /// Forwarded from the vendor callback.
    Scan(ScanNotification),
    /// A connect started by [`SpectrometerEngine::connect`] finished.
    ConnectFinished {
        /// Who asked.
        origin: ConnectOrigin,
        /// Opened device or the reason it failed.
        result: Result<DeviceInfo, ConnectError>,
    },
    /// A blocking stop finished.
    StopFinished(Result<(), MeasurementError>),
    /// A full reset (stop, deactivate, reopen) finished.
    ResetFinished(Result<DeviceInfo, ConnectError>),
}

/// Observable outcomes for the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SpectrometerUpdate {
    /// A device is open.
    Connected {
        /// Serial number.
        serial: String,
        /// Detector pixels.
        pixels: usize,
    },
    /// Opening failed.
    ConnectFailed {
        /// Reason.
        error: ConnectError,
        /// Set when the engine wants one retry after this delay.
        retry_in: Option<Duration>,
    },
    /// The handle was released.
    Disconnected {
        /// Deactivation failure; the handle is cleared regardless.
        deactivate_error: Option<MeasurementError>,
    },
    /// Measuring started.
    MeasurementStarted(MeasurementConfig),
    /// A requested stop completed.
    MeasurementStopped,
    /// New settings are loaded (and measuring resumed if it was running).
    SettingsApplied(MeasurementConfig),
    /// Restart after a settings change failed.
    RestartFailed(MeasurementError),
    /// The watchdog consumed a saturated scan.
    Saturated,
    /// A recovery attempt ran.
    Recovery {
        /// Level and remediation.
        attempt: RecoveryAttempt,
        /// The failure that triggered it.
        cause: MeasurementError,
        /// Error text if the remediation failed.
        failure: Option<String>,
    },
    /// The watchdog gave up retrying; stop or reconnect to clear the error.
    RecoveryExhausted {
        /// Level the engine is parked at.
        level: u8,
    },
}

impl fmt::Display for SpectrometerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpectrometerUpdate::Connected { serial, pixels } => {
                write!(f, "Spectrometer ready (SN={}, {} pixels)", serial, pixels)
            }
            SpectrometerUpdate::ConnectFailed { error, retry_in } => {
                write!(f, "Spectrometer: Connection failed: {}", error)?;
                if let Some(delay) = retry_in {
                    write!(f, " - will retry in {} seconds", delay.as_secs())?;
                }
                Ok(())
            }
            SpectrometerUpdate::Disconnected { deactivate_error } => match deactivate_error {
                Some(e) => write!(f, "Spectrometer: Disconnected (deactivation issue: {})", e),
                None => write!(f, "Spectrometer: Disconnected"),
            },
            SpectrometerUpdate::MeasurementStarted(c) => write!(
                f,
                "Measurement started (Int: {}ms, Avg: {}, Cycles: {}, Rep: {})",
                c.integration_ms, c.averages, c.cycles, c.repetitions
            ),
            SpectrometerUpdate::MeasurementStopped => write!(f, "Measurement stopped"),
            SpectrometerUpdate::SettingsApplied(c) => write!(
                f,
                "Settings updated (Int: {}ms, Avg: {}, Cycles: {}, Rep: {})",
                c.integration_ms, c.averages, c.cycles, c.repetitions
            ),
            SpectrometerUpdate::RestartFailed(e) => write!(f, "Restart after settings change failed: {}", e),
            SpectrometerUpdate::Saturated => write!(f, "Warning: Detector saturation detected"),
            SpectrometerUpdate::Recovery {
                attempt, failure, ..
            } => match failure {
                None => write!(f, "Spectrometer recovery level {}: {}", attempt.level, attempt.action),
                Some(e) => write!(
                    f,
                    "Spectrometer error (level {}): {} failed: {}",
                    attempt.level, attempt.action, e
                ),
            },
            SpectrometerUpdate::RecoveryExhausted { level } => write!(
                f,
                "Spectrometer still in error at recovery level {} - stop or reconnect to clear",
                level
            ),
        }
    }
}

/// Result of [`SpectrometerEngine::update_settings`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingsChange {
    /// Loaded immediately (device was idle).
    Applied(MeasurementConfig),
    /// Waits for the in-flight stop; confirmed by `SettingsApplied`.
    Deferred(MeasurementConfig),
}

impl SettingsChange {
    /// The validated configuration.
    pub fn config(&self) -> &MeasurementConfig {
        match self {
            SettingsChange::Applied(c) | SettingsChange::Deferred(c) => c,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Watchdog retries at the current level before the engine parks in `Error`.
pub const MAX_WATCHDOG_RETRIES: u8 = 3;

/// Recovery attempt whose reset is running on the blocking pool.
#[derive(Debug)]
struct PendingReset {
    attempt: RecoveryAttempt,
    cause: MeasurementError,
    pixels: usize,
}

/// Acquisition engine for one spectrometer index.
pub struct SpectrometerEngine {
    sdk: Arc<dyn SpectrometerSdk>,
    device_index: usize,
    retry_backoff: Duration,
    state: AcquisitionState,
    session: Option<AcquisitionSession>,
    recovery: RecoveryTracker,
    last_config: Option<MeasurementConfig>,
    reset: Option<PendingReset>,
    watchdog_retries: u8,
    events: mpsc::UnboundedSender<SpectrometerEvent>,
    updates: Vec<SpectrometerUpdate>,
}

impl fmt::Debug for SpectrometerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrometerEngine")
            .field("device_index", &self.device_index)
            .field("state", &self.state)
            .field("recovery_level", &self.recovery.level())
            .finish_non_exhaustive()
    }
}

impl SpectrometerEngine {
    /// Create a disconnected engine and the receiver its events arrive on.
    pub fn new(
        sdk: Arc<dyn SpectrometerSdk>,
        settings: &SpectrometerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SpectrometerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            sdk,
            device_index: settings.device_index,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            state: AcquisitionState::Disconnected,
            session: None,
            recovery: RecoveryTracker::default(),
            last_config: None,
            reset: None,
            watchdog_retries: 0,
            events,
            updates: Vec::new(),
        };
        (engine, rx)
    }

    // ===== Accessors =====

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Open session, if any.
    pub fn session(&self) -> Option<&AcquisitionSession> {
        self.session.as_ref()
    }

    /// Most recent successful scan.
    pub fn latest_scan(&self) -> Option<&Scan> {
        self.session.as_ref().and_then(AcquisitionSession::latest_scan)
    }

    /// Recovery counter and history.
    pub fn recovery(&self) -> &RecoveryTracker {
        &self.recovery
    }

    /// Configuration of the current (or last) measurement.
    pub fn active_config(&self) -> Option<&MeasurementConfig> {
        self.last_config.as_ref()
    }

    /// Updates produced since the last drain.
    pub fn drain_updates(&mut self) -> Vec<SpectrometerUpdate> {
        std::mem::take(&mut self.updates)
    }

    // ===== Operations =====

    /// Open the device on the blocking pool.
    ///
    /// Allowed when disconnected, or in `Error` after a reset lost the
    /// handle. Completion arrives as [`SpectrometerEvent::ConnectFinished`].
    #[instrument(skip(self))]
    pub fn connect(&mut self, origin: ConnectOrigin) -> RigResult<()> {
        let allowed = match self.state {
            AcquisitionState::Disconnected => true,
            AcquisitionState::Error => self.session.is_none(),
            _ => false,
        };
        if !allowed {
            return Err(RigError::invalid_state("connect", self.state));
        }

        self.state = AcquisitionState::Connecting;
        let sdk = Arc::clone(&self.sdk);
        let tx = self.events.clone();
        let index = self.device_index;
        tokio::task::spawn_blocking(move || {
            let result = open_device(sdk.as_ref(), index);
            let _ = tx.send(SpectrometerEvent::ConnectFinished { origin, result });
        });
        Ok(())
    }

    /// Validate `request`, prepare the device and start continuous
    /// measurement. Requires `Ready`.
    #[instrument(skip(self))]
    pub fn prepare_and_start(&mut self, request: &MeasurementRequest) -> RigResult<MeasurementConfig> {
        if self.state != AcquisitionState::Ready {
            return Err(RigError::invalid_state("start measurement", self.state));
        }
        let pixels = self.pixels()?;
        let config = MeasurementConfig::from_request(request, pixels)?;
        self.launch(config)?;
        info!(integration_ms = config.integration_ms, averages = config.averages, "measurement started");
        self.updates.push(SpectrometerUpdate::MeasurementStarted(config));
        Ok(config)
    }

    /// Apply new settings.
    ///
    /// While measuring this requests a stop and returns
    /// [`SettingsChange::Deferred`]; the new configuration is live only after
    /// `SettingsApplied` is reported. A restart that is already queued behind
    /// a stop or a reset takes the newer configuration. When idle the device
    /// is prepared at once.
    #[instrument(skip(self))]
    pub fn update_settings(&mut self, request: &MeasurementRequest) -> RigResult<SettingsChange> {
        match self.state {
            AcquisitionState::Measuring | AcquisitionState::DataReady => {
                let config = MeasurementConfig::from_request(request, self.pixels()?)?;
                self.begin_stop(AfterStop::Restart(config))?;
                Ok(SettingsChange::Deferred(config))
            }
            AcquisitionState::Stopping(AfterStop::Restart(queued)) => {
                let config = MeasurementConfig::from_request(request, self.pixels()?)?;
                debug!(from = queued.integration_ms, to = config.integration_ms, "queued restart replaced");
                self.state = AcquisitionState::Stopping(AfterStop::Restart(config));
                Ok(SettingsChange::Deferred(config))
            }
            AcquisitionState::Resetting(AfterStop::Restart(queued)) => {
                let config = MeasurementConfig::from_request(request, self.pixels()?)?;
                debug!(from = queued.integration_ms, to = config.integration_ms, "queued restart replaced");
                self.state = AcquisitionState::Resetting(AfterStop::Restart(config));
                Ok(SettingsChange::Deferred(config))
            }
            AcquisitionState::Ready => {
                let config = MeasurementConfig::from_request(request, self.pixels()?)?;
                let session = self.session_mut("update settings")?;
                let handle = session.handle();
                self.sdk.prepare_measure(handle, &config)?;
                if let Some(session) = self.session.as_mut() {
                    session.set_config(config);
                }
                self.last_config = Some(config);
                self.updates.push(SpectrometerUpdate::SettingsApplied(config));
                Ok(SettingsChange::Applied(config))
            }
            state => Err(RigError::invalid_state("update settings", state)),
        }
    }

    /// Request a stop. Returns `false` when nothing was measuring.
    ///
    /// A pending restart (after a settings change or a reset) is turned into
    /// a plain stop.
    pub fn stop(&mut self) -> bool {
        match self.state {
            AcquisitionState::Stopping(AfterStop::Restart(_)) => {
                self.state = AcquisitionState::Stopping(AfterStop::Idle);
                return true;
            }
            AcquisitionState::Resetting(AfterStop::Restart(_)) => {
                self.state = AcquisitionState::Resetting(AfterStop::Idle);
                return true;
            }
            _ => {}
        }
        let stoppable = self.state.is_measuring()
            || (self.state == AcquisitionState::Error && self.session.is_some());
        if !stoppable {
            return false;
        }
        self.begin_stop(AfterStop::Idle).is_ok()
    }

    /// Stop any measurement, then release the handle.
    #[instrument(skip(self))]
    pub fn disconnect(&mut self) -> RigResult<()> {
        match self.state {
            AcquisitionState::Measuring | AcquisitionState::DataReady => {
                self.begin_stop(AfterStop::Disconnect)
            }
            AcquisitionState::Error if self.session.is_some() => {
                self.begin_stop(AfterStop::Disconnect)
            }
            AcquisitionState::Stopping(_) => {
                self.state = AcquisitionState::Stopping(AfterStop::Disconnect);
                Ok(())
            }
            AcquisitionState::Resetting(_) => {
                self.state = AcquisitionState::Resetting(AfterStop::Disconnect);
                Ok(())
            }
            AcquisitionState::Ready | AcquisitionState::Error => {
                self.release();
                Ok(())
            }
            state => Err(RigError::invalid_state("disconnect", state)),
        }
    }

    /// Periodic supervision.
    ///
    /// Consumes a pending scan (`DataReady` back to `Measuring`) and reports
    /// saturation. In `Error` it retries the remediation of the current level
    /// up to [`MAX_WATCHDOG_RETRIES`] times, then reports once that it gave
    /// up. Retries never raise the recovery level or add to its history.
    pub fn watchdog_tick(&mut self) {
        match self.state {
            AcquisitionState::DataReady => {
                self.state = AcquisitionState::Measuring;
                if self.session.as_ref().is_some_and(AcquisitionSession::is_saturated) {
                    warn!("detector saturation");
                    self.updates.push(SpectrometerUpdate::Saturated);
                }
            }
            AcquisitionState::Error => self.retry_recovery(),
            _ => {}
        }
    }

    /// Apply one asynchronous event.
    pub fn handle_event(&mut self, event: SpectrometerEvent) {
        match event {
            SpectrometerEvent::Scan(notification) => self.on_scan(notification),
            SpectrometerEvent::ConnectFinished { origin, result } => {
                self.on_connect_finished(origin, result)
            }
            SpectrometerEvent::StopFinished(result) => self.on_stop_finished(result),
            SpectrometerEvent::ResetFinished(result) => self.on_reset_finished(result),
        }
    }

    // ===== Internals =====

    fn pixels(&self) -> RigResult<usize> {
        self.session
            .as_ref()
            .map(AcquisitionSession::pixels)
            .or_else(|| self.reset.as_ref().map(|r| r.pixels))
            .ok_or_else(|| RigError::invalid_state("configure", self.state))
    }

    fn session_mut(&mut self, operation: &'static str) -> RigResult<&mut AcquisitionSession> {
        let state = self.state;
        self.session
            .as_mut()
            .ok_or_else(|| RigError::invalid_state(operation, state))
    }

    fn scan_callback(&self) -> ScanCallback {
        let tx = self.events.clone();
        Arc::new(move |notification| {
            let _ = tx.send(SpectrometerEvent::Scan(notification));
        })
    }

    /// Prepare and start measuring with `config`.
    fn launch(&mut self, config: MeasurementConfig) -> Result<(), MeasurementError> {
        let callback = self.scan_callback();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| MeasurementError::new("measure", -3, "no device handle"))?;
        let handle = session.handle();
        self.sdk.prepare_measure(handle, &config)?;
        session.set_config(config);
        self.last_config = Some(config);
        self.sdk.measure(handle, CONTINUOUS, callback)?;
        self.state = AcquisitionState::Measuring;
        Ok(())
    }

    fn begin_stop(&mut self, after: AfterStop) -> RigResult<()> {
        let handle = self.session_mut("stop measurement")?.handle();
        self.state = AcquisitionState::Stopping(after);
        let sdk = Arc::clone(&self.sdk);
        let tx = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let result = sdk.stop_measure(handle);
            let _ = tx.send(SpectrometerEvent::StopFinished(result));
        });
        debug!(?after, "stop requested");
        Ok(())
    }

    fn release(&mut self) {
        let mut deactivate_error = None;
        if let Some(session) = self.session.take() {
            if let Err(e) = self.sdk.deactivate(session.handle()) {
                warn!(error = %e, "deactivation failed, clearing handle anyway");
                deactivate_error = Some(e);
            }
        }
        self.state = AcquisitionState::Disconnected;
        self.recovery = RecoveryTracker::default();
        self.last_config = None;
        self.reset = None;
        self.watchdog_retries = 0;
        info!("spectrometer disconnected");
        self.updates
            .push(SpectrometerUpdate::Disconnected { deactivate_error });
    }

    fn on_connect_finished(&mut self, origin: ConnectOrigin, result: Result<DeviceInfo, ConnectError>) {
        if self.state != AcquisitionState::Connecting {
            warn!(state = %self.state, "unexpected connect completion");
            if let Ok(device) = result {
                let _ = self.sdk.deactivate(device.handle);
            }
            return;
        }

        match result {
            Ok(device) => {
                info!(serial = %device.identity.serial, pixels = device.pixels, ?origin, "spectrometer connected");
                self.updates.push(SpectrometerUpdate::Connected {
                    serial: device.identity.serial.clone(),
                    pixels: device.pixels,
                });
                self.session = Some(AcquisitionSession::new(device));
                self.state = AcquisitionState::Ready;
            }
            Err(error) => {
                let retry_in = (origin == ConnectOrigin::Initial).then_some(self.retry_backoff);
                warn!(error = %error, ?origin, retry = retry_in.is_some(), "spectrometer connection failed");
                self.state = if self.last_config.is_some() {
                    AcquisitionState::Error
                } else {
                    AcquisitionState::Disconnected
                };
                self.updates
                    .push(SpectrometerUpdate::ConnectFailed { error, retry_in });
            }
        }
    }

    fn on_stop_finished(&mut self, result: Result<(), MeasurementError>) {
        let AcquisitionState::Stopping(after) = self.state else {
            debug!(state = %self.state, "stop confirmation ignored");
            return;
        };
        if let Err(e) = result {
            warn!(error = %e, "stop reported an error");
        }
        self.state = AcquisitionState::Ready;

        match after {
            AfterStop::Idle => {
                info!("measurement stopped");
                self.updates.push(SpectrometerUpdate::MeasurementStopped);
            }
            AfterStop::Restart(config) => match self.launch(config) {
                Ok(()) => {
                    info!(integration_ms = config.integration_ms, "settings applied");
                    self.updates.push(SpectrometerUpdate::SettingsApplied(config));
                }
                Err(e) => {
                    error!(error = %e, "restart after settings change failed");
                    self.state = AcquisitionState::Ready;
                    self.updates.push(SpectrometerUpdate::RestartFailed(e));
                }
            },
            AfterStop::Disconnect => {
                self.updates.push(SpectrometerUpdate::MeasurementStopped);
                self.release();
            }
        }
    }

    fn on_scan(&mut self, notification: ScanNotification) {
        if !self.state.is_measuring() {
            trace!(state = %self.state, "scan ignored");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.handle() != notification.handle {
            trace!(?notification, "scan from stale handle ignored");
            return;
        }

        if !notification.is_success() {
            self.fail(MeasurementError::new(
                "measure",
                notification.status,
                "scan completed with error status",
            ));
            return;
        }

        match self.sdk.scope_data(session.handle()) {
            Ok(raw) => {
                let intensities = fit_scan(&raw, session.pixels());
                let saturated = is_saturated(&intensities);
                session.store_scan(Scan {
                    intensities,
                    acquired_at: Local::now(),
                    saturated,
                });
                self.state = AcquisitionState::DataReady;
            }
            Err(e) => self.fail(e),
        }
    }

    /// Escalate recovery and run the remediation for the new level.
    fn fail(&mut self, cause: MeasurementError) {
        warn!(error = %cause, "measurement failure");
        self.watchdog_retries = 0;
        let attempt = self.recovery.escalate();
        self.run_recovery(attempt, cause);
    }

    fn retry_recovery(&mut self) {
        let level = self.recovery.level();
        match self.watchdog_retries.cmp(&MAX_WATCHDOG_RETRIES) {
            std::cmp::Ordering::Less => {
                self.watchdog_retries += 1;
                let cause = MeasurementError::new(
                    "watchdog",
                    -1,
                    format!(
                        "still in error at recovery level {} (retry {} of {})",
                        level, self.watchdog_retries, MAX_WATCHDOG_RETRIES
                    ),
                );
                debug!(level, retry = self.watchdog_retries, "watchdog retrying recovery");
                self.run_recovery(self.recovery.current_attempt(), cause);
            }
            std::cmp::Ordering::Equal => {
                self.watchdog_retries += 1;
                warn!(level, "recovery retries exhausted");
                self.updates.push(SpectrometerUpdate::RecoveryExhausted { level });
            }
            std::cmp::Ordering::Greater => {}
        }
    }

    fn run_recovery(&mut self, attempt: RecoveryAttempt, cause: MeasurementError) {
        let Some(config) = self.last_config else {
            self.finish_recovery(attempt, cause, Some("no configuration to restore".to_string()));
            return;
        };
        match attempt.action {
            RecoveryAction::RestartMeasurement => {
                let failure = self.launch(config).err().map(|e| e.to_string());
                self.finish_recovery(attempt, cause, failure);
            }
            RecoveryAction::FullReset => self.begin_reset(attempt, cause, config),
        }
    }

    fn finish_recovery(&mut self, attempt: RecoveryAttempt, cause: MeasurementError, failure: Option<String>) {
        match &failure {
            None => info!(level = attempt.level, action = %attempt.action, "recovery succeeded"),
            Some(e) => {
                self.state = AcquisitionState::Error;
                error!(level = attempt.level, action = %attempt.action, error = %e, "recovery failed");
            }
        }
        self.updates.push(SpectrometerUpdate::Recovery {
            attempt,
            cause,
            failure,
        });
    }

    /// Stop, release and reopen the device on the blocking pool. The old
    /// handle is stopped before it is deactivated.
    fn begin_reset(&mut self, attempt: RecoveryAttempt, cause: MeasurementError, config: MeasurementConfig) {
        let old = self.session.take().map(|s| (s.handle(), s.pixels()));
        let pixels = old
            .map(|(_, pixels)| pixels)
            .or_else(|| self.reset.as_ref().map(|r| r.pixels))
            .unwrap_or(config.pixel_range.stop + 1);
        self.reset = Some(PendingReset {
            attempt,
            cause,
            pixels,
        });
        self.state = AcquisitionState::Resetting(AfterStop::Restart(config));

        let sdk = Arc::clone(&self.sdk);
        let tx = self.events.clone();
        let index = self.device_index;
        tokio::task::spawn_blocking(move || {
            if let Some((handle, _)) = old {
                if let Err(e) = sdk.stop_measure(handle) {
                    debug!(error = %e, "stop before reset failed");
                }
                if let Err(e) = sdk.deactivate(handle) {
                    warn!(error = %e, "deactivate before reset failed");
                }
            }
            let result = open_device(sdk.as_ref(), index);
            let _ = tx.send(SpectrometerEvent::ResetFinished(result));
        });
        debug!("full reset requested");
    }

    fn on_reset_finished(&mut self, result: Result<DeviceInfo, ConnectError>) {
        let AcquisitionState::Resetting(after) = self.state else {
            warn!(state = %self.state, "unexpected reset completion");
            if let Ok(device) = result {
                let _ = self.sdk.deactivate(device.handle);
            }
            return;
        };
        let pending = self.reset.take();

        let failure = match result {
            Ok(device) => {
                info!(serial = %device.identity.serial, "spectrometer reopened");
                self.session = Some(AcquisitionSession::new(device));
                self.state = AcquisitionState::Ready;
                match after {
                    AfterStop::Restart(config) => self.launch(config).err().map(|e| e.to_string()),
                    AfterStop::Idle | AfterStop::Disconnect => None,
                }
            }
            Err(e) => {
                self.state = AcquisitionState::Error;
                Some(e.to_string())
            }
        };
        if let Some(PendingReset { attempt, cause, .. }) = pending {
            self.finish_recovery(attempt, cause, failure);
        }

        match after {
            AfterStop::Restart(_) => {}
            AfterStop::Idle => {
                info!("measurement stopped");
                self.updates.push(SpectrometerUpdate::MeasurementStopped);
            }
            AfterStop::Disconnect => self.release(),
        }
    }
}
