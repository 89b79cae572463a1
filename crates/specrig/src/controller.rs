//! The control-thread actor.
//!
//! A single task owns every piece of mutable rig state: the acquisition
//! engine and its session, the hardware-state store, the acquisition hazard,
//! the averaging pipeline and its sink, and the routine cursor. Everything
//! else talks to it through channels:
//!
//! ```text
//!  ControllerHandle ──ControllerCommand──┐
//!  vendor callback / blocking pool ──────┤  SpectrometerEvent
//!  device worker threads ────────────────┤  DeviceEvent
//!  timers (collect, emit, watchdog,      │
//!          routine continuation, retry) ─┴─▶ Controller::run ──▶ StatusBus
//! ```
//!
//! Handlers never block; slow serial work is queued to the workers and the
//! blocking spectrometer calls run on tokio's blocking pool.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use rig_core::hardware_state::{FilterState, HardwareState, HardwareStateView, MotorState};
use rig_core::hazard::{AcquisitionHazard, HazardCause};
use rig_core::settings::RigSettings;
use rig_experiment::{RoutineEngine, RoutineHost, RoutineProgram, RoutineProgress, RoutineTiming};
use rig_hardware::drivers::filter_wheel::FilterCommand;
use rig_hardware::spectrometer::config::MAX_SCAN_PIXELS;
use rig_hardware::spectrometer::{
    AcquisitionState, AfterStop, ConnectOrigin, MeasurementConfig, MeasurementRequest, Scan,
    SpectrometerEngine, SpectrometerEvent, SpectrometerUpdate,
};
use rig_hardware::workers::{
    spawn_filter, spawn_motor, spawn_thp_poller, DeviceEvent, FilterEvent, MotorEvent,
    MotorRequest, ThpEvent, WorkerHandle,
};
use rig_storage::pipeline::{AveragingPipeline, CollectOutcome, Sample};
use rig_storage::record_sink::RecordSink;
use rig_storage::snapshot::{write_final_data, write_snapshot, SnapshotTag};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::devices::DeviceSet;
use crate::status::{StatusBus, StatusMessage, StatusSource};

/// How long shutdown waits for the spectrometer to stop and release.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Commands and Handle
// =============================================================================

/// Requests accepted by the controller.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Run a routine, or stop the running one.
    RunRoutine {
        /// Routine to run.
        program: RoutineProgram,
        /// Resolved when this request's routine finishes.
        done: Option<oneshot::Sender<RoutineProgress>>,
    },
    /// Stop the running routine.
    StopRoutine,
    /// Move the motor.
    MoveMotor(f64),
    /// Move the filter wheel.
    SetFilter(u8),
    /// Manual spectrometer connect.
    ConnectSpectrometer,
    /// Stop and release the spectrometer.
    DisconnectSpectrometer,
    /// Start measuring with the current request.
    StartMeasurement,
    /// Stop measuring.
    StopMeasurement,
    /// Change the integration time.
    SetIntegration(f64),
    /// Save the latest scan.
    SaveSnapshot {
        /// Optional label.
        label: Option<String>,
    },
    /// Start or stop continuous data saving.
    SetDataSaving(bool),
    /// Report current state.
    Query(oneshot::Sender<ControllerSnapshot>),
    /// Stop the controller.
    Shutdown,
}

/// Read-only view of the controller state.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    /// Acquisition state.
    pub acquisition: AcquisitionState,
    /// Recovery level.
    pub recovery_level: u8,
    /// Last acknowledged motor angle.
    pub motor: MotorState,
    /// Last reported filter slot.
    pub filter: FilterState,
    /// Running routine.
    pub routine: Option<String>,
    /// A routine continuation is scheduled.
    pub pending_continuation: bool,
    /// Continuous data saving is active.
    pub data_saving: bool,
    /// Records written since startup.
    pub records_written: usize,
    /// The acquisition hazard is active.
    pub hazard_active: bool,
    /// Peak of the latest scan.
    pub latest_peak: Option<f64>,
    /// Configuration of the current or last measurement.
    pub measurement: Option<MeasurementConfig>,
}

/// Cloneable handle to a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControllerCommand>,
    status: StatusBus,
}

impl ControllerHandle {
    /// Queue a command.
    pub fn send(&self, command: ControllerCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("controller has stopped"))
    }

    /// Subscribe to status lines.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusMessage> {
        self.status.subscribe()
    }

    /// Current state.
    pub async fn snapshot(&self) -> Result<ControllerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(ControllerCommand::Query(reply))?;
        rx.await.context("controller stopped before replying")
    }

    /// Run `program` and wait for it to finish.
    ///
    /// If another routine is running this stops it instead (and resolves
    /// with [`RoutineProgress::Stopped`]).
    pub async fn run_routine(&self, program: RoutineProgram) -> Result<RoutineProgress> {
        let (done, rx) = oneshot::channel();
        self.send(ControllerCommand::RunRoutine {
            program,
            done: Some(done),
        })?;
        rx.await.context("controller stopped during the routine")
    }

    /// Ask the controller to stop.
    pub fn shutdown(&self) -> Result<()> {
        self.send(ControllerCommand::Shutdown)
    }
}

// =============================================================================
// Rig state (routine host)
// =============================================================================

/// Everything the routine engine may act on.
struct Rig {
    settings: RigSettings,
    status: StatusBus,
    engine: SpectrometerEngine,
    request: MeasurementRequest,
    hardware: HardwareState,
    hazard: AcquisitionHazard,
    pipeline: AveragingPipeline,
    sink: Option<RecordSink>,
    records_written: usize,
    emit_period: Duration,
    next_emit: Instant,
    retry_at: Option<Instant>,
    motor: Option<WorkerHandle<MotorRequest>>,
    filter: Option<WorkerHandle<FilterCommand>>,
    thp: Option<WorkerHandle<()>>,
}

impl Rig {
    fn publish(&self, source: StatusSource, text: impl Into<String>) {
        self.status.publish(source, text);
    }

    fn integration_ms(&self) -> f64 {
        self.engine
            .active_config()
            .map_or(self.request.integration_ms, |c| c.integration_ms)
    }

    fn connect(&mut self, origin: ConnectOrigin) {
        if let Err(e) = self.engine.connect(origin) {
            self.publish(StatusSource::Spectrometer, format!("Spectrometer: {e}"));
        }
    }

    fn publish_updates(&mut self, now: Instant) {
        for update in self.engine.drain_updates() {
            if let SpectrometerUpdate::ConnectFailed {
                retry_in: Some(delay),
                ..
            } = &update
            {
                self.retry_at = Some(now + *delay);
            }
            if let SpectrometerUpdate::SettingsApplied(_) = &update {
                self.reset_emit_period(now);
            }
            self.publish(StatusSource::Spectrometer, update.to_string());
        }
    }

    fn reset_emit_period(&mut self, now: Instant) {
        let period = self.pipeline.emit_interval(self.integration_ms());
        if period != self.emit_period {
            debug!(period_ms = period.as_millis() as u64, "emit period changed");
        }
        self.emit_period = period;
        self.next_emit = now + period;
    }

    fn collect_tick(&mut self, now: Instant) {
        let scan = if self.engine.state().is_measuring() {
            self.engine.latest_scan().map(|s| Sample {
                acquired_at: s.acquired_at,
                intensities: s.intensities.clone(),
            })
        } else {
            None
        };
        let position = self.hardware.position();
        match self.pipeline.collect(now, position, scan, &mut self.hazard) {
            CollectOutcome::Hazard(cause) => {
                self.publish(StatusSource::Data, format!("{cause} - pausing data collection"));
            }
            CollectOutcome::Stopped => {
                let _ = self.hazard.poll(now);
            }
            _ => {}
        }
    }

    fn emit_tick(&mut self, now: Instant, routine: Option<String>) {
        let hardware = self.hardware.snapshot(self.integration_ms());
        let Some(record) = self.pipeline.emit(now, hardware, routine, &self.hazard) else {
            return;
        };
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.append(&record) {
            Ok(()) => self.records_written += 1,
            Err(e) => {
                warn!(error = %e, "record append failed");
                self.publish(StatusSource::Data, format!("Error writing record: {e:#}"));
            }
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Motor(MotorEvent::Connected { port, baud }) => {
                let text = match baud {
                    Some(baud) => format!("Motor connected on {port} at {baud} baud"),
                    None => format!("Motor connected on {port}"),
                };
                self.publish(StatusSource::Motor, text);
            }
            DeviceEvent::Motor(MotorEvent::ConnectFailed { port, error }) => {
                self.motor = None;
                self.publish(StatusSource::Motor, format!("Motor on {port}: {error}"));
            }
            DeviceEvent::Motor(MotorEvent::Moved { angle_deg }) => {
                self.hardware.set_motor_angle(angle_deg);
                self.publish(StatusSource::Motor, format!("Motor moved to {angle_deg:.2}°"));
            }
            DeviceEvent::Motor(MotorEvent::MoveFailed { angle_deg, error }) => {
                self.publish(
                    StatusSource::Motor,
                    format!("Motor move to {angle_deg:.2}° failed: {error}"),
                );
            }
            DeviceEvent::Filter(FilterEvent::Connected { port }) => {
                self.publish(StatusSource::Filter, format!("Filter wheel connected on {port}"));
            }
            DeviceEvent::Filter(FilterEvent::ConnectFailed { port, error }) => {
                self.filter = None;
                self.publish(StatusSource::Filter, format!("Filter wheel on {port}: {error}"));
            }
            DeviceEvent::Filter(FilterEvent::Report { report, .. }) => {
                self.hardware.set_filter_position(report.position);
                let text = match report.position {
                    Some(p) => format!("Filter at position {p}"),
                    None => "Filter position unknown".to_string(),
                };
                self.publish(StatusSource::Filter, text);
            }
            DeviceEvent::Filter(FilterEvent::Failed { command, error }) => {
                self.publish(StatusSource::Filter, format!("Filter {command:?} failed: {error}"));
            }
            DeviceEvent::Thp(ThpEvent::Reading(reading)) => {
                debug!(temperature_c = reading.temperature_c, "THP reading");
                self.hardware.set_thp(reading);
            }
            DeviceEvent::Thp(ThpEvent::Failed(error)) => {
                debug!(error = %error, "THP read failed");
            }
        }
    }

    fn save_snapshot(&mut self, tag: Option<&SnapshotTag>) -> Result<PathBuf> {
        let scan = self.engine.latest_scan().context("No scan available")?;
        write_snapshot(
            &self.settings.storage.snapshot_dir,
            &scan.intensities,
            tag,
            Local::now(),
        )
    }
}

impl RoutineHost for Rig {
    fn move_motor(&mut self, angle_deg: f64) -> Result<()> {
        let motor = self.motor.as_ref().context("Motor not connected")?;
        motor.send(MotorRequest::MoveTo(angle_deg))?;
        Ok(())
    }

    fn set_filter(&mut self, position: u8) -> Result<()> {
        let command = FilterCommand::move_to(position)?;
        let filter = self.filter.as_ref().context("Filter wheel not connected")?;
        filter.send(command)?;
        Ok(())
    }

    fn spectrometer_start(&mut self) -> Result<()> {
        self.engine.prepare_and_start(&self.request)?;
        let now = Instant::now();
        self.reset_emit_period(now);
        Ok(())
    }

    fn spectrometer_stop(&mut self) -> Result<()> {
        if !self.engine.stop() {
            debug!(state = %self.engine.state(), "stop requested while not measuring");
        }
        Ok(())
    }

    fn set_integration(&mut self, ms: f64) -> Result<()> {
        let request = self.request.with_integration(ms);
        // A stop or reset that will go idle or disconnect keeps only the
        // request; the next start picks it up.
        match self.engine.state() {
            AcquisitionState::Ready
            | AcquisitionState::Measuring
            | AcquisitionState::DataReady
            | AcquisitionState::Stopping(AfterStop::Restart(_))
            | AcquisitionState::Resetting(AfterStop::Restart(_)) => {
                self.engine.update_settings(&request)?;
            }
            _ => {
                MeasurementConfig::from_request(&request, MAX_SCAN_PIXELS)?;
            }
        }
        self.request = request;

        let now = Instant::now();
        self.hazard.raise(
            HazardCause::IntegrationChanged,
            now,
            Duration::from_secs_f64(2.0 * ms / 1000.0),
        );
        self.reset_emit_period(now);
        Ok(())
    }

    fn save_spectrum(&mut self, tag: &SnapshotTag) -> Result<PathBuf> {
        self.save_snapshot(Some(tag))
    }

    fn latest_scan(&self) -> Option<Vec<f64>> {
        self.engine.latest_scan().map(|s| s.intensities.clone())
    }

    fn data_saving(&self) -> bool {
        self.sink.is_some()
    }

    fn set_data_saving(&mut self, enabled: bool) -> Result<()> {
        if enabled {
            if self.sink.is_some() {
                return Ok(());
            }
            let pixels = self
                .engine
                .session()
                .map(|s| s.pixels().min(MAX_SCAN_PIXELS))
                .context("Spectrometer not connected")?;
            let storage = &self.settings.storage;
            let sink = RecordSink::create(
                &storage.data_dir,
                &storage.log_dir,
                pixels,
                self.settings.pipeline.flush_every,
                Local::now(),
            )?;
            self.publish(
                StatusSource::Data,
                format!("Continuous data saving to {}", sink.data_path().display()),
            );
            self.sink = Some(sink);
            self.pipeline.start();
            self.reset_emit_period(Instant::now());
        } else {
            self.pipeline.stop();
            if let Some(sink) = self.sink.take() {
                let summary = sink.close()?;
                self.publish(
                    StatusSource::Data,
                    format!(
                        "Data saving stopped ({} records in {})",
                        summary.rows,
                        summary.data_path.display()
                    ),
                );
            }
        }
        Ok(())
    }

    fn save_final_data(&mut self, intensities: &[f64], metadata: &[(String, String)]) -> Result<PathBuf> {
        write_final_data(&self.settings.storage.data_dir, intensities, metadata, Local::now())
    }

    fn status(&mut self, message: String) {
        self.publish(StatusSource::Routine, message);
    }
}

// =============================================================================
// Controller
// =============================================================================

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The control-thread actor.
pub struct Controller {
    rig: Rig,
    routine: RoutineEngine,
    routine_done: Option<oneshot::Sender<RoutineProgress>>,
    commands: mpsc::UnboundedReceiver<ControllerCommand>,
    spectrometer_events: mpsc::UnboundedReceiver<SpectrometerEvent>,
    device_events: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("engine", &self.rig.engine)
            .field("routine", &self.routine.active())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Build the controller and start the device workers.
    pub fn new(settings: RigSettings, devices: DeviceSet) -> Result<(Self, ControllerHandle)> {
        let status = StatusBus::new();
        let (device_tx, device_events) = mpsc::unbounded_channel();

        let motor = devices
            .motor
            .map(|spec| {
                spawn_motor(
                    spec.port,
                    spec.connect,
                    settings.motor.home_on_connect,
                    device_tx.clone(),
                )
            })
            .transpose()
            .context("Failed to start motor worker")?;
        let filter = devices
            .filter
            .map(|spec| spawn_filter(spec.port, spec.connect, device_tx.clone()))
            .transpose()
            .context("Failed to start filter worker")?;
        let thp = devices
            .thp
            .map(|(source, interval)| spawn_thp_poller(source, interval, device_tx.clone()))
            .transpose()
            .context("Failed to start THP poller")?;
        drop(device_tx);

        let (engine, spectrometer_events) =
            SpectrometerEngine::new(devices.spectrometer, &settings.spectrometer);
        let request = MeasurementRequest::from(&settings.spectrometer);
        let pipeline = AveragingPipeline::new(settings.pipeline.clone());
        let emit_period = pipeline.emit_interval(request.integration_ms);
        let timing = RoutineTiming::from_settings(&settings);

        let (tx, commands) = mpsc::unbounded_channel();
        let rig = Rig {
            settings,
            status: status.clone(),
            engine,
            request,
            hardware: HardwareState::default(),
            hazard: AcquisitionHazard::new(),
            pipeline,
            sink: None,
            records_written: 0,
            emit_period,
            next_emit: Instant::now() + emit_period,
            retry_at: None,
            motor,
            filter,
            thp,
        };
        let controller = Self {
            rig,
            routine: RoutineEngine::new(timing),
            routine_done: None,
            commands,
            spectrometer_events,
            device_events,
        };
        Ok((controller, ControllerHandle { tx, status }))
    }

    /// Build the controller and run it on the current runtime.
    pub fn spawn(
        settings: RigSettings,
        devices: DeviceSet,
    ) -> Result<(ControllerHandle, tokio::task::JoinHandle<()>)> {
        let (controller, handle) = Self::new(settings, devices)?;
        Ok((handle, tokio::spawn(controller.run())))
    }

    /// Event loop; returns after [`ControllerCommand::Shutdown`] or when every
    /// handle is dropped.
    pub async fn run(mut self) {
        let start = Instant::now();
        let spectrometer = &self.rig.settings.spectrometer;
        let mut auto_connect = spectrometer
            .auto_connect
            .then(|| start + Duration::from_millis(spectrometer.auto_connect_delay_ms));
        let watchdog_period = Duration::from_millis(spectrometer.watchdog_ms.max(1));
        let collect_period = self.rig.pipeline.collection_interval();

        let mut collect = interval_at(start + collect_period, collect_period);
        collect.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog = interval_at(start + watchdog_period, watchdog_period);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.rig.next_emit = start + self.rig.emit_period;
        info!("controller started");

        loop {
            let continuation = self.routine.pending_continuation();
            let retry = self.rig.retry_at;
            let next_emit = self.rig.next_emit;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.process_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = self.spectrometer_events.recv() => {
                    self.rig.engine.handle_event(event);
                }
                Some(event) = self.device_events.recv() => {
                    self.rig.on_device_event(event);
                }
                _ = collect.tick() => {
                    self.rig.collect_tick(Instant::now());
                }
                _ = sleep_until(next_emit) => {
                    let now = Instant::now();
                    let routine = self.routine.active().map(|r| r.name.clone());
                    self.rig.emit_tick(now, routine);
                    self.rig.next_emit = now + self.rig.emit_period;
                }
                _ = watchdog.tick() => {
                    self.rig.engine.watchdog_tick();
                }
                _ = wait_until(continuation) => {
                    self.advance_routine();
                }
                _ = wait_until(retry) => {
                    self.rig.retry_at = None;
                    self.rig.connect(ConnectOrigin::Retry);
                }
                _ = wait_until(auto_connect) => {
                    auto_connect = None;
                    self.rig.connect(ConnectOrigin::Initial);
                }
            }
            self.rig.publish_updates(Instant::now());
        }

        self.shutdown().await;
    }

    fn process_command(&mut self, command: ControllerCommand) -> bool {
        match command {
            ControllerCommand::RunRoutine { program, done } => {
                let progress = self.routine.toggle(program, &mut self.rig, Instant::now());
                self.finish_routine(progress);
                match (progress, done) {
                    (RoutineProgress::Waiting(_), Some(done)) => self.routine_done = Some(done),
                    (progress, Some(done)) => {
                        let _ = done.send(progress);
                    }
                    (_, None) => {}
                }
            }
            ControllerCommand::StopRoutine => {
                let progress = self.routine.stop(&mut self.rig);
                self.finish_routine(progress);
            }
            ControllerCommand::MoveMotor(angle_deg) => {
                if let Err(e) = self.rig.move_motor(angle_deg) {
                    self.rig.publish(StatusSource::Motor, format!("{e:#}"));
                }
            }
            ControllerCommand::SetFilter(position) => {
                if let Err(e) = self.rig.set_filter(position) {
                    self.rig.publish(StatusSource::Filter, format!("{e:#}"));
                }
            }
            ControllerCommand::ConnectSpectrometer => self.rig.connect(ConnectOrigin::Manual),
            ControllerCommand::DisconnectSpectrometer => {
                if let Err(e) = self.rig.engine.disconnect() {
                    self.rig.publish(StatusSource::Spectrometer, format!("Spectrometer: {e}"));
                }
            }
            ControllerCommand::StartMeasurement => {
                if let Err(e) = self.rig.spectrometer_start() {
                    self.rig.publish(StatusSource::Spectrometer, format!("Spectrometer: {e:#}"));
                }
            }
            ControllerCommand::StopMeasurement => {
                if !self.rig.engine.stop() {
                    self.rig
                        .publish(StatusSource::Spectrometer, "Spectrometer is not measuring");
                }
            }
            ControllerCommand::SetIntegration(ms) => {
                if let Err(e) = self.rig.set_integration(ms) {
                    self.rig.publish(StatusSource::Spectrometer, format!("{e:#}"));
                }
            }
            ControllerCommand::SaveSnapshot { label } => {
                let tag = self.routine.active().map(|identity| SnapshotTag {
                    routine: identity.name.clone(),
                    started: identity.started_at,
                    label: label.clone(),
                });
                match self.rig.save_snapshot(tag.as_ref()) {
                    Ok(path) => self
                        .rig
                        .publish(StatusSource::Data, format!("Saved {}", path.display())),
                    Err(e) => self
                        .rig
                        .publish(StatusSource::Data, format!("Save failed: {e:#}")),
                }
            }
            ControllerCommand::SetDataSaving(enabled) => {
                if let Err(e) = self.rig.set_data_saving(enabled) {
                    self.rig.publish(StatusSource::Data, format!("{e:#}"));
                }
            }
            ControllerCommand::Query(reply) => {
                let _ = reply.send(self.snapshot());
            }
            ControllerCommand::Shutdown => return false,
        }
        true
    }

    fn advance_routine(&mut self) {
        let progress = self.routine.advance(&mut self.rig, Instant::now());
        self.finish_routine(progress);
    }

    fn finish_routine(&mut self, progress: RoutineProgress) {
        if matches!(progress, RoutineProgress::Completed | RoutineProgress::Stopped) {
            if let Some(done) = self.routine_done.take() {
                let _ = done.send(progress);
            }
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        let rig = &self.rig;
        ControllerSnapshot {
            acquisition: rig.engine.state(),
            recovery_level: rig.engine.recovery().level(),
            motor: rig.hardware.motor_state(),
            filter: rig.hardware.filter_state(),
            routine: self.routine.active().map(|r| r.name.clone()),
            pending_continuation: self.routine.pending_continuation().is_some(),
            data_saving: rig.sink.is_some(),
            records_written: rig.records_written,
            hazard_active: rig.hazard.is_active(Instant::now()),
            latest_peak: rig.engine.latest_scan().map(Scan::peak),
            measurement: rig.engine.active_config().copied(),
        }
    }

    async fn shutdown(&mut self) {
        let progress = self.routine.stop(&mut self.rig);
        self.finish_routine(progress);
        if let Err(e) = self.rig.set_data_saving(false) {
            warn!(error = %e, "closing record sink failed");
        }

        if self.rig.engine.disconnect().is_ok() {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while self.rig.engine.state() != AcquisitionState::Disconnected {
                match timeout_at(deadline, self.spectrometer_events.recv()).await {
                    Ok(Some(event)) => self.rig.engine.handle_event(event),
                    _ => {
                        warn!(state = %self.rig.engine.state(), "spectrometer did not release in time");
                        break;
                    }
                }
            }
        }
        self.rig.publish_updates(Instant::now());

        self.rig.motor.take();
        self.rig.filter.take();
        self.rig.thp.take();
        info!("controller stopped");
    }
}
