//! Routine execution engine.
//!
//! Executes a [`RoutineProgram`] one command at a time against a
//! [`RoutineHost`]. Nothing blocks: a command either completes and the engine
//! moves on at once, or it schedules a continuation (a wait, a settle delay)
//! and the engine returns. The owner calls [`RoutineEngine::advance`] again
//! once [`RoutineEngine::pending_continuation`] has passed.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  toggle()   ┌─────────┐  continuation   ┌─────────┐
//! │ Idle │────────────▶│ Running │────────────────▶│ Waiting │
//! └──────┘             └─────────┘◀────────────────└─────────┘
//!    ▲                      │        advance(now ≥ deadline)
//!    │ last command / toggle() / stop()
//!    └──────────────────────┘
//! ```
//!
//! `toggle()` on a running routine stops it; it never restarts. Stopping
//! cancels the pending continuation, so a stopped routine cannot resume.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use rig_core::settings::RigSettings;
use rig_storage::snapshot::SnapshotTag;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::routine::{Command, RoutineProgram};

/// Hardware and storage operations a routine can request.
///
/// Implemented by the controller. Every call returns at once; slow hardware
/// work is queued to the device workers.
pub trait RoutineHost {
    /// Queue a motor move.
    fn move_motor(&mut self, angle_deg: f64) -> anyhow::Result<()>;
    /// Queue a filter wheel move.
    fn set_filter(&mut self, position: u8) -> anyhow::Result<()>;
    /// Start continuous measurement.
    fn spectrometer_start(&mut self) -> anyhow::Result<()>;
    /// Stop measurement.
    fn spectrometer_stop(&mut self) -> anyhow::Result<()>;
    /// Apply a new integration time.
    fn set_integration(&mut self, ms: f64) -> anyhow::Result<()>;
    /// Persist the current scan; returns the written file.
    fn save_spectrum(&mut self, tag: &SnapshotTag) -> anyhow::Result<PathBuf>;
    /// Most recent scan intensities.
    fn latest_scan(&self) -> Option<Vec<f64>>;
    /// Whether continuous data saving is active.
    fn data_saving(&self) -> bool;
    /// Start or stop continuous data saving.
    fn set_data_saving(&mut self, enabled: bool) -> anyhow::Result<()>;
    /// Persist the routine's final scan with metadata.
    fn save_final_data(
        &mut self,
        intensities: &[f64],
        metadata: &[(String, String)],
    ) -> anyhow::Result<PathBuf>;
    /// Operator-facing status line.
    fn status(&mut self, message: String);
}

/// Settle delays applied after hardware moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineTiming {
    /// After `motor move`.
    pub motor_settle: Duration,
    /// After `filter position`.
    pub filter_settle: Duration,
}

impl Default for RoutineTiming {
    fn default() -> Self {
        Self::from_settings(&RigSettings::default())
    }
}

impl RoutineTiming {
    /// Delays from settings.
    pub fn from_settings(settings: &RigSettings) -> Self {
        Self {
            motor_settle: Duration::from_millis(settings.motor.settle_ms),
            filter_settle: Duration::from_millis(settings.filter_wheel.settle_ms),
        }
    }
}

/// Identity of the running routine, used to tag records and files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineIdentity {
    /// Routine name.
    pub name: String,
    /// Unique run id.
    pub run_id: Uuid,
    /// Wall-clock start.
    pub started_at: DateTime<Local>,
}

/// Result of a call into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineProgress {
    /// No routine running.
    Idle,
    /// Suspended until the instant.
    Waiting(Instant),
    /// Last command executed.
    Completed,
    /// Stopped before the end.
    Stopped,
}

#[derive(Debug)]
struct ActiveRun {
    program: RoutineProgram,
    identity: RoutineIdentity,
    cursor: usize,
    continuation: Option<Instant>,
    started_data_saving: bool,
    final_data: Option<Vec<f64>>,
}

/// What a single command asks the engine to do next.
enum Step {
    Next,
    Suspend(Duration),
}

/// The routine execution engine.
#[derive(Debug, Default)]
pub struct RoutineEngine {
    timing: RoutineTiming,
    run: Option<ActiveRun>,
}

impl RoutineEngine {
    /// Idle engine.
    pub fn new(timing: RoutineTiming) -> Self {
        Self { timing, run: None }
    }

    /// Whether a routine is running.
    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Running routine, if any.
    pub fn active(&self) -> Option<&RoutineIdentity> {
        self.run.as_ref().map(|r| &r.identity)
    }

    /// Deadline of the scheduled continuation.
    pub fn pending_continuation(&self) -> Option<Instant> {
        self.run.as_ref().and_then(|r| r.continuation)
    }

    /// Index of the next command.
    pub fn cursor(&self) -> Option<usize> {
        self.run.as_ref().map(|r| r.cursor)
    }

    /// Run `program`, or stop the running routine.
    #[instrument(skip_all, fields(routine = %program.name()))]
    pub fn toggle(
        &mut self,
        program: RoutineProgram,
        host: &mut dyn RoutineHost,
        now: Instant,
    ) -> RoutineProgress {
        if self.is_running() {
            return self.stop(host);
        }
        if program.is_empty() {
            host.status("No routine loaded".to_string());
            return RoutineProgress::Idle;
        }

        let identity = RoutineIdentity {
            name: program.name().to_string(),
            run_id: Uuid::new_v4(),
            started_at: Local::now(),
        };
        info!(run_id = %identity.run_id, commands = program.len(), "routine started");

        let mut started_data_saving = false;
        if !host.data_saving() {
            match host.set_data_saving(true) {
                Ok(()) => {
                    started_data_saving = true;
                    host.status("Started continuous data saving for routine".to_string());
                }
                Err(e) => host.status(format!("Could not start data saving: {e:#}")),
            }
        }

        self.run = Some(ActiveRun {
            program,
            identity,
            cursor: 0,
            continuation: None,
            started_data_saving,
            final_data: None,
        });
        self.advance(host, now)
    }

    /// Stop the running routine and cancel its continuation.
    pub fn stop(&mut self, host: &mut dyn RoutineHost) -> RoutineProgress {
        let Some(run) = self.run.take() else {
            return RoutineProgress::Idle;
        };
        info!(routine = %run.identity.name, cursor = run.cursor, "routine stopped");
        Self::release_data_saving(&run, host);
        host.status("Routine execution stopped".to_string());
        RoutineProgress::Stopped
    }

    /// Execute commands until the next suspension or the end.
    pub fn advance(&mut self, host: &mut dyn RoutineHost, now: Instant) -> RoutineProgress {
        let Some(run) = self.run.as_mut() else {
            return RoutineProgress::Idle;
        };
        if let Some(deadline) = run.continuation {
            if now < deadline {
                return RoutineProgress::Waiting(deadline);
            }
            run.continuation = None;
        }

        while let Some(command) = run.program.commands().get(run.cursor).cloned() {
            let total = run.program.len();
            host.status(format!("Running {}/{}: {}", run.cursor + 1, total, command));
            run.cursor += 1;
            if let Step::Suspend(delay) = Self::execute(self.timing, run, &command, host) {
                let deadline = now + delay;
                run.continuation = Some(deadline);
                return RoutineProgress::Waiting(deadline);
            }
        }
        self.complete(host)
    }

    fn execute(
        timing: RoutineTiming,
        run: &mut ActiveRun,
        command: &Command,
        host: &mut dyn RoutineHost,
    ) -> Step {
        let result = match command {
            Command::Wait { ms } => return Step::Suspend(Duration::from_millis(*ms)),
            Command::Log { text } => {
                host.status(text.clone());
                Ok(())
            }
            Command::MoveMotor { angle_deg } => match host.move_motor(*angle_deg) {
                Ok(()) => return Step::Suspend(timing.motor_settle),
                Err(e) => Err(e.context("Motor move error")),
            },
            Command::SetFilter { position } => match host.set_filter(*position) {
                Ok(()) => return Step::Suspend(timing.filter_settle),
                Err(e) => Err(e.context("Filter position error")),
            },
            Command::SpectrometerStart => host.spectrometer_start(),
            Command::SpectrometerStop => host.spectrometer_stop(),
            Command::SpectrometerSave { name } => {
                let tag = SnapshotTag {
                    routine: run.identity.name.clone(),
                    started: run.identity.started_at,
                    label: name.clone(),
                };
                let saved = host.save_spectrum(&tag).map(|path| {
                    host.status(format!("Saved {}", path.display()));
                });
                if let Some(scan) = host.latest_scan() {
                    run.final_data = Some(scan);
                }
                saved
            }
            Command::SetIntegration { ms } => host.set_integration(*ms),
            Command::Snapshot => {
                run.final_data = host.latest_scan();
                Ok(())
            }
            Command::DataStart => host.set_data_saving(true),
            Command::DataStop => host.set_data_saving(false),
        };
        if let Err(e) = result {
            warn!(command = %command, error = %e, "routine command failed");
            host.status(format!("{command}: {e:#}"));
        }
        Step::Next
    }

    fn complete(&mut self, host: &mut dyn RoutineHost) -> RoutineProgress {
        let Some(run) = self.run.take() else {
            return RoutineProgress::Idle;
        };
        Self::release_data_saving(&run, host);

        if let Some(data) = run.final_data.as_deref() {
            let peak = data.iter().copied().fold(0.0, f64::max);
            host.status(format!("Routine completed - Peak value: {peak:.1}"));
            let metadata = vec![
                ("routine".to_string(), run.identity.name.clone()),
                ("run_id".to_string(), run.identity.run_id.to_string()),
                (
                    "routine_started".to_string(),
                    run.identity.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ),
                (
                    "completed".to_string(),
                    Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                ),
                ("peak".to_string(), format!("{peak:.1}")),
            ];
            if let Err(e) = host.save_final_data(data, &metadata) {
                host.status(format!("Error saving final data: {e:#}"));
            }
        }

        if let Err(e) = host.spectrometer_stop() {
            warn!(error = %e, "spectrometer stop after routine failed");
        }
        info!(routine = %run.identity.name, run_id = %run.identity.run_id, "routine completed");
        host.status("Routine execution completed".to_string());
        RoutineProgress::Completed
    }

    fn release_data_saving(run: &ActiveRun, host: &mut dyn RoutineHost) {
        if run.started_data_saving && host.data_saving() {
            match host.set_data_saving(false) {
                Ok(()) => host.status("Stopped continuous data saving".to_string()),
                Err(e) => host.status(format!("Could not stop data saving: {e:#}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        statuses: Vec<String>,
        saving: bool,
        scan: Option<Vec<f64>>,
        fail_motor: bool,
        finals: Vec<Vec<(String, String)>>,
    }

    impl RoutineHost for Recorder {
        fn move_motor(&mut self, angle_deg: f64) -> anyhow::Result<()> {
            if self.fail_motor {
                anyhow::bail!("no ack");
            }
            self.calls.push(format!("motor {angle_deg}"));
            Ok(())
        }
        fn set_filter(&mut self, position: u8) -> anyhow::Result<()> {
            self.calls.push(format!("filter {position}"));
            Ok(())
        }
        fn spectrometer_start(&mut self) -> anyhow::Result<()> {
            self.calls.push("start".into());
            self.scan = Some(vec![1.0, 8.0, 2.0]);
            Ok(())
        }
        fn spectrometer_stop(&mut self) -> anyhow::Result<()> {
            self.calls.push("stop".into());
            Ok(())
        }
        fn set_integration(&mut self, ms: f64) -> anyhow::Result<()> {
            self.calls.push(format!("integration {ms}"));
            Ok(())
        }
        fn save_spectrum(&mut self, tag: &SnapshotTag) -> anyhow::Result<PathBuf> {
            self.calls.push(format!("save {} {:?}", tag.routine, tag.label));
            Ok(PathBuf::from("snapshot.csv"))
        }
        fn latest_scan(&self) -> Option<Vec<f64>> {
            self.scan.clone()
        }
        fn data_saving(&self) -> bool {
            self.saving
        }
        fn set_data_saving(&mut self, enabled: bool) -> anyhow::Result<()> {
            self.calls.push(format!("data {enabled}"));
            self.saving = enabled;
            Ok(())
        }
        fn save_final_data(
            &mut self,
            _intensities: &[f64],
            metadata: &[(String, String)],
        ) -> anyhow::Result<PathBuf> {
            self.finals.push(metadata.to_vec());
            Ok(PathBuf::from("final.csv"))
        }
        fn status(&mut self, message: String) {
            self.statuses.push(message);
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn timing() -> RoutineTiming {
        RoutineTiming {
            motor_settle: ms(500),
            filter_settle: ms(1500),
        }
    }

    #[test]
    fn waits_suspend_and_resume_in_order() {
        let program = RoutineProgram::parse(
            "r",
            "filter position 2\nwait 500\nmotor move 45\nspectrometer start\nspectrometer save\nlog done",
        );
        let mut host = Recorder::default();
        let mut engine = RoutineEngine::new(timing());
        let t0 = Instant::now();

        assert_eq!(engine.toggle(program, &mut host, t0), RoutineProgress::Waiting(t0 + ms(1500)));
        assert_eq!(host.calls, ["data true", "filter 2"]);
        assert_eq!(engine.advance(&mut host, t0 + ms(1000)), RoutineProgress::Waiting(t0 + ms(1500)));

        let t1 = t0 + ms(1500);
        assert_eq!(engine.advance(&mut host, t1), RoutineProgress::Waiting(t1 + ms(500)));
        let t2 = t1 + ms(500);
        assert_eq!(engine.advance(&mut host, t2), RoutineProgress::Waiting(t2 + ms(500)));
        assert_eq!(engine.advance(&mut host, t2 + ms(500)), RoutineProgress::Completed);

        assert_eq!(
            host.calls,
            [
                "data true",
                "filter 2",
                "motor 45",
                "start",
                "save r None",
                "data false",
                "stop"
            ]
        );
        assert!(host.statuses.iter().any(|s| s == "done"));
        assert!(host.statuses.iter().any(|s| s == "Routine completed - Peak value: 8.0"));
        assert_eq!(host.finals.len(), 1);
        assert_eq!(host.finals[0][0], ("routine".to_string(), "r".to_string()));
        assert!(!engine.is_running());
        assert_eq!(engine.pending_continuation(), None);
    }

    #[test]
    fn toggle_while_running_stops_and_cancels() {
        let program = RoutineProgram::parse("r", "wait 1000\nmotor move 10");
        let mut host = Recorder::default();
        let mut engine = RoutineEngine::new(timing());
        let t0 = Instant::now();

        engine.toggle(program.clone(), &mut host, t0);
        assert!(engine.pending_continuation().is_some());
        assert_eq!(engine.toggle(program, &mut host, t0 + ms(10)), RoutineProgress::Stopped);
        assert_eq!(engine.pending_continuation(), None);
        assert_eq!(engine.advance(&mut host, t0 + ms(5000)), RoutineProgress::Idle);
        assert!(!host.calls.iter().any(|c| c.starts_with("motor")));
        assert!(!host.saving);
    }

    #[test]
    fn data_saving_already_on_is_left_alone() {
        let program = RoutineProgram::parse("r", "log hi");
        let mut host = Recorder {
            saving: true,
            ..Recorder::default()
        };
        let mut engine = RoutineEngine::default();
        assert_eq!(engine.toggle(program, &mut host, Instant::now()), RoutineProgress::Completed);
        assert!(host.saving);
        assert!(!host.calls.iter().any(|c| c.starts_with("data")));
    }

    #[test]
    fn failed_command_is_reported_and_skipped() {
        let program = RoutineProgram::parse("r", "motor move 10\nlog after");
        let mut host = Recorder {
            fail_motor: true,
            ..Recorder::default()
        };
        let mut engine = RoutineEngine::new(timing());
        assert_eq!(engine.toggle(program, &mut host, Instant::now()), RoutineProgress::Completed);
        assert!(host.statuses.iter().any(|s| s.contains("Motor move error")));
        assert!(host.statuses.iter().any(|s| s == "after"));
        // No scan was kept, so no final data.
        assert!(host.finals.is_empty());
    }

    #[test]
    fn empty_routine_does_not_start() {
        let mut host = Recorder::default();
        let mut engine = RoutineEngine::default();
        let program = RoutineProgram::parse("r", "# nothing\n");
        assert_eq!(engine.toggle(program, &mut host, Instant::now()), RoutineProgress::Idle);
        assert_eq!(host.statuses, ["No routine loaded"]);
        assert!(host.calls.is_empty());
    }

    #[test]
    fn active_identity_tags_the_run() {
        let mut host = Recorder::default();
        let mut engine = RoutineEngine::default();
        engine.toggle(RoutineProgram::parse("survey", "wait 10"), &mut host, Instant::now());
        let identity = engine.active().unwrap();
        assert_eq!(identity.name, "survey");
        assert_eq!(engine.cursor(), Some(1));
    }
}
