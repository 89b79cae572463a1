//! Controller tests against the simulated rig under paused tokio time.

use std::path::Path;
use std::time::Duration;

use rig_core::settings::RigSettings;
use rig_experiment::{RoutineProgram, RoutineProgress};
use rig_hardware::simulated::SimulatedConfig;
use rig_hardware::spectrometer::AcquisitionState;
use specrig::{
    Controller, ControllerCommand, ControllerHandle, ControllerSnapshot, DeviceSet, SimulatedRig,
    StatusSource,
};
use tempfile::TempDir;

const SURVEY: &str = "\
filter position 1
wait 500
motor move 45
wait 1000
spectrometer start
wait 2000
spectrometer save
log done
";

fn settings(dir: &Path) -> RigSettings {
    let mut settings = RigSettings::default();
    settings.storage.data_dir = dir.join("data");
    settings.storage.snapshot_dir = dir.join("snapshots");
    settings.storage.log_dir = dir.join("logs");
    settings
}

fn start(dir: &TempDir) -> (ControllerHandle, tokio::task::JoinHandle<()>, SimulatedRig) {
    let (devices, sim) = DeviceSet::simulated(SimulatedConfig::default().with_pixels(64));
    let (handle, task) = Controller::spawn(settings(dir.path()), devices).unwrap();
    (handle, task, sim)
}

async fn wait_until(handle: &ControllerHandle, what: &str, done: impl Fn(&ControllerSnapshot) -> bool) {
    for _ in 0..500 {
        if done(&handle.snapshot().await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_ready(handle: &ControllerHandle) {
    wait_until(handle, "Ready", |s| s.acquisition == AcquisitionState::Ready).await;
}

/// Drain queued messages without letting paused time move.
async fn settle(handle: &ControllerHandle, done: impl Fn(&ControllerSnapshot) -> bool) -> ControllerSnapshot {
    for _ in 0..100 {
        let snapshot = handle.snapshot().await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        tokio::task::yield_now().await;
    }
    panic!("controller never settled");
}

fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(prefix))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn survey_routine_runs_to_completion() {
    let dir = TempDir::new().unwrap();
    let (handle, task, sim) = start(&dir);
    wait_ready(&handle).await;

    let progress = handle
        .run_routine(RoutineProgram::parse("survey", SURVEY))
        .await
        .unwrap();
    assert_eq!(progress, RoutineProgress::Completed);

    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.pending_continuation);
    assert_eq!(snapshot.routine, None);
    assert!(!snapshot.data_saving);

    let snapshots = files_with_prefix(&dir.path().join("snapshots"), "snapshot_");
    assert_eq!(snapshots.len(), 1, "{snapshots:?}");
    assert_eq!(files_with_prefix(&dir.path().join("data"), "final_").len(), 1);
    assert_eq!(files_with_prefix(&dir.path().join("data"), "Scans_").len(), 1);

    let saved = std::fs::read_to_string(dir.path().join("snapshots").join(&snapshots[0])).unwrap();
    assert!(saved.starts_with("# routine: survey"));

    // Worker threads run on the real clock.
    let mut moves = Vec::new();
    for _ in 0..200 {
        moves = sim.motor.moves();
        if moves.len() >= 2 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(moves, vec![0.0, 45.0]);
    assert!(!sim.filter.commands().is_empty());

    handle.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stopping_cancels_the_pending_wait() {
    let dir = TempDir::new().unwrap();
    let (handle, task, _sim) = start(&dir);
    wait_ready(&handle).await;
    let mut status = handle.subscribe();

    let program = RoutineProgram::parse("long", "spectrometer start\nwait 10000\nlog unreachable\n");
    let runner = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.run_routine(program).await })
    };
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(handle.snapshot().await.unwrap().pending_continuation);

    handle.send(ControllerCommand::StopRoutine).unwrap();
    assert_eq!(runner.await.unwrap().unwrap(), RoutineProgress::Stopped);

    tokio::time::sleep(Duration::from_millis(12_000)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.pending_continuation);
    assert!(!snapshot.data_saving);

    let mut lines = Vec::new();
    while let Ok(message) = status.try_recv() {
        if message.source == StatusSource::Routine {
            lines.push(message.text);
        }
    }
    assert!(lines.iter().any(|l| l == "Routine execution stopped"));
    assert!(!lines.iter().any(|l| l == "unreachable"));

    handle.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn integration_change_pauses_acquisition_for_two_integrations() {
    let dir = TempDir::new().unwrap();
    let (handle, task, _sim) = start(&dir);
    wait_ready(&handle).await;

    handle.send(ControllerCommand::StartMeasurement).unwrap();
    wait_until(&handle, "a scan", |s| s.latest_peak.is_some()).await;

    handle.send(ControllerCommand::SetIntegration(100.0)).unwrap();
    assert!(handle.snapshot().await.unwrap().hazard_active);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.hazard_active);
    assert_eq!(snapshot.measurement.map(|m| m.integration_ms), Some(100.0));

    handle.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn back_to_back_integration_changes_keep_the_last_one() {
    let dir = TempDir::new().unwrap();
    let (handle, task, sim) = start(&dir);
    wait_ready(&handle).await;

    handle.send(ControllerCommand::StartMeasurement).unwrap();
    wait_until(&handle, "a scan", |s| s.latest_peak.is_some()).await;

    handle.send(ControllerCommand::SetIntegration(100.0)).unwrap();
    handle.send(ControllerCommand::SetIntegration(200.0)).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.acquisition.is_measuring(), "{}", snapshot.acquisition);
    assert_eq!(snapshot.measurement.map(|m| m.integration_ms), Some(200.0));
    assert_eq!(
        sim.spectrometer.last_prepared().map(|c| c.integration_ms),
        Some(200.0)
    );

    handle.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn motor_move_while_saving_pauses_records_for_the_cooldown() {
    let dir = TempDir::new().unwrap();
    let (handle, task, sim) = start(&dir);
    wait_ready(&handle).await;
    wait_until(&handle, "motor homed", |s| s.motor.angle_deg == Some(0.0)).await;

    handle.send(ControllerCommand::StartMeasurement).unwrap();
    wait_until(&handle, "a scan", |s| s.latest_peak.is_some()).await;
    handle.send(ControllerCommand::SetDataSaving(true)).unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let saving = handle.snapshot().await.unwrap();
    assert!(saving.data_saving);
    assert!(saving.records_written > 0);

    // The worker runs on the real clock. Blocking here keeps paused time
    // still until its Moved event is queued.
    handle.send(ControllerCommand::MoveMotor(30.0)).unwrap();
    handle.snapshot().await.unwrap();
    for _ in 0..200 {
        if sim.motor.moves().contains(&30.0) {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(20));
    settle(&handle, |s| s.motor.angle_deg == Some(30.0)).await;

    // The next collection tick sees the new angle.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let paused = handle.snapshot().await.unwrap();
    assert!(paused.hazard_active);
    let before = paused.records_written;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let still = handle.snapshot().await.unwrap();
    assert!(still.hazard_active);
    assert_eq!(still.records_written, before);

    tokio::time::sleep(Duration::from_millis(3000)).await;
    let resumed = handle.snapshot().await.unwrap();
    assert!(!resumed.hazard_active);
    assert!(resumed.records_written > before);

    handle.send(ControllerCommand::SetDataSaving(false)).unwrap();
    let stopped = handle.snapshot().await.unwrap();
    assert!(!stopped.data_saving);

    let data = dir.path().join("data");
    let files = files_with_prefix(&data, "Scans_");
    assert_eq!(files.len(), 1, "{files:?}");
    let mut reader = csv::Reader::from_path(data.join(&files[0])).unwrap();
    let angles: Vec<String> = reader
        .records()
        .map(|r| r.unwrap()[1].to_string())
        .collect();
    assert_eq!(angles.len(), stopped.records_written);
    assert_eq!(angles.last().map(String::as_str), Some("30.00"));

    handle.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn empty_routine_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (handle, task, _sim) = start(&dir);

    let progress = handle
        .run_routine(RoutineProgram::parse("blank", "# nothing\n"))
        .await
        .unwrap();
    assert_eq!(progress, RoutineProgress::Idle);
    assert!(!handle.snapshot().await.unwrap().data_saving);

    handle.shutdown().unwrap();
    task.await.unwrap();
}
