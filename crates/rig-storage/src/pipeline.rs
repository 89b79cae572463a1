//! Averaging / consistency pipeline.
//!
//! Two cadences drive the pipeline from the control thread:
//!
//! - **collect** (fast): copy the latest scan into the sample window and
//!   compare the observed motor/filter position with the last one
//! - **emit** (slow): reduce the window to one [`AveragedRecord`]
//!
//! A position change between two collection ticks discards the window and
//! raises the shared [`AcquisitionHazard`] for the cool-down. Collection
//! resumes only after the hazard lapses, tracking the new position afresh.
//! The hazard is also raised from outside (integration change); the pipeline
//! treats any active hazard the same way.
//!
//! The pipeline never reads a clock itself. Callers pass `now`, which keeps
//! it deterministic under paused tokio time.

use chrono::{DateTime, Local};
use rig_core::hardware_state::{HardwarePosition, HardwareSnapshot};
use rig_core::hazard::{AcquisitionHazard, HazardCause};
use rig_core::settings::PipelineSettings;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// One collected scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// When the scan was acquired.
    pub acquired_at: DateTime<Local>,
    /// Intensity per pixel.
    pub intensities: Vec<f64>,
}

/// Mean of one window, tagged with the hardware state read alongside it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AveragedRecord {
    /// Acquisition time of the first sample in the window.
    pub timestamp: DateTime<Local>,
    /// Per-pixel arithmetic mean.
    pub mean: Vec<f64>,
    /// Number of samples averaged.
    pub samples: usize,
    /// Hardware state at emit time.
    pub hardware: HardwareSnapshot,
    /// Active routine, if any.
    pub routine: Option<String>,
}

impl AveragedRecord {
    /// Largest mean intensity.
    pub fn peak(&self) -> f64 {
        self.mean.iter().copied().fold(0.0, f64::max)
    }
}

/// Result of one collection tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollectOutcome {
    /// Pipeline is stopped.
    Stopped,
    /// Sample added; window now holds this many.
    Collected(usize),
    /// No scan available yet.
    NoScan,
    /// Position changed; window discarded and hazard raised.
    Hazard(HazardCause),
    /// Hazard still active; nothing collected.
    Paused,
}

/// Pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not collecting.
    Stopped,
    /// Collecting into the window.
    Collecting,
    /// Suspended by a hazard.
    Paused,
}

/// The averaging pipeline.
#[derive(Debug)]
pub struct AveragingPipeline {
    settings: PipelineSettings,
    running: bool,
    window: Vec<Sample>,
    last_position: Option<HardwarePosition>,
    discarded: usize,
}

impl AveragingPipeline {
    /// Stopped pipeline.
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            running: false,
            window: Vec::new(),
            last_position: None,
            discarded: 0,
        }
    }

    /// Collection period.
    pub fn collection_interval(&self) -> Duration {
        self.settings.collection_interval()
    }

    /// Emit period for the given integration time.
    pub fn emit_interval(&self, integration_ms: f64) -> Duration {
        self.settings.emit_interval(integration_ms)
    }

    /// Hazard hold time.
    pub fn cooldown(&self) -> Duration {
        self.settings.cooldown()
    }

    /// Lifecycle state at `now`.
    pub fn state(&self, hazard: &AcquisitionHazard, now: Instant) -> PipelineState {
        if !self.running {
            PipelineState::Stopped
        } else if hazard.is_active(now) {
            PipelineState::Paused
        } else {
            PipelineState::Collecting
        }
    }

    /// Whether the pipeline is started.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Samples waiting in the window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Total samples thrown away because of hazards.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Start collecting with an empty window.
    pub fn start(&mut self) {
        self.running = true;
        self.window.clear();
        self.last_position = None;
        info!("averaging pipeline started");
    }

    /// Stop collecting and drop the window.
    pub fn stop(&mut self) {
        self.running = false;
        self.window.clear();
        self.last_position = None;
        info!("averaging pipeline stopped");
    }

    /// One collection tick.
    pub fn collect(
        &mut self,
        now: Instant,
        position: HardwarePosition,
        scan: Option<Sample>,
        hazard: &mut AcquisitionHazard,
    ) -> CollectOutcome {
        if !self.running {
            return CollectOutcome::Stopped;
        }

        if let Some(cause) = hazard.poll(now) {
            info!(cause = %cause, "hazard cleared, resuming collection");
            self.last_position = Some(position);
        }
        if hazard.is_active(now) {
            self.discard();
            self.last_position = Some(position);
            return CollectOutcome::Paused;
        }

        if let Some(cause) = self.detect_change(position) {
            let dropped = self.discard();
            hazard.raise(cause, now, self.settings.cooldown());
            self.last_position = Some(position);
            info!(cause = %cause, dropped, "hardware changed mid-window, pausing");
            return CollectOutcome::Hazard(cause);
        }
        self.last_position = Some(position);

        match scan {
            Some(sample) => {
                self.window.push(sample);
                CollectOutcome::Collected(self.window.len())
            }
            None => CollectOutcome::NoScan,
        }
    }

    /// One emit tick. Returns a record when the window holds samples and no
    /// hazard is active. The record is stamped with the first sample's
    /// acquisition time.
    pub fn emit(
        &mut self,
        now: Instant,
        hardware: HardwareSnapshot,
        routine: Option<String>,
        hazard: &AcquisitionHazard,
    ) -> Option<AveragedRecord> {
        if !self.running || hazard.is_active(now) || self.window.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.window);
        let timestamp = samples.first()?.acquired_at;
        let mean = mean_spectrum(&samples);
        debug!(samples = samples.len(), pixels = mean.len(), "emitting averaged record");
        Some(AveragedRecord {
            timestamp,
            mean,
            samples: samples.len(),
            hardware,
            routine,
        })
    }

    fn detect_change(&self, position: HardwarePosition) -> Option<HazardCause> {
        let last = self.last_position?;
        if let (Some(before), Some(after)) = (last.motor.angle_deg, position.motor.angle_deg) {
            if (after - before).abs() > self.settings.angle_threshold_deg {
                return Some(HazardCause::MotorMoved);
            }
        }
        if let (Some(before), Some(after)) = (last.filter.position, position.filter.position) {
            if before != after {
                return Some(HazardCause::FilterChanged);
            }
        }
        None
    }

    fn discard(&mut self) -> usize {
        let dropped = self.window.len();
        self.discarded += dropped;
        self.window.clear();
        dropped
    }
}

/// Per-pixel mean over the shortest sample length.
pub fn mean_spectrum(samples: &[Sample]) -> Vec<f64> {
    let Some(pixels) = samples.iter().map(|s| s.intensities.len()).min() else {
        return Vec::new();
    };
    let n = samples.len() as f64;
    (0..pixels)
        .map(|i| samples.iter().map(|s| s.intensities[i]).sum::<f64>() / n)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: f64) -> Option<Sample> {
        Some(Sample {
            acquired_at: Local::now(),
            intensities: vec![value; 4],
        })
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn started() -> (AveragingPipeline, AcquisitionHazard) {
        let mut pipeline = AveragingPipeline::new(PipelineSettings::default());
        pipeline.start();
        (pipeline, AcquisitionHazard::new())
    }

    #[test]
    fn averages_the_window() {
        let (mut p, mut h) = started();
        let t0 = Instant::now();
        let pos = HardwarePosition::new(0.0, 1);
        assert_eq!(p.collect(t0, pos, sample(10.0), &mut h), CollectOutcome::Collected(1));
        assert_eq!(p.collect(t0 + ms(250), pos, sample(20.0), &mut h), CollectOutcome::Collected(2));
        assert_eq!(p.collect(t0 + ms(500), pos, None, &mut h), CollectOutcome::NoScan);

        let record = p
            .emit(t0 + ms(1000), HardwareSnapshot::default(), None, &h)
            .unwrap();
        assert_eq!(record.samples, 2);
        assert_eq!(record.mean, vec![15.0; 4]);
        assert_eq!(record.peak(), 15.0);
        assert_eq!(p.window_len(), 0);
    }

    #[test]
    fn record_is_stamped_with_first_sample_time() {
        let (mut p, mut h) = started();
        let t0 = Instant::now();
        let pos = HardwarePosition::new(0.0, 1);
        let first = Local::now() - chrono::Duration::seconds(30);
        let at = |acquired_at| {
            Some(Sample {
                acquired_at,
                intensities: vec![1.0; 4],
            })
        };
        p.collect(t0, pos, at(first), &mut h);
        p.collect(t0 + ms(250), pos, at(first + chrono::Duration::milliseconds(250)), &mut h);

        let record = p
            .emit(t0 + ms(1000), HardwareSnapshot::default(), None, &h)
            .unwrap();
        assert_eq!(record.timestamp, first);
    }

    #[test]
    fn motor_move_discards_window_until_cooldown_expires() {
        let (mut p, mut h) = started();
        let t0 = Instant::now();
        p.collect(t0, HardwarePosition::new(0.0, 1), sample(1.0), &mut h);
        p.collect(t0 + ms(250), HardwarePosition::new(0.0, 1), sample(1.0), &mut h);

        let moved = HardwarePosition::new(5.0, 1);
        assert_eq!(
            p.collect(t0 + ms(500), moved, sample(99.0), &mut h),
            CollectOutcome::Hazard(HazardCause::MotorMoved)
        );
        assert_eq!(p.window_len(), 0);
        assert_eq!(p.discarded(), 2);
        assert!(p
            .emit(t0 + ms(1000), HardwareSnapshot::default(), None, &h)
            .is_none());

        // Still inside the 2 s cool-down.
        assert_eq!(p.collect(t0 + ms(2250), moved, sample(7.0), &mut h), CollectOutcome::Paused);
        assert_eq!(p.state(&h, t0 + ms(2250)), PipelineState::Paused);

        // Cool-down over: the new angle is the baseline, not a second hazard.
        assert_eq!(p.collect(t0 + ms(2500), moved, sample(7.0), &mut h), CollectOutcome::Collected(1));
        let record = p
            .emit(t0 + ms(3000), HardwareSnapshot::default(), None, &h)
            .unwrap();
        assert_eq!(record.samples, 1);
        assert_eq!(record.mean, vec![7.0; 4]);
    }

    #[test]
    fn small_motor_jitter_and_unknown_positions_are_not_hazards() {
        let (mut p, mut h) = started();
        let t0 = Instant::now();
        p.collect(t0, HardwarePosition::new(10.0, 2), sample(1.0), &mut h);
        assert_eq!(
            p.collect(t0 + ms(250), HardwarePosition::new(10.4, 2), sample(1.0), &mut h),
            CollectOutcome::Collected(2)
        );
        assert_eq!(
            p.collect(t0 + ms(500), HardwarePosition::default(), sample(1.0), &mut h),
            CollectOutcome::Collected(3)
        );
    }

    #[test]
    fn filter_change_is_a_hazard() {
        let (mut p, mut h) = started();
        let t0 = Instant::now();
        p.collect(t0, HardwarePosition::new(0.0, 1), sample(1.0), &mut h);
        assert_eq!(
            p.collect(t0 + ms(250), HardwarePosition::new(0.0, 2), sample(1.0), &mut h),
            CollectOutcome::Hazard(HazardCause::FilterChanged)
        );
    }

    #[test]
    fn external_hazard_pauses_collection() {
        let (mut p, mut h) = started();
        let t0 = Instant::now();
        let pos = HardwarePosition::new(0.0, 1);
        p.collect(t0, pos, sample(1.0), &mut h);
        h.raise(HazardCause::IntegrationChanged, t0, ms(400));
        assert_eq!(p.collect(t0 + ms(250), pos, sample(1.0), &mut h), CollectOutcome::Paused);
        assert_eq!(p.window_len(), 0);
        assert_eq!(p.collect(t0 + ms(500), pos, sample(3.0), &mut h), CollectOutcome::Collected(1));
    }

    #[test]
    fn stopped_pipeline_ignores_ticks() {
        let mut p = AveragingPipeline::new(PipelineSettings::default());
        let mut h = AcquisitionHazard::new();
        let t0 = Instant::now();
        assert_eq!(
            p.collect(t0, HardwarePosition::new(0.0, 1), sample(1.0), &mut h),
            CollectOutcome::Stopped
        );
        assert!(p.emit(t0, HardwareSnapshot::default(), None, &h).is_none());
        assert_eq!(p.state(&h, t0), PipelineState::Stopped);
    }

    #[test]
    fn mean_uses_shortest_sample() {
        let samples = vec![
            Sample {
                acquired_at: Local::now(),
                intensities: vec![1.0, 2.0, 3.0],
            },
            Sample {
                acquired_at: Local::now(),
                intensities: vec![3.0, 4.0],
            },
        ];
        assert_eq!(mean_spectrum(&samples), vec![2.0, 3.0]);
        assert!(mean_spectrum(&[]).is_empty());
    }
}
