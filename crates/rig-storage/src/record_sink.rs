//! Delimited record sink and peak log.
//!
//! One `Scans_<ts>_mini.csv` per data-saving session: a header naming every
//! channel and one `Pixel_<i>` column per detector pixel, then one row per
//! [`AveragedRecord`]. Alongside it `log_<ts>.txt` gets one line per record
//! with the peak of the averaged spectrum. A second session started in the
//! same second gets `_1`, `_2`, ... after the stamp instead of truncating
//! the first.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::pipeline::AveragedRecord;

/// Timestamp format used inside records and logs.
pub const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Timestamp format used in file names.
pub const FILE_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Channel columns preceding the pixel columns.
pub const CHANNEL_COLUMNS: [&str; 24] = [
    "Timestamp",
    "MotorAngle_deg",
    "FilterPos",
    "Roll_deg",
    "Pitch_deg",
    "Yaw_deg",
    "AccelX_g",
    "AccelY_g",
    "AccelZ_g",
    "MagX_uT",
    "MagY_uT",
    "MagZ_uT",
    "Pressure_hPa",
    "Temperature_C",
    "TempCtrl_curr",
    "TempCtrl_set",
    "TempCtrl_aux",
    "Latitude_deg",
    "Longitude_deg",
    "IntegrationTime_ms",
    "THP_Temp_C",
    "THP_Humidity_pct",
    "THP_Pressure_hPa",
    "Routine",
];

/// Header row for `pixels` detector pixels.
pub fn header(pixels: usize) -> Vec<String> {
    CHANNEL_COLUMNS
        .iter()
        .map(|c| (*c).to_string())
        .chain((0..pixels).map(|i| format!("Pixel_{i}")))
        .collect()
}

fn fixed(value: f64, decimals: usize) -> String {
    format!("{value:.decimals$}")
}

/// One record as CSV fields, padded or truncated to `pixels`.
pub fn record_fields(record: &AveragedRecord, pixels: usize) -> Vec<String> {
    let hw = &record.hardware;
    let imu = hw.environment.imu.unwrap_or_default();
    let tc = hw.environment.temp_controller.unwrap_or_default();
    let thp = hw.environment.thp.clone().unwrap_or_default();

    let mut fields = Vec::with_capacity(CHANNEL_COLUMNS.len() + pixels);
    fields.push(record.timestamp.format(RECORD_TIME_FORMAT).to_string());
    fields.push(hw.motor.angle_deg.map(|a| fixed(a, 2)).unwrap_or_default());
    fields.push(hw.filter.position.map(|p| p.to_string()).unwrap_or_default());
    for value in imu.rpy_deg.iter().chain(&imu.accel_g).chain(&imu.mag_ut) {
        fields.push(fixed(*value, 2));
    }
    fields.push(fixed(imu.pressure_hpa, 2));
    fields.push(fixed(imu.temperature_c, 2));
    fields.push(fixed(tc.current_c, 2));
    fields.push(fixed(tc.setpoint_c, 2));
    fields.push(fixed(tc.auxiliary_c, 2));
    fields.push(fixed(imu.latitude_deg, 6));
    fields.push(fixed(imu.longitude_deg, 6));
    fields.push(fixed(hw.integration_ms, 2));
    fields.push(fixed(thp.temperature_c, 2));
    fields.push(fixed(thp.humidity_pct, 2));
    fields.push(fixed(thp.pressure_hpa, 2));
    fields.push(record.routine.clone().unwrap_or_default());
    fields.extend(
        (0..pixels).map(|i| fixed(record.mean.get(i).copied().unwrap_or_default(), 4)),
    );
    fields
}

/// Peak log line for one record.
pub fn peak_line(record: &AveragedRecord) -> String {
    format!(
        "{} | Peak {:.1} (avg of {} samples)",
        record.timestamp.format(RECORD_TIME_FORMAT),
        record.peak(),
        record.samples
    )
}

/// First free `(record file, peak log)` pair for a session stamp.
fn session_paths(data_dir: &Path, log_dir: &Path, stamp: &str) -> (PathBuf, PathBuf) {
    let mut tag = stamp.to_string();
    let mut n = 1;
    loop {
        let data_path = data_dir.join(format!("Scans_{tag}_mini.csv"));
        let log_path = log_dir.join(format!("log_{tag}.txt"));
        if !data_path.exists() && !log_path.exists() {
            return (data_path, log_path);
        }
        tag = format!("{stamp}_{n}");
        n += 1;
    }
}

/// Paths and row count of a closed sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSummary {
    /// Record file.
    pub data_path: PathBuf,
    /// Peak log.
    pub log_path: PathBuf,
    /// Rows written.
    pub rows: usize,
}

/// Open record file plus peak log.
#[derive(Debug)]
pub struct RecordSink {
    writer: csv::Writer<File>,
    log: BufWriter<File>,
    data_path: PathBuf,
    log_path: PathBuf,
    pixels: usize,
    flush_every: usize,
    unflushed: usize,
    rows: usize,
}

impl RecordSink {
    /// Create both files and write the header.
    pub fn create(
        data_dir: &Path,
        log_dir: &Path,
        pixels: usize,
        flush_every: usize,
        started: DateTime<Local>,
    ) -> Result<Self> {
        let stamp = started.format(FILE_TIME_FORMAT).to_string();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let (data_path, log_path) = session_paths(data_dir, log_dir, &stamp);

        let file = File::create(&data_path)
            .with_context(|| format!("Failed to create {}", data_path.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(header(pixels))
            .context("Failed to write record header")?;
        writer.flush().context("Failed to flush record header")?;

        let log = File::create(&log_path)
            .with_context(|| format!("Failed to create {}", log_path.display()))?;

        info!(path = %data_path.display(), pixels, "record sink opened");
        Ok(Self {
            writer,
            log: BufWriter::new(log),
            data_path,
            log_path,
            pixels,
            flush_every: flush_every.max(1),
            unflushed: 0,
            rows: 0,
        })
    }

    /// Record file path.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Append one record, flushing every `flush_every` rows.
    pub fn append(&mut self, record: &AveragedRecord) -> Result<()> {
        self.writer
            .write_record(record_fields(record, self.pixels))
            .context("Failed to write record")?;
        writeln!(self.log, "{}", peak_line(record)).context("Failed to write peak log")?;
        self.rows += 1;
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush both files.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush records")?;
        self.log.flush().context("Failed to flush peak log")?;
        debug!(rows = self.rows, "record sink flushed");
        self.unflushed = 0;
        Ok(())
    }

    /// Flush and close.
    pub fn close(mut self) -> Result<SinkSummary> {
        self.flush()?;
        info!(path = %self.data_path.display(), rows = self.rows, "record sink closed");
        Ok(SinkSummary {
            data_path: self.data_path.clone(),
            log_path: self.log_path.clone(),
            rows: self.rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rig_core::hardware_state::{HardwareSnapshot, MotorState, ThpReading};

    fn record(mean: Vec<f64>) -> AveragedRecord {
        let mut hardware = HardwareSnapshot {
            motor: MotorState {
                angle_deg: Some(45.0),
            },
            integration_ms: 50.0,
            ..HardwareSnapshot::default()
        };
        hardware.filter.position = Some(3);
        hardware.environment.thp = Some(ThpReading {
            sensor_id: None,
            temperature_c: 21.456,
            humidity_pct: 40.0,
            pressure_hpa: 1013.25,
        });
        AveragedRecord {
            timestamp: Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap(),
            mean,
            samples: 4,
            hardware,
            routine: Some("scan_a".into()),
        }
    }

    #[test]
    fn header_lists_channels_then_pixels() {
        let h = header(3);
        assert_eq!(h.len(), CHANNEL_COLUMNS.len() + 3);
        assert_eq!(h[0], "Timestamp");
        assert_eq!(h[23], "Routine");
        assert_eq!(&h[24..], ["Pixel_0", "Pixel_1", "Pixel_2"]);
    }

    #[test]
    fn fields_use_fixed_precision() {
        let fields = record_fields(&record(vec![1.0, 2.5]), 3);
        assert_eq!(fields[0], "2024-03-01 12:30:05.000");
        assert_eq!(fields[1], "45.00");
        assert_eq!(fields[2], "3");
        assert_eq!(fields[17], "0.000000");
        assert_eq!(fields[19], "50.00");
        assert_eq!(fields[20], "21.46");
        assert_eq!(fields[22], "1013.25");
        assert_eq!(fields[23], "scan_a");
        assert_eq!(&fields[24..], ["1.0000", "2.5000", "0.0000"]);
    }

    #[test]
    fn unknown_motor_and_filter_are_blank() {
        let mut r = record(vec![]);
        r.hardware.motor.angle_deg = None;
        r.hardware.filter.position = None;
        let fields = record_fields(&r, 0);
        assert_eq!(fields[1], "");
        assert_eq!(fields[2], "");
    }

    #[test]
    fn peak_line_format() {
        assert_eq!(
            peak_line(&record(vec![10.0, 1234.56])),
            "2024-03-01 12:30:05.000 | Peak 1234.6 (avg of 4 samples)"
        );
    }

    #[test]
    fn sink_writes_rows_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let started = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut sink = RecordSink::create(dir.path(), &dir.path().join("logs"), 2, 5, started).unwrap();
        assert!(sink.data_path().ends_with("Scans_20240301_120000_mini.csv"));

        sink.append(&record(vec![1.0, 2.0])).unwrap();
        sink.append(&record(vec![3.0, 4.0])).unwrap();
        let summary = sink.close().unwrap();
        assert_eq!(summary.rows, 2);

        let mut reader = csv::Reader::from_path(&summary.data_path).unwrap();
        assert_eq!(reader.headers().unwrap().len(), CHANNEL_COLUMNS.len() + 2);
        let rows: Vec<_> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][25], "4.0000");

        let log = fs::read_to_string(&summary.log_path).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.lines().all(|l| l.contains("(avg of 4 samples)")));
    }

    #[test]
    fn sessions_in_the_same_second_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let started = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let mut first = RecordSink::create(dir.path(), &logs, 2, 1, started).unwrap();
        first.append(&record(vec![1.0, 2.0])).unwrap();
        let first = first.close().unwrap();

        let second = RecordSink::create(dir.path(), &logs, 2, 1, started).unwrap();
        let third = RecordSink::create(dir.path(), &logs, 2, 1, started).unwrap();
        assert!(second.data_path().ends_with("Scans_20240301_120000_1_mini.csv"));
        assert!(third.data_path().ends_with("Scans_20240301_120000_2_mini.csv"));
        let second = second.close().unwrap();
        assert!(second.log_path.ends_with("log_20240301_120000_1.txt"));
        assert_ne!(first.log_path, second.log_path);

        let rows = csv::Reader::from_path(&first.data_path).unwrap().records().count();
        assert_eq!(rows, 1);
    }
}
