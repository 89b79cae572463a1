//! Single-spectrum files: snapshots and final routine data.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::info;

/// Routine identity attached to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTag {
    /// Routine name.
    pub routine: String,
    /// Routine start time.
    pub started: DateTime<Local>,
    /// Optional label from `spectrometer save <name>`.
    pub label: Option<String>,
}

/// File name stamp with millisecond resolution.
pub fn snapshot_stamp(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}

fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let mut path = dir.join(format!("{stem}.csv"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}_{n}.csv"));
        n += 1;
    }
    path
}

fn write_spectrum(
    path: &Path,
    metadata: &[(String, String)],
    intensities: &[f64],
    skip_zero: bool,
) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    for (key, value) in metadata {
        writeln!(file, "# {key}: {value}")
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(["Pixel", "Intensity"])?;
    for (pixel, value) in intensities.iter().enumerate() {
        if skip_zero && *value == 0.0 {
            continue;
        }
        writer.write_record([pixel.to_string(), format!("{value:.4}")])?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

/// Write `snapshot_<ts>.csv` with the non-zero pixels of `intensities`.
pub fn write_snapshot(
    dir: &Path,
    intensities: &[f64],
    tag: Option<&SnapshotTag>,
    at: DateTime<Local>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create snapshot directory {}", dir.display()))?;
    let path = unique_path(dir, &format!("snapshot_{}", snapshot_stamp(at)));

    let mut metadata = Vec::new();
    if let Some(tag) = tag {
        metadata.push(("routine".to_string(), tag.routine.clone()));
        metadata.push((
            "routine_started".to_string(),
            tag.started.format("%Y-%m-%d %H:%M:%S").to_string(),
        ));
        if let Some(label) = &tag.label {
            metadata.push(("label".to_string(), label.clone()));
        }
    }
    write_spectrum(&path, &metadata, intensities, true)?;
    info!(path = %path.display(), "snapshot saved");
    Ok(path)
}

/// Write `final_<ts>.csv` with every pixel and `# key: value` metadata.
pub fn write_final_data(
    dir: &Path,
    intensities: &[f64],
    metadata: &[(String, String)],
    at: DateTime<Local>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    let path = unique_path(dir, &format!("final_{}", at.format("%Y%m%d_%H%M%S")));
    write_spectrum(&path, metadata, intensities, false)?;
    info!(path = %path.display(), "final routine data saved");
    Ok(path)
}
