//! Layered rig settings.
//!
//! Loaded with Figment in three layers, each overriding the previous one:
//!
//! 1. Base layer: [`RigSettings::default()`]
//! 2. File layer: a TOML file (optional, skipped when missing)
//! 3. Environment layer: variables prefixed with `SPECRIG_`, nested fields
//!    separated by double underscores
//!
//! # Environment Variables
//!
//! - `SPECRIG_LOG_LEVEL=debug` sets `log_level`
//! - `SPECRIG_PORTS__MOTOR=/dev/ttyUSB1` sets `ports.motor`
//! - `SPECRIG_PIPELINE__COOLDOWN_MS=3000` sets `pipeline.cooldown_ms`
//!
//! # Example
//!
//! ```toml
//! log_level = "info"
//!
//! [ports]
//! motor = "/dev/ttyUSB0"
//! filter_wheel = "/dev/ttyUSB1"
//!
//! [spectrometer]
//! integration_ms = 100.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigurationError;

/// Default location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "config/specrig.toml";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigSettings {
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Per-device serial ports.
    pub ports: PortSettings,
    /// Motor behaviour.
    pub motor: MotorSettings,
    /// Filter wheel behaviour.
    pub filter_wheel: FilterWheelSettings,
    /// THP polling.
    pub thp: ThpSettings,
    /// Spectrometer defaults and timers.
    pub spectrometer: SpectrometerSettings,
    /// Averaging pipeline cadence and hazard policy.
    pub pipeline: PipelineSettings,
    /// Output directories.
    pub storage: StorageSettings,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            ports: PortSettings::default(),
            motor: MotorSettings::default(),
            filter_wheel: FilterWheelSettings::default(),
            thp: ThpSettings::default(),
            spectrometer: SpectrometerSettings::default(),
            pipeline: PipelineSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

/// Serial port names; a device without a port is not started.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// AZ-series motor driver.
    pub motor: Option<String>,
    /// Filter wheel.
    pub filter_wheel: Option<String>,
    /// THP sensor.
    pub thp_sensor: Option<String>,
}

/// Motor behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    /// Modbus slave address.
    pub slave_id: u8,
    /// Move to 0 degrees right after connecting.
    pub home_on_connect: bool,
    /// Routine settle delay after a move command.
    pub settle_ms: u64,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            slave_id: 2,
            home_on_connect: true,
            settle_ms: 500,
        }
    }
}

/// Filter wheel behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterWheelSettings {
    /// Routine settle delay after a position command.
    pub settle_ms: u64,
}

impl Default for FilterWheelSettings {
    fn default() -> Self {
        Self { settle_ms: 1500 }
    }
}

/// THP polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThpSettings {
    /// Interval between reads.
    pub poll_interval_ms: u64,
}

impl Default for ThpSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
        }
    }
}

/// Spectrometer defaults and timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrometerSettings {
    /// Vendor device index.
    pub device_index: usize,
    /// Integration time used on start, ms.
    pub integration_ms: f64,
    /// Hardware cycles per measurement.
    pub cycles: u32,
    /// Hardware repetitions per measurement.
    pub repetitions: u32,
    /// Connect automatically at startup.
    pub auto_connect: bool,
    /// Delay before the automatic connection.
    pub auto_connect_delay_ms: u64,
    /// Backoff before retrying a failed automatic connection.
    pub retry_backoff_ms: u64,
    /// Watchdog period.
    pub watchdog_ms: u64,
}

impl Default for SpectrometerSettings {
    fn default() -> Self {
        Self {
            device_index: 0,
            integration_ms: 50.0,
            cycles: 1,
            repetitions: 1,
            auto_connect: true,
            auto_connect_delay_ms: 500,
            retry_backoff_ms: 5000,
            watchdog_ms: 1000,
        }
    }
}

/// Averaging pipeline cadence and hazard policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Collection tick period.
    pub collection_ms: u64,
    /// Added to the integration time to get the emit period.
    pub emit_buffer_ms: u64,
    /// Lower bound of the emit period.
    pub emit_min_ms: u64,
    /// Upper bound of the emit period.
    pub emit_max_ms: u64,
    /// Motor change that counts as a hazard, degrees.
    pub angle_threshold_deg: f64,
    /// Pause after a hazard.
    pub cooldown_ms: u64,
    /// Records buffered before a disk flush.
    pub flush_every: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            collection_ms: 250,
            emit_buffer_ms: 200,
            emit_min_ms: 1000,
            emit_max_ms: 5000,
            angle_threshold_deg: 0.5,
            cooldown_ms: 2000,
            flush_every: 5,
        }
    }
}

impl PipelineSettings {
    /// Collection tick period.
    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_ms)
    }

    /// Emit period for a given integration time.
    pub fn emit_interval(&self, integration_ms: f64) -> Duration {
        let raw = integration_ms.max(0.0).round() as u64 + self.emit_buffer_ms;
        Duration::from_millis(raw.clamp(self.emit_min_ms, self.emit_max_ms))
    }

    /// Hazard pause.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Output directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Averaged record files and final routine data.
    pub data_dir: PathBuf,
    /// Spectrum snapshots.
    pub snapshot_dir: PathBuf,
    /// Peak logs.
    pub log_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            snapshot_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl RigSettings {
    /// Load settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(RigSettings::default()));

        let file_path = path.map_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH), Path::to_path_buf);
        if file_path.exists() {
            debug!(path = %file_path.display(), "loading settings file");
            figment = figment.merge(Toml::file(&file_path));
        } else if path.is_some() {
            warn!(path = %file_path.display(), "settings file not found, using defaults");
        }

        figment = figment.merge(Env::prefixed("SPECRIG_").split("__"));

        let settings: RigSettings = figment
            .extract()
            .context("Failed to extract settings from Figment")?;
        settings.validate().context("Settings validation failed")?;
        Ok(settings)
    }

    /// Semantic checks that parsing cannot express.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let it = self.spectrometer.integration_ms;
        if !(1.0..=10000.0).contains(&it) {
            return Err(ConfigurationError::IntegrationOutOfRange(it));
        }
        for (field, value) in [
            ("spectrometer.cycles", self.spectrometer.cycles),
            ("spectrometer.repetitions", self.spectrometer.repetitions),
        ] {
            if !(1..=100).contains(&value) {
                return Err(ConfigurationError::OutOfRange {
                    field,
                    value: i64::from(value),
                    min: 1,
                    max: 100,
                });
            }
        }
        if self.pipeline.collection_ms == 0 {
            return Err(ConfigurationError::Invalid(
                "pipeline.collection_ms must be positive".into(),
            ));
        }
        if self.pipeline.emit_min_ms > self.pipeline.emit_max_ms {
            return Err(ConfigurationError::Invalid(
                "pipeline.emit_min_ms exceeds pipeline.emit_max_ms".into(),
            ));
        }
        if self.pipeline.flush_every == 0 {
            return Err(ConfigurationError::Invalid(
                "pipeline.flush_every must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        assert!(RigSettings::default().validate().is_ok());
    }

    #[test]
    fn emit_interval_tracks_integration_time() {
        let p = PipelineSettings::default();
        assert_eq!(p.emit_interval(50.0), Duration::from_millis(1000));
        assert_eq!(p.emit_interval(2000.0), Duration::from_millis(2200));
        assert_eq!(p.emit_interval(9000.0), Duration::from_millis(5000));
    }

    #[test]
    #[serial]
    fn file_layer_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[ports]\nmotor = \"/dev/ttyUSB7\"\n\n[spectrometer]\nintegration_ms = 120.0"
        )
        .unwrap();

        let settings = RigSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.ports.motor.as_deref(), Some("/dev/ttyUSB7"));
        assert_eq!(settings.spectrometer.integration_ms, 120.0);
        assert_eq!(settings.pipeline.cooldown_ms, 2000);
    }

    #[test]
    #[serial]
    fn environment_layer_overrides_file() {
        std::env::set_var("SPECRIG_PIPELINE__COOLDOWN_MS", "3000");
        let settings = RigSettings::load(Some(Path::new("does/not/exist.toml")));
        std::env::remove_var("SPECRIG_PIPELINE__COOLDOWN_MS");
        assert_eq!(settings.unwrap().pipeline.cooldown_ms, 3000);
    }

    #[test]
    fn out_of_range_integration_is_rejected() {
        let mut settings = RigSettings::default();
        settings.spectrometer.integration_ms = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(ConfigurationError::IntegrationOutOfRange(_))
        ));
    }
}
