//! Measurement configuration and its validation.
//!
//! The number of hardware averages is not an operator setting. It is derived
//! from the integration time so that short exposures are averaged more and
//! long ones stay responsive:
//!
//! | integration time | averages |
//! |------------------|----------|
//! | < 10 ms          | 10       |
//! | < 100 ms         | 5        |
//! | < 1000 ms        | 2        |
//! | otherwise        | 1        |
//!
//! Boundary values fall into the lower bucket (10 ms averages 5).

use rig_core::error::ConfigurationError;
use rig_core::settings::SpectrometerSettings;
use serde::{Deserialize, Serialize};

/// Longest scan kept from the detector.
pub const MAX_SCAN_PIXELS: usize = 2048;
/// Detector full-scale count.
pub const FULL_SCALE: f64 = 100_000.0;
/// A scan with any sample above this is saturated (90 % of full scale).
pub const SATURATION_THRESHOLD: f64 = 0.9 * FULL_SCALE;

/// Shortest accepted integration time, ms.
pub const MIN_INTEGRATION_MS: f64 = 1.0;
/// Longest accepted integration time, ms.
pub const MAX_INTEGRATION_MS: f64 = 10_000.0;
/// Cycles and repetitions are clamped into 1..=100.
pub const MAX_CYCLES: u32 = 100;

/// Hardware averages for an integration time.
pub fn averages_for_integration(integration_ms: f64) -> u32 {
    if integration_ms < 10.0 {
        10
    } else if integration_ms < 100.0 {
        5
    } else if integration_ms < 1000.0 {
        2
    } else {
        1
    }
}

/// Inclusive detector pixel range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRange {
    /// First pixel.
    pub start: usize,
    /// Last pixel (inclusive).
    pub stop: usize,
}

impl PixelRange {
    /// Every pixel of an `n`-pixel detector.
    pub fn full(pixels: usize) -> Self {
        Self {
            start: 0,
            stop: pixels.saturating_sub(1),
        }
    }

    /// Clamp into `[0, pixels)`; an inverted range becomes the full range.
    pub fn clamp_to(self, pixels: usize) -> Self {
        let last = pixels.saturating_sub(1);
        let start = self.start.min(last);
        let stop = self.stop.min(last);
        if stop < start {
            Self::full(pixels)
        } else {
            Self { start, stop }
        }
    }

    /// Number of pixels covered.
    pub fn len(&self) -> usize {
        (self.stop + 1).saturating_sub(self.start)
    }

    /// Whether the range covers no pixel.
    pub fn is_empty(&self) -> bool {
        self.stop < self.start
    }
}

/// What the operator (or a routine) asks for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRequest {
    /// Integration time, ms.
    pub integration_ms: f64,
    /// Hardware cycles.
    pub cycles: u32,
    /// Hardware repetitions.
    pub repetitions: u32,
    /// Pixel window; the whole detector when `None`.
    pub pixel_range: Option<PixelRange>,
}

impl Default for MeasurementRequest {
    fn default() -> Self {
        Self {
            integration_ms: 50.0,
            cycles: 1,
            repetitions: 1,
            pixel_range: None,
        }
    }
}

impl From<&SpectrometerSettings> for MeasurementRequest {
    fn from(settings: &SpectrometerSettings) -> Self {
        Self {
            integration_ms: settings.integration_ms,
            cycles: settings.cycles,
            repetitions: settings.repetitions,
            pixel_range: None,
        }
    }
}

impl MeasurementRequest {
    /// Same request with another integration time.
    #[must_use]
    pub fn with_integration(mut self, integration_ms: f64) -> Self {
        self.integration_ms = integration_ms;
        self
    }
}

/// A validated configuration ready for `prepare_measure`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeasurementConfig {
    /// Integration time, ms, within 1..=10000.
    pub integration_ms: f64,
    /// Derived from the integration time.
    pub averages: u32,
    /// Within 1..=100.
    pub cycles: u32,
    /// Within 1..=100.
    pub repetitions: u32,
    /// Within the detector.
    pub pixel_range: PixelRange,
}

impl MeasurementConfig {
    /// Validate `request` against a detector with `pixels` pixels.
    ///
    /// Integration time is rejected when out of range; cycles, repetitions
    /// and the pixel range are clamped.
    pub fn from_request(
        request: &MeasurementRequest,
        pixels: usize,
    ) -> Result<Self, ConfigurationError> {
        let it = request.integration_ms;
        if !it.is_finite() || !(MIN_INTEGRATION_MS..=MAX_INTEGRATION_MS).contains(&it) {
            return Err(ConfigurationError::IntegrationOutOfRange(it));
        }
        if pixels == 0 {
            return Err(ConfigurationError::Invalid(
                "detector has no pixels".to_string(),
            ));
        }

        let pixel_range = request
            .pixel_range
            .map_or_else(|| PixelRange::full(pixels), |r| r.clamp_to(pixels));

        Ok(Self {
            integration_ms: it,
            averages: averages_for_integration(it),
            cycles: request.cycles.clamp(1, MAX_CYCLES),
            repetitions: request.repetitions.clamp(1, MAX_CYCLES),
            pixel_range,
        })
    }
}

/// Truncate or zero-pad raw scope data to `min(MAX_SCAN_PIXELS, pixels)`.
pub fn fit_scan(raw: &[f64], pixels: usize) -> Vec<f64> {
    let len = pixels.min(MAX_SCAN_PIXELS);
    let mut out = vec![0.0; len];
    let n = raw.len().min(len);
    out[..n].copy_from_slice(&raw[..n]);
    out
}

/// Whether any sample exceeds the saturation threshold.
pub fn is_saturated(scan: &[f64]) -> bool {
    scan.iter().any(|&v| v > SATURATION_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_follow_integration_buckets() {
        assert_eq!(averages_for_integration(5.0), 10);
        assert_eq!(averages_for_integration(50.0), 5);
        assert_eq!(averages_for_integration(500.0), 2);
        assert_eq!(averages_for_integration(5000.0), 1);
    }

    #[test]
    fn bucket_boundaries_take_the_lower_average() {
        assert_eq!(averages_for_integration(10.0), 5);
        assert_eq!(averages_for_integration(100.0), 2);
        assert_eq!(averages_for_integration(1000.0), 1);
        assert_eq!(averages_for_integration(9.999), 10);
    }

    #[test]
    fn integration_out_of_range_is_rejected() {
        for it in [0.5, 10_000.5, f64::NAN] {
            let request = MeasurementRequest::default().with_integration(it);
            assert!(matches!(
                MeasurementConfig::from_request(&request, 2048),
                Err(ConfigurationError::IntegrationOutOfRange(_))
            ));
        }
    }

    #[test]
    fn cycles_and_pixel_range_are_clamped() {
        let request = MeasurementRequest {
            integration_ms: 1.0,
            cycles: 0,
            repetitions: 500,
            pixel_range: Some(PixelRange {
                start: 10,
                stop: 5000,
            }),
        };
        let config = MeasurementConfig::from_request(&request, 1024).unwrap();
        assert_eq!(config.cycles, 1);
        assert_eq!(config.repetitions, 100);
        assert_eq!(config.averages, 10);
        assert_eq!(config.pixel_range, PixelRange { start: 10, stop: 1023 });
        assert_eq!(config.pixel_range.len(), 1014);
    }

    #[test]
    fn inverted_range_falls_back_to_full_detector() {
        let range = PixelRange { start: 900, stop: 10 }.clamp_to(512);
        assert_eq!(range, PixelRange::full(512));
    }

    #[test]
    fn scans_fit_detector_and_cap() {
        assert_eq!(fit_scan(&[1.0, 2.0], 4), vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(fit_scan(&[1.0; 3000], 4096).len(), MAX_SCAN_PIXELS);
        assert_eq!(fit_scan(&[1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
    }

    #[test]
    fn saturation_is_strictly_above_ninety_percent() {
        assert!(!is_saturated(&[90_000.0, 10.0]));
        assert!(is_saturated(&[90_000.5]));
    }
}
