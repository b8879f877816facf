//! # Pitch Detection Module
//!
//! The frequency estimator is a collaborator of the session: it turns one
//! fixed-size buffer into a best-effort fundamental, or nothing. The session
//! only depends on the [`FrequencyEstimator`] and [`EstimatorFactory`]
//! traits; [`YinEstimator`] is the implementation used with real devices.
//!
//! ## Default estimator
//! - YIN difference function with cumulative mean normalization
//! - RMS noise gate and a clarity check to reject noise
//! - Parabolic interpolation for sub-sample accuracy
//! - Refinement against the magnitude spectrum

use crate::error::{Result, TunerError};
use crate::fft::SpectrumAnalyzer;

/// Minimum RMS for a buffer to be analysed at all.
pub const AMPLITUDE_THRESHOLD: f32 = 0.01;

/// Dips of the normalized difference below this value count as periodic.
const YIN_THRESHOLD: f32 = 0.1;

/// Highest fundamental the default estimator reports.
const MAX_FREQUENCY: f32 = 2000.0;

/// Lowest fundamental the default estimator reports.
const MIN_FREQUENCY: f32 = 20.0;

/// Converts one analysis buffer into a fundamental frequency.
pub trait FrequencyEstimator {
    /// Returns the fundamental in Hz, or `None` when no pitch is found.
    /// `None` is a normal per-buffer outcome, not an error.
    fn estimate(&mut self, buffer: &[f32]) -> Option<f64>;
}

/// Builds estimators bound to a buffer size and sample rate.
pub trait EstimatorFactory {
    fn create(&self, buffer_size: usize, sample_rate: u32) -> Result<Box<dyn FrequencyEstimator>>;
}

/// Factory for [`YinEstimator`].
#[derive(Debug, Default, Clone, Copy)]
pub struct YinFactory;

impl EstimatorFactory for YinFactory {
    fn create(&self, buffer_size: usize, sample_rate: u32) -> Result<Box<dyn FrequencyEstimator>> {
        Ok(Box::new(YinEstimator::new(buffer_size, sample_rate)?))
    }
}

/// YIN pitch detector with spectrum refinement.
pub struct YinEstimator {
    buffer_size: usize,
    sample_rate: u32,
    min_period: usize,
    yin_buffer: Vec<f32>,
    spectrum: SpectrumAnalyzer,
}

impl YinEstimator {
    /// # Errors
    /// * `EstimatorInit` if the buffer is too short to hold two periods of
    ///   the lowest reportable frequency, or the sample rate is zero
    pub fn new(buffer_size: usize, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(TunerError::EstimatorInit("sample rate must be non-zero".into()));
        }
        if buffer_size < 64 {
            return Err(TunerError::EstimatorInit(format!(
                "buffer size {buffer_size} is too small (minimum 64)"
            )));
        }

        let min_period = ((sample_rate as f32 / MAX_FREQUENCY) as usize).max(2);
        Ok(Self {
            buffer_size,
            sample_rate,
            min_period,
            yin_buffer: vec![0.0; buffer_size / 2],
            spectrum: SpectrumAnalyzer::new(buffer_size),
        })
    }

    /// Cumulative mean normalized difference, written into `yin_buffer`.
    fn normalized_difference(&mut self, signal: &[f32]) {
        let half = self.yin_buffer.len();
        self.yin_buffer[0] = 1.0;

        let mut running_sum = 0.0;
        for tau in 1..half {
            let diff: f32 = signal[..half]
                .iter()
                .zip(&signal[tau..tau + half])
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            running_sum += diff;
            self.yin_buffer[tau] = if running_sum > 0.0 {
                diff * tau as f32 / running_sum
            } else {
                1.0
            };
        }
    }

    /// First dip under the threshold, followed down to its local minimum.
    fn best_period(&self) -> Option<usize> {
        let d = &self.yin_buffer;
        let last = d.len().checked_sub(1)?;

        let mut tau = self.min_period;
        while tau < last {
            if d[tau] < YIN_THRESHOLD {
                while tau + 1 < last && d[tau + 1] < d[tau] {
                    tau += 1;
                }
                return Some(tau);
            }
            tau += 1;
        }
        None
    }

    fn interpolate(&self, period: usize) -> f32 {
        let y1 = self.yin_buffer[period - 1];
        let y2 = self.yin_buffer[period];
        let y3 = self.yin_buffer[period + 1];
        let denominator = y1 - 2.0 * y2 + y3;
        if denominator.abs() > f32::EPSILON {
            period as f32 + (y1 - y3) / (2.0 * denominator)
        } else {
            period as f32
        }
    }
}

impl FrequencyEstimator for YinEstimator {
    fn estimate(&mut self, buffer: &[f32]) -> Option<f64> {
        if buffer.len() != self.buffer_size {
            return None;
        }

        let rms = (buffer.iter().map(|&s| s * s).sum::<f32>() / buffer.len() as f32).sqrt();
        if rms < AMPLITUDE_THRESHOLD {
            return None;
        }

        self.normalized_difference(buffer);
        let period = self.best_period()?;
        let rough = self.sample_rate as f32 / self.interpolate(period);
        if !rough.is_finite() || !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&rough) {
            return None;
        }

        let refined = self
            .spectrum
            .magnitudes(buffer)
            .and_then(|mags| refine_from_spectrum(&mags, rough, self.sample_rate))
            .unwrap_or(rough);
        Some(refined as f64)
    }
}

/// Refines a rough estimate by log-parabolic interpolation of the spectral
/// peak nearest to it. Returns `None` when the spectrum gives no better
/// answer than one bin away from the rough estimate.
pub fn refine_from_spectrum(magnitudes: &[f32], rough: f32, sample_rate: u32) -> Option<f32> {
    if magnitudes.len() < 3 || rough <= 0.0 {
        return None;
    }
    let fft_size = magnitudes.len() * 2;
    let bin_width = sample_rate as f32 / fft_size as f32;
    let target = rough / bin_width;

    let start = ((target - 2.0).max(1.0)) as usize;
    let end = ((target + 2.0) as usize).min(magnitudes.len() - 2);
    if start >= end {
        return None;
    }

    let peak = (start..=end).max_by(|&a, &b| magnitudes[a].total_cmp(&magnitudes[b]))?;
    let (y1, y2, y3) = (
        magnitudes[peak - 1].ln(),
        magnitudes[peak].ln(),
        magnitudes[peak + 1].ln(),
    );
    if !(y1.is_finite() && y2.is_finite() && y3.is_finite()) {
        return None;
    }

    let denominator = 2.0 * y2 - y1 - y3;
    if denominator.abs() < 1e-6 {
        return None;
    }
    let bin = peak as f32 + (y3 - y1) / (2.0 * denominator);
    if (bin - target).abs() > 1.0 {
        return None;
    }

    let refined = bin * bin_width;
    (refined.is_finite() && refined > 0.0).then_some(refined)
}
