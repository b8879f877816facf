//! # Spectrum Module
//!
//! Magnitude spectra for the default estimator's refinement step.
//! The FFT plan and the Hann window are computed once per analysis size and
//! reused for every buffer.

use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex};

/// Computes magnitude spectra of fixed-size buffers.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    /// Plans a forward FFT of `size` points. `size` must be at least 2.
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let last = (size.max(2) - 1) as f32;
        let window = (0..size)
            .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / last).cos()))
            .collect();

        Self {
            fft,
            window,
            scratch: Vec::with_capacity(size),
        }
    }

    pub fn size(&self) -> usize {
        self.window.len()
    }

    /// Returns the magnitudes of the first `size / 2` bins (up to Nyquist).
    ///
    /// The signal is DC-centred and Hann-windowed first. Returns `None` if
    /// the buffer length does not match the planned size.
    pub fn magnitudes(&mut self, signal: &[f32]) -> Option<Vec<f32>> {
        if signal.len() != self.size() {
            return None;
        }

        let mean = signal.iter().sum::<f32>() / signal.len() as f32;
        self.scratch.clear();
        self.scratch.extend(
            signal
                .iter()
                .zip(&self.window)
                .map(|(&sample, &w)| Complex::new((sample - mean) * w, 0.0)),
        );

        self.fft.process(&mut self.scratch);
        Some(
            self.scratch
                .iter()
                .take(self.size() / 2)
                .map(|c| c.norm())
                .collect(),
        )
    }
}
