//! Reference tone generator: a plain sine oscillator the user can play to
//! tune by ear. The frequency can be retuned while playing without a click,
//! because the phase is carried across changes.

use std::f64::consts::TAU;

/// Output level of the reference tone.
pub const TONE_AMPLITUDE: f32 = 0.25;

#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency: f64,
    sample_rate: f64,
    phase: f64,
}

impl ToneGenerator {
    pub fn new(frequency: f64, sample_rate: u32) -> Self {
        Self {
            frequency,
            sample_rate: sample_rate as f64,
            phase: 0.0,
        }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn set_frequency(&mut self, frequency: f64) {
        self.frequency = frequency;
    }

    pub fn next_sample(&mut self) -> f32 {
        let value = (self.phase * TAU).sin() as f32 * TONE_AMPLITUDE;
        self.phase = (self.phase + self.frequency / self.sample_rate).fract();
        value
    }

    /// Fills an interleaved buffer, writing the same sample to every channel.
    pub fn fill_interleaved(&mut self, data: &mut [f32], channels: usize) {
        for frame in data.chunks_mut(channels.max(1)) {
            let value = self.next_sample();
            frame.fill(value);
        }
    }
}
