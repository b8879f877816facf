//! # Musical Tuning Module
//!
//! Pitch math and note naming for a seven-step-per-octave scale.
//!
//! Every mapping here is a pure function of a [`TuningReference`]: the
//! frequency assigned to the reference note (index [`REFERENCE_NOTE_INDEX`]).
//! Changing the reference therefore invalidates no stored state.
//!
//! ## Features
//! - Frequency to note index conversion (closed-form, no candidate search)
//! - Standard frequency of any note index
//! - Cent deviation, normalized so one step spans the same musical "cents"
//!   range as a 12-tone semitone
//! - Note names and octaves over all integers (negative indices included)

use serde::{Deserialize, Serialize};

use crate::DetectedNote;
use crate::error::{Result, TunerError};

/// Number of scale steps per octave.
pub const STEPS_PER_OCTAVE: i32 = 7;

/// Note index that sounds at exactly the tuning reference frequency.
pub const REFERENCE_NOTE_INDEX: i32 = 42;

/// Reference frequency used when nothing (valid) has been configured.
pub const DEFAULT_REFERENCE_HZ: f64 = 230.3;

/// The frequency assigned to the reference note, in Hz.
///
/// Always finite and strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct TuningReference(f64);

impl TuningReference {
    /// Validates a reference frequency.
    ///
    /// # Arguments
    /// * `hz` - Frequency of the reference note
    ///
    /// # Returns
    /// * `Ok(reference)` - If `hz` is finite and strictly positive
    /// * `Err(InvalidReference)` - Otherwise
    pub fn new(hz: f64) -> Result<Self> {
        if hz.is_finite() && hz > 0.0 {
            Ok(Self(hz))
        } else {
            Err(TunerError::InvalidReference(hz))
        }
    }

    /// The reference frequency in Hz.
    pub fn hz(self) -> f64 {
        self.0
    }
}

impl Default for TuningReference {
    fn default() -> Self {
        Self(DEFAULT_REFERENCE_HZ)
    }
}

impl TryFrom<f64> for TuningReference {
    type Error = TunerError;

    fn try_from(hz: f64) -> Result<Self> {
        Self::new(hz)
    }
}

impl From<TuningReference> for f64 {
    fn from(reference: TuningReference) -> f64 {
        reference.0
    }
}

fn check_frequency(frequency: f64) -> Result<f64> {
    if frequency.is_finite() && frequency > 0.0 {
        Ok(frequency)
    } else {
        Err(TunerError::InvalidFrequency(frequency))
    }
}

/// Rounds to the nearest integer; exact halves go toward positive infinity.
///
/// For positive inputs this is identical to round-half-away-from-zero
/// (`0.5 -> 1`, `2.5 -> 3`). For negative ties it rounds up (`-0.5 -> 0`,
/// `-1.5 -> -1`), which keeps notes just below the reference consistent with
/// the ones just above it.
fn round_half_up(value: f64) -> f64 {
    let rounded = value.round();
    if value - rounded == 0.5 {
        rounded + 1.0
    } else {
        rounded
    }
}

/// Calculates the nearest note index for a frequency.
///
/// `round(N * log2(f / ref)) + S`, see [`round_half_up`] for tie handling.
///
/// # Errors
/// * `InvalidFrequency` if `frequency` is not finite and strictly positive
pub fn note_index_from_frequency(frequency: f64, reference: TuningReference) -> Result<i32> {
    let frequency = check_frequency(frequency)?;
    let steps = STEPS_PER_OCTAVE as f64 * (frequency / reference.hz()).log2();
    Ok(round_half_up(steps) as i32 + REFERENCE_NOTE_INDEX)
}

/// Returns the in-tune frequency of a note index: `ref * 2^((k - S) / N)`.
///
/// # Arguments
/// * `note_index` - Any integer, negative included
/// * `reference` - Frequency of index [`REFERENCE_NOTE_INDEX`]
///
/// # Returns
/// The frequency in Hz. Defined for every `i32`; indices far enough out
/// underflow to `0.0` or overflow to infinity.
pub fn standard_frequency(note_index: i32, reference: TuningReference) -> f64 {
    let exponent =
        (note_index as f64 - REFERENCE_NOTE_INDEX as f64) / STEPS_PER_OCTAVE as f64;
    reference.hz() * 2.0_f64.powf(exponent)
}

/// Calculates the deviation of `frequency` from the standard frequency of
/// `note_index`, in cents.
///
/// The value is floored rather than rounded, so it is biased downward: a
/// frequency an epsilon below the exact note reads `-1`, an epsilon above
/// reads `0`. Not clamped.
///
/// # Errors
/// * `InvalidFrequency` if `frequency` is not finite and strictly positive
pub fn cents_offset(frequency: f64, note_index: i32, reference: TuningReference) -> Result<i32> {
    let frequency = check_frequency(frequency)?;
    let target = standard_frequency(note_index, reference);
    let step_width = 12.0 / STEPS_PER_OCTAVE as f64;
    Ok((1200.0 * (frequency / target).log2() / step_width).floor() as i32)
}

/// A fixed, repeating sequence of note names, one per scale step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    names: [&'static str; STEPS_PER_OCTAVE as usize],
}

impl Scale {
    /// Thai solfege, the names shown by default.
    pub const THAI: Scale = Scale {
        names: ["ด", "ร", "ม", "ฟ", "ซ", "ล", "ท"],
    };

    /// Latin transliteration of the same steps.
    pub const LATIN: Scale = Scale {
        names: ["do", "re", "mi", "fa", "sol", "la", "ti"],
    };

    /// A custom scale. `names[0]` names the reference note.
    pub const fn new(names: [&'static str; STEPS_PER_OCTAVE as usize]) -> Self {
        Self { names }
    }

    /// Name of a note index. Periodic with period [`STEPS_PER_OCTAVE`],
    /// defined for negative indices as well.
    pub fn name(&self, note_index: i32) -> &'static str {
        self.names[note_index.rem_euclid(STEPS_PER_OCTAVE) as usize]
    }

    /// Octave number of a note index: `floor(k / N) - 1`.
    pub fn octave(&self, note_index: i32) -> i32 {
        note_index.div_euclid(STEPS_PER_OCTAVE) - 1
    }

    /// All names, starting with the reference note's.
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::THAI
    }
}

/// A tuning reference paired with the scale used to name notes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tuning {
    pub reference: TuningReference,
    pub scale: Scale,
}

impl Tuning {
    pub fn new(reference: TuningReference, scale: Scale) -> Self {
        Self { reference, scale }
    }

    /// Maps a detected frequency to the nearest note of the scale.
    ///
    /// # Arguments
    /// * `frequency` - Estimated fundamental in Hz
    ///
    /// # Returns
    /// * `Ok(note)` - Name, index, octave and floored cents
    /// * `Err(InvalidFrequency)` - If `frequency` is not finite and positive
    pub fn detect(&self, frequency: f64) -> Result<DetectedNote> {
        let note_index = note_index_from_frequency(frequency, self.reference)?;
        let cents = cents_offset(frequency, note_index, self.reference)?;
        Ok(DetectedNote {
            name: self.scale.name(note_index).to_string(),
            note_index,
            octave: self.scale.octave(note_index),
            cents,
            frequency,
        })
    }

    /// Standard frequency of a note index under this tuning.
    pub fn standard_frequency(&self, note_index: i32) -> f64 {
        standard_frequency(note_index, self.reference)
    }
}
