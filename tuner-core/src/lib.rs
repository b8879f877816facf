// tuner-core/src/lib.rs

//! The core logic for the heptatonic instrument tuner.
//! This crate maps detected frequencies onto a seven-step scale and owns
//! the lifecycle of the audio capture session. It is completely headless
//! and contains no GUI code.

pub mod audio;
pub mod cpal_io;
pub mod error;
pub mod facade;
pub mod fft;
pub mod pitch;
pub mod session;
pub mod settings;
pub mod tone;
pub mod tuning;

pub use error::{FailureKind, Result, SessionFailure, TunerError};
pub use facade::{TunerEvent, TunerFacade};
pub use session::{AudioSession, SessionState};

/// A note recognised in a single analysis frame.
///
/// Produced once per buffer that yields a pitch and handed straight to the
/// listeners; never stored by the core.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedNote {
    /// Display name of the scale step.
    pub name: String,
    /// Position in the repeating scale, offset so the reference note is 42.
    pub note_index: i32,
    pub octave: i32,
    /// Deviation from the in-tune pitch, floored.
    pub cents: i32,
    /// The estimated fundamental in Hz.
    pub frequency: f64,
}
