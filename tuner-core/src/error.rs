//! # Error Module
//!
//! Error types shared by the pitch math, the audio session and the settings
//! store. Pure functions fail loudly with `InvalidFrequency` /
//! `InvalidReference`; device and estimator problems are classified into a
//! [`FailureKind`] before they reach a consumer.

use std::fmt;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TunerError>;

/// Error type for tuner-core operations.
#[derive(Debug, Error)]
pub enum TunerError {
    /// Non-positive or non-finite frequency handed to the pitch math.
    #[error("invalid frequency: {0} Hz (must be finite and > 0)")]
    InvalidFrequency(f64),

    /// Non-positive or non-finite tuning reference.
    #[error("invalid tuning reference: {0} Hz (must be finite and > 0)")]
    InvalidReference(f64),

    /// The requested capture device could not be opened.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The environment refused access to the microphone.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The frequency estimator could not be constructed.
    #[error("frequency estimator failed to initialize: {0}")]
    EstimatorInit(String),

    /// A second audio provider was requested while one is still alive.
    #[error("an audio session is already active in this process")]
    SessionAlreadyActive,

    #[error("settings I/O error: {0}")]
    SettingsIo(#[from] std::io::Error),

    #[error("settings format error: {0}")]
    SettingsFormat(#[from] serde_json::Error),
}

/// How a session attempt failed, as reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    DeviceUnavailable,
    PermissionDenied,
    EstimatorInitFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::DeviceUnavailable => "device unavailable",
            FailureKind::PermissionDenied => "permission denied",
            FailureKind::EstimatorInitFailure => "estimator initialization failed",
        };
        f.write_str(label)
    }
}

/// A single structured failure surfaced by the session. The consumer is
/// expected to offer a retry, which re-enters `Initializing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SessionFailure {
    /// Classifies an error raised while opening a device or building the
    /// analysis pipeline. Anything that is not a permission or estimator
    /// problem counts as the device being unavailable.
    pub fn classify(error: &TunerError) -> Self {
        let kind = match error {
            TunerError::PermissionDenied(_) => FailureKind::PermissionDenied,
            TunerError::EstimatorInit(_) => FailureKind::EstimatorInitFailure,
            _ => FailureKind::DeviceUnavailable,
        };
        Self {
            kind,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
