//! # Tuner Facade
//!
//! The surface a frontend talks to. Wraps the [`AudioSession`], keeps the
//! tuning reference persisted, and hands out event subscriptions.
//!
//! Every detected note is delivered; deciding whether to react only to
//! repeated notes ("auto mode") is left to the consumer.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::info;

use crate::DetectedNote;
use crate::audio::{AudioIo, DeviceDescriptor};
use crate::error::{Result, SessionFailure};
use crate::pitch::EstimatorFactory;
use crate::session::{AudioSession, SessionEvent, SessionState};
use crate::settings::{Settings, SettingsStore};
use crate::tuning::{Scale, Tuning, TuningReference};

/// Everything a subscriber can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum TunerEvent {
    Note(DetectedNote),
    State(SessionState),
    Failure(SessionFailure),
    Devices {
        devices: Vec<DeviceDescriptor>,
        selected: Option<String>,
    },
}

pub struct TunerFacade<I: AudioIo> {
    session: AudioSession<I>,
    settings: Option<SettingsStore>,
}

impl<I: AudioIo> TunerFacade<I> {
    /// Builds the facade around a new session. The tuning reference comes
    /// from `settings` when given, otherwise the default is used.
    pub fn new(
        io: I,
        estimators: impl EstimatorFactory + 'static,
        scale: Scale,
        settings: Option<SettingsStore>,
    ) -> Self {
        let reference = settings
            .as_ref()
            .map(|store| store.load().tuning_reference)
            .unwrap_or_default();
        info!("Tuning reference: {:.2} Hz", reference.hz());

        Self {
            session: AudioSession::new(io, estimators, Tuning::new(reference, scale)),
            settings,
        }
    }

    pub fn session(&self) -> &AudioSession<I> {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn reference(&self) -> TuningReference {
        self.session.tuning().reference
    }

    /// Changes the tuning reference and persists it. Session state is not
    /// affected.
    pub fn set_reference(&mut self, hz: f64) -> Result<()> {
        let reference = TuningReference::new(hz)?;
        if reference == self.reference() {
            return Ok(());
        }
        self.session.set_reference(reference);
        info!("Tuning reference set to {hz:.2} Hz");

        if let Some(store) = &self.settings {
            store.save(&Settings {
                tuning_reference: reference,
            })?;
        }
        Ok(())
    }

    pub fn set_scale(&mut self, scale: Scale) {
        self.session.set_scale(scale);
    }

    pub fn init(&mut self) {
        self.session.init();
    }

    pub fn retry(&mut self) {
        self.session.retry();
    }

    pub fn select_device(&mut self, device_id: impl Into<String>) {
        self.session.select_device(device_id);
    }

    pub fn set_monitoring(&mut self, enabled: bool) -> Result<()> {
        self.session.set_monitoring(enabled)
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.session.set_visible(visible);
    }

    pub fn refresh_devices(&mut self) -> Result<Vec<DeviceDescriptor>> {
        self.session.refresh_devices()
    }

    pub fn subscribe(&mut self) -> Receiver<TunerEvent> {
        self.session.subscribe()
    }

    /// Sender for environment notifications (visibility, device changes).
    pub fn notifier(&self) -> Sender<SessionEvent> {
        self.session.notifier()
    }

    pub fn pump(&mut self) -> usize {
        self.session.pump()
    }

    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        self.session.pump_timeout(timeout)
    }

    /// Plays the in-tune pitch of `note_index`. Returns its frequency.
    pub fn play_reference(&mut self, note_index: i32) -> Result<f64> {
        self.session.play_tone(note_index)
    }

    pub fn stop_reference(&mut self) {
        self.session.stop_tone();
    }

    pub fn shutdown(&mut self) {
        self.session.shutdown();
    }
}
