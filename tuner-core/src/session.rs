//! # Audio Session Module
//!
//! Owns the capture stream, the analysis graph and the estimator, and the
//! state machine that governs their lifecycle.
//!
//! ## States
//! - `Idle`: nothing held
//! - `Initializing`: context and estimator ready, an open request in flight
//! - `Capturing` / `Monitoring`: a live stream with its analysis graph;
//!   monitoring additionally routes the input to the output
//! - `Stopped`: capture released while the app is in the background, context
//!   and estimator retained
//! - `Error`: the last attempt failed; `retry()` re-enters `Initializing`
//!
//! A capture stream and graph exist if and only if the state is `Capturing`
//! or `Monitoring`.
//!
//! ## Events
//! The environment talks to the session only through [`SessionEvent`]s on
//! the session's channel (open completions, analysis buffers, visibility and
//! device-change notifications). Every open request carries a fresh
//! [`Ticket`]; a completion whose ticket is not the pending one is stale and
//! is discarded, closing its stream if it opened one. The ticket of the live
//! stream is also its buffer generation, so buffers still queued from a
//! released stream are dropped as well.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::audio::{
    ANALYSIS_BUFFER_SIZE, AnalysisGraph, AudioIo, CaptureHandle, DeviceDescriptor,
    ProcessingContext, Ticket,
};
use crate::error::{Result, SessionFailure, TunerError};
use crate::facade::TunerEvent;
use crate::pitch::{EstimatorFactory, FrequencyEstimator};
use crate::tuning::{Scale, Tuning, TuningReference};

/// Lifecycle state of the audio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Capturing,
    Monitoring,
    Stopped,
    Error,
}

impl SessionState {
    /// Whether a capture stream and analysis graph are held in this state.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Capturing | SessionState::Monitoring)
    }
}

/// Messages delivered to the session by its environment.
#[derive(Debug)]
pub enum SessionEvent {
    /// Answer to `AudioIo::request_open`.
    OpenCompleted {
        ticket: Ticket,
        result: Result<CaptureHandle>,
    },
    /// One analysis buffer from the graph of the given generation.
    Buffer { generation: Ticket, samples: Vec<f32> },
    /// The application went to the background (`false`) or came back.
    VisibilityChanged(bool),
    /// The set of input devices changed.
    DevicesChanged,
}

/// Processing context with the estimator bound to it.
struct Engine {
    context: ProcessingContext,
    estimator: Box<dyn FrequencyEstimator>,
    /// Sample rate the estimator was built for.
    estimator_rate: u32,
}

/// Estimator construction problems are reported as `EstimatorInit`, whatever
/// the factory returned.
fn estimator_error(error: TunerError) -> TunerError {
    match error {
        TunerError::EstimatorInit(_) => error,
        other => TunerError::EstimatorInit(other.to_string()),
    }
}

/// The live capture stream and the graph built on it.
struct Capture {
    handle: CaptureHandle,
    graph: Box<dyn AnalysisGraph>,
    generation: Ticket,
}

pub struct AudioSession<I: AudioIo> {
    io: I,
    estimators: Box<dyn EstimatorFactory>,
    tuning: Tuning,
    buffer_size: usize,

    state: SessionState,
    engine: Option<Engine>,
    capture: Option<Capture>,
    pending: Option<Ticket>,
    next_ticket: Ticket,

    selected_device: Option<String>,
    devices: Vec<DeviceDescriptor>,
    last_failure: Option<SessionFailure>,

    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    listeners: Vec<Sender<TunerEvent>>,
}

impl<I: AudioIo> AudioSession<I> {
    /// Creates an idle session. The session takes ownership of the provider,
    /// so a provider can drive at most one session.
    pub fn new(io: I, estimators: impl EstimatorFactory + 'static, tuning: Tuning) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            io,
            estimators: Box::new(estimators),
            tuning,
            buffer_size: ANALYSIS_BUFFER_SIZE,
            state: SessionState::Idle,
            engine: None,
            capture: None,
            pending: None,
            next_ticket: 1,
            selected_device: None,
            devices: Vec::new(),
            last_failure: None,
            events_tx,
            events_rx,
            listeners: Vec::new(),
        }
    }

    /// Overrides the analysis buffer size used from the next `init()` on.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The audio provider the session drives.
    pub fn io(&self) -> &I {
        &self.io
    }

    /// Reference and scale used to name detected pitches.
    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    /// Takes effect from the next analysed buffer. The state is untouched.
    pub fn set_reference(&mut self, reference: TuningReference) {
        self.tuning.reference = reference;
    }

    pub fn set_scale(&mut self, scale: Scale) {
        self.tuning.scale = scale;
    }

    /// Device used by the next open request. `None` means best available.
    pub fn selected_device(&self) -> Option<&str> {
        self.selected_device.as_deref()
    }

    /// Device id of the live capture stream, if any.
    pub fn live_device(&self) -> Option<&str> {
        self.capture.as_ref().map(|c| c.handle.device_id.as_str())
    }

    /// Devices from the last refresh.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// The failure that put the session in `Error`, cleared by `init()`.
    pub fn last_failure(&self) -> Option<&SessionFailure> {
        self.last_failure.as_ref()
    }

    /// Sender the environment uses to deliver [`SessionEvent`]s.
    pub fn notifier(&self) -> Sender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Registers a listener. Dropping the receiver unsubscribes it.
    ///
    /// # Returns
    /// * An unbounded receiver of every [`TunerEvent`] emitted from now on
    pub fn subscribe(&mut self) -> Receiver<TunerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, event: TunerEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("Session {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(TunerEvent::State(state));
        }
    }

    /// Stops monitoring, detaches the analysis callback and stops every
    /// track of the live stream. No-op if nothing is held.
    fn release_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.graph.disable_passthrough();
            capture.graph.detach();
            debug!("Releasing capture stream {}", capture.handle.id);
            self.io.close_stream(capture.handle);
        }
    }

    fn release_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.io.close_context(engine.context);
        }
    }

    fn fail(&mut self, error: TunerError) {
        self.release_capture();
        self.pending = None;
        let failure = SessionFailure::classify(&error);
        warn!("Session failed: {failure}");
        self.last_failure = Some(failure.clone());
        self.set_state(SessionState::Error);
        self.emit(TunerEvent::Failure(failure));
    }

    /// (Re)initializes the session from any state: releases whatever is held,
    /// builds a fresh context and estimator, then opens the selected device
    /// (or the best available one).
    pub fn init(&mut self) {
        self.release_capture();
        self.pending = None;
        self.release_engine();
        self.last_failure = None;
        self.set_state(SessionState::Initializing);

        let context = match self.io.create_context() {
            Ok(context) => context,
            Err(e) => return self.fail(e),
        };
        let estimator = match self.estimators.create(self.buffer_size, context.sample_rate) {
            Ok(estimator) => estimator,
            Err(e) => {
                self.io.close_context(context);
                return self.fail(estimator_error(e));
            }
        };
        debug!(
            "Estimator ready: {} samples at {} Hz",
            self.buffer_size, context.sample_rate
        );
        let estimator_rate = context.sample_rate;
        self.engine = Some(Engine {
            context,
            estimator,
            estimator_rate,
        });
        self.start_open();
    }

    /// Equivalent to `init()`; offered to the user after a failure.
    pub fn retry(&mut self) {
        info!("Retrying audio session");
        self.init();
    }

    /// Issues a new open request, superseding any pending one.
    fn start_open(&mut self) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending = Some(ticket);
        self.set_state(SessionState::Initializing);
        debug!(
            "Open request {ticket} for {}",
            self.selected_device.as_deref().unwrap_or("<best available>")
        );
        self.io
            .request_open(ticket, self.selected_device.as_deref(), self.events_tx.clone());
    }

    fn on_open_completed(&mut self, ticket: Ticket, result: Result<CaptureHandle>) {
        if self.pending != Some(ticket) {
            match result {
                Ok(handle) => {
                    debug!("Discarding stale stream {} from request {ticket}", handle.id);
                    self.io.close_stream(handle);
                }
                Err(e) => debug!("Ignoring stale failure from request {ticket}: {e}"),
            }
            return;
        }
        self.pending = None;

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => return self.fail(e),
        };
        let estimator_rate = self.engine.as_ref().map(|e| e.estimator_rate);
        if estimator_rate.is_some_and(|rate| rate != handle.sample_rate) {
            if let Err(e) = self.rebind_estimator(handle.sample_rate) {
                self.io.close_stream(handle);
                return self.fail(e);
            }
        }
        let Some(engine) = self.engine.as_ref() else {
            self.io.close_stream(handle);
            return self.fail(TunerError::EstimatorInit("no processing context".into()));
        };

        match self.io.build_analysis_graph(
            &engine.context,
            &handle,
            self.buffer_size,
            ticket,
            self.events_tx.clone(),
        ) {
            Ok(graph) => {
                info!("Capturing from '{}'", handle.device_id);
                self.capture = Some(Capture {
                    handle,
                    graph,
                    generation: ticket,
                });
                self.set_state(SessionState::Capturing);
            }
            Err(e) => {
                self.io.close_stream(handle);
                self.fail(e);
            }
        }
    }

    /// Rebuilds the estimator for a stream that runs at a different rate
    /// than the context.
    fn rebind_estimator(&mut self, sample_rate: u32) -> Result<()> {
        let estimator = self
            .estimators
            .create(self.buffer_size, sample_rate)
            .map_err(estimator_error)?;
        if let Some(engine) = self.engine.as_mut() {
            info!(
                "Stream runs at {sample_rate} Hz, not {} Hz; estimator rebuilt",
                engine.estimator_rate
            );
            engine.estimator = estimator;
            engine.estimator_rate = sample_rate;
        }
        Ok(())
    }

    /// Turns the direct input-to-output passthrough on or off. Idempotent,
    /// and ignored unless a stream is live.
    pub fn set_monitoring(&mut self, enabled: bool) -> Result<()> {
        let Some(capture) = self.capture.as_mut() else {
            debug!("Monitoring request ignored in {:?}", self.state);
            return Ok(());
        };
        match (self.state, enabled) {
            (SessionState::Capturing, true) => {
                capture.graph.enable_passthrough()?;
                self.set_state(SessionState::Monitoring);
            }
            (SessionState::Monitoring, false) => {
                capture.graph.disable_passthrough();
                self.set_state(SessionState::Capturing);
            }
            _ => {}
        }
        Ok(())
    }

    /// Switches capture to another device. A live stream is fully released
    /// before the new one is requested; a pending request is superseded.
    /// Outside those states the choice is only remembered.
    pub fn select_device(&mut self, device_id: impl Into<String>) {
        let device_id = device_id.into();
        info!("Selecting input device '{device_id}'");
        self.selected_device = Some(device_id);

        match self.state {
            SessionState::Capturing | SessionState::Monitoring => {
                self.release_capture();
                self.start_open();
            }
            SessionState::Initializing => self.start_open(),
            _ => {}
        }
    }

    /// Handles the application going to the background or coming back.
    ///
    /// # Arguments
    /// * `visible` - `false` releases capture unless monitoring is on;
    ///   `true` refreshes devices and reopens after a stop
    pub fn set_visible(&mut self, visible: bool) {
        match (visible, self.state) {
            (false, SessionState::Capturing) => {
                self.release_capture();
                self.set_state(SessionState::Stopped);
            }
            (false, SessionState::Initializing) => {
                self.pending = None;
                self.set_state(SessionState::Stopped);
            }
            (false, SessionState::Monitoring) => {
                debug!("Monitoring is on, capture continues in the background");
            }
            (true, SessionState::Stopped) => {
                if let Err(e) = self.refresh_devices() {
                    warn!("Device refresh on resume failed: {e}");
                }
                self.start_open();
            }
            _ => {}
        }
    }

    /// Lists input devices. Opens a transient grant first so labels are
    /// visible, and closes it again before listing. Keeps the selected
    /// device if it still exists, otherwise selects the first one.
    ///
    /// # Returns
    /// * `Ok(devices)` - The new list, also sent as `TunerEvent::Devices`
    /// * `Err(e)` - The grant or the enumeration failed; the session state
    ///   is unchanged
    pub fn refresh_devices(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let grant = self.io.acquire_transient_grant()?;
        self.io.close_stream(grant);

        let devices = self.io.enumerate_input_devices()?;
        let keep = self
            .selected_device
            .as_ref()
            .is_some_and(|id| devices.iter().any(|d| &d.id == id));
        if !keep {
            self.selected_device = devices.first().map(|d| d.id.clone());
        }
        debug!("{} input device(s) listed", devices.len());

        self.devices = devices.clone();
        self.emit(TunerEvent::Devices {
            devices: devices.clone(),
            selected: self.selected_device.clone(),
        });
        Ok(devices)
    }

    fn on_devices_changed(&mut self) {
        let live = self.live_device().map(str::to_owned);
        let devices = match self.refresh_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device refresh failed: {e}");
                return;
            }
        };

        if let Some(live) = live {
            if !devices.iter().any(|d| d.id == live) {
                warn!("Input device '{live}' disappeared, switching to the default");
                self.release_capture();
                self.start_open();
            }
        }
    }

    fn on_buffer(&mut self, generation: Ticket, samples: &[f32]) {
        let current = self.capture.as_ref().map(|c| c.generation);
        if !self.state.is_live() || current != Some(generation) {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let Some(frequency) = engine.estimator.estimate(samples) else {
            return;
        };

        match self.tuning.detect(frequency) {
            Ok(note) => self.emit(TunerEvent::Note(note)),
            Err(e) => warn!("Estimator produced an unusable frequency: {e}"),
        }
    }

    /// Handles one environment event.
    pub fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::OpenCompleted { ticket, result } => self.on_open_completed(ticket, result),
            SessionEvent::Buffer {
                generation,
                samples,
            } => self.on_buffer(generation, &samples),
            SessionEvent::VisibilityChanged(visible) => self.set_visible(visible),
            SessionEvent::DevicesChanged => self.on_devices_changed(),
        }
    }

    /// Dispatches every event already queued. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for the next event, then drains the queue.
    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.dispatch(event);
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Plays the reference tone for a note index under the current tuning.
    ///
    /// # Arguments
    /// * `note_index` - Any note index; 42 is the reference note
    ///
    /// # Returns
    /// * `Ok(hz)` - The frequency now playing
    /// * `Err(InvalidFrequency)` - The index lies so far out that its pitch
    ///   is zero or infinite
    /// * `Err(e)` - The output device could not be opened
    pub fn play_tone(&mut self, note_index: i32) -> Result<f64> {
        let frequency = self.tuning.standard_frequency(note_index);
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(TunerError::InvalidFrequency(frequency));
        }
        self.io.play_tone(frequency)?;
        Ok(frequency)
    }

    /// Stops the reference tone. No-op if none is playing.
    pub fn stop_tone(&mut self) {
        self.io.stop_tone();
    }

    /// Releases everything and returns to `Idle`.
    pub fn shutdown(&mut self) {
        self.release_capture();
        self.pending = None;
        self.release_engine();
        self.io.stop_tone();
        self.set_state(SessionState::Idle);
    }
}

impl<I: AudioIo> Drop for AudioSession<I> {
    fn drop(&mut self) {
        self.release_capture();
        self.release_engine();
    }
}
