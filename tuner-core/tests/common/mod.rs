//! Scripted audio environment for session tests.
//!
//! `FakeIo` is moved into the session; the test keeps a `World` handle to
//! the same state to complete open requests, feed buffers and inspect what
//! the session did.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crossbeam_channel::{Receiver, Sender};
use tuner_core::audio::{
    AnalysisGraph, AudioIo, CaptureHandle, DeviceDescriptor, ProcessingContext, Ticket,
};
use tuner_core::pitch::{EstimatorFactory, FrequencyEstimator};
use tuner_core::session::SessionEvent;
use tuner_core::{Result, TunerError, TunerEvent};

pub struct PendingOpen {
    pub ticket: Ticket,
    pub device_id: Option<String>,
    completions: Sender<SessionEvent>,
}

pub struct GraphRecord {
    pub generation: Ticket,
    pub stream_id: u64,
    pub detached: bool,
    pub passthrough: bool,
    pub passthrough_enables: usize,
    sink: Sender<SessionEvent>,
}

#[derive(Default)]
pub struct State {
    pub devices: Vec<DeviceDescriptor>,
    pub auto_complete: bool,
    pub open_failures: VecDeque<TunerError>,
    pub fail_context: bool,
    /// Streams open at this rate unless `device_rates` says otherwise.
    pub context_rate: u32,
    pub device_rates: HashMap<String, u32>,

    next_id: u64,
    pub requests: Vec<(Ticket, Option<String>)>,
    pub pending: Vec<PendingOpen>,
    pub open_streams: Vec<CaptureHandle>,
    pub opened: Vec<CaptureHandle>,
    pub closed: Vec<u64>,
    pub max_open: usize,
    pub grants: usize,
    pub contexts_created: usize,
    pub contexts_closed: usize,
    pub graphs: Vec<GraphRecord>,
    pub tone: Option<f64>,
}

impl State {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open(&mut self, device_id: Option<&str>) -> Result<CaptureHandle> {
        if let Some(error) = self.open_failures.pop_front() {
            return Err(error);
        }
        let device_id = match device_id {
            Some(id) if self.devices.iter().any(|d| d.id == id) => id.to_string(),
            Some(id) if self.devices.is_empty() => id.to_string(),
            Some(id) => {
                return Err(TunerError::DeviceUnavailable(format!("no device '{id}'")));
            }
            None => self
                .devices
                .first()
                .map(|d| d.id.clone())
                .unwrap_or_else(|| "default".to_string()),
        };
        let sample_rate = self
            .device_rates
            .get(&device_id)
            .copied()
            .unwrap_or(self.context_rate);
        let handle = CaptureHandle {
            id: self.allocate(),
            device_id,
            sample_rate,
        };
        self.open_streams.push(handle.clone());
        self.opened.push(handle.clone());
        self.max_open = self.max_open.max(self.open_streams.len());
        Ok(handle)
    }
}

#[derive(Clone, Default)]
pub struct World(pub Rc<RefCell<State>>);

impl World {
    pub fn new() -> Self {
        let world = Self::default();
        world.0.borrow_mut().context_rate = 48_000;
        world
    }

    /// Opens complete as soon as they are requested, like the cpal adapter.
    pub fn auto() -> Self {
        let world = Self::new();
        world.0.borrow_mut().auto_complete = true;
        world
    }

    pub fn with_devices(self, ids: &[&str]) -> Self {
        self.set_devices(ids);
        self
    }

    pub fn set_devices(&self, ids: &[&str]) {
        self.0.borrow_mut().devices = ids
            .iter()
            .map(|id| DeviceDescriptor {
                id: id.to_string(),
                label: format!("Microphone {id}"),
            })
            .collect();
    }

    /// Makes `device` deliver samples at `rate` regardless of the context.
    pub fn with_device_rate(self, device: &str, rate: u32) -> Self {
        self.0.borrow_mut().device_rates.insert(device.to_string(), rate);
        self
    }

    pub fn io(&self) -> FakeIo {
        FakeIo(self.clone())
    }

    pub fn state(&self) -> std::cell::Ref<'_, State> {
        self.0.borrow()
    }

    pub fn fail_next_open(&self, error: TunerError) {
        self.0.borrow_mut().open_failures.push_back(error);
    }

    pub fn pending_tickets(&self) -> Vec<Ticket> {
        self.0.borrow().pending.iter().map(|p| p.ticket).collect()
    }

    /// Answers the pending request with the given ticket.
    pub fn complete(&self, ticket: Ticket) {
        let mut state = self.0.borrow_mut();
        let index = state
            .pending
            .iter()
            .position(|p| p.ticket == ticket)
            .expect("no pending request with that ticket");
        let request = state.pending.remove(index);
        let result = state.open(request.device_id.as_deref());
        request
            .completions
            .send(SessionEvent::OpenCompleted { ticket, result })
            .unwrap();
    }

    pub fn complete_all(&self) {
        for ticket in self.pending_tickets() {
            self.complete(ticket);
        }
    }

    /// Sends one analysis buffer carrying `frequency` from the newest graph.
    pub fn feed(&self, frequency: f32) {
        let state = self.0.borrow();
        let graph = state.graphs.last().expect("no analysis graph built");
        Self::send_buffer(graph, graph.generation, frequency);
    }

    /// Sends a buffer through the newest graph's sink with an explicit
    /// generation.
    pub fn feed_generation(&self, generation: Ticket, frequency: f32) {
        let state = self.0.borrow();
        let graph = state.graphs.last().expect("no analysis graph built");
        Self::send_buffer(graph, generation, frequency);
    }

    fn send_buffer(graph: &GraphRecord, generation: Ticket, frequency: f32) {
        graph
            .sink
            .send(SessionEvent::Buffer {
                generation,
                samples: vec![frequency; 32],
            })
            .unwrap();
    }

    pub fn live_graph(&self) -> Option<(Ticket, bool)> {
        self.0
            .borrow()
            .graphs
            .iter()
            .rev()
            .find(|g| !g.detached)
            .map(|g| (g.generation, g.passthrough))
    }

    pub fn open_ids(&self) -> Vec<u64> {
        self.0.borrow().open_streams.iter().map(|h| h.id).collect()
    }

    /// Every opened stream was closed at most once, and nothing unknown was
    /// closed.
    pub fn assert_close_accounting(&self) {
        let state = self.0.borrow();
        let mut seen = state.closed.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), state.closed.len(), "a stream was closed twice");
        for id in &state.closed {
            assert!(state.opened.iter().any(|h| h.id == *id), "closed unknown stream {id}");
        }
    }
}

pub struct FakeIo(World);

impl AudioIo for FakeIo {
    fn create_context(&mut self) -> Result<ProcessingContext> {
        let mut state = self.0.0.borrow_mut();
        if state.fail_context {
            return Err(TunerError::DeviceUnavailable("audio context unsupported".into()));
        }
        state.contexts_created += 1;
        Ok(ProcessingContext {
            id: state.allocate(),
            sample_rate: state.context_rate,
        })
    }

    fn close_context(&mut self, _context: ProcessingContext) {
        self.0.0.borrow_mut().contexts_closed += 1;
    }

    fn acquire_transient_grant(&mut self) -> Result<CaptureHandle> {
        let mut state = self.0.0.borrow_mut();
        state.grants += 1;
        state.open(None)
    }

    fn enumerate_input_devices(&mut self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.0.0.borrow().devices.clone())
    }

    fn request_open(
        &mut self,
        ticket: Ticket,
        device_id: Option<&str>,
        completions: Sender<SessionEvent>,
    ) {
        let auto = {
            let mut state = self.0.0.borrow_mut();
            state.requests.push((ticket, device_id.map(str::to_owned)));
            state.pending.push(PendingOpen {
                ticket,
                device_id: device_id.map(str::to_owned),
                completions,
            });
            state.auto_complete
        };
        if auto {
            self.0.complete(ticket);
        }
    }

    fn build_analysis_graph(
        &mut self,
        _context: &ProcessingContext,
        stream: &CaptureHandle,
        _buffer_size: usize,
        generation: Ticket,
        sink: Sender<SessionEvent>,
    ) -> Result<Box<dyn AnalysisGraph>> {
        let mut state = self.0.0.borrow_mut();
        state.graphs.push(GraphRecord {
            generation,
            stream_id: stream.id,
            detached: false,
            passthrough: false,
            passthrough_enables: 0,
            sink,
        });
        Ok(Box::new(FakeGraph {
            world: self.0.clone(),
            index: state.graphs.len() - 1,
        }))
    }

    fn close_stream(&mut self, stream: CaptureHandle) {
        let mut state = self.0.0.borrow_mut();
        state.open_streams.retain(|h| h.id != stream.id);
        state.closed.push(stream.id);
    }

    fn play_tone(&mut self, frequency: f64) -> Result<()> {
        self.0.0.borrow_mut().tone = Some(frequency);
        Ok(())
    }

    fn stop_tone(&mut self) {
        self.0.0.borrow_mut().tone = None;
    }
}

struct FakeGraph {
    world: World,
    index: usize,
}

impl FakeGraph {
    fn with_record(&self, f: impl FnOnce(&mut GraphRecord)) {
        let mut state = self.world.0.borrow_mut();
        f(&mut state.graphs[self.index]);
    }
}

impl AnalysisGraph for FakeGraph {
    fn enable_passthrough(&mut self) -> Result<()> {
        self.with_record(|g| {
            g.passthrough = true;
            g.passthrough_enables += 1;
        });
        Ok(())
    }

    fn disable_passthrough(&mut self) {
        self.with_record(|g| g.passthrough = false);
    }

    fn detach(&mut self) {
        self.with_record(|g| g.detached = true);
    }
}

/// Reports the first sample of each buffer as the frequency; zero or
/// negative means no pitch.
pub struct EchoEstimator;

impl FrequencyEstimator for EchoEstimator {
    fn estimate(&mut self, buffer: &[f32]) -> Option<f64> {
        buffer.first().map(|&s| s as f64).filter(|&f| f > 0.0)
    }
}

pub struct EchoFactory;

impl EstimatorFactory for EchoFactory {
    fn create(&self, _buffer_size: usize, _sample_rate: u32) -> Result<Box<dyn FrequencyEstimator>> {
        Ok(Box::new(EchoEstimator))
    }
}

/// Echo estimators that remember which sample rates they were built for.
/// Rates listed in `refuse` fail with `EstimatorInit`.
#[derive(Clone, Default)]
pub struct RateLog {
    pub rates: Rc<RefCell<Vec<u32>>>,
    pub refuse: Vec<u32>,
}

impl EstimatorFactory for RateLog {
    fn create(&self, _buffer_size: usize, sample_rate: u32) -> Result<Box<dyn FrequencyEstimator>> {
        self.rates.borrow_mut().push(sample_rate);
        if self.refuse.contains(&sample_rate) {
            return Err(TunerError::EstimatorInit(format!("{sample_rate} Hz unsupported")));
        }
        Ok(Box::new(EchoEstimator))
    }
}

pub struct BrokenFactory;

impl EstimatorFactory for BrokenFactory {
    fn create(&self, _buffer_size: usize, sample_rate: u32) -> Result<Box<dyn FrequencyEstimator>> {
        Err(TunerError::EstimatorInit(format!("no model for {sample_rate} Hz")))
    }
}

pub fn drain(events: &Receiver<TunerEvent>) -> Vec<TunerEvent> {
    events.try_iter().collect()
}

pub fn notes(events: &[TunerEvent]) -> Vec<i32> {
    events
        .iter()
        .filter_map(|e| match e {
            TunerEvent::Note(note) => Some(note.note_index),
            _ => None,
        })
        .collect()
}
