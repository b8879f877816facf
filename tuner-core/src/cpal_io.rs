//! # CPAL Audio Provider
//!
//! [`AudioIo`] on top of CPAL (Cross-Platform Audio Library).
//!
//! cpal streams stay inside this adapter, in a table keyed by the id of the
//! [`CaptureHandle`] handed to the session. Every input stream feeds a shared
//! [`StreamTaps`]: the analysis tap chunks mono audio into fixed-size frames
//! for the session, the monitor tap queues audio for the passthrough output.
//!
//! Only one provider may exist per process, which is what keeps a single
//! session per physical microphone.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig, SupportedStreamConfigRange,
};
use crossbeam_channel::{SendError, Sender};
use log::{debug, error, info, warn};

use crate::audio::{
    AnalysisGraph, AudioIo, CaptureHandle, DeviceDescriptor, ProcessingContext, Ticket,
};
use crate::error::{Result, TunerError};
use crate::session::SessionEvent;
use crate::tone::ToneGenerator;

/// Sample rate used when the default input device reports nothing usable.
const FALLBACK_SAMPLE_RATE: u32 = 44_100;

/// Upper bound on queued passthrough audio, in seconds.
const MONITOR_QUEUE_SECONDS: f32 = 0.25;

static PROVIDER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Chunks mono samples into analysis frames and sends them to the session.
struct FrameSink {
    generation: Ticket,
    frame_size: usize,
    pending: Vec<f32>,
    sender: Sender<SessionEvent>,
}

impl FrameSink {
    fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.frame_size {
            let frame = self.pending.drain(..self.frame_size).collect();
            // A full or closed channel only drops this frame.
            let _ = self.sender.try_send(SessionEvent::Buffer {
                generation: self.generation,
                samples: frame,
            });
        }
    }
}

/// Taps shared between an input callback and the graph built on it.
#[derive(Default)]
struct StreamTaps {
    analysis: Mutex<Option<FrameSink>>,
    monitoring: AtomicBool,
    monitor_queue: Mutex<VecDeque<f32>>,
    monitor_capacity: usize,
}

impl StreamTaps {
    fn new(sample_rate: u32) -> Self {
        Self {
            monitor_capacity: (sample_rate as f32 * MONITOR_QUEUE_SECONDS) as usize,
            ..Self::default()
        }
    }

    fn feed(&self, mono: &[f32]) {
        if let Ok(mut analysis) = self.analysis.lock() {
            if let Some(sink) = analysis.as_mut() {
                sink.push(mono);
            }
        }

        if self.monitoring.load(Ordering::Acquire) {
            if let Ok(mut queue) = self.monitor_queue.lock() {
                queue.extend(mono.iter().copied());
                let overflow = queue.len().saturating_sub(self.monitor_capacity);
                queue.drain(..overflow);
            }
        }
    }

    fn drain_monitor(&self, out: &mut [f32], channels: usize) {
        let mut queue = match self.monitor_queue.lock() {
            Ok(queue) => queue,
            Err(_) => {
                out.fill(0.0);
                return;
            }
        };
        for frame in out.chunks_mut(channels.max(1)) {
            frame.fill(queue.pop_front().unwrap_or(0.0));
        }
    }
}

struct OpenStream {
    stream: Stream,
    taps: Arc<StreamTaps>,
}

/// The cpal-backed audio provider.
pub struct CpalAudioIo {
    host: cpal::Host,
    next_id: u64,
    context_rate: Option<u32>,
    streams: HashMap<u64, OpenStream>,
    tone: Option<(Stream, Arc<Mutex<ToneGenerator>>)>,
}

impl CpalAudioIo {
    /// Claims the process-wide audio provider.
    ///
    /// # Errors
    /// * `SessionAlreadyActive` if another provider is still alive
    pub fn new() -> Result<Self> {
        if PROVIDER_ACTIVE.swap(true, Ordering::AcqRel) {
            return Err(TunerError::SessionAlreadyActive);
        }
        let host = cpal::default_host();
        info!("Using audio host: {:?}", host.id());
        Ok(Self {
            host,
            next_id: 1,
            context_rate: None,
            streams: HashMap::new(),
            tone: None,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Lists input devices with their ids, see [`unique_ids`].
    fn list_input_devices(&self) -> Result<Vec<(String, Device)>> {
        let devices: Vec<(String, Device)> = self
            .host
            .input_devices()
            .map_err(classify_error)?
            .filter_map(|device| device.name().ok().map(|name| (name, device)))
            .collect();
        let ids = unique_ids(devices.iter().map(|(name, _)| name.as_str()));
        Ok(ids
            .into_iter()
            .zip(devices)
            .map(|(id, (_, device))| (id, device))
            .collect())
    }

    /// Resolves a device id to a device and its id. `None` picks the host
    /// default input.
    fn find_input_device(&self, device_id: Option<&str>) -> Result<(String, Device)> {
        match device_id {
            Some(id) => self
                .list_input_devices()?
                .into_iter()
                .find(|(candidate, _)| candidate == id)
                .ok_or_else(|| TunerError::DeviceUnavailable(format!("no input device named '{id}'"))),
            None => {
                let device = self
                    .host
                    .default_input_device()
                    .ok_or_else(|| TunerError::DeviceUnavailable("no input device available".into()))?;
                // The default carries no index, so it maps to the first device
                // with its name.
                let id = device.name().map_err(classify_error)?;
                Ok((id, device))
            }
        }
    }

    /// Picks the device's config at the context sample rate when it supports
    /// it, otherwise the device default. The chosen rate travels with the
    /// returned config, so callers must not assume it equals the context's.
    fn input_config(&self, device: &Device) -> Result<(StreamConfig, SampleFormat)> {
        if let Some(rate) = self.context_rate {
            let matching = device
                .supported_input_configs()
                .ok()
                .and_then(|configs| config_at_rate(configs, rate));
            if let Some(config) = matching {
                let format = config.sample_format();
                return Ok((config.into(), format));
            }
            warn!("Input device does not support {rate} Hz, using its default config");
        }

        let config = device.default_input_config().map_err(classify_error)?;
        let format = config.sample_format();
        Ok((config.into(), format))
    }

    fn open_input(&mut self, device_id: Option<&str>) -> Result<CaptureHandle> {
        let (name, device) = self.find_input_device(device_id)?;
        let (config, format) = self.input_config(&device)?;
        let sample_rate = config.sample_rate.0;
        debug!("Opening '{name}' with {config:?} ({format:?})");

        let taps = Arc::new(StreamTaps::new(sample_rate));
        let stream = match format {
            SampleFormat::F32 => build_input::<f32>(&device, &config, taps.clone()),
            SampleFormat::I16 => build_input::<i16>(&device, &config, taps.clone()),
            SampleFormat::I32 => build_input::<i32>(&device, &config, taps.clone()),
            SampleFormat::U16 => build_input::<u16>(&device, &config, taps.clone()),
            other => {
                return Err(TunerError::DeviceUnavailable(format!(
                    "unsupported sample format {other:?}"
                )));
            }
        }
        .map_err(classify_error)?;
        stream.play().map_err(classify_error)?;

        let id = self.allocate_id();
        self.streams.insert(id, OpenStream { stream, taps });
        info!("Capture stream {id} open on '{name}' at {sample_rate} Hz");
        Ok(CaptureHandle {
            id,
            device_id: name,
            sample_rate,
        })
    }
}

impl Drop for CpalAudioIo {
    fn drop(&mut self) {
        self.stop_tone();
        for (id, open) in self.streams.drain() {
            let _ = open.stream.pause();
            debug!("Capture stream {id} dropped with provider");
        }
        PROVIDER_ACTIVE.store(false, Ordering::Release);
    }
}

impl AudioIo for CpalAudioIo {
    fn create_context(&mut self) -> Result<ProcessingContext> {
        let sample_rate = self
            .host
            .default_input_device()
            .and_then(|device| device.default_input_config().ok())
            .map(|config| config.sample_rate().0)
            .unwrap_or(FALLBACK_SAMPLE_RATE);
        self.context_rate = Some(sample_rate);
        let id = self.allocate_id();
        info!("Processing context {id} at {sample_rate} Hz");
        Ok(ProcessingContext { id, sample_rate })
    }

    fn close_context(&mut self, context: ProcessingContext) {
        debug!("Processing context {} closed", context.id);
        self.context_rate = None;
    }

    fn acquire_transient_grant(&mut self) -> Result<CaptureHandle> {
        self.open_input(None)
    }

    fn enumerate_input_devices(&mut self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .list_input_devices()?
            .into_iter()
            .map(|(id, _)| DeviceDescriptor {
                label: id.clone(),
                id,
            })
            .collect())
    }

    fn request_open(
        &mut self,
        ticket: Ticket,
        device_id: Option<&str>,
        completions: Sender<SessionEvent>,
    ) {
        let result = self.open_input(device_id);
        if let Err(SendError(event)) = completions.send(SessionEvent::OpenCompleted { ticket, result }) {
            // Nobody is listening any more; do not leak the stream.
            if let SessionEvent::OpenCompleted { result: Ok(handle), .. } = event {
                self.close_stream(handle);
            }
        }
    }

    fn build_analysis_graph(
        &mut self,
        context: &ProcessingContext,
        stream: &CaptureHandle,
        buffer_size: usize,
        generation: Ticket,
        sink: Sender<SessionEvent>,
    ) -> Result<Box<dyn AnalysisGraph>> {
        let open = self.streams.get(&stream.id).ok_or_else(|| {
            TunerError::DeviceUnavailable(format!("capture stream {} is not open", stream.id))
        })?;

        let mut analysis = open
            .taps
            .analysis
            .lock()
            .map_err(|_| TunerError::DeviceUnavailable("analysis tap poisoned".into()))?;
        *analysis = Some(FrameSink {
            generation,
            frame_size: buffer_size,
            pending: Vec::with_capacity(buffer_size * 2),
            sender: sink,
        });
        debug!(
            "Analysis graph {generation} wired on stream {} (context {})",
            stream.id, context.id
        );

        Ok(Box::new(CpalGraph {
            host_output: self.host.default_output_device(),
            taps: open.taps.clone(),
            monitor: None,
        }))
    }

    fn close_stream(&mut self, stream: CaptureHandle) {
        match self.streams.remove(&stream.id) {
            Some(open) => {
                if let Err(e) = open.stream.pause() {
                    warn!("Error pausing capture stream {}: {e}", stream.id);
                }
                if let Ok(mut analysis) = open.taps.analysis.lock() {
                    analysis.take();
                }
                info!("Capture stream {} closed", stream.id);
            }
            None => warn!("Capture stream {} was already closed", stream.id),
        }
    }

    fn play_tone(&mut self, frequency: f64) -> Result<()> {
        if let Some((_, generator)) = &self.tone {
            if let Ok(mut generator) = generator.lock() {
                generator.set_frequency(frequency);
            }
            return Ok(());
        }

        let device = self
            .host
            .default_output_device()
            .ok_or_else(|| TunerError::DeviceUnavailable("no output device available".into()))?;
        let config = device.default_output_config().map_err(classify_error)?;
        let generator = Arc::new(Mutex::new(ToneGenerator::new(
            frequency,
            config.sample_rate().0,
        )));

        let channels = config.channels() as usize;
        let source = generator.clone();
        let stream = open_output(&device, config, move |out| match source.lock() {
            Ok(mut generator) => generator.fill_interleaved(out, channels),
            Err(_) => out.fill(0.0),
        })?;
        info!("Reference tone at {frequency:.2} Hz");
        self.tone = Some((stream, generator));
        Ok(())
    }

    fn stop_tone(&mut self) {
        if let Some((stream, _)) = self.tone.take() {
            let _ = stream.pause();
            info!("Reference tone stopped");
        }
    }
}

struct CpalGraph {
    host_output: Option<Device>,
    taps: Arc<StreamTaps>,
    monitor: Option<Stream>,
}

impl AnalysisGraph for CpalGraph {
    fn enable_passthrough(&mut self) -> Result<()> {
        if self.monitor.is_some() {
            return Ok(());
        }
        let device = self
            .host_output
            .as_ref()
            .ok_or_else(|| TunerError::DeviceUnavailable("no output device available".into()))?;
        let config = device.default_output_config().map_err(classify_error)?;
        let channels = config.channels() as usize;

        let taps = self.taps.clone();
        let stream = open_output(device, config, move |out| taps.drain_monitor(out, channels))?;
        self.taps.monitoring.store(true, Ordering::Release);
        self.monitor = Some(stream);
        Ok(())
    }

    fn disable_passthrough(&mut self) {
        if let Some(stream) = self.monitor.take() {
            self.taps.monitoring.store(false, Ordering::Release);
            let _ = stream.pause();
            if let Ok(mut queue) = self.taps.monitor_queue.lock() {
                queue.clear();
            }
        }
    }

    fn detach(&mut self) {
        self.disable_passthrough();
        if let Ok(mut analysis) = self.taps.analysis.lock() {
            analysis.take();
        }
    }
}

/// Narrowest range that contains `rate`, preferring fewer channels and
/// `f32` samples.
fn config_at_rate(
    ranges: impl IntoIterator<Item = SupportedStreamConfigRange>,
    rate: u32,
) -> Option<SupportedStreamConfig> {
    ranges
        .into_iter()
        .filter(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
        .min_by_key(|c| (c.channels(), c.sample_format() != SampleFormat::F32))
        .map(|range| range.with_sample_rate(cpal::SampleRate(rate)))
}

/// Device names are not unique (two identical USB mics), so repeated names
/// get a `#n` suffix: `["Mic", "Mic"]` becomes `["Mic", "Mic #2"]`.
fn unique_ids<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let count = seen.entry(name).or_insert(0);
            *count += 1;
            if *count == 1 {
                name.to_string()
            } else {
                format!("{name} #{count}")
            }
        })
        .collect()
}

/// Maps a cpal error onto the session's taxonomy.
fn classify_error(err: impl Display) -> TunerError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") {
        TunerError::PermissionDenied(message)
    } else {
        TunerError::DeviceUnavailable(message)
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    taps: Arc<StreamTaps>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            mono.clear();
            mono.extend(data.chunks(channels).map(|frame| f32::from_sample(frame[0])));
            taps.feed(&mono);
        },
        |err| error!("An error occurred on the input stream: {err}"),
        None,
    )
}

fn open_output<F>(device: &Device, config: cpal::SupportedStreamConfig, render: F) -> Result<Stream>
where
    F: FnMut(&mut [f32]) + Send + 'static,
{
    let format = config.sample_format();
    let config: StreamConfig = config.into();
    let stream = match format {
        SampleFormat::F32 => build_output::<f32, F>(device, &config, render),
        SampleFormat::I16 => build_output::<i16, F>(device, &config, render),
        SampleFormat::U16 => build_output::<u16, F>(device, &config, render),
        other => {
            return Err(TunerError::DeviceUnavailable(format!(
                "unsupported output sample format {other:?}"
            )));
        }
    }
    .map_err(classify_error)?;
    stream.play().map_err(classify_error)?;
    Ok(stream)
}

fn build_output<T, F>(
    device: &Device,
    config: &StreamConfig,
    mut render: F,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
    F: FnMut(&mut [f32]) + Send + 'static,
{
    let mut scratch = Vec::new();
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            scratch.resize(data.len(), 0.0);
            render(&mut scratch);
            for (out, &sample) in data.iter_mut().zip(&scratch) {
                *out = T::from_sample(sample);
            }
        },
        |err| error!("An error occurred on the output stream: {err}"),
        None,
    )
}
