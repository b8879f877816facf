//! # Audio I/O Module
//!
//! The contract between the session and the audio environment. The session
//! never touches raw device or graph handles: it holds plain tokens
//! ([`ProcessingContext`], [`CaptureHandle`]) and a boxed [`AnalysisGraph`],
//! and asks the provider to do the rest.
//!
//! Opening a device is asynchronous. The provider answers a request by
//! sending [`SessionEvent::OpenCompleted`] with the same ticket on the
//! session's event channel, and the graph delivers analysis buffers on that
//! channel as [`SessionEvent::Buffer`].

use crossbeam_channel::Sender;

use crate::error::Result;
use crate::session::SessionEvent;

/// Number of samples in one analysis buffer.
pub const ANALYSIS_BUFFER_SIZE: usize = 4096;

/// Identifies one open request. Tickets only ever increase, and the ticket of
/// the request that produced the live stream doubles as the graph generation.
pub type Ticket = u64;

/// An input device as listed to the user. Valid for one enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Stable within one enumeration and unique even when two devices share
    /// a name.
    pub id: String,
    pub label: String,
}

/// Token for the audio-processing context the estimator is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingContext {
    pub id: u64,
    /// Rate the context prefers. Streams may end up at a different one.
    pub sample_rate: u32,
}

/// Token for one open capture stream. Closing it stops every track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHandle {
    pub id: u64,
    pub device_id: String,
    /// Rate the stream actually delivers samples at.
    pub sample_rate: u32,
}

/// Environment capability for devices, streams and output.
///
/// Every method is called from the session's thread. Completions and
/// buffers may be produced on other threads but only reach the session
/// through its channel.
pub trait AudioIo {
    /// Creates a fresh processing context.
    ///
    /// # Returns
    /// * `Ok(context)` - Context token carrying the preferred sample rate
    /// * `Err(e)` - The environment has no usable audio processing
    fn create_context(&mut self) -> Result<ProcessingContext>;

    /// Releases a context created by [`AudioIo::create_context`].
    fn close_context(&mut self, context: ProcessingContext);

    /// Opens a throwaway stream whose only purpose is to make device labels
    /// visible. The caller closes it again immediately.
    ///
    /// # Returns
    /// * `Ok(handle)` - Handle to close with [`AudioIo::close_stream`]
    /// * `Err(PermissionDenied)` / `Err(DeviceUnavailable)` - No access
    fn acquire_transient_grant(&mut self) -> Result<CaptureHandle>;

    /// Lists the input devices currently present, in the environment's
    /// order.
    fn enumerate_input_devices(&mut self) -> Result<Vec<DeviceDescriptor>>;

    /// Starts opening `device_id`, or the best available device for `None`.
    ///
    /// # Arguments
    /// * `ticket` - Echoed back in the completion
    /// * `device_id` - Id from [`AudioIo::enumerate_input_devices`]
    /// * `completions` - Where to send the answer
    ///
    /// Must answer exactly once with `SessionEvent::OpenCompleted { ticket, .. }`.
    fn request_open(
        &mut self,
        ticket: Ticket,
        device_id: Option<&str>,
        completions: Sender<SessionEvent>,
    );

    /// Wires stream -> analysis -> sink.
    ///
    /// # Arguments
    /// * `context` - Context the estimator was created for
    /// * `stream` - An open stream from a completed request
    /// * `buffer_size` - Samples per analysis buffer
    /// * `generation` - Stamped on every buffer this graph sends
    /// * `sink` - The session's event channel
    ///
    /// Buffers are sent as `SessionEvent::Buffer { generation, .. }` at the
    /// stream's own sample rate.
    fn build_analysis_graph(
        &mut self,
        context: &ProcessingContext,
        stream: &CaptureHandle,
        buffer_size: usize,
        generation: Ticket,
        sink: Sender<SessionEvent>,
    ) -> Result<Box<dyn AnalysisGraph>>;

    /// Stops every track of the stream. Each handle is closed at most once.
    fn close_stream(&mut self, stream: CaptureHandle);

    /// Starts the reference tone, or retunes it if already playing.
    fn play_tone(&mut self, frequency: f64) -> Result<()>;

    fn stop_tone(&mut self);
}

/// The wiring built on top of one capture stream.
pub trait AnalysisGraph {
    /// Routes the captured audio straight to the output.
    fn enable_passthrough(&mut self) -> Result<()>;

    fn disable_passthrough(&mut self);

    /// Stops delivering buffers. Synchronous: once this returns no further
    /// buffer from this graph is sent.
    fn detach(&mut self);
}
