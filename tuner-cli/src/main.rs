//! # heptatune
//!
//! Terminal frontend for the tuner core. Opens the microphone through cpal,
//! prints every detected note with a cent meter, and keeps retrying when the
//! device goes away.
//!
//! ## Threads
//! - **Main thread**: owns the `TunerFacade` and pumps its events
//! - **cpal threads**: deliver open completions and analysis buffers over
//!   the session's crossbeam channel

mod auto_lock;
mod cli;
mod display;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use tuner_core::audio::AudioIo;
use tuner_core::cpal_io::CpalAudioIo;
use tuner_core::pitch::YinFactory;
use tuner_core::settings::SettingsStore;
use tuner_core::{SessionState, TunerEvent, TunerFacade};

use auto_lock::AutoLock;
use cli::Cli;

const PUMP_INTERVAL: Duration = Duration::from_millis(100);
const RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let io = CpalAudioIo::new().context("failed to start the audio backend")?;
    let settings = SettingsStore::default_location();
    if settings.is_none() {
        log::warn!("No config directory on this platform, the reference will not be saved");
    }
    let mut tuner = TunerFacade::new(io, YinFactory, cli.scale.into(), settings);
    let events = tuner.subscribe();

    if cli.list_devices {
        let devices = tuner
            .refresh_devices()
            .context("failed to list input devices")?;
        println!("{}", display::device_list(&devices, tuner.session().selected_device()));
        return Ok(());
    }

    start(&mut tuner, &cli)?;
    run(&mut tuner, &events, &cli)
}

/// Applies the command line, lists devices and starts the session.
fn start<I: AudioIo>(tuner: &mut TunerFacade<I>, cli: &Cli) -> Result<()> {
    if let Some(hz) = cli.reference {
        tuner
            .set_reference(hz)
            .with_context(|| format!("cannot use {hz} Hz as the reference"))?;
    }
    if let Some(device) = &cli.device {
        tuner.select_device(device.clone());
    }
    // A failed listing is not fatal: init() still opens the best device.
    match tuner.refresh_devices() {
        Ok(_) => {
            if let Some(wanted) = cli.device.as_deref() {
                if tuner.session().selected_device() != Some(wanted) {
                    log::warn!("No input device '{wanted}', see --list-devices");
                }
            }
        }
        Err(e) => log::warn!("Could not list input devices: {e}"),
    }

    println!(
        "Reference {:.2} Hz. Press Ctrl+C to quit.",
        tuner.reference().hz()
    );
    tuner.init();

    if let Some(note_index) = cli.play {
        let hz = tuner
            .play_reference(note_index)
            .with_context(|| format!("failed to play note {note_index}"))?;
        log::info!("Playing note {note_index} at {hz:.2} Hz");
    }
    Ok(())
}

/// Pumps the session and prints what it reports until the process is
/// interrupted or the device keeps failing.
fn run<I: AudioIo>(
    tuner: &mut TunerFacade<I>,
    events: &Receiver<TunerEvent>,
    cli: &Cli,
) -> Result<()> {
    let mut runner = Runner::default();
    loop {
        tuner.pump_timeout(PUMP_INTERVAL);
        for event in events.try_iter() {
            if let Some(line) = runner.handle(tuner, event, cli)? {
                println!("{line}");
            }
        }
        if runner.retry_due(Instant::now()) {
            tuner.retry();
        }
    }
}

/// Reaction to session events between pumps.
#[derive(Default)]
struct Runner {
    lock: AutoLock,
    retry_at: Option<Instant>,
    failures: u32,
}

impl Runner {
    /// Handles one event. Returns the note line to print, if any.
    ///
    /// # Errors
    /// Only when the device has failed [`MAX_CONSECUTIVE_FAILURES`] times in
    /// a row.
    fn handle<I: AudioIo>(
        &mut self,
        tuner: &mut TunerFacade<I>,
        event: TunerEvent,
        cli: &Cli,
    ) -> Result<Option<String>> {
        match event {
            TunerEvent::Note(note) => {
                let shown = if cli.auto { self.lock.accept(&note) } else { Some(&note) };
                return Ok(shown.map(display::note_line));
            }
            TunerEvent::State(SessionState::Capturing) => {
                self.failures = 0;
                if cli.monitor {
                    if let Err(e) = tuner.set_monitoring(true) {
                        log::warn!("Monitoring unavailable, tuning without it: {e}");
                    }
                }
            }
            TunerEvent::State(state) => {
                log::debug!("Session is {state:?}");
                self.lock.reset();
            }
            TunerEvent::Failure(failure) => {
                self.failures += 1;
                if self.failures >= MAX_CONSECUTIVE_FAILURES {
                    anyhow::bail!("giving up after {} attempts: {failure}", self.failures);
                }
                eprintln!("{failure}. Retrying in {}s...", RETRY_DELAY.as_secs());
                self.retry_at = Some(Instant::now() + RETRY_DELAY);
            }
            TunerEvent::Devices { devices, selected } => {
                log::info!(
                    "Input devices:\n{}",
                    display::device_list(&devices, selected.as_deref())
                );
            }
        }
        Ok(None)
    }

    /// Whether a scheduled retry is due; clears it if so.
    fn retry_due(&mut self, now: Instant) -> bool {
        if self.retry_at.is_some_and(|at| now >= at) {
            self.retry_at = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use crossbeam_channel::Sender;
    use tuner_core::audio::{AnalysisGraph, CaptureHandle, DeviceDescriptor, ProcessingContext, Ticket};
    use tuner_core::pitch::{EstimatorFactory, FrequencyEstimator};
    use tuner_core::session::SessionEvent;
    use tuner_core::tuning::Scale;
    use tuner_core::{TunerError, tuning};

    /// Opens instantly, lists two microphones, has no working output.
    struct StubIo {
        next_id: u64,
    }

    impl StubIo {
        fn handle(&mut self, device_id: Option<&str>) -> CaptureHandle {
            self.next_id += 1;
            CaptureHandle {
                id: self.next_id,
                device_id: device_id.unwrap_or("built-in").to_string(),
                sample_rate: 48_000,
            }
        }
    }

    impl AudioIo for StubIo {
        fn create_context(&mut self) -> tuner_core::Result<ProcessingContext> {
            Ok(ProcessingContext {
                id: 0,
                sample_rate: 48_000,
            })
        }

        fn close_context(&mut self, _context: ProcessingContext) {}

        fn acquire_transient_grant(&mut self) -> tuner_core::Result<CaptureHandle> {
            Ok(self.handle(None))
        }

        fn enumerate_input_devices(&mut self) -> tuner_core::Result<Vec<DeviceDescriptor>> {
            Ok(["built-in", "usb"]
                .into_iter()
                .map(|id| DeviceDescriptor {
                    id: id.into(),
                    label: id.into(),
                })
                .collect())
        }

        fn request_open(&mut self, ticket: Ticket, device_id: Option<&str>, completions: Sender<SessionEvent>) {
            let result = Ok(self.handle(device_id));
            completions
                .send(SessionEvent::OpenCompleted { ticket, result })
                .unwrap();
        }

        fn build_analysis_graph(
            &mut self,
            _context: &ProcessingContext,
            _stream: &CaptureHandle,
            _buffer_size: usize,
            _generation: Ticket,
            _sink: Sender<SessionEvent>,
        ) -> tuner_core::Result<Box<dyn AnalysisGraph>> {
            Ok(Box::new(NoOutput))
        }

        fn close_stream(&mut self, _stream: CaptureHandle) {}

        fn play_tone(&mut self, _frequency: f64) -> tuner_core::Result<()> {
            Err(TunerError::DeviceUnavailable("no output".into()))
        }

        fn stop_tone(&mut self) {}
    }

    struct NoOutput;

    impl AnalysisGraph for NoOutput {
        fn enable_passthrough(&mut self) -> tuner_core::Result<()> {
            Err(TunerError::DeviceUnavailable("no output device available".into()))
        }

        fn disable_passthrough(&mut self) {}

        fn detach(&mut self) {}
    }

    struct Silent;

    impl FrequencyEstimator for Silent {
        fn estimate(&mut self, _buffer: &[f32]) -> Option<f64> {
            None
        }
    }

    impl EstimatorFactory for Silent {
        fn create(&self, _buffer_size: usize, _sample_rate: u32) -> tuner_core::Result<Box<dyn FrequencyEstimator>> {
            Ok(Box::new(Silent))
        }
    }

    fn tuner() -> TunerFacade<StubIo> {
        TunerFacade::new(StubIo { next_id: 0 }, Silent, Scale::THAI, None)
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("heptatune").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn devices_are_listed_before_the_session_starts() {
        let mut tuner = tuner();
        let events = tuner.subscribe();
        start(&mut tuner, &cli(&[])).unwrap();

        let events: Vec<_> = events.try_iter().collect();
        assert!(matches!(
            &events[0],
            TunerEvent::Devices { devices, selected }
                if devices.len() == 2 && selected.as_deref() == Some("built-in")
        ));
        assert!(matches!(events[1], TunerEvent::State(SessionState::Initializing)));
    }

    #[test]
    fn unknown_device_falls_back_to_the_first_listed() {
        let mut tuner = tuner();
        start(&mut tuner, &cli(&["--device", "gone"])).unwrap();
        assert_eq!(tuner.session().selected_device(), Some("built-in"));

        tuner.pump();
        assert_eq!(tuner.session().live_device(), Some("built-in"));
    }

    #[test]
    fn failing_passthrough_keeps_tuning() {
        let mut tuner = tuner();
        let cli = cli(&["--monitor"]);
        start(&mut tuner, &cli).unwrap();
        tuner.pump();
        assert_eq!(tuner.state(), SessionState::Capturing);

        let mut runner = Runner::default();
        let handled = runner.handle(&mut tuner, TunerEvent::State(SessionState::Capturing), &cli);
        assert!(matches!(handled, Ok(None)));
        assert_eq!(tuner.state(), SessionState::Capturing);
    }

    #[test]
    fn auto_mode_prints_only_repeated_notes() {
        let mut tuner = tuner();
        let cli = cli(&["--auto"]);
        let note = tuning::Tuning::default().detect(230.3).unwrap();

        let mut runner = Runner::default();
        let first = runner.handle(&mut tuner, TunerEvent::Note(note.clone()), &cli).unwrap();
        let second = runner.handle(&mut tuner, TunerEvent::Note(note), &cli).unwrap();
        assert!(first.is_none());
        assert!(second.is_some_and(|line| line.contains("ด")));
    }

    #[test]
    fn repeated_failures_give_up() {
        let mut tuner = tuner();
        let cli = cli(&[]);
        let failure = tuner_core::SessionFailure::classify(&TunerError::DeviceUnavailable("gone".into()));

        let mut runner = Runner::default();
        for _ in 1..MAX_CONSECUTIVE_FAILURES {
            assert!(runner.handle(&mut tuner, TunerEvent::Failure(failure.clone()), &cli).is_ok());
        }
        assert!(runner.retry_at.is_some());
        assert!(runner.handle(&mut tuner, TunerEvent::Failure(failure), &cli).is_err());
    }

    #[test]
    fn retry_fires_once_when_due() {
        let mut runner = Runner::default();
        let now = Instant::now();
        runner.retry_at = Some(now);
        assert!(!runner.retry_due(now - Duration::from_millis(1)));
        assert!(runner.retry_due(now));
        assert!(!runner.retry_due(now + RETRY_DELAY));
    }
}
