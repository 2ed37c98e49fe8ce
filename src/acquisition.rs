//! Acquisition loop: the pull-convert-pace-emit cycle and its lifecycle.
//!
//! ```text
//! IDLE --start()--> STARTING --source opened--> RUNNING --stop()--> STOPPING --> IDLE
//!                       |                          |
//!                       +--open failed--> IDLE     +--stream ended / decode error--> IDLE
//! ```
//!
//! Each session owns one `FrameSource`, one `PacingEngine` and one worker
//! thread. The worker is the only thread that touches frames; the controller
//! only flips state and raises the stop signal. At most one session exists
//! at a time: `start()` while a session is active is rejected, not queued.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::cancel::StopSignal;
use crate::config::ViewerConfig;
use crate::convert::convert_owned;
use crate::error::{PipelineError, StartError};
use crate::frame::ColorSpace;
use crate::pacing::{Advice, Clock, PacingEngine, SystemClock};
use crate::rate::{RateCounter, RateSnapshot, DEFAULT_RATE_WINDOW};
use crate::sink::DisplaySink;
use crate::source::{FrameSource, StreamSource};

/// Builds a fresh, unopened source for each session.
pub type SourceFactory = Box<dyn Fn() -> Box<dyn FrameSource> + Send + Sync>;

type SessionListener = Arc<dyn Fn(&SessionExit) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Per-session settings.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Layout every frame is converted to before presentation.
    pub display_space: ColorSpace,
    /// Nominal frame spacing, fed to the rate counter.
    pub expected_interval_ms: u64,
    /// See `PacingEngine::with_lag_warning`.
    pub lag_warn_ms: Option<u64>,
    pub rate_window: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            display_space: ColorSpace::Bgra,
            expected_interval_ms: 33,
            lag_warn_ms: None,
            rate_window: DEFAULT_RATE_WINDOW,
        }
    }
}

/// Frame counts for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub frames_presented: u64,
    /// Frames lost to `UnsupportedConversion`.
    pub frames_skipped: u64,
    pub pacing_inconsistencies: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// `stop()` was called.
    Stopped,
    /// The source failed or ended; the session is over.
    Failed(PipelineError),
}

/// Stop notification delivered when a session ends, for any reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionExit {
    pub reason: ExitReason,
    pub report: SessionReport,
}

impl SessionExit {
    pub fn error(&self) -> Option<&PipelineError> {
        match &self.reason {
            ExitReason::Failed(err) => Some(err),
            ExitReason::Stopped => None,
        }
    }
}

struct Shared {
    state: Mutex<LoopState>,
    last_exit: Mutex<Option<SessionExit>>,
    listener: Mutex<Option<SessionListener>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: LoopState) {
        *self.state() = next;
    }
}

struct Session {
    stop: StopSignal,
    worker: JoinHandle<()>,
}

impl Session {
    fn join(self) {
        if self.worker.join().is_err() {
            log::error!("acquisition worker panicked");
        }
    }
}

// ----------------------------------------------------------------------------
// AcquisitionLoop
// ----------------------------------------------------------------------------

pub struct AcquisitionLoop {
    factory: SourceFactory,
    sink: Arc<dyn DisplaySink>,
    clock: Arc<dyn Clock>,
    config: LoopConfig,
    rate: Arc<RateCounter>,
    shared: Arc<Shared>,
    session: Option<Session>,
}

impl AcquisitionLoop {
    pub fn new(factory: SourceFactory, sink: Arc<dyn DisplaySink>, config: LoopConfig) -> Self {
        let rate = Arc::new(RateCounter::new(config.rate_window));
        Self {
            factory,
            sink,
            clock: Arc::new(SystemClock::new()),
            config,
            rate,
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::Idle),
                last_exit: Mutex::new(None),
                listener: Mutex::new(None),
            }),
            session: None,
        }
    }

    /// Loop reading from a `StreamSource` as described by `config`.
    pub fn from_config(config: &ViewerConfig, sink: Arc<dyn DisplaySink>) -> Self {
        let source_config = config.source.clone();
        let factory: SourceFactory = Box::new(move || {
            Box::new(StreamSource::new(source_config.clone())) as Box<dyn FrameSource>
        });
        Self::new(factory, sink, config.loop_config())
    }

    /// Replace the host clock used for pacing.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Called on the worker thread whenever a session ends.
    pub fn on_session_end<F>(&self, listener: F)
    where
        F: Fn(&SessionExit) + Send + Sync + 'static,
    {
        *self
            .shared
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(listener));
    }

    pub fn state(&self) -> LoopState {
        *self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn current_rate(&self) -> f64 {
        self.rate.current_rate()
    }

    pub fn rate_snapshot(&self) -> RateSnapshot {
        self.rate.snapshot()
    }

    /// Shared handle for readers on other threads (e.g., a UI poll).
    pub fn rate_counter(&self) -> Arc<RateCounter> {
        self.rate.clone()
    }

    /// How the most recent session ended.
    pub fn last_exit(&self) -> Option<SessionExit> {
        self.shared
            .last_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Open the source and launch the worker.
    ///
    /// Fails with `AlreadyRunning` (nothing changes) unless IDLE, and with
    /// the source's own error if it cannot be opened.
    pub fn start(&mut self) -> Result<(), StartError> {
        {
            let mut state = self.shared.state();
            if *state != LoopState::Idle {
                return Err(PipelineError::AlreadyRunning);
            }
            *state = LoopState::Starting;
        }

        // A session that ended on its own still has a worker to reap.
        if let Some(previous) = self.session.take() {
            previous.join();
        }

        let mut source = (self.factory)();
        if let Err(err) = source.start() {
            source.release();
            self.shared.set_state(LoopState::Idle);
            log::error!("acquisition start failed: {}", err);
            return Err(err);
        }
        let uri = source
            .info()
            .map(|info| info.uri)
            .unwrap_or_else(|| "<unknown>".to_string());

        self.rate.reset();
        let stop = StopSignal::new();
        let worker = Worker {
            source,
            sink: self.sink.clone(),
            pacer: PacingEngine::new(self.clock.clone()).with_lag_warning(self.config.lag_warn_ms),
            config: self.config.clone(),
            rate: self.rate.clone(),
            shared: self.shared.clone(),
            stop: stop.clone(),
            report: SessionReport::default(),
        };

        // RUNNING before the worker exists, so a worker that fails at once
        // can still move the state back to IDLE.
        self.shared.set_state(LoopState::Running);
        let spawned = std::thread::Builder::new()
            .name("stream-pacer-worker".to_string())
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                self.session = Some(Session {
                    stop,
                    worker: handle,
                });
                log::info!("acquisition started for {}", uri);
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(LoopState::Idle);
                Err(PipelineError::unavailable(
                    uri,
                    format!("failed to spawn acquisition worker: {}", err),
                ))
            }
        }
    }

    /// Stop the running session. A no-op when nothing is running.
    ///
    /// The worker exits at its next safe point: immediately if it is waiting
    /// on the pacer, otherwise once the current grab returns. The source is
    /// released before this returns.
    pub fn stop(&mut self) {
        let _ = self.try_stop();
    }

    /// Like `stop`, but reports `NotRunning` instead of ignoring the call.
    pub fn try_stop(&mut self) -> Result<(), PipelineError> {
        {
            let mut state = self.shared.state();
            if *state != LoopState::Running {
                drop(state);
                if let Some(finished) = self.session.take() {
                    finished.join();
                }
                return Err(PipelineError::NotRunning);
            }
            *state = LoopState::Stopping;
        }

        if let Some(session) = self.session.take() {
            session.stop.cancel();
            session.join();
        }
        self.shared.set_state(LoopState::Idle);
        log::info!("acquisition stopped");
        Ok(())
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

struct Worker {
    source: Box<dyn FrameSource>,
    sink: Arc<dyn DisplaySink>,
    pacer: PacingEngine,
    config: LoopConfig,
    rate: Arc<RateCounter>,
    shared: Arc<Shared>,
    stop: StopSignal,
    report: SessionReport,
}

impl Worker {
    fn run(mut self) {
        let reason = match self.cycle() {
            Ok(()) => ExitReason::Stopped,
            Err(err) => {
                log::error!("acquisition session ended: {}", err);
                ExitReason::Failed(err)
            }
        };
        self.source.release();
        self.pacer.reset();

        let exit = SessionExit {
            reason,
            report: self.report,
        };
        log::info!(
            "session report: presented={} skipped={} pacing_inconsistencies={}",
            exit.report.frames_presented,
            exit.report.frames_skipped,
            exit.report.pacing_inconsistencies
        );
        *self
            .shared
            .last_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(exit.clone());

        {
            // A stop() in progress owns the STOPPING -> IDLE transition.
            let mut state = self.shared.state();
            if *state == LoopState::Running {
                *state = LoopState::Idle;
            }
        }

        let listener = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener(&exit);
        }
    }

    /// Runs until stopped (`Ok`) or until the source fails (`Err`).
    fn cycle(&mut self) -> Result<(), PipelineError> {
        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            let frame = self.source.grab()?;
            let (image, timestamp_us) = frame.into_parts();

            let image = match convert_owned(image, self.config.display_space) {
                Ok(image) => image,
                Err(err) if err.is_fatal_to_frame() => {
                    log::warn!("skipping frame at {}us: {}", timestamp_us, err);
                    self.report.frames_skipped += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let advice = self.pacer.advise(timestamp_us);
            if let Advice::Inconsistent(_) = advice {
                self.report.pacing_inconsistencies += 1;
            }
            let wait = advice.wait();
            if !wait.is_zero() && !self.stop.sleep(wait) {
                return Ok(());
            }

            self.sink.present(image);
            self.report.frames_presented += 1;
            self.rate.tick(self.config.expected_interval_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ColorTaggedImage;
    use crate::source::SourceConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    fn stub_factory(frame_limit: Option<u64>) -> SourceFactory {
        Box::new(move || {
            Box::new(StreamSource::new(SourceConfig {
                uri: "stub://unit".to_string(),
                width: 8,
                height: 8,
                frame_rate: 1_000,
                frame_limit,
                ..SourceConfig::default()
            })) as Box<dyn FrameSource>
        })
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn finite_stream_presents_every_frame_then_idles() {
        let presented = Arc::new(AtomicU64::new(0));
        let counter = presented.clone();
        let sink = Arc::new(move |image: ColorTaggedImage| {
            assert_eq!(image.space(), ColorSpace::Bgra);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut acquisition =
            AcquisitionLoop::new(stub_factory(Some(25)), sink, LoopConfig::default());

        acquisition.start().unwrap();
        wait_until(|| !acquisition.is_running());

        let exit = acquisition.last_exit().expect("session exit");
        assert_eq!(exit.reason, ExitReason::Failed(PipelineError::StreamEnded));
        assert_eq!(exit.report.frames_presented, 25);
        assert_eq!(presented.load(Ordering::SeqCst), 25);
        assert_eq!(acquisition.state(), LoopState::Idle);
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let mut acquisition = AcquisitionLoop::new(
            stub_factory(None),
            Arc::new(|_image: ColorTaggedImage| {}),
            LoopConfig::default(),
        );
        acquisition.stop();
        assert_eq!(acquisition.try_stop(), Err(PipelineError::NotRunning));
        assert_eq!(acquisition.state(), LoopState::Idle);
    }

    #[test]
    fn restart_after_stream_end_opens_a_new_session() {
        let mut acquisition = AcquisitionLoop::new(
            stub_factory(Some(3)),
            Arc::new(|_image: ColorTaggedImage| {}),
            LoopConfig::default(),
        );

        for _ in 0..2 {
            acquisition.start().unwrap();
            wait_until(|| !acquisition.is_running());
            let exit = acquisition.last_exit().expect("session exit");
            assert_eq!(exit.report.frames_presented, 3);
        }
    }
}
