use crate::config::{RecorderConfig, VideoConfig};
use crate::error::{CrittercamError, Result};
use crate::light::Floodlight;
use crate::motion::MotionEvent;
use crate::session::{artifact_name, SessionBackend, SessionHandle};
use crate::uploader::UploadJob;
use chrono::Local;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Recorder lifecycle states.
///
/// `Starting` and `Stopping` are transient: they are entered and collapsed
/// into `Recording` / `Idle` within a single poll cycle, so between cycles
/// the recorder is only ever `Idle` or `Recording`. Invalid states are
/// unrepresentable; every transition is an exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Starting,
    Recording,
    Stopping,
}

/// A completed recording buffered until the upload debounce window elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub artifact: PathBuf,
}

/// The capture session currently being written. Present iff the recorder is
/// `Recording`; two concurrent writers to the capture device would corrupt
/// both, so this is the invariant everything else hangs off.
struct ActiveSession {
    artifact: PathBuf,
    handle: Box<dyn SessionHandle>,
}

/// Motion-triggered recording state machine.
///
/// Owns the recording lifecycle: consumes motion events, opens and closes
/// capture sessions, drives the floodlight, enforces the timeout-based auto
/// stop, and buffers completed artifacts until the upload debounce window
/// since the *last* stop has elapsed, so all recordings from one contiguous
/// motion burst ship together.
///
/// All state mutation happens on the poll loop; the interrupt side only ever
/// enqueues into the motion channel.
pub struct Recorder {
    config: RecorderConfig,
    video: VideoConfig,
    state: RecorderState,
    session: Option<ActiveSession>,
    started_at: Option<Instant>,
    last_stop: Option<Instant>,
    pending: VecDeque<PendingUpload>,
    floodlight: Box<dyn Floodlight>,
    backend: Box<dyn SessionBackend>,
    motion_rx: mpsc::Receiver<MotionEvent>,
    upload_tx: mpsc::Sender<UploadJob>,
    shut_down: bool,
}

impl Recorder {
    pub fn builder() -> RecorderBuilder {
        RecorderBuilder::new()
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    fn motion_timeout(&self) -> Duration {
        Duration::from_secs(self.config.motion_timeout_secs)
    }

    fn upload_debounce(&self) -> Duration {
        Duration::from_secs(self.config.upload_debounce_secs)
    }

    fn min_retrigger(&self) -> Duration {
        Duration::from_secs(self.config.min_retrigger_secs)
    }

    /// Handle one observed motion event.
    ///
    /// From `Idle` this requests a transition toward `Recording`; while a
    /// recording is active it resets the timeout instead, and never opens a
    /// second session.
    pub fn on_motion(&mut self, now: Instant) {
        match self.state {
            RecorderState::Idle => {
                debug!("Motion event while idle, starting recording");
                self.state = RecorderState::Starting;
            }
            RecorderState::Starting => {
                // Already on the way up; the coming tick opens the session
                debug!("Motion event while starting, ignored");
            }
            RecorderState::Recording => {
                if let Some(started_at) = self.started_at {
                    if now.duration_since(started_at) >= self.min_retrigger() {
                        info!("Motion re-trigger, resetting timeout");
                        self.started_at = Some(now);
                    } else {
                        debug!("Motion re-trigger inside minimum interval, ignored");
                    }
                }
            }
            RecorderState::Stopping => {
                // Transient within a tick, never observable here; treat a
                // racing event as a fresh start request
                self.state = RecorderState::Starting;
            }
        }
    }

    /// Advance the state machine by one poll cycle.
    ///
    /// Performs at most one state transition, with the transient states
    /// collapsed in the same cycle: `Starting` lands in `Recording`,
    /// a timed-out `Recording` lands in `Idle`.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            RecorderState::Starting => self.begin_recording(now),
            RecorderState::Recording => {
                let started_at = self
                    .started_at
                    .expect("recording without a start time is a state machine defect");
                if now.duration_since(started_at) >= self.motion_timeout() {
                    info!("Motion timeout elapsed, stopping recording");
                    self.state = RecorderState::Stopping;
                    self.finish_recording(now);
                } else if let Some(session) = self.session.as_mut() {
                    if let Err(e) = session.handle.pump() {
                        // Surfaced to the operator; the timeout transition
                        // still runs so we never wedge in Recording
                        warn!("Capture backend error: {}", e);
                    }
                }
            }
            RecorderState::Idle => self.flush_pending(now),
            RecorderState::Stopping => self.finish_recording(now),
        }
    }

    /// Open a new session named by the current wall-clock time, turn the
    /// floodlight on and enter `Recording`.
    fn begin_recording(&mut self, now: Instant) {
        debug_assert!(self.session.is_none(), "second concurrent capture session");

        let name = artifact_name(Local::now(), &self.video.container_ext);
        let artifact = Path::new(&self.video.artifact_dir).join(&name);

        match self.backend.open(&artifact) {
            Ok(handle) => {
                info!("Recording started: {}", artifact.display());
                self.session = Some(ActiveSession { artifact, handle });
                self.floodlight.set_on();
                self.started_at = Some(now);
                self.state = RecorderState::Recording;
            }
            Err(e) => {
                error!("Failed to open capture session: {}", e);
                self.state = RecorderState::Idle;
            }
        }
    }

    /// Close the active session, turn the floodlight off, buffer the artifact
    /// for upload and return to `Idle`.
    fn finish_recording(&mut self, now: Instant) {
        if let Some(active) = self.session.take() {
            self.floodlight.set_off();
            match active.handle.close() {
                Ok(()) => info!("Recording finalized: {}", active.artifact.display()),
                Err(e) => {
                    // A partially written file is preferable to none, so the
                    // artifact is still queued best-effort
                    error!(
                        "Failed to finalize {}: {}",
                        active.artifact.display(),
                        e
                    );
                }
            }
            debug!(
                "Buffered {} for upload ({} pending)",
                active.artifact.display(),
                self.pending.len() + 1
            );
            self.pending.push_back(PendingUpload {
                artifact: active.artifact,
            });
            self.last_stop = Some(now);
        }
        self.started_at = None;
        self.state = RecorderState::Idle;
    }

    /// Debounce-and-flush check, run while `Idle`: once the debounce window
    /// since the last stop has passed, hand every buffered artifact to the
    /// upload queue in completion order.
    fn flush_pending(&mut self, now: Instant) {
        if self.pending.is_empty() {
            return;
        }
        let Some(last_stop) = self.last_stop else {
            return;
        };
        if now.duration_since(last_stop) <= self.upload_debounce() {
            return;
        }

        info!(
            "Upload debounce elapsed, dispatching {} artifact(s)",
            self.pending.len()
        );
        self.dispatch_pending();
    }

    /// Move buffered artifacts to the upload queue, preserving order. If the
    /// bounded queue fills up the remainder stays buffered and is retried on
    /// the next cycle; nothing is dropped while the process lives.
    fn dispatch_pending(&mut self) {
        while let Some(pending) = self.pending.front() {
            let job = UploadJob::new(pending.artifact.clone());
            match self.upload_tx.try_send(job) {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Upload queue full, {} artifact(s) stay buffered",
                        self.pending.len()
                    );
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!(
                        "Upload queue closed, dropping {} artifact(s)",
                        self.pending.len()
                    );
                    self.pending.clear();
                    break;
                }
            }
        }
    }

    /// Terminate cleanly: finalize any active session, flush the floodlight
    /// off and hand all buffered artifacts to the uploader (the debounce is
    /// waived on shutdown). Idempotent; a second call is a no-op.
    pub fn shutdown(&mut self, now: Instant) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.session.is_some() {
            info!("Shutdown while recording, finalizing active session");
            self.state = RecorderState::Stopping;
            self.finish_recording(now);
        }

        if !self.pending.is_empty() {
            info!(
                "Flushing {} buffered artifact(s) on shutdown",
                self.pending.len()
            );
            self.dispatch_pending();
        }
    }

    /// The recorder's poll loop: drain the motion queue without blocking,
    /// advance the state machine, then sleep out the remainder of the cycle.
    /// When a cycle overruns its budget the sleep is skipped; state
    /// transitions are never dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        info!("Recorder loop started (poll interval {:?})", poll_interval);

        loop {
            let cycle_start = Instant::now();

            loop {
                match self.motion_rx.try_recv() {
                    Ok(MotionEvent) => self.on_motion(cycle_start),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        // Source stopped; keep ticking so an active recording
                        // still times out and flushes
                        break;
                    }
                }
            }

            self.tick(cycle_start);

            if cancel.is_cancelled() {
                break;
            }

            let elapsed = cycle_start.elapsed();
            if elapsed < poll_interval {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval - elapsed) => {}
                }
            }
        }

        self.shutdown(Instant::now());
        info!("Recorder loop stopped");
    }
}

/// Builder wiring the recorder's collaborators together.
pub struct RecorderBuilder {
    config: Option<RecorderConfig>,
    video: Option<VideoConfig>,
    floodlight: Option<Box<dyn Floodlight>>,
    backend: Option<Box<dyn SessionBackend>>,
    motion_rx: Option<mpsc::Receiver<MotionEvent>>,
    upload_tx: Option<mpsc::Sender<UploadJob>>,
}

impl RecorderBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            video: None,
            floodlight: None,
            backend: None,
            motion_rx: None,
            upload_tx: None,
        }
    }

    pub fn config(mut self, config: RecorderConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn video(mut self, video: VideoConfig) -> Self {
        self.video = Some(video);
        self
    }

    pub fn floodlight(mut self, floodlight: Box<dyn Floodlight>) -> Self {
        self.floodlight = Some(floodlight);
        self
    }

    pub fn backend(mut self, backend: Box<dyn SessionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn motion_rx(mut self, motion_rx: mpsc::Receiver<MotionEvent>) -> Self {
        self.motion_rx = Some(motion_rx);
        self
    }

    pub fn upload_tx(mut self, upload_tx: mpsc::Sender<UploadJob>) -> Self {
        self.upload_tx = Some(upload_tx);
        self
    }

    pub fn build(self) -> Result<Recorder> {
        let config = self
            .config
            .ok_or_else(|| CrittercamError::component("recorder", "Config is required"))?;
        let video = self
            .video
            .ok_or_else(|| CrittercamError::component("recorder", "Video config is required"))?;
        let floodlight = self
            .floodlight
            .ok_or_else(|| CrittercamError::component("recorder", "Floodlight is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| CrittercamError::component("recorder", "Session backend is required"))?;
        let motion_rx = self
            .motion_rx
            .ok_or_else(|| CrittercamError::component("recorder", "Motion receiver is required"))?;
        let upload_tx = self
            .upload_tx
            .ok_or_else(|| CrittercamError::component("recorder", "Upload sender is required"))?;

        Ok(Recorder {
            config,
            video,
            state: RecorderState::Idle,
            session: None,
            started_at: None,
            last_stop: None,
            pending: VecDeque::new(),
            floodlight,
            backend,
            motion_rx,
            upload_tx,
            shut_down: false,
        })
    }
}

impl Default for RecorderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::light::MockFloodlight;
    use crate::motion::MockMotionSource;
    use crate::motion::MotionSource;
    use crate::session::MockSessionBackend;

    const SEC: Duration = Duration::from_secs(1);

    struct Harness {
        recorder: Recorder,
        floodlight: MockFloodlight,
        backend: MockSessionBackend,
        _motion_tx: mpsc::Sender<MotionEvent>,
        upload_rx: mpsc::Receiver<UploadJob>,
        t0: Instant,
    }

    fn test_config() -> RecorderConfig {
        RecorderConfig {
            motion_timeout_secs: 30,
            upload_debounce_secs: 60,
            poll_interval_ms: 100,
            min_retrigger_secs: 0,
            motion_queue_capacity: 16,
        }
    }

    fn test_video() -> VideoConfig {
        VideoConfig {
            artifact_dir: "/tmp/crittercam_test".to_string(),
            container_ext: "mp4".to_string(),
            frame_rate: 15,
            frame_size: (640, 480),
            encoder_command: "true {output}".to_string(),
            finalize_timeout_secs: 2,
        }
    }

    fn harness_with(config: RecorderConfig, backend: MockSessionBackend) -> Harness {
        let floodlight = MockFloodlight::new();
        let (motion_tx, motion_rx) = mpsc::channel(16);
        let (upload_tx, upload_rx) = mpsc::channel(8);

        let recorder = Recorder::builder()
            .config(config)
            .video(test_video())
            .floodlight(Box::new(floodlight.clone()))
            .backend(Box::new(backend.clone()))
            .motion_rx(motion_rx)
            .upload_tx(upload_tx)
            .build()
            .unwrap();

        Harness {
            recorder,
            floodlight,
            backend,
            _motion_tx: motion_tx,
            upload_rx,
            t0: Instant::now(),
        }
    }

    fn harness() -> Harness {
        harness_with(test_config(), MockSessionBackend::new())
    }

    impl Harness {
        fn at(&self, secs: u64) -> Instant {
            self.t0 + Duration::from_secs(secs)
        }

        fn motion_at(&mut self, secs: u64) {
            let now = self.at(secs);
            self.recorder.on_motion(now);
            self.recorder.tick(now);
        }

        fn tick_at(&mut self, secs: u64) {
            self.recorder.tick(self.at(secs));
        }

        fn drain_uploads(&mut self) -> Vec<PathBuf> {
            let mut jobs = Vec::new();
            while let Ok(job) = self.upload_rx.try_recv() {
                jobs.push(job.artifact);
            }
            jobs
        }
    }

    #[tokio::test]
    async fn test_motion_while_idle_opens_one_session() {
        let mut h = harness();
        assert_eq!(h.recorder.state(), RecorderState::Idle);

        h.motion_at(0);

        assert_eq!(h.recorder.state(), RecorderState::Recording);
        assert_eq!(h.backend.open_count(), 1);
        assert!(h.floodlight.is_on());
    }

    #[tokio::test]
    async fn test_retrigger_never_opens_second_session() {
        let mut h = harness();
        h.motion_at(0);
        h.motion_at(5);
        h.motion_at(10);

        assert_eq!(h.backend.opened().len(), 1);
        assert_eq!(h.recorder.state(), RecorderState::Recording);
    }

    #[tokio::test]
    async fn test_timeout_stops_recording_never_earlier() {
        let mut h = harness();
        h.motion_at(0);

        // One tick shy of the timeout: still recording
        h.recorder.tick(h.at(30) - Duration::from_millis(100));
        assert_eq!(h.recorder.state(), RecorderState::Recording);

        h.tick_at(30);
        assert_eq!(h.recorder.state(), RecorderState::Idle);
        assert_eq!(h.backend.closed().len(), 1);
        assert!(!h.floodlight.is_on());
    }

    #[tokio::test]
    async fn test_retrigger_extends_timeout() {
        // Events at t=0 and t=20 with timeout 30: effective stop at t=50
        let mut h = harness();
        h.motion_at(0);
        h.motion_at(20);

        h.tick_at(30);
        assert_eq!(h.recorder.state(), RecorderState::Recording);
        h.tick_at(49);
        assert_eq!(h.recorder.state(), RecorderState::Recording);

        h.tick_at(50);
        assert_eq!(h.recorder.state(), RecorderState::Idle);
        assert_eq!(h.backend.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_min_retrigger_interval_suppresses_reset() {
        let mut config = test_config();
        config.min_retrigger_secs = 10;
        let mut h = harness_with(config, MockSessionBackend::new());

        h.motion_at(0);
        // Inside the minimum interval: timeout not reset
        h.motion_at(5);

        h.tick_at(30);
        assert_eq!(h.recorder.state(), RecorderState::Idle);
    }

    #[tokio::test]
    async fn test_actuator_on_iff_recording() {
        let mut h = harness();
        assert!(!h.floodlight.is_on());

        h.motion_at(0);
        assert!(h.floodlight.is_on());

        h.tick_at(30);
        assert!(!h.floodlight.is_on());
        assert_eq!(h.floodlight.writes(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_debounce_flush_after_last_stop() {
        // Scenario from the field: timeout 30, debounce 60. Motion at t=0,
        // stop at t=30, no further events: flush exactly once after t=90.
        let mut h = harness();
        h.motion_at(0);
        h.tick_at(30);

        h.tick_at(90);
        assert!(h.drain_uploads().is_empty(), "flushed at the window edge");

        h.tick_at(91);
        let jobs = h.drain_uploads();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_burst_of_recordings_flushes_together_in_order() {
        let mut h = harness();

        // First recording: t=0..30
        h.motion_at(0);
        h.tick_at(30);
        // Second recording: t=40..70, inside the first one's debounce window
        h.motion_at(40);
        h.tick_at(70);

        // Debounce measured from the *last* stop: nothing at t=91
        h.tick_at(91);
        assert!(h.drain_uploads().is_empty());

        // Both ship in one flush after t=130, in completion order
        h.tick_at(131);
        let jobs = h.drain_uploads();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs, h.backend.closed());
    }

    #[tokio::test]
    async fn test_full_upload_queue_retries_next_cycle() {
        let floodlight = MockFloodlight::new();
        let backend = MockSessionBackend::new();
        let (_motion_tx, motion_rx) = mpsc::channel(16);
        let (upload_tx, mut upload_rx) = mpsc::channel(1);

        let mut recorder = Recorder::builder()
            .config(test_config())
            .video(test_video())
            .floodlight(Box::new(floodlight))
            .backend(Box::new(backend.clone()))
            .motion_rx(motion_rx)
            .upload_tx(upload_tx)
            .build()
            .unwrap();

        let t0 = Instant::now();
        // Two recordings back to back
        for start in [0u64, 40] {
            recorder.on_motion(t0 + Duration::from_secs(start));
            recorder.tick(t0 + Duration::from_secs(start));
            recorder.tick(t0 + Duration::from_secs(start + 30));
        }

        // Queue capacity 1: only the first artifact fits
        recorder.tick(t0 + Duration::from_secs(131));
        let first = upload_rx.try_recv().unwrap();
        assert!(upload_rx.try_recv().is_err());

        // The remainder goes out on a later cycle, order preserved
        recorder.tick(t0 + Duration::from_secs(132));
        let second = upload_rx.try_recv().unwrap();
        assert_eq!(vec![first.artifact, second.artifact], backend.closed());
    }

    #[tokio::test]
    async fn test_open_failure_returns_to_idle() {
        let mut h = harness_with(test_config(), MockSessionBackend::failing_open());

        h.motion_at(0);

        assert_eq!(h.recorder.state(), RecorderState::Idle);
        assert!(!h.floodlight.is_on());
        // No artifact exists, so nothing is queued
        h.tick_at(100);
        assert!(h.drain_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_close_failure_still_queues_artifact() {
        let mut h = harness_with(test_config(), MockSessionBackend::failing_close());

        h.motion_at(0);
        h.tick_at(30);

        assert_eq!(h.recorder.state(), RecorderState::Idle);
        assert!(!h.floodlight.is_on());

        // Partially written file still ships
        h.tick_at(91);
        assert_eq!(h.drain_uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_idle_is_a_noop() {
        let mut h = harness();

        h.recorder.shutdown(h.at(0));

        assert_eq!(h.recorder.state(), RecorderState::Idle);
        assert!(h.floodlight.writes().is_empty());
        assert!(h.drain_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_while_recording_finalizes_and_flushes() {
        let mut h = harness();
        h.motion_at(0);

        h.recorder.shutdown(h.at(10));

        // Exactly one finalized artifact, actuator off, debounce waived
        assert_eq!(h.backend.closed().len(), 1);
        assert!(!h.floodlight.is_on());
        assert_eq!(h.drain_uploads().len(), 1);

        // Second call is a no-op
        h.recorder.shutdown(h.at(11));
        assert_eq!(h.backend.closed().len(), 1);
        assert!(h.drain_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_events_in_one_cycle_start_once() {
        let mut h = harness();
        let now = h.at(0);

        // Two edges drained in the same cycle before the tick
        h.recorder.on_motion(now);
        h.recorder.on_motion(now);
        h.recorder.tick(now);

        assert_eq!(h.backend.open_count(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_end_to_end() {
        let floodlight = MockFloodlight::new();
        let backend = MockSessionBackend::new();
        let mut source = MockMotionSource::new();
        let handle = source.handle();

        let (motion_tx, motion_rx) = mpsc::channel(16);
        let (upload_tx, mut upload_rx) = mpsc::channel(8);
        source.start(motion_tx).unwrap();

        let config = RecorderConfig {
            motion_timeout_secs: 1,
            upload_debounce_secs: 1,
            poll_interval_ms: 10,
            min_retrigger_secs: 0,
            motion_queue_capacity: 16,
        };

        let recorder = Recorder::builder()
            .config(config)
            .video(test_video())
            .floodlight(Box::new(floodlight.clone()))
            .backend(Box::new(backend.clone()))
            .motion_rx(motion_rx)
            .upload_tx(upload_tx)
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(recorder.run(cancel.clone()));

        assert!(handle.emit());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(floodlight.is_on());
        assert_eq!(backend.open_count(), 1);

        // Wait out the timeout plus the debounce window
        let job = tokio::time::timeout(Duration::from_secs(5), upload_rx.recv())
            .await
            .expect("flush never happened")
            .expect("upload queue closed early");
        assert_eq!(Some(&job.artifact), backend.closed().first());
        assert!(!floodlight.is_on());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("recorder loop did not stop")
            .unwrap();
    }
}
