use crate::config::CrittercamConfig;
use crate::error::{CrittercamError, Result};
use crate::light::Floodlight;
use crate::motion::MotionSource;
use crate::recorder::Recorder;
use crate::session::SessionBackend;
use crate::uploader::{PushAction, ShellPushAction, Uploader};

#[cfg(all(feature = "gpio", target_os = "linux"))]
use crate::light::GpioFloodlight;
#[cfg(all(feature = "gpio", target_os = "linux"))]
use crate::motion::GpioMotionSource;
use crate::session::EncoderProcessBackend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Component lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// System shutdown reason
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    Error(String),
}

/// Main application coordinator: wires the queues, starts the recorder and
/// uploader workers, arms the motion sensor and owns the shutdown sequence.
///
/// Shutdown order matters: first the motion source stops accepting events,
/// then the recorder is cancelled (finalizing any active session and turning
/// the floodlight off), and only then does the uploader drain out — its
/// queue closes when the recorder drops the sender.
pub struct CrittercamOrchestrator {
    config: CrittercamConfig,
    motion_source: Box<dyn MotionSource>,

    // Collaborators handed to the workers at start
    floodlight: Option<Box<dyn Floodlight>>,
    backend: Option<Box<dyn SessionBackend>>,
    push_action: Option<Box<dyn PushAction>>,

    // Worker tasks
    recorder_task: Option<JoinHandle<()>>,
    uploader_task: Option<JoinHandle<()>>,

    // Lifecycle management
    component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    cancellation_token: CancellationToken,
}

impl CrittercamOrchestrator {
    /// Create an orchestrator wired to the real hardware and the configured
    /// external encoder and push commands.
    pub fn new(config: CrittercamConfig) -> Result<Self> {
        #[cfg(all(feature = "gpio", target_os = "linux"))]
        {
            let motion_source = Box::new(GpioMotionSource::new(config.gpio.clone()));
            let floodlight = Box::new(GpioFloodlight::new(&config.gpio)?);
            let backend = Box::new(EncoderProcessBackend::new(config.video.clone()));
            let push_action = Box::new(ShellPushAction::new(config.upload.push_command.clone()));
            Ok(Self::with_components(
                config,
                motion_source,
                floodlight,
                backend,
                push_action,
            ))
        }

        #[cfg(not(all(feature = "gpio", target_os = "linux")))]
        {
            tracing::warn!("GPIO support not available on this platform, using a mock motion source");
            let motion_source = Box::new(crate::motion::MockMotionSource::new());
            let floodlight = Box::new(crate::light::MockFloodlight::new());
            let backend = Box::new(EncoderProcessBackend::new(config.video.clone()));
            let push_action = Box::new(ShellPushAction::new(config.upload.push_command.clone()));
            Ok(Self::with_components(
                config,
                motion_source,
                floodlight,
                backend,
                push_action,
            ))
        }
    }

    /// Create an orchestrator with explicit collaborators. Used by tests and
    /// by deployments that substitute their own backends.
    pub fn with_components(
        config: CrittercamConfig,
        motion_source: Box<dyn MotionSource>,
        floodlight: Box<dyn Floodlight>,
        backend: Box<dyn SessionBackend>,
        push_action: Box<dyn PushAction>,
    ) -> Self {
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        Self {
            config,
            motion_source,
            floodlight: Some(floodlight),
            backend: Some(backend),
            push_action: Some(push_action),
            recorder_task: None,
            uploader_task: None,
            component_states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all system components.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting crittercam system");

        let floodlight = self
            .floodlight
            .take()
            .ok_or_else(|| CrittercamError::system("Orchestrator already started"))?;
        let backend = self
            .backend
            .take()
            .ok_or_else(|| CrittercamError::system("Orchestrator already started"))?;
        let push_action = self
            .push_action
            .take()
            .ok_or_else(|| CrittercamError::system("Orchestrator already started"))?;

        let (motion_tx, motion_rx) = mpsc::channel(self.config.recorder.motion_queue_capacity);
        let (upload_tx, upload_rx) = mpsc::channel(self.config.upload.queue_capacity);

        // Uploader first so jobs flushed during startup have a consumer
        self.set_component_state("uploader", ComponentState::Starting)
            .await;
        let uploader = Uploader::new(push_action);
        self.uploader_task = Some(tokio::spawn(uploader.run(upload_rx)));
        self.set_component_state("uploader", ComponentState::Running)
            .await;
        info!("Upload dispatcher started");

        self.set_component_state("recorder", ComponentState::Starting)
            .await;
        let recorder = Recorder::builder()
            .config(self.config.recorder.clone())
            .video(self.config.video.clone())
            .floodlight(floodlight)
            .backend(backend)
            .motion_rx(motion_rx)
            .upload_tx(upload_tx)
            .build()?;
        self.recorder_task = Some(tokio::spawn(
            recorder.run(self.cancellation_token.child_token()),
        ));
        self.set_component_state("recorder", ComponentState::Running)
            .await;
        info!("Recorder started");

        // Arm the sensor last so no event arrives before its consumer runs
        self.set_component_state("motion", ComponentState::Starting)
            .await;
        self.motion_source.start(motion_tx).map_err(|e| {
            error!("Failed to start motion source: {}", e);
            e
        })?;
        self.set_component_state("motion", ComponentState::Running)
            .await;
        info!("Motion source started");

        info!("Crittercam system started successfully");
        Ok(())
    }

    /// Run the main application loop with signal handling.
    pub async fn run(&mut self) -> Result<i32> {
        info!("Crittercam system is running");

        let shutdown_sender = self.shutdown_sender.take().ok_or_else(|| {
            CrittercamError::system("Shutdown sender already taken")
        })?;

        let shutdown_receiver = self.shutdown_receiver.take().ok_or_else(|| {
            CrittercamError::system("Shutdown receiver already taken")
        })?;

        Self::setup_signal_handlers(shutdown_sender);

        let shutdown_reason = shutdown_receiver.await.map_err(|_| {
            CrittercamError::system("Shutdown channel closed unexpectedly")
        })?;

        info!("Shutdown initiated: {:?}", shutdown_reason);

        let exit_code = self.stop().await?;

        info!("Crittercam system shutdown complete");
        Ok(exit_code)
    }

    /// Set up signal handlers for graceful shutdown.
    fn setup_signal_handlers(shutdown_sender: oneshot::Sender<ShutdownReason>) {
        let shutdown_sender = Arc::new(Mutex::new(Some(shutdown_sender)));

        // SIGTERM (systemd stop) - Unix only
        #[cfg(unix)]
        {
            let shutdown_sender_sigterm = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                if let Some(()) =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("Failed to register SIGTERM handler")
                        .recv()
                        .await
                {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = shutdown_sender_sigterm.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        // SIGINT (Ctrl+C) - Cross-platform
        let shutdown_sender_sigint = Arc::clone(&shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = shutdown_sender_sigint.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }

    /// Perform graceful shutdown of all components.
    ///
    /// Stops the motion source first so no new events are accepted, cancels
    /// the recorder (which finalizes an active session, turns the floodlight
    /// off and flushes buffered artifacts), then waits for the uploader to
    /// drain its queue.
    pub async fn stop(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");

        let mut exit_code = 0;

        self.set_component_state("motion", ComponentState::Stopping)
            .await;
        if let Err(e) = self.motion_source.stop() {
            error!("Error stopping motion source: {}", e);
            self.set_component_state("motion", ComponentState::Failed)
                .await;
            exit_code = 1;
        } else {
            self.set_component_state("motion", ComponentState::Stopped)
                .await;
        }

        self.cancellation_token.cancel();

        if let Some(task) = self.recorder_task.take() {
            self.set_component_state("recorder", ComponentState::Stopping)
                .await;
            match timeout(Duration::from_secs(15), task).await {
                Ok(Ok(())) => {
                    self.set_component_state("recorder", ComponentState::Stopped)
                        .await;
                    info!("Recorder stopped");
                }
                Ok(Err(e)) => {
                    self.set_component_state("recorder", ComponentState::Failed)
                        .await;
                    error!("Recorder task panicked: {}", e);
                    exit_code = 1;
                }
                Err(_) => {
                    self.set_component_state("recorder", ComponentState::Failed)
                        .await;
                    error!("Recorder stop timeout");
                    exit_code = 1;
                }
            }
        }

        // The recorder dropped the upload sender, so the dispatcher exits
        // once it has drained every remaining job
        if let Some(task) = self.uploader_task.take() {
            self.set_component_state("uploader", ComponentState::Stopping)
                .await;
            match timeout(Duration::from_secs(60), task).await {
                Ok(Ok(())) => {
                    self.set_component_state("uploader", ComponentState::Stopped)
                        .await;
                    info!("Upload dispatcher stopped");
                }
                Ok(Err(e)) => {
                    self.set_component_state("uploader", ComponentState::Failed)
                        .await;
                    error!("Uploader task panicked: {}", e);
                    exit_code = 1;
                }
                Err(_) => {
                    self.set_component_state("uploader", ComponentState::Failed)
                        .await;
                    error!("Uploader drain timeout");
                    exit_code = 1;
                }
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Update component state.
    async fn set_component_state(&self, component: &str, state: ComponentState) {
        let mut states = self.component_states.lock().await;
        states.insert(component.to_string(), state.clone());
        debug!("Component '{}' state changed to: {:?}", component, state);
    }

    /// Get component state.
    pub async fn get_component_state(&self, component: &str) -> Option<ComponentState> {
        let states = self.component_states.lock().await;
        states.get(component).cloned()
    }

    /// Get all component states.
    pub async fn get_all_component_states(&self) -> HashMap<String, ComponentState> {
        let states = self.component_states.lock().await;
        states.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecorderConfig, VideoConfig};
    use crate::light::MockFloodlight;
    use crate::motion::{MockMotionHandle, MockMotionSource};
    use crate::session::MockSessionBackend;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::path::{Path, PathBuf};

    struct RecordingPushAction {
        pushed: Arc<SyncMutex<Vec<PathBuf>>>,
    }

    #[async_trait]
    impl PushAction for RecordingPushAction {
        async fn push(&self, artifact: &Path) -> Result<bool> {
            self.pushed.lock().push(artifact.to_path_buf());
            Ok(true)
        }
    }

    fn fast_config() -> CrittercamConfig {
        let mut config = CrittercamConfig::default();
        config.recorder = RecorderConfig {
            motion_timeout_secs: 1,
            upload_debounce_secs: 1,
            poll_interval_ms: 10,
            min_retrigger_secs: 0,
            motion_queue_capacity: 16,
        };
        config.video = VideoConfig {
            artifact_dir: "/tmp/crittercam_test".to_string(),
            container_ext: "mp4".to_string(),
            frame_rate: 15,
            frame_size: (640, 480),
            encoder_command: "true {output}".to_string(),
            finalize_timeout_secs: 2,
        };
        config
    }

    fn mock_orchestrator() -> (
        CrittercamOrchestrator,
        MockMotionHandle,
        MockFloodlight,
        MockSessionBackend,
        Arc<SyncMutex<Vec<PathBuf>>>,
    ) {
        let source = MockMotionSource::new();
        let handle = source.handle();
        let floodlight = MockFloodlight::new();
        let backend = MockSessionBackend::new();
        let pushed = Arc::new(SyncMutex::new(Vec::new()));

        let orchestrator = CrittercamOrchestrator::with_components(
            fast_config(),
            Box::new(source),
            Box::new(floodlight.clone()),
            Box::new(backend.clone()),
            Box::new(RecordingPushAction {
                pushed: Arc::clone(&pushed),
            }),
        );

        (orchestrator, handle, floodlight, backend, pushed)
    }

    #[tokio::test]
    async fn test_start_and_stop_lifecycle() {
        let (mut orchestrator, _handle, _floodlight, _backend, _pushed) = mock_orchestrator();

        orchestrator.start().await.unwrap();
        assert_eq!(
            orchestrator.get_component_state("recorder").await,
            Some(ComponentState::Running)
        );
        assert_eq!(
            orchestrator.get_component_state("uploader").await,
            Some(ComponentState::Running)
        );
        assert_eq!(
            orchestrator.get_component_state("motion").await,
            Some(ComponentState::Running)
        );

        let exit_code = orchestrator.stop().await.unwrap();
        assert_eq!(exit_code, 0);

        let states = orchestrator.get_all_component_states().await;
        assert!(states.values().all(|s| *s == ComponentState::Stopped));
    }

    #[tokio::test]
    async fn test_motion_to_upload_end_to_end() {
        let (mut orchestrator, handle, floodlight, backend, pushed) = mock_orchestrator();
        orchestrator.start().await.unwrap();

        assert!(handle.emit());

        // Recording starts within a few poll cycles
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(floodlight.is_on());
        assert_eq!(backend.open_count(), 1);

        // Wait out the motion timeout and the upload debounce
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!floodlight.is_on());
        assert_eq!(backend.open_count(), 0);
        assert_eq!(pushed.lock().len(), 1);

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_recording_finalizes_artifact() {
        let (mut orchestrator, handle, floodlight, backend, pushed) = mock_orchestrator();
        orchestrator.start().await.unwrap();

        assert!(handle.emit());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.open_count(), 1);

        // Stop mid-recording: the artifact is finalized, the light goes off
        // and the buffered artifact still reaches the push action
        orchestrator.stop().await.unwrap();

        assert_eq!(backend.closed().len(), 1);
        assert!(!floodlight.is_on());
        assert_eq!(pushed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let (mut orchestrator, _handle, _floodlight, _backend, _pushed) = mock_orchestrator();
        orchestrator.start().await.unwrap();
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await.unwrap();
    }
}
