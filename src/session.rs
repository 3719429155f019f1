use crate::config::VideoConfig;
use crate::error::{CrittercamError, Result};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Open capture session bound to one artifact.
///
/// `pump` is called once per recorder poll cycle and must complete within the
/// cycle's budget: a pull-based backend would grab and encode one frame here,
/// the process backend only checks encoder liveness. `close` consumes the
/// handle and finalizes the container so downstream tooling can read it;
/// use-after-close is unrepresentable.
pub trait SessionHandle: Send {
    fn pump(&mut self) -> Result<()>;
    fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for capture sessions. The recorder opens at most one at a time.
pub trait SessionBackend: Send {
    fn open(&self, artifact: &Path) -> Result<Box<dyn SessionHandle>>;
}

/// Artifact file name for a recording started at `now`:
/// `YYYY-MM-DD_HH-MM-SS.<ext>`, filesystem-safe and lexically sortable by
/// creation order.
pub fn artifact_name(now: DateTime<Local>, ext: &str) -> String {
    format!("{}.{}", now.format("%Y-%m-%d_%H-%M-%S"), ext)
}

/// Substitute the backend placeholders in a command template.
fn render_encoder_command(template: &str, config: &VideoConfig, artifact: &Path) -> String {
    template
        .replace("{output}", &artifact.to_string_lossy())
        .replace("{width}", &config.frame_size.0.to_string())
        .replace("{height}", &config.frame_size.1.to_string())
        .replace("{fps}", &config.frame_rate.to_string())
}

/// Session backend that delegates capture and encoding to an external
/// process (the original deployment drives a `gst-launch-1.0 -e` pipeline).
///
/// The encoder is self-driving once spawned; `close` asks it to finalize by
/// delivering SIGINT, which with `-e` makes the muxer flush its container
/// metadata before exiting.
pub struct EncoderProcessBackend {
    config: VideoConfig,
}

impl EncoderProcessBackend {
    pub fn new(config: VideoConfig) -> Self {
        Self { config }
    }
}

impl SessionBackend for EncoderProcessBackend {
    fn open(&self, artifact: &Path) -> Result<Box<dyn SessionHandle>> {
        let command = render_encoder_command(&self.config.encoder_command, &self.config, artifact);
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            CrittercamError::session(
                artifact.display().to_string(),
                "Encoder command is empty".to_string(),
            )
        })?;

        debug!("Spawning encoder: {}", command);

        let child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                CrittercamError::session(
                    artifact.display().to_string(),
                    format!("Failed to spawn encoder '{}': {}", program, e),
                )
            })?;

        info!(
            "Encoder started (pid {}) for {}",
            child.id(),
            artifact.display()
        );

        Ok(Box::new(EncoderProcessSession {
            artifact: artifact.to_path_buf(),
            child,
            finalize_timeout: Duration::from_secs(self.config.finalize_timeout_secs),
            exit_reported: false,
        }))
    }
}

/// A running external encoder bound to one artifact.
pub struct EncoderProcessSession {
    artifact: PathBuf,
    child: Child,
    finalize_timeout: Duration,
    exit_reported: bool,
}

impl SessionHandle for EncoderProcessSession {
    fn pump(&mut self) -> Result<()> {
        // Liveness check only; the encoder pulls its own frames
        match self.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                if self.exit_reported {
                    return Ok(());
                }
                self.exit_reported = true;
                Err(CrittercamError::session(
                    self.artifact.display().to_string(),
                    format!("Encoder exited early: {}", status),
                ))
            }
            Err(e) => Err(CrittercamError::session(
                self.artifact.display().to_string(),
                format!("Failed to poll encoder: {}", e),
            )),
        }
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        // Encoder already gone: reap it and report how it ended
        if let Ok(Some(status)) = self.child.try_wait() {
            warn!(
                "Encoder for {} exited before close: {}",
                self.artifact.display(),
                status
            );
            return Ok(());
        }

        #[cfg(unix)]
        {
            let pid = self.child.id() as libc::pid_t;
            let rc = unsafe { libc::kill(pid, libc::SIGINT) };
            if rc != 0 {
                warn!(
                    "Failed to signal encoder (pid {}), killing it instead",
                    pid
                );
                let _ = self.child.kill();
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }

        // Give the muxer a bounded window to flush container metadata
        let deadline = Instant::now() + self.finalize_timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!(
                        "Encoder finalized {} ({})",
                        self.artifact.display(),
                        status
                    );
                    return Ok(());
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        error!(
                            "Encoder for {} ignored finalize request, killing it",
                            self.artifact.display()
                        );
                        let _ = self.child.kill();
                        let _ = self.child.wait();
                        return Err(CrittercamError::session(
                            self.artifact.display().to_string(),
                            "Encoder did not finalize within timeout".to_string(),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(CrittercamError::session(
                        self.artifact.display().to_string(),
                        format!("Failed to wait for encoder: {}", e),
                    ));
                }
            }
        }
    }
}

/// Recorded lifecycle of a mock session, shared with the test that owns the
/// backend.
#[derive(Debug, Default)]
pub struct MockSessionLog {
    pub opened: Vec<PathBuf>,
    pub closed: Vec<PathBuf>,
}

/// In-memory session backend for tests: records opens and closes, and can be
/// told to fail either operation.
#[derive(Default, Clone)]
pub struct MockSessionBackend {
    log: Arc<Mutex<MockSessionLog>>,
    fail_open: bool,
    fail_close: bool,
}

impl MockSessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.log.lock().opened.clone()
    }

    pub fn closed(&self) -> Vec<PathBuf> {
        self.log.lock().closed.clone()
    }

    /// Sessions opened but not yet closed.
    pub fn open_count(&self) -> usize {
        let log = self.log.lock();
        log.opened.len() - log.closed.len()
    }
}

impl SessionBackend for MockSessionBackend {
    fn open(&self, artifact: &Path) -> Result<Box<dyn SessionHandle>> {
        if self.fail_open {
            return Err(CrittercamError::session(
                artifact.display().to_string(),
                "Mock open failure".to_string(),
            ));
        }
        self.log.lock().opened.push(artifact.to_path_buf());
        Ok(Box::new(MockSession {
            artifact: artifact.to_path_buf(),
            log: Arc::clone(&self.log),
            fail_close: self.fail_close,
        }))
    }
}

struct MockSession {
    artifact: PathBuf,
    log: Arc<Mutex<MockSessionLog>>,
    fail_close: bool,
}

impl SessionHandle for MockSession {
    fn pump(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.log.lock().closed.push(self.artifact.clone());
        if self.fail_close {
            return Err(CrittercamError::session(
                self.artifact.display().to_string(),
                "Mock close failure".to_string(),
            ));
        }
        Ok(())
    }
}
