use crate::error::{CrittercamError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One completed recording awaiting transfer. Consumed exactly once by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub artifact: PathBuf,
}

impl UploadJob {
    pub fn new(artifact: PathBuf) -> Self {
        Self { artifact }
    }
}

/// External "push this artifact" action. Returns whether the action reported
/// success; the dispatcher observes the outcome but never acts on it beyond
/// logging.
#[async_trait]
pub trait PushAction: Send + Sync {
    async fn push(&self, artifact: &Path) -> Result<bool>;
}

/// Push action that runs a shell command template, substituting `{artifact}`
/// per job. Matches the original deployment's handoff to a push script.
pub struct ShellPushAction {
    command_template: String,
}

impl ShellPushAction {
    pub fn new(command_template: String) -> Self {
        Self { command_template }
    }
}

#[async_trait]
impl PushAction for ShellPushAction {
    async fn push(&self, artifact: &Path) -> Result<bool> {
        let command = self
            .command_template
            .replace("{artifact}", &artifact.to_string_lossy());

        info!("Running push command: {}", command);

        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .status()
            .await
            .map_err(|e| {
                CrittercamError::component(
                    "uploader".to_string(),
                    format!("Failed to run push command: {}", e),
                )
            })?;

        Ok(status.success())
    }
}

/// Single-consumer dispatcher draining the upload queue strictly in order.
///
/// Each job's push action runs to completion before the next job starts. A
/// failed job is logged and skipped, never retried, and never halts the loop
/// (at-most-once delivery). The loop exits once the queue closes and every
/// remaining job has been drained.
pub struct Uploader {
    action: Box<dyn PushAction>,
}

impl Uploader {
    pub fn new(action: Box<dyn PushAction>) -> Self {
        Self { action }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<UploadJob>) {
        info!("Upload dispatcher started");

        while let Some(job) = rx.recv().await {
            info!("Dispatching upload: {}", job.artifact.display());
            match self.action.push(&job.artifact).await {
                Ok(true) => info!("Upload completed: {}", job.artifact.display()),
                Ok(false) => warn!(
                    "Push command reported failure for {}, continuing",
                    job.artifact.display()
                ),
                Err(e) => warn!(
                    "Push command could not run for {}: {}",
                    job.artifact.display(),
                    e
                ),
            }
        }

        info!("Upload dispatcher stopped (queue closed)");
    }
}
