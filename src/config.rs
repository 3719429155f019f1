use crate::error::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CrittercamConfig {
    pub gpio: GpioConfig,
    pub recorder: RecorderConfig,
    pub video: VideoConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpioConfig {
    /// BCM pin number of the motion sensor input
    #[serde(default = "default_motion_pin")]
    pub motion_pin: u8,

    /// BCM pin number of the floodlight output
    #[serde(default = "default_light_pin")]
    pub light_pin: u8,

    /// Level the motion sensor drives the input to when it detects motion
    #[serde(default = "default_active_level")]
    pub active_level: ActiveLevel,

    /// Hardware debounce window for the motion edge, in milliseconds (0 disables)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecorderConfig {
    /// Seconds of no motion before a recording is stopped
    #[serde(default = "default_motion_timeout_secs")]
    pub motion_timeout_secs: u64,

    /// Seconds after the last stop before buffered artifacts are handed to the uploader
    #[serde(default = "default_upload_debounce_secs")]
    pub upload_debounce_secs: u64,

    /// Poll cycle period of the recorder loop, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Minimum seconds between timeout resets from repeated motion (0 = reset unconditionally)
    #[serde(default = "default_min_retrigger_secs")]
    pub min_retrigger_secs: u64,

    /// Capacity of the motion event queue fed from interrupt context
    #[serde(default = "default_motion_queue_capacity")]
    pub motion_queue_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VideoConfig {
    /// Directory where finished recordings are written
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    /// Container extension for recorded artifacts
    #[serde(default = "default_container_ext")]
    pub container_ext: String,

    /// Target frame rate of the capture backend
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// Frame size (width, height)
    #[serde(default = "default_frame_size")]
    pub frame_size: (u32, u32),

    /// External encoder command template; `{output}`, `{width}`, `{height}` and
    /// `{fps}` are substituted before the command is spawned
    #[serde(default = "default_encoder_command")]
    pub encoder_command: String,

    /// Seconds to wait for the encoder to finalize the container on close
    #[serde(default = "default_finalize_timeout_secs")]
    pub finalize_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UploadConfig {
    /// External push command template; `{artifact}` is substituted per job
    #[serde(default = "default_push_command")]
    pub push_command: String,

    /// Capacity of the upload job queue
    #[serde(default = "default_upload_queue_capacity")]
    pub queue_capacity: usize,
}

/// Electrical level the motion sensor asserts when it fires.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActiveLevel {
    High,
    Low,
}

impl CrittercamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self> {
        Self::load_from_file("crittercam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("gpio.motion_pin", default_motion_pin() as i64)?
            .set_default("gpio.light_pin", default_light_pin() as i64)?
            .set_default("gpio.active_level", "high")?
            .set_default("gpio.debounce_ms", default_debounce_ms() as i64)?
            .set_default(
                "recorder.motion_timeout_secs",
                default_motion_timeout_secs() as i64,
            )?
            .set_default(
                "recorder.upload_debounce_secs",
                default_upload_debounce_secs() as i64,
            )?
            .set_default(
                "recorder.poll_interval_ms",
                default_poll_interval_ms() as i64,
            )?
            .set_default(
                "recorder.min_retrigger_secs",
                default_min_retrigger_secs() as i64,
            )?
            .set_default(
                "recorder.motion_queue_capacity",
                default_motion_queue_capacity() as i64,
            )?
            .set_default("video.artifact_dir", default_artifact_dir())?
            .set_default("video.container_ext", default_container_ext())?
            .set_default("video.frame_rate", default_frame_rate() as i64)?
            .set_default(
                "video.frame_size",
                vec![default_frame_size().0, default_frame_size().1],
            )?
            .set_default("video.encoder_command", default_encoder_command())?
            .set_default(
                "video.finalize_timeout_secs",
                default_finalize_timeout_secs() as i64,
            )?
            .set_default("upload.push_command", default_push_command())?
            .set_default(
                "upload.queue_capacity",
                default_upload_queue_capacity() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with CRITTERCAM_ prefix
            .add_source(Environment::with_prefix("CRITTERCAM").separator("_"))
            .build()?;

        let config: CrittercamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.gpio.motion_pin == self.gpio.light_pin {
            return Err(ConfigError::Message(
                "Motion pin and light pin must differ".to_string(),
            ));
        }

        if self.recorder.motion_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "Motion timeout must be greater than 0".to_string(),
            ));
        }

        if self.recorder.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        if self.recorder.motion_queue_capacity == 0 {
            return Err(ConfigError::Message(
                "Motion queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.video.frame_rate == 0 {
            return Err(ConfigError::Message(
                "Frame rate must be greater than 0".to_string(),
            ));
        }

        if self.video.frame_size.0 == 0 || self.video.frame_size.1 == 0 {
            return Err(ConfigError::Message(
                "Frame size must be greater than 0".to_string(),
            ));
        }

        if self.video.artifact_dir.is_empty() {
            return Err(ConfigError::Message(
                "Artifact directory cannot be empty".to_string(),
            ));
        }

        if !self.video.encoder_command.contains("{output}") {
            return Err(ConfigError::Message(
                "Encoder command must contain the {output} placeholder".to_string(),
            ));
        }

        if !self.upload.push_command.contains("{artifact}") {
            return Err(ConfigError::Message(
                "Push command must contain the {artifact} placeholder".to_string(),
            ));
        }

        if self.upload.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "Upload queue capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Serialize the configuration to TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl Default for CrittercamConfig {
    fn default() -> Self {
        Self {
            gpio: GpioConfig {
                motion_pin: default_motion_pin(),
                light_pin: default_light_pin(),
                active_level: default_active_level(),
                debounce_ms: default_debounce_ms(),
            },
            recorder: RecorderConfig {
                motion_timeout_secs: default_motion_timeout_secs(),
                upload_debounce_secs: default_upload_debounce_secs(),
                poll_interval_ms: default_poll_interval_ms(),
                min_retrigger_secs: default_min_retrigger_secs(),
                motion_queue_capacity: default_motion_queue_capacity(),
            },
            video: VideoConfig {
                artifact_dir: default_artifact_dir(),
                container_ext: default_container_ext(),
                frame_rate: default_frame_rate(),
                frame_size: default_frame_size(),
                encoder_command: default_encoder_command(),
                finalize_timeout_secs: default_finalize_timeout_secs(),
            },
            upload: UploadConfig {
                push_command: default_push_command(),
                queue_capacity: default_upload_queue_capacity(),
            },
        }
    }
}

// Default value functions
fn default_motion_pin() -> u8 {
    18
}
fn default_light_pin() -> u8 {
    23
}
fn default_active_level() -> ActiveLevel {
    ActiveLevel::High
}
fn default_debounce_ms() -> u64 {
    0
}

fn default_motion_timeout_secs() -> u64 {
    60
}
fn default_upload_debounce_secs() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_min_retrigger_secs() -> u64 {
    0
}
fn default_motion_queue_capacity() -> usize {
    16
}

fn default_artifact_dir() -> String {
    "/tmp".to_string()
}
fn default_container_ext() -> String {
    "mp4".to_string()
}
fn default_frame_rate() -> u32 {
    15
}
fn default_frame_size() -> (u32, u32) {
    (640, 480)
}
fn default_encoder_command() -> String {
    "gst-launch-1.0 -e v4l2src ! videoconvert ! videoscale ! \
     video/x-raw,format=I420,width={width},height={height},framerate={fps}/1 ! \
     timeoverlay ! x264enc ! mp4mux ! filesink location={output}"
        .to_string()
}
fn default_finalize_timeout_secs() -> u64 {
    10
}

fn default_push_command() -> String {
    "/usr/local/bin/pushvideo.sh {artifact}".to_string()
}
fn default_upload_queue_capacity() -> usize {
    30
}
