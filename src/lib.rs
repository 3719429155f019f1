pub mod config;
pub mod error;
pub mod light;
pub mod motion;
pub mod orchestration;
pub mod recorder;
pub mod session;
pub mod uploader;

pub use config::{ActiveLevel, CrittercamConfig, GpioConfig, RecorderConfig, UploadConfig, VideoConfig};
pub use error::{CrittercamError, Result};
pub use light::{Floodlight, MockFloodlight};
pub use motion::{MockMotionHandle, MockMotionSource, MotionEvent, MotionSource};
pub use orchestration::{ComponentState, CrittercamOrchestrator, ShutdownReason};
pub use recorder::{PendingUpload, Recorder, RecorderBuilder, RecorderState};
pub use session::{
    artifact_name, EncoderProcessBackend, MockSessionBackend, SessionBackend, SessionHandle,
};
pub use uploader::{PushAction, ShellPushAction, UploadJob, Uploader};

#[cfg(all(feature = "gpio", target_os = "linux"))]
pub use light::GpioFloodlight;
#[cfg(all(feature = "gpio", target_os = "linux"))]
pub use motion::GpioMotionSource;
