use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrittercamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("GPIO error: {message}")]
    Gpio { message: String },

    #[error("Capture session error for '{artifact}': {message}")]
    Session { artifact: String, message: String },

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl CrittercamError {
    pub fn gpio<S: Into<String>>(message: S) -> Self {
        Self::Gpio {
            message: message.into(),
        }
    }

    pub fn session<S: Into<String>>(artifact: S, message: S) -> Self {
        Self::Session {
            artifact: artifact.into(),
            message: message.into(),
        }
    }

    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CrittercamError>;
