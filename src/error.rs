use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ItsError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Timed out waiting for {operation} after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Connection shut down while a command was in flight")]
    Shutdown,

    #[error("System error: {message}")]
    System { message: String },
}

/// Errors decoding an inbound command line
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed command: {details}")]
    MalformedCommand { details: String },

    #[error("Command line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    #[error("Invalid parameters for {command}: {details}")]
    InvalidParams { command: String, details: String },
}

/// Errors reported by (or about) the imaging device and its collaborators
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device access refused: {details}")]
    Access { details: String },

    #[error("Device configuration failed: {details}")]
    Configuration { details: String },

    #[error("Capture {frame_number} failed: {reason}")]
    CaptureFailed { frame_number: u64, reason: String },

    #[error("Raw container encoding failed: {details}")]
    Encoder { details: String },

    #[error("Operation not supported by device: {operation}")]
    Unsupported { operation: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Unable to start vibrator")]
    HapticsUnavailable,
}

/// Resource errors, raised before any device call is made
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Too many output surfaces: requested {requested}, at most {max} supported")]
    TooManySurfaces { requested: usize, max: usize },

    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Zero stream configs available for requested format: {format}")]
    NoStreamConfigs { format: String },

    #[error("Only one {family} output surface may be active at a time")]
    DuplicateSurfaceFamily { family: String },

    #[error("Output surface {dimension} {value} is out of range")]
    InvalidSurfaceSize { dimension: String, value: i64 },

    #[error("Command carried no capture requests")]
    NoCaptureRequests,

    #[error("Unsupported image format delivered: {format}")]
    UnexpectedImage { format: String },
}

impl ItsError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Whether this error ends the session. Only a line that cannot be read as
    /// a command at all is dropped and the connection kept.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ItsError::Protocol(ProtocolError::MalformedCommand { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ItsError>;
