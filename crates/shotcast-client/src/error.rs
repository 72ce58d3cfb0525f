use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No camera device found")]
    NoDeviceFound,

    #[error("No camera device selected")]
    NoDeviceSelected,

    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("Constraint cannot be satisfied: {0}")]
    ConstraintUnsatisfiable(String),

    #[error("Failed to switch to device {device_id}: {source}")]
    DeviceSwitchFailed {
        device_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Capture is not running")]
    NotCapturing,

    #[error("Capture platform error: {0}")]
    Platform(String),

    #[error("{0} was superseded before it completed")]
    Superseded(&'static str),

    #[error("Signaling request `{method}` timed out after {timeout:?}")]
    SignalingTimeout { method: String, timeout: Duration },

    #[error("Signaling channel is not connected")]
    SignalingDisconnected,

    #[error("Signaling request `{method}` rejected: {message}")]
    SignalingRejected { method: String, message: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Failed to load SFU device: {0}")]
    DeviceLoad(String),

    #[error("Transport negotiation failed: {0}")]
    TransportNegotiation(String),

    #[error("Produce negotiation failed: {0}")]
    ProduceNegotiation(String),

    #[error("No send transport")]
    NoSendTransport,

    #[error("Session has been stopped")]
    SessionStopped,

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Device-level failures end the session instead of being retried
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Error::NoDeviceFound
                | Error::NoDeviceSelected
                | Error::PermissionDenied(_)
                | Error::ConstraintUnsatisfiable(_)
                | Error::Platform(_)
        )
    }

    pub fn switch_failed(device_id: &str, source: Error) -> Self {
        Error::DeviceSwitchFailed {
            device_id: device_id.to_string(),
            source: Box::new(source),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
