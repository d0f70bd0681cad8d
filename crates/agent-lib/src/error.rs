//! Error types shared across the library boundary

use thiserror::Error;

/// Failures raised by a [`DeviceRegistry`](crate::registry::DeviceRegistry)
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("device {0} not found")]
    NotFound(String),

    #[error("device conflicts with an existing record: {0}")]
    Conflict(String),

    #[error("invalid device record: {0}")]
    Invalid(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RegistryError {
    /// True when the failure comes from the caller's input rather than the store
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RegistryError::NotFound(_) | RegistryError::Conflict(_) | RegistryError::Invalid(_)
        )
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Failures talking to the telemetry gateway
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("gateway client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("failed to encode gateway payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("gateway not connected: {0}")]
    Disconnected(String),
}

/// Failures raised while probing a single device
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe mechanism itself cannot run (missing binary, no permission)
    #[error("probe subsystem unavailable: {0}")]
    Unavailable(String),

    #[error("probe failed: {0}")]
    Failed(String),
}

/// Reasons a remote command is answered with a negative acknowledgement
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
