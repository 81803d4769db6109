use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlayerError {
    #[error("Resource is empty or could not be loaded")]
    EmptyResource,

    #[error("Resource is not supported: {0}")]
    UnsupportedResource(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("Player is not ready")]
    NotReady,

    #[error("External player binary is not configured")]
    BinaryNotConfigured,

    #[error("External player binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("External player binary is not executable: {}", .0.display())]
    BinaryNotExecutable(PathBuf),

    #[error("External player did not become ready within {0} ms")]
    InitTimeout(u64),

    #[error("External player failed to initialize: {0}")]
    InitFailed(String),

    #[error("External player exited unexpectedly (attempt {attempt})")]
    ProcessCrashed { attempt: u32 },

    #[error("External player crashed {0} times, giving up")]
    RetriesExhausted(u32),

    #[error("Player has been destroyed")]
    Destroyed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Audio output device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl PlayerError {
    /// Errors caused by a bad setup. They are surfaced once and never retried.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            PlayerError::BinaryNotConfigured
                | PlayerError::BinaryNotFound(_)
                | PlayerError::BinaryNotExecutable(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PlayerError::RetriesExhausted(_) | PlayerError::Destroyed)
    }
}

impl From<std::io::Error> for PlayerError {
    fn from(err: std::io::Error) -> Self {
        PlayerError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for PlayerError {
    fn from(err: reqwest::Error) -> Self {
        PlayerError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for PlayerError {
    fn from(err: serde_json::Error) -> Self {
        PlayerError::Ipc(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_configuration_errors() {
        assert!(PlayerError::BinaryNotConfigured.is_config_error());
        assert!(PlayerError::BinaryNotFound(PathBuf::from("/nope")).is_config_error());
        assert!(!PlayerError::InitTimeout(10).is_config_error());
        assert!(!PlayerError::ProcessCrashed { attempt: 1 }.is_config_error());
    }

    #[test]
    fn only_exhaustion_and_destroy_are_fatal() {
        assert!(PlayerError::RetriesExhausted(3).is_fatal());
        assert!(PlayerError::Destroyed.is_fatal());
        assert!(!PlayerError::NotReady.is_fatal());
        assert!(!PlayerError::EmptyResource.is_fatal());
    }
}
