use crate::domain::models::DeviceAddress;
use thiserror::Error;

/// Error type for the monitor bridge.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("bluetooth radio unavailable")]
    RadioUnavailable,

    #[error("device already active: {active}")]
    AlreadyConnected { active: DeviceAddress },

    #[error("no device connected")]
    NotConnected,

    /// No byte-layout candidate passed range validation.
    #[error("no plausible decoding for {field}")]
    DecodeAmbiguous { field: &'static str },

    #[error("link lost to {0}")]
    LinkLost(DeviceAddress),

    #[error("file not found on device: {0}")]
    FileNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("settings error: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
