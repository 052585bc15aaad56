pub mod integration;
pub mod messages;
pub mod render;
pub mod stream;
pub mod transport;
pub mod utils;
pub mod viseme;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PanelError {
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl From<std::io::Error> for PanelError {
    fn from(e: std::io::Error) -> Self {
        PanelError::IOError(e.to_string())
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(e: serde_json::Error) -> Self {
        PanelError::ProtocolError(e.to_string())
    }
}

impl PanelError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Malformed payloads are dropped, the channel keeps going
            PanelError::ProtocolError(_) => true,
            PanelError::StorageError(_) => true,
            PanelError::IOError(_) => false,
            PanelError::ConfigError(_) => false,
            PanelError::ChannelError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            PanelError::ProtocolError(_) => "Received an unreadable message from the backend.".to_string(),
            PanelError::StorageError(_) => "Chat history could not be saved.".to_string(),
            PanelError::IOError(_) => "File system error occurred.".to_string(),
            PanelError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            PanelError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PanelError>;
