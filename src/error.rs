/// Centralized error types for the rate streaming service
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    // Network Errors
    #[error("WebSocket connection failed: {0}")]
    WebSocketError(String),

    #[error("WebSocket disconnected: {0}")]
    WebSocketDisconnected(String),

    #[error("Subscribe request failed: {0}")]
    SubscribeFailed(String),

    // Data Errors
    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Invalid tick: {0}")]
    InvalidTick(String),

    #[error("Unknown pair: {0}")]
    UnknownPair(String),

    // Persistence Errors
    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// Errors the feed loop recovers from locally (reconnect or skip)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamError::WebSocketError(_)
                | StreamError::WebSocketDisconnected(_)
                | StreamError::SubscribeFailed(_)
                | StreamError::DeserializationError(_)
                | StreamError::InvalidTick(_)
                | StreamError::UnknownPair(_)
                | StreamError::PersistenceFailed(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            StreamError::WebSocketError(_) => "NET_001",
            StreamError::WebSocketDisconnected(_) => "NET_002",
            StreamError::SubscribeFailed(_) => "NET_003",
            StreamError::DeserializationError(_) => "DATA_001",
            StreamError::InvalidTick(_) => "DATA_002",
            StreamError::UnknownPair(_) => "DATA_003",
            StreamError::PersistenceFailed(_) => "STORE_001",
            StreamError::ConfigError(_) => "CFG_001",
            StreamError::InvalidParameter(_) => "CFG_002",
            StreamError::FileError(_) => "FILE_001",
            StreamError::InternalError(_) => "INT_001",
        }
    }
}
