//! # Error Types
//!
//! Custom error types for the call box core using `thiserror`.

use thiserror::Error;

/// Main error type for the call box core
#[derive(Debug, Error)]
pub enum CallboxError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// GPIO pin read/write/export failure
    #[error("GPIO {pin} error: {message}")]
    Gpio { pin: u32, message: String },

    /// Telemetry or time-sync transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bounded operation ran past its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Panel serial line errors
    #[error("Panel error: {0}")]
    Panel(String),

    /// External call subsystem errors
    #[error("Call control error: {0}")]
    CallControl(String),

    /// Server time could not be parsed or applied
    #[error("Time sync error: {0}")]
    TimeSync(String),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Scheduler no longer accepts timers
    #[error("Scheduler is shut down")]
    SchedulerClosed,
}

/// Result type alias for the call box core
pub type Result<T> = std::result::Result<T, CallboxError>;
