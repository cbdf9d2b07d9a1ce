//! Error types for btrelay
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for btrelay
#[derive(Error, Debug)]
pub enum Error {
    /// Transport driver call failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Audio output was already started for this sink
    ///
    /// Treated as success when starting output during session setup.
    #[error("Audio output already started")]
    AlreadyStarted,

    /// Capture service call failed
    #[error("Capture error: {0}")]
    Capture(String),

    /// System volume/mute service errors
    #[error("System audio error: {0}")]
    SystemAudio(String),

    /// Power-state service errors
    #[error("Power service error: {0}")]
    Power(String),

    /// Relay session lifecycle errors
    #[error("Session error: {0}")]
    Session(String),

    /// Buffer pool allocation failure
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Preference record errors
    #[error("Preference error: {0}")]
    Preference(String),

    /// Invalid device address string
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the benign "output already started" condition.
    pub fn is_already_started(&self) -> bool {
        matches!(self, Error::AlreadyStarted)
    }
}

/// Convenience Result type using btrelay Error
pub type Result<T> = std::result::Result<T, Error>;
