//! Error types for offloadtune
//!
//! External-process failures (OOM, crash, timeout) are not errors: they are
//! outcome tags returned by the launch monitor. Everything here is a fault of
//! the tuner itself or of its environment.

use thiserror::Error;

/// Main error type for the tuning engine
#[derive(Error, Debug)]
pub enum TuneError {
    /// State machine transition errors
    #[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    /// A monitored server process is still alive
    #[error("A monitored server process is already running (pid {pid:?}); stop it before launching again")]
    MonitorBusy { pid: Option<u32> },

    /// The server process could not be spawned at all
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// VRAM probe failures
    #[error("VRAM oracle error: {0}")]
    Oracle(String),

    /// Tensor selector text that cannot be mapped onto tensor classes
    #[error("Invalid tensor selector '{text}': {reason}")]
    InvalidSelector { text: String, reason: String },

    /// Success pattern that does not compile
    #[error("Invalid success pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// History store errors
    #[error("History store error: {0}")]
    History(String),

    /// History database errors
    #[error("History database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic errors with context
    #[error("Tuner error: {0}")]
    Generic(String),
}

/// Result type alias for tuner operations
pub type Result<T> = std::result::Result<T, TuneError>;

/// Convert anyhow errors to TuneError
impl From<anyhow::Error> for TuneError {
    fn from(err: anyhow::Error) -> Self {
        TuneError::Generic(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TuneError::MonitorBusy { pid: Some(4242) };
        assert!(err.to_string().contains("4242"));
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = TuneError::InvalidTransition {
            from: "Accepted".to_string(),
            to: "Attempting".to_string(),
            reason: "Session already finished".to_string(),
        };
        assert!(err.to_string().contains("Accepted"));
        assert!(err.to_string().contains("Attempting"));
    }

    #[test]
    fn test_anyhow_conversion_keeps_context() {
        let err: TuneError = anyhow::anyhow!("inner").context("outer").into();
        let text = err.to_string();
        assert!(text.contains("outer"));
        assert!(text.contains("inner"));
    }
}
