//! Error types for trackfeed

use thiserror::Error;

/// Result type alias for trackfeed operations
pub type Result<T> = std::result::Result<T, Error>;

/// trackfeed error type
#[derive(Error, Debug)]
pub enum Error {
    // Registration errors
    #[error("Constraint {constraint} cannot be satisfied: {reason}")]
    ConstraintViolation {
        /// Name of the offending constraint key
        constraint: &'static str,
        reason: String,
    },

    // Capture errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed buffer: {0}")]
    MalformedBuffer(String),

    #[error("Buffer mapping failed: {0}")]
    BufferMapping(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Capture not started")]
    CaptureNotStarted,

    #[error("Capture source ended")]
    SourceEnded,

    // Frame errors
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    // Scheduler errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Scheduler stopped")]
    SchedulerStopped,

    #[error("Frame stream error: {0}")]
    Stream(String),

    // General errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structured reason reported through a track's start callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    /// A constraint could not be satisfied
    ConstraintNotSatisfied,
    /// The remote device or its channel failed
    TransportError,
    /// The source ended before the track could start
    SourceEnded,
    /// Anything else that kept the track from starting
    TrackStartFailure,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::ConstraintNotSatisfied => "ConstraintNotSatisfied",
            FailureCode::TransportError => "TransportError",
            FailureCode::SourceEnded => "SourceEnded",
            FailureCode::TrackStartFailure => "TrackStartFailure",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Stream(_) | Error::BufferMapping(_) | Error::UnsupportedFormat(_)
        )
    }

    /// Check if this error ends the capture session
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::MalformedBuffer(_) | Error::SourceEnded
        )
    }

    /// Reason code surfaced to track start callbacks
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Error::ConstraintViolation { .. } => FailureCode::ConstraintNotSatisfied,
            Error::Transport(_) | Error::MalformedBuffer(_) => FailureCode::TransportError,
            Error::SourceEnded => FailureCode::SourceEnded,
            _ => FailureCode::TrackStartFailure,
        }
    }

    /// Name accompanying the failure code (the constraint key for violations)
    pub fn failure_name(&self) -> String {
        match self {
            Error::ConstraintViolation { constraint, .. } => (*constraint).to_string(),
            other => other.to_string(),
        }
    }
}
