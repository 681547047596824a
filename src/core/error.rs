use std::io;
use thiserror::Error;

use crate::protocol::message::Code;

/// Custom error types for homelink
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Path too long: {len} bytes (max {max})")]
    PathTooLong { len: usize, max: usize },

    #[error("Too many path segments: {count} (max {max})")]
    TooManySegments { count: usize, max: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected response code {0}")]
    Response(Code),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Exchange cancelled")]
    Cancelled,

    #[error("Already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }

    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Creates a new not connected error
    pub fn not_connected(msg: impl Into<String>) -> Self {
        Error::NotConnected(msg.into())
    }

    /// Creates a new already in progress error
    pub fn already_in_progress(msg: impl Into<String>) -> Self {
        Error::AlreadyInProgress(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// True for errors detected before anything went on the wire
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::ResourceExhausted(_)
                | Error::PathTooLong { .. }
                | Error::TooManySegments { .. }
                | Error::Config(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("Malformed document: {}", e))
    }
}
