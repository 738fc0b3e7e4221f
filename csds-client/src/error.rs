//! Error types for the CSDS client.

use thiserror::Error;

/// Error type for the CSDS client.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or contradictory configuration, detected before any I/O.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unreadable or invalid authentication material.
    #[error("invalid credentials in {path}: {reason}")]
    Credential {
        /// Path of the offending file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The channel or the stream could not be established.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request template could not be parsed.
    #[error("failed to parse request: {0}")]
    RequestParse(String),

    /// The response could not be decoded for the selected protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server terminated the stream with a gRPC status.
    #[error("stream error: {0}")]
    Stream(#[from] tonic::Status),

    /// The stream was closed by the server.
    #[error("stream closed")]
    StreamClosed,

    /// No response arrived before the cycle deadline.
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),

    /// Retries were exhausted or the session hit an unrecoverable fault.
    #[error("session failed: {0}")]
    Session(String),

    /// Writing output failed.
    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

impl Error {
    /// Returns true for faults that leave the stream unusable, so that the
    /// session tears it down and reconnects.
    pub fn is_stream_fault(&self) -> bool {
        matches!(
            self,
            Error::Stream(_) | Error::StreamClosed | Error::Timeout(_) | Error::Transport(_)
        )
    }
}

/// Result type alias for CSDS client operations.
pub type Result<T> = std::result::Result<T, Error>;
