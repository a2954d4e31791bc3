//! Error types for Strand

use std::io;

use thiserror::Error;

/// Unified error type for all Strand operations
#[derive(Debug, Error)]
pub enum StrandError {
    /// I/O error, including the send-confirmation timeout of a channel
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol violation, fatal to the transport
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Cryptographic failure (MAC, AEAD, key agreement, signatures)
    #[error("Security error: {0}")]
    Security(String),

    /// The server host key or its signature was not accepted
    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    /// The transport has been disconnected
    #[error("Disconnected ({code}): {description}")]
    Disconnected {
        /// Machine-readable reason code
        code: u32,
        /// Human-readable description
        description: String,
    },

    /// A local wait elapsed; the underlying operation may still complete
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Channel-local failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// API misuse, such as sending from the I/O task
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Other error
    #[error("Error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl StrandError {
    /// Returns true for waits that elapsed, including socket write timeouts.
    pub fn is_timeout(&self) -> bool {
        match self {
            StrandError::Timeout(_) => true,
            StrandError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Returns true when the error ends the transport connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrandError::Protocol(_)
                | StrandError::Security(_)
                | StrandError::HostKeyRejected(_)
                | StrandError::Disconnected { .. }
        )
    }
}

/// Result type for Strand operations
pub type StrandResult<T> = Result<T, StrandError>;
