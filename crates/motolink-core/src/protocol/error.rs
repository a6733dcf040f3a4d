//! Link errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::FrameError;

/// Coarse classification of a [`LinkError`], stable enough for callers to
/// branch on and for the event sink to display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Port unavailable, timeout, unexpected close. Recoverable by reconnecting.
    Transport,
    /// Checksum mismatch, desync, unexpected response. Recovered locally by retry.
    Protocol,
    /// Operation attempted in the wrong link state. Rejected without side effects.
    Sequence,
    /// Fatal to the current flash session.
    FlashIntegrity,
    /// Invalid configuration.
    Config,
}

/// Errors that can occur while talking to the ECU
#[derive(Error, Debug)]
pub enum LinkError {
    /// The port could not be opened
    #[error("Port unavailable: {port}: {reason}")]
    PortUnavailable {
        /// Identifier passed to connect
        port: String,
        /// Why opening failed
        reason: String,
    },

    /// No reply before the deadline
    #[error("Timed out waiting for ECU")]
    Timeout,

    /// The port or socket went away
    #[error("Transport closed unexpectedly: {0}")]
    TransportClosed(String),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A received frame failed to decode
    #[error("Frame rejected: {0}")]
    Frame(#[from] FrameError),

    /// The reply did not match the request
    #[error("Unexpected response from ECU: {0}")]
    UnexpectedResponse(String),

    /// A parameter could not be read after retries
    #[error("Parameter {0:#06x} unreadable")]
    ParameterUnreadable(u16),

    /// No open connection, or the guard outlived it
    #[error("Not connected to ECU")]
    NotConnected,

    /// The link is busy with an exclusive operation
    #[error("Another operation is in progress: {0}")]
    OperationInProgress(String),

    /// The ECU refused the unlock key
    #[error("ECU rejected unlock")]
    UnlockRejected,

    /// The ECU refused to erase the target region
    #[error("ECU rejected erase of {length} bytes at {address:#010x}")]
    EraseRejected {
        /// Start of the region
        address: u32,
        /// Region length in bytes
        length: u32,
    },

    /// A block was refused after all retries
    #[error("Flash write failed at block {0}")]
    FlashWriteFailed(u32),

    /// The ECU reported a different image CRC
    #[error("Verification failed: expected {expected:#010x}, ECU reported {actual:#010x}")]
    VerificationFailed {
        /// CRC32 of the image
        expected: u32,
        /// CRC32 the ECU computed
        actual: u32,
    },

    /// The image cannot be split into blocks
    #[error("Malformed firmware image: {0}")]
    MalformedImage(String),

    /// Stopped by the caller or by a disconnect
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid settings
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LinkError {
    /// Machine-readable classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::PortUnavailable { .. }
            | LinkError::Timeout
            | LinkError::TransportClosed(_)
            | LinkError::Io(_) => ErrorKind::Transport,
            LinkError::Frame(_)
            | LinkError::UnexpectedResponse(_)
            | LinkError::ParameterUnreadable(_) => ErrorKind::Protocol,
            LinkError::NotConnected | LinkError::OperationInProgress(_) => ErrorKind::Sequence,
            LinkError::UnlockRejected
            | LinkError::EraseRejected { .. }
            | LinkError::FlashWriteFailed(_)
            | LinkError::VerificationFailed { .. }
            | LinkError::MalformedImage(_)
            | LinkError::Cancelled => ErrorKind::FlashIntegrity,
            LinkError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a retry of the same exchange may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout | LinkError::Frame(_) | LinkError::UnexpectedResponse(_)
        )
    }

    /// Whether the transport can no longer be used
    pub(crate) fn is_link_fatal(&self) -> bool {
        matches!(self, LinkError::TransportClosed(_) | LinkError::Io(_))
    }
}
