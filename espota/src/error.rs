//! Error types for espota.

use std::io;
use thiserror::Error;

/// Result type for espota operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for espota operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (sockets, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Firmware image cannot be used (empty, unreadable metadata).
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Device never answered the invitation.
    #[error("No response from device after {attempts} invitation attempts")]
    NoResponse {
        /// Number of invitation datagrams sent.
        attempts: u32,
    },

    /// Invitation reply was neither `OK` nor an authentication challenge.
    #[error("Unexpected reply from device: {0}")]
    UnexpectedReply(String),

    /// Challenge nonce has an unknown length or is not hex.
    #[error("Unsupported authentication nonce: {0}")]
    UnsupportedNonce(String),

    /// Device rejected every authentication attempt.
    #[error("Authentication failed: {0}")]
    AuthRejected(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Send or receive failure while streaming the image.
    #[error("Transfer failed after {sent} bytes: {source}")]
    Transfer {
        /// Bytes handed to the device before the failure.
        sent: u64,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// Device went silent after the last chunk.
    #[error("Upload not confirmed by device")]
    NoConfirmation,

    /// Device replied after the last chunk without confirming; surfaced
    /// as an error only in strict mode.
    #[error("Device replied {0:?} instead of confirming the upload")]
    Unconfirmed(String),

    /// Cooperative interrupt (Ctrl-C) observed between I/O steps.
    #[error("Interrupted")]
    Interrupted,
}
