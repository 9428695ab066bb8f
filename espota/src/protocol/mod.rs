//! OTA wire protocol implementation.
//!
//! The protocol has two halves carried over two sockets:
//!
//! - a UDP control channel for the invitation and the authentication
//!   exchange (short ASCII lines), and
//! - a TCP data channel the device opens towards the host, carrying the
//!   raw image in fixed-size chunks with free-form acknowledgements.

pub mod auth;
pub mod invite;
pub mod stream;

/// Default control port devices listen on for invitations.
pub const DEFAULT_DEVICE_PORT: u16 = 3232;

/// Wire command code announcing an application image.
pub const CMD_FLASH: u32 = 0;

/// Wire command code announcing a filesystem image.
pub const CMD_SPIFFS: u32 = 100;

/// Wire command code prefixing the authentication response.
pub const CMD_AUTH: u32 = 200;

/// Payload bytes per data-channel chunk.
pub const CHUNK_SIZE: usize = 1024;

/// Maximum invitation reply size (`"AUTH "` plus a 64-char nonce).
pub const INVITE_REPLY_MAX: usize = 69;

/// Maximum per-chunk acknowledgement size.
pub const CHUNK_ACK_MAX: usize = 10;

/// Maximum result-phase read size.
pub const RESULT_REPLY_MAX: usize = 32;

/// What kind of payload the invitation announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadCommand {
    /// Application firmware (code partition).
    #[default]
    Flash,
    /// Filesystem image (SPIFFS/LittleFS partition).
    Spiffs,
}

impl UploadCommand {
    /// Numeric command code used in the invitation line.
    pub fn code(self) -> u32 {
        match self {
            Self::Flash => CMD_FLASH,
            Self::Spiffs => CMD_SPIFFS,
        }
    }
}

// Re-export common types
pub use {
    auth::{AuthAttempt, AuthOutcome, AuthScheme, UploadIdentity},
    invite::{DeviceReply, Invitation},
    stream::{StreamConfig, StreamOutcome, StreamTransfer},
};
