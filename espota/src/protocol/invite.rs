//! Invitation datagrams and device replies.
//!
//! An upload starts with the host announcing itself over the UDP control
//! channel:
//!
//! ```text
//! <cmd> <host_port> <length> <md5>\n
//! ```
//!
//! The device answers with one short ASCII line: `OK` when no credential
//! is configured, `AUTH <nonce>` when it wants a challenge response, or a
//! free-form error. Replies never exceed
//! [`INVITE_REPLY_MAX`](super::INVITE_REPLY_MAX) bytes.

use crate::protocol::UploadCommand;

/// One invitation, reused verbatim for every attempt of a job.
///
/// The digest announced here is the one the device verifies after the
/// data channel closes, so it must describe exactly the bytes that will
/// be streamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Payload kind announced to the device.
    pub command: UploadCommand,
    /// TCP port the host is already listening on.
    pub host_port: u16,
    /// Image length in bytes.
    pub size: u64,
    /// Image MD5, lowercase hex.
    pub md5_hex: String,
}

impl Invitation {
    /// Render the wire line, including the trailing newline.
    pub fn render(&self) -> String {
        format!(
            "{} {} {} {}\n",
            self.command.code(),
            self.host_port,
            self.size,
            self.md5_hex
        )
    }
}

/// Parsed device reply to an invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    /// Device accepts the upload without authentication.
    Ok,
    /// Device wants a challenge response; carries the nonce.
    AuthChallenge(String),
    /// Anything else the device said, verbatim (trimmed).
    Error(String),
}

impl DeviceReply {
    /// Parse a raw reply datagram.
    ///
    /// The payload is decoded lossily and trimmed before matching; only
    /// an exact `OK` counts as acceptance.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();

        if text == "OK" {
            return Self::Ok;
        }
        if let Some(nonce) = text.strip_prefix("AUTH ") {
            return Self::AuthChallenge(nonce.trim().to_string());
        }
        Self::Error(text.to_string())
    }
}
