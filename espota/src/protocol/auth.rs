//! Challenge-response authentication ladder.
//!
//! Devices have shipped three generations of the exchange, distinguished
//! by the nonce length in the `AUTH <nonce>` challenge:
//!
//! | Nonce | Scheme | Credential hash | Response |
//! |-------|--------|-----------------|----------|
//! | 32 hex | legacy MD5 | MD5 | MD5 over `hash:nonce:cnonce` |
//! | 64 hex | SHA-256 | SHA-256 | SHA-256 over `pbkdf2:nonce:cnonce` |
//! | 64 hex | MD5-compat | MD5 | SHA-256 over `pbkdf2:nonce:cnonce` |
//!
//! The two 64-char schemes differ only in how the stored credential was
//! hashed; MD5-compat exists for devices whose configuration still holds
//! an MD5 password hash. The response frame is the same for all three:
//!
//! ```text
//! 200 <cnonce> <response>\n
//! ```

use hmac::Hmac;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::CMD_AUTH;

/// PBKDF2 iteration count used by the 64-char-nonce schemes.
pub const PBKDF2_ROUNDS: u32 = 10_000;

/// Derived-key length in bytes for the 64-char-nonce schemes.
pub const DERIVED_KEY_LEN: usize = 32;

/// Authentication scheme generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// Original MD5 challenge-response (32-char nonces).
    LegacyMd5,
    /// PBKDF2-HMAC-SHA256 response over a SHA-256 credential hash
    /// (64-char nonces).
    Sha256,
    /// PBKDF2-HMAC-SHA256 response over an MD5 credential hash, for
    /// devices that still store MD5 credentials (64-char nonces).
    Md5Compat,
}

impl AuthScheme {
    /// Pick the initial scheme for a challenge nonce.
    ///
    /// `force_md5` starts 64-char challenges on [`AuthScheme::Md5Compat`]
    /// directly, skipping the SHA-256 attempt (and with it the automatic
    /// fallback).
    pub fn for_nonce(nonce: &str, force_md5: bool) -> Result<Self> {
        if nonce.is_empty() || !nonce.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::UnsupportedNonce(format!("not hex: {nonce:?}")));
        }
        match nonce.len() {
            32 => Ok(Self::LegacyMd5),
            64 if force_md5 => Ok(Self::Md5Compat),
            64 => Ok(Self::Sha256),
            len => Err(Error::UnsupportedNonce(format!("{len} hex chars"))),
        }
    }

    /// Scheme to retry with after the device rejects this one, if any.
    ///
    /// Only the SHA-256 scheme has a fallback; a rejection there usually
    /// means the device holds an MD5 credential hash.
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::Sha256 => Some(Self::Md5Compat),
            Self::LegacyMd5 | Self::Md5Compat => None,
        }
    }

    /// Hex length of this scheme's response hash.
    pub fn response_len(self) -> usize {
        match self {
            Self::LegacyMd5 => 32,
            Self::Sha256 | Self::Md5Compat => 64,
        }
    }
}

/// Inputs binding a challenge response to one specific upload.
///
/// The client nonce is derived from these fields so a captured exchange
/// cannot be replayed for a different image or target.
#[derive(Debug, Clone, Copy)]
pub struct UploadIdentity<'a> {
    /// Image file name (path basename).
    pub filename: &'a str,
    /// Image length in bytes.
    pub size: u64,
    /// Image MD5, lowercase hex.
    pub md5_hex: &'a str,
    /// Device address exactly as the user supplied it.
    pub device_addr: &'a str,
}

impl UploadIdentity<'_> {
    /// Concatenated client-nonce preimage. No separators; the device
    /// rebuilds the same string from the invitation it received.
    fn cnonce_preimage(&self) -> String {
        format!(
            "{}{}{}{}",
            self.filename, self.size, self.md5_hex, self.device_addr
        )
    }
}

/// One derived challenge-response attempt, ready to send.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    scheme: AuthScheme,
    cnonce: String,
    response: String,
}

impl AuthAttempt {
    /// Derive the client nonce and response hash for one challenge.
    ///
    /// Deterministic: the same scheme, password, nonce and identity
    /// always produce the same frame. An empty password is hashed as the
    /// empty string.
    pub fn derive(
        scheme: AuthScheme,
        password: &str,
        nonce: &str,
        identity: &UploadIdentity<'_>,
    ) -> Self {
        let preimage = identity.cnonce_preimage();
        let cnonce = match scheme {
            AuthScheme::LegacyMd5 => md5_hex(preimage.as_bytes()),
            AuthScheme::Sha256 | AuthScheme::Md5Compat => sha256_hex(preimage.as_bytes()),
        };

        let response = match scheme {
            AuthScheme::LegacyMd5 => {
                let password_hash = md5_hex(password.as_bytes());
                md5_hex(format!("{password_hash}:{nonce}:{cnonce}").as_bytes())
            }
            AuthScheme::Sha256 | AuthScheme::Md5Compat => {
                let password_hash = if scheme == AuthScheme::Md5Compat {
                    md5_hex(password.as_bytes())
                } else {
                    sha256_hex(password.as_bytes())
                };
                let salt = format!("{nonce}:{cnonce}");
                let mut derived = [0u8; DERIVED_KEY_LEN];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(
                    password_hash.as_bytes(),
                    salt.as_bytes(),
                    PBKDF2_ROUNDS,
                    &mut derived,
                )
                .expect("HMAC accepts any key length");
                let keyed = format!("{}:{nonce}:{cnonce}", hex::encode(derived));
                sha256_hex(keyed.as_bytes())
            }
        };

        Self {
            scheme,
            cnonce,
            response,
        }
    }

    /// Scheme this attempt was derived under.
    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// Client nonce, lowercase hex.
    pub fn cnonce(&self) -> &str {
        &self.cnonce
    }

    /// Response hash, lowercase hex.
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Render the wire frame, including the trailing newline.
    pub fn frame(&self) -> String {
        format!("{} {} {}\n", CMD_AUTH, self.cnonce, self.response)
    }
}

/// What the device said to an authentication response.
///
/// Socket failures are deliberately not represented here; they surface as
/// [`Error`] values and never trigger a scheme fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Device accepted the response.
    Accepted,
    /// Device rejected the response (or answered with anything that is
    /// not `OK`); carries the device's wording.
    Rejected(String),
}

impl AuthOutcome {
    /// Classify a raw reply datagram.
    pub fn from_reply(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if text == "OK" {
            Self::Accepted
        } else {
            Self::Rejected(text.to_string())
        }
    }
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
