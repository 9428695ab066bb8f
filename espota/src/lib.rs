//! # espota
//!
//! A library implementing the espota over-the-air firmware upload protocol.
//!
//! This crate provides the core functionality for pushing firmware to
//! espota-compatible devices over the local network, including:
//!
//! - UDP invitation and challenge parsing
//! - Three-generation authentication ladder (legacy MD5, SHA-256 with
//!   PBKDF2, and the MD5-credential compatibility scheme)
//! - TCP connect-back streaming with per-chunk acknowledgements
//! - Firmware image digesting
//!
//! The library performs no terminal output of its own; progress flows
//! through caller-supplied callbacks and diagnostics through the `log`
//! facade.
//!
//! ## Example
//!
//! ```rust,no_run
//! use espota::{FirmwareImage, UploadJob, Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::open("firmware.bin")?;
//!     let job = UploadJob::new("192.168.1.50", image);
//!
//!     let outcome = Uploader::new(job)?.run(&mut |sent, total| {
//!         println!("Uploading: {sent}/{total}");
//!     })?;
//!
//!     println!("Done: {outcome:?}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod image;
pub mod protocol;
pub mod uploader;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
pub use {
    error::{Error, Result},
    image::FirmwareImage,
    protocol::{
        UploadCommand,
        auth::{AuthOutcome, AuthScheme},
        invite::DeviceReply,
        stream::{StreamConfig, StreamOutcome},
    },
    uploader::{UploadJob, UploadOutcome, Uploader},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }
}
