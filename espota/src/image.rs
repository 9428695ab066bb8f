//! Firmware image handling.
//!
//! An image is digested once when staged and re-opened by the transport
//! layer for the actual upload, so even large images are never held in
//! memory.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

/// Read buffer size for the digest pass.
const DIGEST_BUF_SIZE: usize = 64 * 1024;

/// A firmware image staged for upload.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    path: PathBuf,
    filename: String,
    size: u64,
    md5_hex: String,
}

impl FirmwareImage {
    /// Open a firmware image and compute its size and MD5 digest.
    ///
    /// Fails with [`Error::InvalidImage`] for zero-length files and with
    /// [`Error::Io`] when the file cannot be read.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Digesting firmware image: {}", path.display());

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut context = md5::Context::new();
        let mut buf = vec![0u8; DIGEST_BUF_SIZE];
        let mut size: u64 = 0;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            context.consume(&buf[..n]);
            size += n as u64;
        }

        if size == 0 {
            return Err(Error::InvalidImage(format!("{} is empty", path.display())));
        }

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let md5_hex = format!("{:x}", context.compute());
        debug!("Image {filename}: {size} bytes, md5 {md5_hex}");

        Ok(Self {
            path: path.to_path_buf(),
            filename,
            size,
            md5_hex,
        })
    }

    /// Path the image was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name component of the path, as sent in the challenge preimage.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Image length in bytes. Always non-zero.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Lowercase hex MD5 digest of the whole image.
    pub fn md5_hex(&self) -> &str {
        &self.md5_hex
    }

    /// Open the underlying file again for the streaming pass.
    pub fn reopen(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }
}
