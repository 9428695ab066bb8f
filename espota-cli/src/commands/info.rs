//! Firmware image inspection command.

use {
    anyhow::{Context, Result},
    console::style,
    espota::FirmwareImage,
    std::path::Path,
};

/// Info command implementation.
///
/// Human-readable output goes to stderr; `--json` prints structured JSON
/// to stdout so the command composes with pipes.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let image = FirmwareImage::open(firmware)
        .with_context(|| format!("cannot read {}", firmware.display()))?;

    if json {
        let info = serde_json::json!({
            "ok": true,
            "data": {
                "file": image.path().display().to_string(),
                "filename": image.filename(),
                "size_bytes": image.size(),
                "md5": image.md5_hex(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!("{}", style("Firmware Image").bold().underlined());
    eprintln!("  File:     {}", style(image.path().display()).cyan());
    eprintln!("  Size:     {} bytes", image.size());
    eprintln!("  MD5:      {}", image.md5_hex());
    eprintln!(
        "  Chunks:   {} x {} bytes",
        image.size().div_ceil(espota::protocol::CHUNK_SIZE as u64),
        espota::protocol::CHUNK_SIZE
    );

    Ok(())
}
