//! Remote write pipeline assembly.
//!
//! The temporary server runs a single shell pipeline that fetches (or reads
//! from standard input), decompresses and writes the image to the boot disk.
//! This module centralises the string building so the orchestrator only
//! deals with a finished command.

use shell_escape::unix::escape;

use crate::request::{Compression, ImageFormat, SourceKind, ValidationError};

/// Block device of the rescue system that backs the server's root disk.
pub const TARGET_DISK: &str = "/dev/sda";

const BLOCK_SIZE: &str = "4M";
const QCOW2_SCRATCH_FILE: &str = "image.qcow2";

/// Builds the shell command that writes the image on the remote host.
///
/// The pipeline runs under `bash` strict mode and ends with `sync`, so a
/// zero exit status means every byte reached the disk.
///
/// # Errors
///
/// Returns [`ValidationError::UnsupportedCompression`] for compressions that
/// have no decompression stage.
pub fn assemble_command(
    source: SourceKind<'_>,
    compression: Compression,
    format: ImageFormat,
) -> Result<String, ValidationError> {
    let mut stages: Vec<String> = Vec::with_capacity(3);

    if let SourceKind::Remote(url) = source {
        stages.push(format!("wget --no-verbose -O - {}", double_quote(url.as_str())));
    }

    match compression {
        Compression::None => {}
        Compression::Bz2 => stages.push(String::from("bzip2 -cd")),
        Compression::Xz => stages.push(String::from("xz -cd")),
        Compression::Zstd => return Err(ValidationError::UnsupportedCompression(compression)),
    }

    let write = match format {
        ImageFormat::Raw => {
            stages.push(format!("dd of={TARGET_DISK} bs={BLOCK_SIZE}"));
            stages.join(" | ")
        }
        ImageFormat::Qcow2 => {
            stages.push(format!("tee {QCOW2_SCRATCH_FILE} > /dev/null"));
            format!(
                "{} && qemu-img dd -f qcow2 -O raw if={QCOW2_SCRATCH_FILE} of={TARGET_DISK} bs={BLOCK_SIZE}",
                stages.join(" | ")
            )
        }
    };

    let script = format!("set -euo pipefail && {write} && sync");
    Ok(format!("bash -c {}", escape(script.into())))
}

/// Quotes `value` for use inside a double-quoted shell word.
fn double_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if matches!(ch, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}
