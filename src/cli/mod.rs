//! Command-line interface definitions for the `hcloud-upload-image` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{ArgGroup, Parser};

/// Top-level CLI for the `hcloud-upload-image` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hcloud-upload-image",
    about = "Manage custom OS images on Hetzner Cloud",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Upload a disk image into your Hetzner Cloud project.
    #[command(
        name = "upload",
        about = "Upload the specified disk image into your Hetzner Cloud project",
        long_about = concat!(
            "Implements a fake upload by writing the image onto the disk of a ",
            "temporary server and snapshotting that disk. The temporary server ",
            "is billed for the duration of the upload."
        ),
        after_help = concat!(
            "Examples:\n",
            "  hcloud-upload-image upload --image-path ./image-x86.bz2 ",
            "--architecture x86 --compression bz2 --description \"My image\"\n",
            "  hcloud-upload-image upload --image-url https://example.com/image-arm.raw ",
            "--architecture arm --labels foo=bar,version=latest"
        )
    )]
    Upload(UploadCommand),
    /// Remove temporary resources left behind by failed uploads.
    #[command(
        name = "cleanup",
        about = "Remove any temporary resources that were left over",
        long_about = concat!(
            "Removes every server and SSH key labelled ",
            "apricote.de/created-by=hcloud-upload-image.\n\n",
            "This does not coordinate with uploads that are still running: ",
            "their server and SSH key carry the same label and will be ",
            "removed, making those uploads fail."
        )
    )]
    Cleanup(CleanupCommand),
}

/// Arguments for the `upload` subcommand.
#[derive(Debug, Parser)]
#[command(
    group(ArgGroup::new("source").required(true).args(["image_url", "image_path"])),
    group(ArgGroup::new("target").required(true).args(["architecture", "server_type"]))
)]
pub(crate) struct UploadCommand {
    /// Remote URL of the disk image; the temporary server downloads it.
    #[arg(long, value_name = "URL")]
    pub(crate) image_url: Option<String>,
    /// Local path of the disk image; streamed over the SSH session.
    #[arg(long, value_name = "PATH")]
    pub(crate) image_path: Option<String>,
    /// Compression used on the disk image [choices: bz2, xz].
    #[arg(long, value_name = "COMPRESSION")]
    pub(crate) compression: Option<String>,
    /// Container format of the disk image [choices: raw, qcow2].
    #[arg(long, value_name = "FORMAT")]
    pub(crate) format: Option<String>,
    /// CPU architecture of the disk image [choices: x86, arm].
    #[arg(long, value_name = "ARCH")]
    pub(crate) architecture: Option<String>,
    /// Use this server type to write the image. Mutually exclusive with
    /// --architecture.
    #[arg(long, value_name = "TYPE")]
    pub(crate) server_type: Option<String>,
    /// Description for the resulting image.
    #[arg(long, value_name = "TEXT")]
    pub(crate) description: Option<String>,
    /// Labels for the resulting image, as comma-separated key=value pairs.
    #[arg(long, value_name = "KEY=VALUE", value_delimiter = ',')]
    pub(crate) labels: Vec<String>,
    /// Keep the temporary server and SSH key for debugging.
    #[arg(long)]
    pub(crate) skip_cleanup: bool,
}

/// Arguments for the `cleanup` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CleanupCommand {}
