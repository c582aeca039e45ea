//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

/// Command isolated from the caller's configuration files and token.
fn isolated_cmd(home: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("hcloud-upload-image");
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path())
        .env_remove("HCLOUD_TOKEN")
        .env_remove("HCLOUD_UPLOAD_IMAGE_CONFIG_PATH");
    cmd
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("hcloud-upload-image");
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(contains("upload"))
        .stdout(contains("cleanup"));
}

#[test]
fn cleanup_help_warns_about_running_uploads() {
    let mut cmd = cargo_bin_cmd!("hcloud-upload-image");
    cmd.args(["cleanup", "--help"]);

    cmd.assert()
        .success()
        .stdout(contains("apricote.de/created-by=hcloud-upload-image"))
        .stdout(contains("still running"));
}

#[test]
fn upload_requires_an_image_source() {
    let mut cmd = cargo_bin_cmd!("hcloud-upload-image");
    cmd.args(["upload", "--architecture", "x86"]);

    cmd.assert().failure().code(2).stderr(contains("--image-url"));
}

#[test]
fn upload_rejects_architecture_with_server_type() {
    let mut cmd = cargo_bin_cmd!("hcloud-upload-image");
    cmd.args([
        "upload",
        "--image-url",
        "https://example.com/image.raw",
        "--architecture",
        "x86",
        "--server-type",
        "cx22",
    ]);

    cmd.assert().failure().code(2);
}

#[test]
fn upload_without_token_names_the_variable() {
    let home = tempfile::tempdir().expect("tempdir");
    let mut cmd = isolated_cmd(&home);
    cmd.args([
        "upload",
        "--image-url",
        "https://example.com/image.raw",
        "--architecture",
        "x86",
    ]);

    cmd.assert()
        .failure()
        .code(1)
        .stdout("")
        .stderr(contains("HCLOUD_TOKEN"));
}

#[test]
fn cleanup_without_token_names_the_variable() {
    let home = tempfile::tempdir().expect("tempdir");
    let mut cmd = isolated_cmd(&home);
    cmd.arg("cleanup");

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("HCLOUD_TOKEN"));
}
