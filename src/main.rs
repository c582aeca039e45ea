//! Binary entry point for the hcloud-upload-image CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use hcloud_upload_image::request::{parse_image_url, parse_label};
use hcloud_upload_image::{
    Architecture, Compression, ConfigError, ExecutorSettings, HcloudConfig, HcloudError,
    HcloudProvider, ImageFormat, Janitor, JanitorError, LocalImageError, OpenSshTransport,
    ProvisionSettings, RemoteExecutor, ResourceProvisioner, SshConfig, SshKeygen,
    TracingEventSink, UploadError, UploadOrchestrator, UploadRequest, ValidationError,
    open_local_image,
};

mod cli;

use cli::{Cli, UploadCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("provider setup failed: {0}")]
    Provider(#[from] HcloudError),
    #[error("invalid arguments: {0}")]
    Request(#[from] ValidationError),
    #[error(transparent)]
    LocalImage(#[from] LocalImageError),
    #[error("failed to upload the image: {0}")]
    Upload(#[from] UploadError),
    #[error("failed to clean up temporary resources: {0}")]
    Cleanup(#[from] JanitorError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    install_tracing();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let exit_code = match dispatch(cli, &cancel).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn install_tracing() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let fmt_layer = fmt::layer().with_target(false).with_writer(io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if watch_interrupts(tokio::signal::ctrl_c, cancel).await {
            process::exit(INTERRUPTED_EXIT_CODE);
        }
    });
}

/// Exit status used when a second interrupt abandons cleanup.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Fires `cancel` on the first interrupt. Returns `true` when a second
/// interrupt asks to stop without waiting for cleanup.
async fn watch_interrupts<S, F>(mut next_interrupt: S, cancel: CancellationToken) -> bool
where
    S: FnMut() -> F,
    F: Future<Output = io::Result<()>>,
{
    if next_interrupt().await.is_err() {
        return false;
    }
    tracing::warn!(
        "interrupt received, stopping and removing temporary resources; interrupt again to exit immediately"
    );
    cancel.cancel();

    if next_interrupt().await.is_err() {
        return false;
    }
    tracing::warn!("second interrupt received, exiting without cleanup");
    true
}

async fn dispatch(cli: Cli, cancel: &CancellationToken) -> Result<(), CliError> {
    match cli {
        Cli::Upload(args) => run_upload(args, cancel).await,
        Cli::Cleanup(_) => run_cleanup(cancel).await,
    }
}

fn load_hcloud_config() -> Result<HcloudConfig, CliError> {
    let config = HcloudConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

async fn run_upload(args: UploadCommand, cancel: &CancellationToken) -> Result<(), CliError> {
    let hcloud = load_hcloud_config()?;
    let ssh = SshConfig::load_without_cli_args()?;
    ssh.validate()?;

    let request = build_request(args)?;

    let provisioner = ResourceProvisioner::new(
        HcloudProvider::new(&hcloud)?,
        SshKeygen::new(ssh.ssh_keygen_bin.clone()),
        ProvisionSettings::from(&hcloud),
    );
    let executor = RemoteExecutor::new(
        OpenSshTransport::new(ssh.ssh_bin.clone()),
        ExecutorSettings::from(&ssh),
    );
    let orchestrator = UploadOrchestrator::new(provisioner, executor);

    let image = orchestrator
        .upload(request, &TracingEventSink, cancel)
        .await?;
    tracing::info!(image_id = image.id, "successfully uploaded the image");
    writeln!(io::stdout(), "{}", image.id).map_err(|err| CliError::Output(err.to_string()))
}

async fn run_cleanup(cancel: &CancellationToken) -> Result<(), CliError> {
    let hcloud = load_hcloud_config()?;
    let janitor = Janitor::new(HcloudProvider::new(&hcloud)?);
    let summary = janitor.sweep(cancel).await?;
    tracing::info!(
        deleted_servers = summary.deleted_servers,
        deleted_ssh_keys = summary.deleted_ssh_keys,
        "successfully cleaned up all temporary resources"
    );
    Ok(())
}

fn build_request(args: UploadCommand) -> Result<UploadRequest, CliError> {
    let labels = args
        .labels
        .iter()
        .map(String::as_str)
        .map(parse_label)
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = UploadRequest::builder()
        .compression(
            args.compression
                .as_deref()
                .unwrap_or_default()
                .parse::<Compression>()?,
        )
        .format(
            args.format
                .as_deref()
                .unwrap_or_default()
                .parse::<ImageFormat>()?,
        )
        .description(args.description)
        .labels(labels)
        .skip_cleanup(args.skip_cleanup);

    if let Some(raw) = args.architecture.as_deref() {
        builder = builder.architecture(raw.parse::<Architecture>()?);
    }
    if let Some(server_type) = args.server_type {
        builder = builder.server_type(server_type);
    }
    if let Some(raw) = args.image_url.as_deref() {
        builder = builder.image_url(parse_image_url(raw)?);
    }
    if let Some(path) = args.image_path.as_deref() {
        let image = open_local_image(path)?;
        builder = builder
            .image_reader(image.reader)
            .size_hint(Some(image.size));
    }

    Ok(builder.build()?)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "Error: {err}").ok();
}
