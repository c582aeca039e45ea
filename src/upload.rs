//! Upload state machine.
//!
//! An upload walks a fixed sequence of stages:
//!
//! ```text
//! init -> key-created -> machine-created -> rescue-enabled -> booted
//!      -> connected -> image-written -> shutdown-requested -> snapshotted
//!      -> done
//! ```
//!
//! Any failing transition ends the run in `failed`. Whatever the outcome,
//! every resource recorded in the [`ResourceLedger`] then gets exactly one
//! destroy attempt, newest first, unless the request disabled cleanup.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::command::assemble_command;
use crate::events::{EventSink, UploadEvent};
use crate::keys::KeyGenerator;
use crate::ledger::{ProvisionedResource, ResourceLedger};
use crate::provider::{ImageDescriptor, ImageSpec, Provider};
use crate::provision::{ProvisionError, ResourceProvisioner};
use crate::remote::{RemoteError, RemoteExecutor, RemoteShell};
use crate::request::{ImageSource, ServerTarget, UploadRequest, ValidationError, full_labels};
use crate::run_id::RunIdentity;

/// Position of an upload in its state machine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum UploadStage {
    /// Request accepted; nothing created yet.
    Init,
    /// Temporary SSH key registered.
    KeyCreated,
    /// Temporary server created and settled.
    MachineCreated,
    /// Rescue system selected for the next boot.
    RescueEnabled,
    /// Server powered on into the rescue system.
    Booted,
    /// Remote shell session established.
    Connected,
    /// Image written to the server disk.
    ImageWritten,
    /// Power-down requested.
    ShutdownRequested,
    /// Snapshot image created.
    Snapshotted,
    /// Upload finished successfully.
    Done,
    /// Upload ended in failure.
    Failed,
}

impl UploadStage {
    /// Stable kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::KeyCreated => "key-created",
            Self::MachineCreated => "machine-created",
            Self::RescueEnabled => "rescue-enabled",
            Self::Booted => "booted",
            Self::Connected => "connected",
            Self::ImageWritten => "image-written",
            Self::ShutdownRequested => "shutdown-requested",
            Self::Snapshotted => "snapshotted",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Progress message for the transition into this stage.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Init => "preparing upload",
            Self::KeyCreated => "creating temporary ssh key",
            Self::MachineCreated => "creating temporary server",
            Self::RescueEnabled => "enabling rescue system",
            Self::Booted => "booting server into rescue system",
            Self::Connected => "connecting to rescue system",
            Self::ImageWritten => "writing image to disk",
            Self::ShutdownRequested => "shutting down server",
            Self::Snapshotted => "creating snapshot image",
            Self::Done => "upload complete",
            Self::Failed => "upload failed",
        }
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause of a failed upload.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum UploadFailure {
    /// The request was malformed or contradictory.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A provider call or wait failed.
    #[error(transparent)]
    Provisioning(ProvisionError),
    /// The rescue system could not be reached.
    #[error(transparent)]
    Connectivity(RemoteError),
    /// The remote write command failed.
    #[error(transparent)]
    Execution(RemoteError),
    /// The caller cancelled the upload.
    #[error("upload cancelled")]
    Cancelled,
}

impl From<ProvisionError> for UploadFailure {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::Cancelled => Self::Cancelled,
            other => Self::Provisioning(other),
        }
    }
}

impl UploadFailure {
    fn connectivity(err: RemoteError) -> Self {
        match err {
            RemoteError::Cancelled => Self::Cancelled,
            other => Self::Connectivity(other),
        }
    }

    fn execution(err: RemoteError) -> Self {
        match err {
            RemoteError::Cancelled => Self::Cancelled,
            other => Self::Execution(other),
        }
    }
}

/// Upload failure tagged with the stage the failing transition was heading
/// into.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("upload failed at stage {stage}: {source}")]
pub struct UploadError {
    /// Target stage of the failed transition.
    pub stage: UploadStage,
    /// Underlying cause.
    #[source]
    pub source: UploadFailure,
}

impl UploadError {
    fn new(stage: UploadStage, source: impl Into<UploadFailure>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    /// Returns `true` when the upload stopped because of cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.source, UploadFailure::Cancelled)
    }
}

/// A temporary resource that could not be removed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to remove {resource}: {source}")]
pub struct CleanupError {
    /// Resource left behind.
    pub resource: ProvisionedResource,
    /// Underlying cause.
    #[source]
    pub source: ProvisionError,
}

/// Everything the stages need besides the collaborators.
struct UploadPlan {
    run: RunIdentity,
    source: ImageSource,
    command: String,
    target: ServerTarget,
    labels: BTreeMap<String, String>,
    image: ImageSpec,
}

/// Drives one upload from request to snapshot image.
#[derive(Clone, Debug)]
pub struct UploadOrchestrator<P, K, T: RemoteShell> {
    provisioner: ResourceProvisioner<P, K>,
    executor: RemoteExecutor<T>,
}

impl<P, K, T> UploadOrchestrator<P, K, T>
where
    P: Provider + Sync,
    K: KeyGenerator,
    T: RemoteShell,
{
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(provisioner: ResourceProvisioner<P, K>, executor: RemoteExecutor<T>) -> Self {
        Self {
            provisioner,
            executor,
        }
    }

    /// Uploads the image described by `request` under a fresh run identity.
    ///
    /// Cancellation goes through `cancel`: every wait observes it and cleanup
    /// still runs afterwards. Dropping the returned future instead skips
    /// cleanup and may leave resources behind.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError`] carrying the first failure. Cleanup failures
    /// are reported as `cleanup-failed` events only.
    pub async fn upload(
        &self,
        request: UploadRequest,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<ImageDescriptor, UploadError> {
        self.upload_as(RunIdentity::generate(), request, events, cancel)
            .await
    }

    /// Same as [`Self::upload`] with a caller-chosen run identity.
    ///
    /// # Errors
    ///
    /// See [`Self::upload`].
    pub async fn upload_as(
        &self,
        run: RunIdentity,
        request: UploadRequest,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<ImageDescriptor, UploadError> {
        let UploadRequest {
            source,
            compression,
            format,
            target,
            description,
            labels,
            size_hint,
            skip_cleanup,
        } = request;

        events.emit(UploadEvent::UploadStarted {
            run_id: run.to_string(),
            source: describe_source(&source),
            size_hint,
        });

        let command = match assemble_command(source.kind(), compression, format) {
            Ok(command) => command,
            Err(invalid) => {
                let err = UploadError::new(UploadStage::Init, invalid);
                Self::report_outcome(Err(&err), events);
                return Err(err);
            }
        };

        let merged_labels = full_labels(&labels);
        let plan = UploadPlan {
            run,
            source,
            command,
            target,
            image: ImageSpec {
                description,
                labels: merged_labels.clone(),
            },
            labels: merged_labels,
        };

        let mut ledger = ResourceLedger::new();
        let result = self.run_stages(plan, &mut ledger, events, cancel).await;
        self.cleanup(ledger, skip_cleanup, events).await;
        Self::report_outcome(result.as_ref(), events);
        result
    }

    async fn run_stages(
        &self,
        plan: UploadPlan,
        ledger: &mut ResourceLedger,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<ImageDescriptor, UploadError> {
        let UploadPlan {
            run,
            source,
            command,
            target,
            labels,
            image,
        } = plan;
        let provisioner = &self.provisioner;

        stage_started(events, UploadStage::KeyCreated);
        let (key_pair, ssh_key) = provisioner
            .create_key_pair(&run, &labels, ledger, events, cancel)
            .await
            .map_err(|err| UploadError::new(UploadStage::KeyCreated, err))?;
        stage_completed(events, UploadStage::KeyCreated);

        stage_started(events, UploadStage::MachineCreated);
        let machine = provisioner
            .create_machine(&run, &target, &labels, &ssh_key, ledger, events, cancel)
            .await
            .map_err(|err| UploadError::new(UploadStage::MachineCreated, err))?;
        stage_completed(events, UploadStage::MachineCreated);

        stage_started(events, UploadStage::RescueEnabled);
        provisioner
            .enable_rescue(&machine, &ssh_key, cancel)
            .await
            .map_err(|err| UploadError::new(UploadStage::RescueEnabled, err))?;
        stage_completed(events, UploadStage::RescueEnabled);

        stage_started(events, UploadStage::Booted);
        provisioner
            .boot(&machine, cancel)
            .await
            .map_err(|err| UploadError::new(UploadStage::Booted, err))?;
        stage_completed(events, UploadStage::Booted);

        stage_started(events, UploadStage::Connected);
        let session = self
            .executor
            .connect(
                IpAddr::V4(machine.public_ipv4),
                key_pair.private_key_path(),
                events,
                cancel,
            )
            .await
            .map_err(|err| {
                UploadError::new(UploadStage::Connected, UploadFailure::connectivity(err))
            })?;
        stage_completed(events, UploadStage::Connected);

        stage_started(events, UploadStage::ImageWritten);
        match self
            .executor
            .run(&session, &command, source.into_reader(), cancel)
            .await
        {
            Ok(output) => events.emit(UploadEvent::RemoteOutput { output }),
            Err(err) => {
                if let RemoteError::CommandFailed { output, .. } = &err {
                    events.emit(UploadEvent::RemoteOutput {
                        output: output.clone(),
                    });
                }
                self.executor.disconnect(session).await;
                return Err(UploadError::new(
                    UploadStage::ImageWritten,
                    UploadFailure::execution(err),
                ));
            }
        }
        stage_completed(events, UploadStage::ImageWritten);

        stage_started(events, UploadStage::ShutdownRequested);
        if let Err(err) = self.executor.shutdown(session, cancel).await {
            events.emit(UploadEvent::ShutdownFailed {
                message: err.to_string(),
            });
        }
        stage_completed(events, UploadStage::ShutdownRequested);

        stage_started(events, UploadStage::Snapshotted);
        let descriptor = provisioner
            .create_snapshot(&machine, &image, cancel)
            .await
            .map_err(|err| UploadError::new(UploadStage::Snapshotted, err))?;
        stage_completed(events, UploadStage::Snapshotted);

        drop(key_pair);
        Ok(descriptor)
    }

    async fn cleanup(&self, ledger: ResourceLedger, skip_cleanup: bool, events: &dyn EventSink) {
        if ledger.is_empty() {
            return;
        }

        if skip_cleanup {
            events.emit(UploadEvent::CleanupSkipped {
                resources: ledger.iter().cloned().collect(),
            });
            return;
        }

        for resource in ledger.into_teardown_order() {
            events.emit(UploadEvent::CleanupAttempted {
                resource: resource.clone(),
            });
            if let Err(source) = self.provisioner.destroy(&resource).await {
                let failure = CleanupError {
                    resource: resource.clone(),
                    source,
                };
                events.emit(UploadEvent::CleanupFailed {
                    resource,
                    message: failure.to_string(),
                });
            }
        }
    }

    fn report_outcome(result: Result<&ImageDescriptor, &UploadError>, events: &dyn EventSink) {
        match result {
            Ok(image) => {
                stage_completed(events, UploadStage::Done);
                events.emit(UploadEvent::UploadCompleted { image_id: image.id });
            }
            Err(err) => events.emit(UploadEvent::UploadFailed {
                stage: err.stage,
                message: err.source.to_string(),
            }),
        }
    }
}

fn stage_started(events: &dyn EventSink, stage: UploadStage) {
    events.emit(UploadEvent::StageStarted { stage });
}

fn stage_completed(events: &dyn EventSink, stage: UploadStage) {
    events.emit(UploadEvent::StageCompleted { stage });
}

fn describe_source(source: &ImageSource) -> String {
    match source {
        ImageSource::Url(url) => url.to_string(),
        ImageSource::Local(_) => String::from("local stream"),
        ImageSource::None => String::from("empty stream"),
    }
}
