//! Lifecycle events emitted by the upload engine.
//!
//! The engine never formats output itself. It reports what happened through
//! an [`EventSink`]; the binary wires in [`TracingEventSink`], tests record
//! events for assertions.

use std::time::Duration;

use crate::ledger::ProvisionedResource;
use crate::upload::UploadStage;

/// Something noteworthy that happened during an upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UploadEvent {
    /// An upload call began.
    UploadStarted {
        /// Run identity of this call.
        run_id: String,
        /// Human readable source description.
        source: String,
        /// Advisory image size in bytes.
        size_hint: Option<u64>,
    },
    /// A state transition began.
    StageStarted {
        /// Stage being entered.
        stage: UploadStage,
    },
    /// A state transition completed.
    StageCompleted {
        /// Stage that was reached.
        stage: UploadStage,
    },
    /// A temporary resource now exists and is tracked for cleanup.
    ResourceCreated {
        /// The new resource.
        resource: ProvisionedResource,
    },
    /// A retryable operation failed and will run again after a pause.
    RetryScheduled {
        /// Operation being retried.
        operation: String,
        /// Number of the upcoming attempt, starting at 1 for the first retry.
        attempt: u32,
        /// Pause before the next attempt.
        backoff: Duration,
        /// Error from the failed attempt.
        message: String,
    },
    /// Combined output of the remote write command.
    RemoteOutput {
        /// Interleaved stdout and stderr.
        output: String,
    },
    /// The best-effort power-down request failed.
    ShutdownFailed {
        /// Error message.
        message: String,
    },
    /// A resource is about to be destroyed.
    CleanupAttempted {
        /// Resource being destroyed.
        resource: ProvisionedResource,
    },
    /// Destroying a resource failed; the upload result is unaffected.
    CleanupFailed {
        /// Resource left behind.
        resource: ProvisionedResource,
        /// Error message.
        message: String,
    },
    /// Cleanup was disabled and these resources were left in place.
    CleanupSkipped {
        /// Resources left behind.
        resources: Vec<ProvisionedResource>,
    },
    /// The upload ended in failure.
    UploadFailed {
        /// Stage whose transition failed.
        stage: UploadStage,
        /// Error message.
        message: String,
    },
    /// The upload produced an image.
    UploadCompleted {
        /// Provider identifier of the image.
        image_id: u64,
    },
}

impl UploadEvent {
    /// Stable event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UploadStarted { .. } => "upload-started",
            Self::StageStarted { .. } => "stage-started",
            Self::StageCompleted { .. } => "stage-completed",
            Self::ResourceCreated { .. } => "resource-created",
            Self::RetryScheduled { .. } => "retry-scheduled",
            Self::RemoteOutput { .. } => "remote-output",
            Self::ShutdownFailed { .. } => "shutdown-failed",
            Self::CleanupAttempted { .. } => "cleanup-attempted",
            Self::CleanupFailed { .. } => "cleanup-failed",
            Self::CleanupSkipped { .. } => "cleanup-skipped",
            Self::UploadFailed { .. } => "upload-failed",
            Self::UploadCompleted { .. } => "upload-completed",
        }
    }
}

/// Receiver of [`UploadEvent`]s.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn emit(&self, event: UploadEvent);
}

/// Forwards events to `tracing` with structured fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: UploadEvent) {
        let name = event.name();
        match event {
            UploadEvent::UploadStarted {
                run_id,
                source,
                size_hint,
            } => tracing::info!(event = name, %run_id, %source, ?size_hint, "starting upload"),
            UploadEvent::StageStarted { stage } => {
                tracing::info!(event = name, %stage, "{}", stage.description());
            }
            UploadEvent::StageCompleted { stage } => {
                tracing::debug!(event = name, %stage, "stage completed");
            }
            UploadEvent::ResourceCreated { resource } => {
                tracing::debug!(event = name, %resource, "temporary resource created");
            }
            UploadEvent::RetryScheduled {
                operation,
                attempt,
                backoff,
                message,
            } => tracing::debug!(
                event = name,
                %operation,
                attempt,
                ?backoff,
                error = %message,
                "operation failed, waiting before trying again"
            ),
            UploadEvent::RemoteOutput { output } => {
                tracing::info!(event = name, %output, "remote command finished");
            }
            UploadEvent::ShutdownFailed { message } => {
                tracing::warn!(event = name, error = %message, "shutting down the server failed");
            }
            UploadEvent::CleanupAttempted { resource } => {
                tracing::debug!(event = name, %resource, "removing temporary resource");
            }
            UploadEvent::CleanupFailed { resource, message } => tracing::warn!(
                event = name,
                %resource,
                error = %message,
                "failed to remove temporary resource"
            ),
            UploadEvent::CleanupSkipped { resources } => {
                for resource in resources {
                    tracing::warn!(event = name, %resource, "leaving temporary resource in place");
                }
            }
            UploadEvent::UploadFailed { stage, message } => {
                tracing::error!(event = name, %stage, error = %message, "upload failed");
            }
            UploadEvent::UploadCompleted { image_id } => {
                tracing::info!(event = name, image_id, "image uploaded");
            }
        }
    }
}
