//! Bulk removal of leftover temporary resources.
//!
//! Every server and SSH key an upload creates carries the provenance label
//! `apricote.de/created-by=hcloud-upload-image`. The janitor finds all
//! resources with that label and deletes them, failing if anything remains
//! afterwards.
//!
//! # Concurrency
//!
//! The label cannot tell an orphaned resource from one that an upload in
//! progress still needs. Running a sweep while any upload is running in the
//! same project deletes that upload's server and key and makes it fail.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::provider::{ActionHandle, LabeledResource, Provider, ProviderError};
use crate::request::{CREATED_BY_LABEL, CREATED_BY_VALUE};

/// Label selector matching every resource created by an upload.
#[must_use]
pub fn label_selector() -> String {
    format!("{CREATED_BY_LABEL}={CREATED_BY_VALUE}")
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Number of servers deleted during the sweep.
    pub deleted_servers: usize,
    /// Number of SSH keys deleted during the sweep.
    pub deleted_ssh_keys: usize,
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JanitorError {
    /// Raised when listing labelled resources fails.
    #[error("failed to list {resource}: {message}")]
    List {
        /// Resource type being listed (for example `servers`).
        resource: &'static str,
        /// Provider error message.
        message: String,
    },
    /// Raised when the caller cancelled the sweep.
    #[error("sweep cancelled")]
    Cancelled,
    /// Raised when resources remain after the sweep.
    #[error("resources remain after janitor sweep: {message}")]
    NotClean {
        /// Human-readable description of what remains.
        message: String,
    },
}

/// Deletes provenance-labelled resources through a [`Provider`].
#[derive(Clone, Debug)]
pub struct Janitor<P> {
    provider: P,
}

impl<P: Provider + Sync> Janitor<P> {
    /// Creates a janitor backed by `provider`.
    #[must_use]
    pub const fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Performs a sweep and returns how many resources were deleted.
    ///
    /// Servers are deleted first and their deletion awaited, so no key is
    /// removed while a server still references it. Individual deletion
    /// failures do not stop the sweep; the final re-listing decides the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError`] when listing fails, the sweep is cancelled,
    /// or labelled resources remain after deletion attempts.
    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepSummary, JanitorError> {
        let selector = label_selector();
        let mut failures = Vec::new();

        let servers = self.list_servers(&selector).await?;
        let mut deleted_servers = 0;
        let mut pending_actions: Vec<ActionHandle> = Vec::new();
        for server in &servers {
            ensure_active(cancel)?;
            match self.provider.delete_server(server.id).await {
                Ok(action) => {
                    tracing::info!(server = %server.name, id = server.id, "deleting server");
                    pending_actions.push(action);
                    deleted_servers += 1;
                }
                Err(err) if err.is_not_found() => {
                    tracing::debug!(server = %server.name, id = server.id, "server already gone");
                }
                Err(err) => {
                    tracing::warn!(server = %server.name, id = server.id, error = %err, "failed to delete server");
                    failures.push(format!("server {} ({}): {err}", server.name, server.id));
                }
            }
        }

        if !pending_actions.is_empty()
            && let Err(err) = self
                .provider
                .wait_for_actions(&pending_actions, cancel)
                .await
        {
            ensure_active(cancel)?;
            tracing::warn!(error = %err, "waiting for server deletion failed");
            failures.push(format!("server deletion: {err}"));
        }

        let keys = self.list_ssh_keys(&selector).await?;
        let mut deleted_ssh_keys = 0;
        for key in &keys {
            ensure_active(cancel)?;
            match self.provider.delete_ssh_key(key.id).await {
                Ok(()) => {
                    tracing::info!(ssh_key = %key.name, id = key.id, "deleted ssh key");
                    deleted_ssh_keys += 1;
                }
                Err(err) if err.is_not_found() => {
                    tracing::debug!(ssh_key = %key.name, id = key.id, "ssh key already gone");
                }
                Err(err) => {
                    tracing::warn!(ssh_key = %key.name, id = key.id, error = %err, "failed to delete ssh key");
                    failures.push(format!("ssh key {} ({}): {err}", key.name, key.id));
                }
            }
        }

        let remaining_servers = self.list_servers(&selector).await?;
        let remaining_keys = self.list_ssh_keys(&selector).await?;
        if !remaining_servers.is_empty() || !remaining_keys.is_empty() {
            let mut message = format!(
                "servers remaining: {}, ssh keys remaining: {}",
                remaining_servers.len(),
                remaining_keys.len()
            );
            if !failures.is_empty() {
                message.push_str("; ");
                message.push_str(&failures.join("; "));
            }
            return Err(JanitorError::NotClean { message });
        }

        Ok(SweepSummary {
            deleted_servers,
            deleted_ssh_keys,
        })
    }

    async fn list_servers(&self, selector: &str) -> Result<Vec<LabeledResource>, JanitorError> {
        self.provider
            .list_servers(selector)
            .await
            .map_err(|err| JanitorError::List {
                resource: "servers",
                message: err.to_string(),
            })
    }

    async fn list_ssh_keys(&self, selector: &str) -> Result<Vec<LabeledResource>, JanitorError> {
        self.provider
            .list_ssh_keys(selector)
            .await
            .map_err(|err| JanitorError::List {
                resource: "ssh keys",
                message: err.to_string(),
            })
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), JanitorError> {
    if cancel.is_cancelled() {
        return Err(JanitorError::Cancelled);
    }
    Ok(())
}
