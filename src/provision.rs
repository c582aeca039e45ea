//! Creation and removal of the temporary resources behind an upload.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::HcloudConfig;
use crate::events::{EventSink, UploadEvent};
use crate::keys::{KeyError, KeyGenerator, TemporaryKeyPair};
use crate::ledger::{ProvisionedResource, ResourceLedger};
use crate::provider::{
    ActionHandle, ImageDescriptor, ImageSpec, Provider, ProviderError, ServerSpec, SshKeyHandle,
};
use crate::request::{Architecture, ServerTarget};
use crate::run_id::RunIdentity;

/// Server type used for x86 images.
pub const X86_SERVER_TYPE: &str = "cx22";
/// Server type used for arm images.
pub const ARM_SERVER_TYPE: &str = "cax11";

/// Maps a target to the server type that hosts the upload.
#[must_use]
pub fn resolve_server_type(target: &ServerTarget) -> &str {
    match target {
        ServerTarget::Architecture(Architecture::X86) => X86_SERVER_TYPE,
        ServerTarget::Architecture(Architecture::Arm) => ARM_SERVER_TYPE,
        ServerTarget::ServerType(name) => name,
    }
}

/// Errors raised while provisioning or removing resources.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Raised when the local key pair cannot be generated.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Raised when a provider call fails.
    #[error("{operation} failed: {message}")]
    Provider {
        /// Provider call that failed.
        operation: &'static str,
        /// Provider error message.
        message: String,
    },
    /// Raised when an asynchronous provider action fails or times out.
    #[error("waiting for {operation} failed: {message}")]
    Action {
        /// Operation whose actions were awaited.
        operation: &'static str,
        /// Provider error message.
        message: String,
    },
    /// Raised when a new server has no public IPv4 address.
    #[error("server {server_id} has no public IPv4 address")]
    MissingPublicIp {
        /// Provider server identifier.
        server_id: u64,
    },
    /// Raised when the cancellation token fired.
    #[error("provisioning cancelled")]
    Cancelled,
}

/// Server created for an upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemporaryMachine {
    /// Provider server identifier.
    pub id: u64,
    /// Server name.
    pub name: String,
    /// Public address used for SSH.
    pub public_ipv4: Ipv4Addr,
}

/// Provider side settings for new servers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionSettings {
    /// Location name, for example `fsn1`.
    pub location: String,
    /// Image installed on the server disk.
    pub base_image: String,
    /// Rescue system flavour.
    pub rescue_type: String,
}

impl From<&HcloudConfig> for ProvisionSettings {
    fn from(config: &HcloudConfig) -> Self {
        Self {
            location: config.location.clone(),
            base_image: config.base_image.clone(),
            rescue_type: config.rescue_type.clone(),
        }
    }
}

/// Creates, prepares and removes the temporary key and server.
///
/// Every resource is recorded in the caller's [`ResourceLedger`] as soon as
/// the provider acknowledges it, before any follow-up wait, so a failure in
/// a later step still leaves it eligible for cleanup.
#[derive(Clone, Debug)]
pub struct ResourceProvisioner<P, K> {
    provider: P,
    keys: K,
    settings: ProvisionSettings,
}

impl<P, K> ResourceProvisioner<P, K>
where
    P: Provider + Sync,
    K: KeyGenerator,
{
    /// Creates a provisioner.
    #[must_use]
    pub const fn new(provider: P, keys: K, settings: ProvisionSettings) -> Self {
        Self {
            provider,
            keys,
            settings,
        }
    }

    /// Returns the underlying provider.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Generates a key pair and registers its public half.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when generation or registration fails.
    pub async fn create_key_pair(
        &self,
        run: &RunIdentity,
        labels: &BTreeMap<String, String>,
        ledger: &mut ResourceLedger,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<(TemporaryKeyPair, SshKeyHandle), ProvisionError> {
        ensure_active(cancel)?;
        let name = run.resource_name();
        let key_pair = self.keys.generate(&name).await?;

        ensure_active(cancel)?;
        let handle = self
            .provider
            .create_ssh_key(&name, key_pair.public_key(), labels)
            .await
            .map_err(|err| provider_error("create_ssh_key", &err))?;

        record(
            ledger,
            events,
            ProvisionedResource::SshKey {
                id: handle.id,
                name: handle.name.clone(),
            },
        );
        Ok((key_pair, handle))
    }

    /// Creates the server, attached to `ssh_key` and powered off, and waits
    /// until the provider finished setting it up.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when creation or the wait fails, or when
    /// the server has no public IPv4 address.
    #[expect(
        clippy::too_many_arguments,
        reason = "ledger, event sink and token are threaded through every step"
    )]
    pub async fn create_machine(
        &self,
        run: &RunIdentity,
        target: &ServerTarget,
        labels: &BTreeMap<String, String>,
        ssh_key: &SshKeyHandle,
        ledger: &mut ResourceLedger,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<TemporaryMachine, ProvisionError> {
        ensure_active(cancel)?;
        let spec = ServerSpec {
            name: run.resource_name(),
            server_type: resolve_server_type(target).to_owned(),
            image: self.settings.base_image.clone(),
            location: self.settings.location.clone(),
            ssh_keys: vec![ssh_key.id],
            start_after_create: false,
            labels: labels.clone(),
        };
        let created = self
            .provider
            .create_server(&spec)
            .await
            .map_err(|err| provider_error("create_server", &err))?;

        let server = created.server;
        record(
            ledger,
            events,
            ProvisionedResource::Server {
                id: server.id,
                name: server.name.clone(),
            },
        );

        self.wait("create_server", &created.actions, cancel).await?;

        let public_ipv4 = server
            .public_ipv4
            .ok_or(ProvisionError::MissingPublicIp {
                server_id: server.id,
            })?;
        Ok(TemporaryMachine {
            id: server.id,
            name: server.name,
            public_ipv4,
        })
    }

    /// Selects the rescue system, authorised for `ssh_key`, for the next
    /// boot.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the call or its action fails.
    pub async fn enable_rescue(
        &self,
        machine: &TemporaryMachine,
        ssh_key: &SshKeyHandle,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        ensure_active(cancel)?;
        let action = self
            .provider
            .enable_rescue(machine.id, &self.settings.rescue_type, &[ssh_key.id])
            .await
            .map_err(|err| provider_error("enable_rescue", &err))?;
        self.wait("enable_rescue", &[action], cancel).await
    }

    /// Powers the server on.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the call or its action fails.
    pub async fn boot(
        &self,
        machine: &TemporaryMachine,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        ensure_active(cancel)?;
        let action = self
            .provider
            .power_on(machine.id)
            .await
            .map_err(|err| provider_error("poweron", &err))?;
        self.wait("poweron", &[action], cancel).await
    }

    /// Snapshots the server disk and waits until the image is complete.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the call or its action fails.
    pub async fn create_snapshot(
        &self,
        machine: &TemporaryMachine,
        spec: &ImageSpec,
        cancel: &CancellationToken,
    ) -> Result<ImageDescriptor, ProvisionError> {
        ensure_active(cancel)?;
        let created = self
            .provider
            .create_image(machine.id, spec)
            .await
            .map_err(|err| provider_error("create_image", &err))?;
        self.wait("create_image", std::slice::from_ref(&created.action), cancel)
            .await?;
        Ok(created.image)
    }

    /// Removes one resource. Server deletion waits for its action.
    ///
    /// Runs to completion regardless of any upload cancellation. A resource
    /// the provider no longer knows about counts as removed.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the provider rejects the deletion.
    pub async fn destroy(&self, resource: &ProvisionedResource) -> Result<(), ProvisionError> {
        match resource {
            ProvisionedResource::SshKey { id, .. } => match self.provider.delete_ssh_key(*id).await {
                Ok(()) => Ok(()),
                Err(err) if err.is_not_found() => Ok(()),
                Err(err) => Err(provider_error("delete_ssh_key", &err)),
            },
            ProvisionedResource::Server { id, .. } => {
                let action = match self.provider.delete_server(*id).await {
                    Ok(action) => action,
                    Err(err) if err.is_not_found() => return Ok(()),
                    Err(err) => return Err(provider_error("delete_server", &err)),
                };
                self.wait("delete_server", &[action], &CancellationToken::new())
                    .await
            }
        }
    }

    async fn wait(
        &self,
        operation: &'static str,
        actions: &[ActionHandle],
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        match self.provider.wait_for_actions(actions, cancel).await {
            Ok(()) => Ok(()),
            Err(_) if cancel.is_cancelled() => Err(ProvisionError::Cancelled),
            Err(err) => Err(ProvisionError::Action {
                operation,
                message: err.to_string(),
            }),
        }
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled);
    }
    Ok(())
}

fn provider_error(operation: &'static str, err: &dyn std::error::Error) -> ProvisionError {
    ProvisionError::Provider {
        operation,
        message: err.to_string(),
    }
}

fn record(ledger: &mut ResourceLedger, events: &dyn EventSink, resource: ProvisionedResource) {
    ledger.record(resource.clone());
    events.emit(UploadEvent::ResourceCreated { resource });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        FakeKeyGenerator, ProviderCall, RecordingEventSink, ScriptedProvider,
    };
    use rstest::{fixture, rstest};

    #[rstest]
    #[case(ServerTarget::Architecture(Architecture::X86), "cx22")]
    #[case(ServerTarget::Architecture(Architecture::Arm), "cax11")]
    #[case(ServerTarget::ServerType(String::from("cpx31")), "cpx31")]
    fn resolves_server_type(#[case] target: ServerTarget, #[case] expected: &str) {
        assert_eq!(resolve_server_type(&target), expected);
    }

    fn settings() -> ProvisionSettings {
        ProvisionSettings {
            location: String::from("fsn1"),
            base_image: String::from("ubuntu-24.04"),
            rescue_type: String::from("linux64"),
        }
    }

    #[fixture]
    fn provisioner() -> ResourceProvisioner<ScriptedProvider, FakeKeyGenerator> {
        ResourceProvisioner::new(ScriptedProvider::new(), FakeKeyGenerator, settings())
    }

    fn run_id() -> RunIdentity {
        RunIdentity::from_string("0a1b2c3d")
    }

    #[rstest]
    #[tokio::test]
    async fn key_pair_is_registered_and_recorded(
        provisioner: ResourceProvisioner<ScriptedProvider, FakeKeyGenerator>,
    ) {
        let mut ledger = ResourceLedger::new();
        let events = RecordingEventSink::default();
        let (key_pair, handle) = provisioner
            .create_key_pair(
                &run_id(),
                &BTreeMap::new(),
                &mut ledger,
                &events,
                &CancellationToken::new(),
            )
            .await
            .expect("key pair");

        assert!(key_pair.public_key().starts_with("ssh-ed25519 "));
        assert_eq!(handle.name, "hcloud-upload-image-0a1b2c3d");
        assert_eq!(ledger.len(), 1);
        assert_eq!(events.names(), vec!["resource-created"]);
    }

    #[rstest]
    #[tokio::test]
    async fn machine_is_created_powered_off_with_key(
        provisioner: ResourceProvisioner<ScriptedProvider, FakeKeyGenerator>,
    ) {
        let mut ledger = ResourceLedger::new();
        let key = SshKeyHandle {
            id: 7,
            name: String::from("hcloud-upload-image-0a1b2c3d"),
        };
        let machine = provisioner
            .create_machine(
                &run_id(),
                &ServerTarget::Architecture(Architecture::Arm),
                &BTreeMap::new(),
                &key,
                &mut ledger,
                &RecordingEventSink::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("machine");

        assert_eq!(machine.name, "hcloud-upload-image-0a1b2c3d");
        let calls = provisioner.provider().calls();
        let Some(ProviderCall::CreateServer(spec)) = calls.first() else {
            panic!("expected create_server call, got {calls:?}");
        };
        assert_eq!(spec.server_type, "cax11");
        assert_eq!(spec.ssh_keys, vec![7]);
        assert!(!spec.start_after_create);
        assert_eq!(spec.location, "fsn1");
        assert_eq!(spec.image, "ubuntu-24.04");
    }

    #[rstest]
    #[tokio::test]
    async fn server_is_recorded_before_wait_failure(
        provisioner: ResourceProvisioner<ScriptedProvider, FakeKeyGenerator>,
    ) {
        provisioner.provider().fail_wait_for("create_server");
        let mut ledger = ResourceLedger::new();
        let key = SshKeyHandle {
            id: 7,
            name: String::from("key"),
        };
        let err = provisioner
            .create_machine(
                &run_id(),
                &ServerTarget::Architecture(Architecture::X86),
                &BTreeMap::new(),
                &key,
                &mut ledger,
                &RecordingEventSink::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("wait should fail");

        assert!(
            matches!(err, ProvisionError::Action { operation: "create_server", .. }),
            "unexpected error: {err}"
        );
        assert_eq!(ledger.len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn missing_public_ip_still_records_server(
        provisioner: ResourceProvisioner<ScriptedProvider, FakeKeyGenerator>,
    ) {
        provisioner.provider().omit_public_ip();
        let mut ledger = ResourceLedger::new();
        let key = SshKeyHandle {
            id: 7,
            name: String::from("key"),
        };
        let err = provisioner
            .create_machine(
                &run_id(),
                &ServerTarget::Architecture(Architecture::X86),
                &BTreeMap::new(),
                &key,
                &mut ledger,
                &RecordingEventSink::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("no address");

        assert!(matches!(err, ProvisionError::MissingPublicIp { .. }));
        assert_eq!(ledger.len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn cancelled_token_stops_before_provider_calls(
        provisioner: ResourceProvisioner<ScriptedProvider, FakeKeyGenerator>,
    ) {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut ledger = ResourceLedger::new();
        let err = provisioner
            .create_key_pair(
                &run_id(),
                &BTreeMap::new(),
                &mut ledger,
                &RecordingEventSink::default(),
                &cancel,
            )
            .await
            .expect_err("cancelled");

        assert_eq!(err, ProvisionError::Cancelled);
        assert!(provisioner.provider().calls().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn destroy_server_waits_on_delete_action(
        provisioner: ResourceProvisioner<ScriptedProvider, FakeKeyGenerator>,
    ) {
        provisioner
            .destroy(&ProvisionedResource::Server {
                id: 42,
                name: String::from("server"),
            })
            .await
            .expect("destroy");

        let calls = provisioner.provider().calls();
        assert_eq!(
            calls,
            vec![
                ProviderCall::DeleteServer(42),
                ProviderCall::WaitForActions(vec![String::from("delete_server")]),
            ]
        );
    }

    #[rstest]
    #[case::server(ProvisionedResource::Server { id: 42, name: String::from("server") })]
    #[case::ssh_key(ProvisionedResource::SshKey { id: 7, name: String::from("key") })]
    #[tokio::test]
    async fn destroy_treats_vanished_resources_as_removed(
        provisioner: ResourceProvisioner<ScriptedProvider, FakeKeyGenerator>,
        #[case] resource: ProvisionedResource,
    ) {
        provisioner.provider().vanish_on_delete(resource.id());

        provisioner.destroy(&resource).await.expect("destroy");

        let calls = provisioner.provider().calls();
        assert_eq!(calls.len(), 1, "calls: {calls:?}");
    }

    #[rstest]
    #[tokio::test]
    async fn destroy_reports_rejected_deletion(
        provisioner: ResourceProvisioner<ScriptedProvider, FakeKeyGenerator>,
    ) {
        provisioner.provider().fail_delete_ssh_key(7);

        let err = provisioner
            .destroy(&ProvisionedResource::SshKey {
                id: 7,
                name: String::from("key"),
            })
            .await
            .expect_err("locked key");

        assert!(
            matches!(err, ProvisionError::Provider { operation: "delete_ssh_key", .. }),
            "unexpected error: {err}"
        );
    }
}
