//! Provider abstraction for the cloud API used during an upload.
//!
//! The upload engine only needs a handful of calls: register and delete an
//! SSH key, create, boot and delete a server, enable the rescue system,
//! snapshot the disk and wait for asynchronous actions. Label-filtered
//! listing backs the bulk cleanup command.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Handle to an asynchronous provider action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActionHandle {
    /// Provider identifier of the action.
    pub id: u64,
    /// Action command, for example `create_server`.
    pub command: String,
}

/// SSH key registered with the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshKeyHandle {
    /// Provider identifier.
    pub id: u64,
    /// Key name.
    pub name: String,
}

/// Parameters for creating a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSpec {
    /// Server name.
    pub name: String,
    /// Server type name, for example `cx22`.
    pub server_type: String,
    /// Image installed on the disk; never booted during an upload.
    pub image: String,
    /// Location name, for example `fsn1`.
    pub location: String,
    /// SSH keys injected into the server.
    pub ssh_keys: Vec<u64>,
    /// Whether the provider boots the server right after creation.
    pub start_after_create: bool,
    /// Labels attached to the server.
    pub labels: BTreeMap<String, String>,
}

/// Server as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerHandle {
    /// Provider identifier.
    pub id: u64,
    /// Server name.
    pub name: String,
    /// Public IPv4 address, when one is assigned.
    pub public_ipv4: Option<Ipv4Addr>,
}

/// Result of a server creation call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedServer {
    /// The new server.
    pub server: ServerHandle,
    /// The creation action followed by any follow-up actions.
    pub actions: Vec<ActionHandle>,
}

/// Parameters for snapshotting a server disk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageSpec {
    /// Optional image description.
    pub description: Option<String>,
    /// Labels attached to the image.
    pub labels: BTreeMap<String, String>,
}

/// Image produced by an upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageDescriptor {
    /// Provider identifier.
    pub id: u64,
    /// Status reported by the provider, for example `creating` or `available`.
    pub status: String,
    /// Image description.
    pub description: Option<String>,
    /// Labels attached to the image.
    pub labels: BTreeMap<String, String>,
}

/// Result of an image creation call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedImage {
    /// The new image.
    pub image: ImageDescriptor,
    /// Action that completes the snapshot.
    pub action: ActionHandle,
}

/// Resource found by a label selector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabeledResource {
    /// Provider identifier.
    pub id: u64,
    /// Resource name.
    pub name: String,
}

/// Error raised by a [`Provider`].
pub trait ProviderError: std::error::Error + Send + Sync + 'static {
    /// Returns `true` when the addressed resource no longer exists.
    fn is_not_found(&self) -> bool;
}

/// Cloud API calls needed to upload an image.
pub trait Provider {
    /// Provider specific error type.
    type Error: ProviderError;

    /// Registers a public SSH key.
    fn create_ssh_key<'a>(
        &'a self,
        name: &'a str,
        public_key: &'a str,
        labels: &'a BTreeMap<String, String>,
    ) -> ProviderFuture<'a, SshKeyHandle, Self::Error>;

    /// Deletes an SSH key.
    fn delete_ssh_key(&self, id: u64) -> ProviderFuture<'_, (), Self::Error>;

    /// Creates a server and returns the actions that finish its creation.
    fn create_server<'a>(
        &'a self,
        spec: &'a ServerSpec,
    ) -> ProviderFuture<'a, CreatedServer, Self::Error>;

    /// Deletes a server.
    fn delete_server(&self, id: u64) -> ProviderFuture<'_, ActionHandle, Self::Error>;

    /// Selects the rescue system for the server's next boot.
    fn enable_rescue<'a>(
        &'a self,
        server_id: u64,
        rescue_type: &'a str,
        ssh_keys: &'a [u64],
    ) -> ProviderFuture<'a, ActionHandle, Self::Error>;

    /// Powers the server on.
    fn power_on(&self, server_id: u64) -> ProviderFuture<'_, ActionHandle, Self::Error>;

    /// Snapshots the server's disk into a new image.
    fn create_image<'a>(
        &'a self,
        server_id: u64,
        spec: &'a ImageSpec,
    ) -> ProviderFuture<'a, CreatedImage, Self::Error>;

    /// Waits until every action finished successfully.
    ///
    /// Implementations stop polling as soon as `cancel` fires.
    fn wait_for_actions<'a>(
        &'a self,
        actions: &'a [ActionHandle],
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Lists servers matching a label selector.
    fn list_servers<'a>(
        &'a self,
        label_selector: &'a str,
    ) -> ProviderFuture<'a, Vec<LabeledResource>, Self::Error>;

    /// Lists SSH keys matching a label selector.
    fn list_ssh_keys<'a>(
        &'a self,
        label_selector: &'a str,
    ) -> ProviderFuture<'a, Vec<LabeledResource>, Self::Error>;
}
