//! Wire payloads of the Hetzner Cloud API.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::provider::{ActionHandle, ImageDescriptor, LabeledResource, ServerHandle, SshKeyHandle};

#[derive(Debug, Serialize)]
pub(super) struct CreateSshKeyBody<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
    pub labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateServerBody<'a> {
    pub name: &'a str,
    pub server_type: &'a str,
    pub image: &'a str,
    pub location: &'a str,
    pub ssh_keys: &'a [u64],
    pub start_after_create: bool,
    pub labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub(super) struct EnableRescueBody<'a> {
    #[serde(rename = "type")]
    pub rescue_type: &'a str,
    pub ssh_keys: &'a [u64],
}

#[derive(Debug, Serialize)]
pub(super) struct CreateImageBody<'a> {
    #[serde(rename = "type")]
    pub image_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
    pub labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ErrorEnvelope {
    pub error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
pub(super) struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct Action {
    pub id: u64,
    pub command: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub(super) enum ActionStatus {
    Running,
    Success,
    Error,
}

impl From<Action> for ActionHandle {
    fn from(value: Action) -> Self {
        Self {
            id: value.id,
            command: value.command,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ActionEnvelope {
    pub action: Action,
}

#[derive(Debug, Deserialize)]
pub(super) struct ActionsEnvelope {
    pub actions: Vec<Action>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKey {
    pub id: u64,
    pub name: String,
}

impl From<SshKey> for SshKeyHandle {
    fn from(value: SshKey) -> Self {
        Self {
            id: value.id,
            name: value.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKeyEnvelope {
    pub ssh_key: SshKey,
}

#[derive(Debug, Deserialize)]
pub(super) struct Ipv4 {
    pub ip: Ipv4Addr,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Server {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub public_net: PublicNet,
}

impl From<Server> for ServerHandle {
    fn from(value: Server) -> Self {
        Self {
            id: value.id,
            name: value.name,
            public_ipv4: value.public_net.ipv4.map(|ipv4| ipv4.ip),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateServerEnvelope {
    pub server: Server,
    pub action: Action,
    #[serde(default)]
    pub next_actions: Vec<Action>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Image {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl From<Image> for ImageDescriptor {
    fn from(value: Image) -> Self {
        Self {
            id: value.id,
            status: value.status,
            description: value.description.filter(|text| !text.is_empty()),
            labels: value.labels,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateImageEnvelope {
    pub image: Image,
    pub action: Action,
}

#[derive(Debug, Deserialize)]
pub(super) struct Named {
    pub id: u64,
    pub name: String,
}

impl From<Named> for LabeledResource {
    fn from(value: Named) -> Self {
        Self {
            id: value.id,
            name: value.name,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct Pagination {
    #[serde(default)]
    pub next_page: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct Meta {
    #[serde(default)]
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerPage {
    pub servers: Vec<Named>,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKeyPage {
    pub ssh_keys: Vec<Named>,
    #[serde(default)]
    pub meta: Meta,
}
