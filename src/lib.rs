//! Core library for uploading disk images as Hetzner Cloud snapshots.
//!
//! An upload creates a temporary SSH key and server, boots the server into
//! the rescue system, streams or downloads the image onto its disk, and
//! snapshots that disk into a reusable image. Every temporary resource is
//! labelled so a later sweep can remove anything an interrupted run left
//! behind.

pub mod command;
pub mod config;
pub mod events;
pub mod hcloud;
pub mod janitor;
pub mod keys;
pub mod ledger;
pub mod local_image;
pub mod paths;
pub mod provider;
pub mod provision;
pub mod remote;
pub mod request;
pub mod run_id;
pub mod test_support;
pub mod upload;

pub use config::{ConfigError, HcloudConfig, SshConfig};
pub use events::{EventSink, TracingEventSink, UploadEvent};
pub use hcloud::{HcloudError, HcloudProvider};
pub use janitor::{Janitor, JanitorError, SweepSummary, label_selector};
pub use keys::{KeyError, KeyGenerator, SshKeygen, TemporaryKeyPair};
pub use ledger::{ProvisionedResource, ResourceLedger};
pub use local_image::{LocalImage, LocalImageError, open_local_image};
pub use provider::{ImageDescriptor, Provider, ProviderError};
pub use provision::{ProvisionError, ProvisionSettings, ResourceProvisioner};
pub use remote::{ExecutorSettings, OpenSshTransport, RemoteError, RemoteExecutor, RemoteShell};
pub use request::{
    Architecture, Compression, ImageFormat, ImageReader, ImageSource, ServerTarget,
    UploadRequest, UploadRequestBuilder, ValidationError,
};
pub use run_id::RunIdentity;
pub use upload::{UploadError, UploadFailure, UploadOrchestrator, UploadStage};
