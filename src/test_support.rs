//! Test support utilities shared across unit and integration tests.
//!
//! The doubles record every call they receive and answer from scripted
//! state, so upload and sweep flows run without network or processes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::events::{EventSink, UploadEvent};
use crate::keys::{KeyFuture, KeyGenerator, TemporaryKeyPair};
use crate::provider::{
    ActionHandle, CreatedImage, CreatedServer, ImageDescriptor, ImageSpec, LabeledResource,
    Provider, ProviderError, ProviderFuture, ServerHandle, ServerSpec, SshKeyHandle,
};
use crate::remote::{Attempt, CommandOutcome, RemoteShell, SshTarget, TransportFuture};
use crate::request::ImageReader;

/// Public address handed out for scripted servers.
pub const SCRIPTED_SERVER_IPV4: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error returned by [`ScriptedProvider`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedProviderError {
    /// The call was scripted to fail.
    #[error("scripted provider: {0}")]
    Rejected(String),
    /// The resource disappeared before the call reached it.
    #[error("scripted provider: {0} not found")]
    NotFound(String),
}

impl ProviderError for ScriptedProviderError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A call received by [`ScriptedProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderCall {
    /// `create_ssh_key` with the key name.
    CreateSshKey(String),
    /// `delete_ssh_key` with the key id.
    DeleteSshKey(u64),
    /// `create_server` with the full server request.
    CreateServer(ServerSpec),
    /// `delete_server` with the server id.
    DeleteServer(u64),
    /// `enable_rescue` with server id, rescue type and key ids.
    EnableRescue(u64, String, Vec<u64>),
    /// `power_on` with the server id.
    PowerOn(u64),
    /// `create_image` with server id and image request.
    CreateImage(u64, ImageSpec),
    /// `wait_for_actions` with the awaited action commands.
    WaitForActions(Vec<String>),
    /// `list_servers` with the label selector.
    ListServers(String),
    /// `list_ssh_keys` with the label selector.
    ListSshKeys(String),
}

#[derive(Debug, Default)]
struct ProviderState {
    calls: Vec<ProviderCall>,
    next_id: u64,
    servers: BTreeMap<u64, String>,
    ssh_keys: BTreeMap<u64, String>,
    failing_calls: BTreeSet<String>,
    failing_waits: BTreeSet<String>,
    failing_server_deletes: BTreeSet<u64>,
    failing_key_deletes: BTreeSet<u64>,
    vanishing: BTreeSet<u64>,
    cancel_on_wait: Option<(String, CancellationToken)>,
    omit_public_ip: bool,
}

impl ProviderState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn action(&mut self, command: &str) -> ActionHandle {
        ActionHandle {
            id: 1000 + self.next_id(),
            command: command.to_owned(),
        }
    }

    fn check(&self, operation: &str) -> Result<(), ScriptedProviderError> {
        if self.failing_calls.contains(operation) {
            return Err(ScriptedProviderError::Rejected(format!("{operation} rejected")));
        }
        Ok(())
    }
}

/// In-memory [`Provider`] with scripted failures.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl ScriptedProvider {
    /// Creates a provider where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all calls recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.state).calls.clone()
    }

    /// Makes calls to `operation` (for example `create_server`) fail.
    pub fn fail_call(&self, operation: &str) {
        lock(&self.state).failing_calls.insert(operation.to_owned());
    }

    /// Makes waits on actions with `command` fail.
    pub fn fail_wait_for(&self, command: &str) {
        lock(&self.state).failing_waits.insert(command.to_owned());
    }

    /// Makes deletion of server `id` fail.
    pub fn fail_delete_server(&self, id: u64) {
        lock(&self.state).failing_server_deletes.insert(id);
    }

    /// Makes deletion of SSH key `id` fail.
    pub fn fail_delete_ssh_key(&self, id: u64) {
        lock(&self.state).failing_key_deletes.insert(id);
    }

    /// Makes deletion of resource `id` report that it was already gone.
    pub fn vanish_on_delete(&self, id: u64) {
        lock(&self.state).vanishing.insert(id);
    }

    /// Fires `token` and fails when actions with `command` are awaited.
    pub fn cancel_on_wait(&self, command: &str, token: CancellationToken) {
        lock(&self.state).cancel_on_wait = Some((command.to_owned(), token));
    }

    /// Creates servers without a public IPv4 address.
    pub fn omit_public_ip(&self) {
        lock(&self.state).omit_public_ip = true;
    }

    /// Adds an existing labelled server.
    pub fn seed_server(&self, id: u64, name: &str) {
        lock(&self.state).servers.insert(id, name.to_owned());
    }

    /// Adds an existing labelled SSH key.
    pub fn seed_ssh_key(&self, id: u64, name: &str) {
        lock(&self.state).ssh_keys.insert(id, name.to_owned());
    }

    /// Identifiers of servers that currently exist.
    #[must_use]
    pub fn server_ids(&self) -> Vec<u64> {
        lock(&self.state).servers.keys().copied().collect()
    }

    /// Identifiers of SSH keys that currently exist.
    #[must_use]
    pub fn ssh_key_ids(&self) -> Vec<u64> {
        lock(&self.state).ssh_keys.keys().copied().collect()
    }

    fn record(&self, call: ProviderCall) -> MutexGuard<'_, ProviderState> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state
    }
}

fn listing(resources: &BTreeMap<u64, String>) -> Vec<LabeledResource> {
    resources
        .iter()
        .map(|(id, name)| LabeledResource {
            id: *id,
            name: name.clone(),
        })
        .collect()
}

impl Provider for ScriptedProvider {
    type Error = ScriptedProviderError;

    fn create_ssh_key<'a>(
        &'a self,
        name: &'a str,
        _public_key: &'a str,
        _labels: &'a BTreeMap<String, String>,
    ) -> ProviderFuture<'a, SshKeyHandle, Self::Error> {
        Box::pin(async move {
            let mut state = self.record(ProviderCall::CreateSshKey(name.to_owned()));
            state.check("create_ssh_key")?;
            let id = state.next_id();
            state.ssh_keys.insert(id, name.to_owned());
            Ok(SshKeyHandle {
                id,
                name: name.to_owned(),
            })
        })
    }

    fn delete_ssh_key(&self, id: u64) -> ProviderFuture<'_, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.record(ProviderCall::DeleteSshKey(id));
            if state.failing_key_deletes.contains(&id) {
                return Err(ScriptedProviderError::Rejected(format!("ssh key {id} is locked")));
            }
            state.ssh_keys.remove(&id);
            if state.vanishing.contains(&id) {
                return Err(ScriptedProviderError::NotFound(format!("ssh key {id}")));
            }
            Ok(())
        })
    }

    fn create_server<'a>(
        &'a self,
        spec: &'a ServerSpec,
    ) -> ProviderFuture<'a, CreatedServer, Self::Error> {
        Box::pin(async move {
            let mut state = self.record(ProviderCall::CreateServer(spec.clone()));
            state.check("create_server")?;
            let id = state.next_id();
            state.servers.insert(id, spec.name.clone());
            let public_ipv4 = (!state.omit_public_ip).then_some(SCRIPTED_SERVER_IPV4);
            let actions = vec![state.action("create_server"), state.action("start_server")];
            Ok(CreatedServer {
                server: ServerHandle {
                    id,
                    name: spec.name.clone(),
                    public_ipv4,
                },
                actions,
            })
        })
    }

    fn delete_server(&self, id: u64) -> ProviderFuture<'_, ActionHandle, Self::Error> {
        Box::pin(async move {
            let mut state = self.record(ProviderCall::DeleteServer(id));
            if state.failing_server_deletes.contains(&id) {
                return Err(ScriptedProviderError::Rejected(format!("server {id} is locked")));
            }
            state.servers.remove(&id);
            if state.vanishing.contains(&id) {
                return Err(ScriptedProviderError::NotFound(format!("server {id}")));
            }
            Ok(state.action("delete_server"))
        })
    }

    fn enable_rescue<'a>(
        &'a self,
        server_id: u64,
        rescue_type: &'a str,
        ssh_keys: &'a [u64],
    ) -> ProviderFuture<'a, ActionHandle, Self::Error> {
        Box::pin(async move {
            let mut state = self.record(ProviderCall::EnableRescue(
                server_id,
                rescue_type.to_owned(),
                ssh_keys.to_vec(),
            ));
            state.check("enable_rescue")?;
            Ok(state.action("enable_rescue"))
        })
    }

    fn power_on(&self, server_id: u64) -> ProviderFuture<'_, ActionHandle, Self::Error> {
        Box::pin(async move {
            let mut state = self.record(ProviderCall::PowerOn(server_id));
            state.check("poweron")?;
            Ok(state.action("start_server"))
        })
    }

    fn create_image<'a>(
        &'a self,
        server_id: u64,
        spec: &'a ImageSpec,
    ) -> ProviderFuture<'a, CreatedImage, Self::Error> {
        Box::pin(async move {
            let mut state = self.record(ProviderCall::CreateImage(server_id, spec.clone()));
            state.check("create_image")?;
            let id = state.next_id();
            let action = state.action("create_image");
            Ok(CreatedImage {
                image: ImageDescriptor {
                    id,
                    status: String::from("creating"),
                    description: spec.description.clone(),
                    labels: spec.labels.clone(),
                },
                action,
            })
        })
    }

    fn wait_for_actions<'a>(
        &'a self,
        actions: &'a [ActionHandle],
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let commands: Vec<String> = actions.iter().map(|a| a.command.clone()).collect();
            let state = self.record(ProviderCall::WaitForActions(commands.clone()));
            if let Some((command, token)) = &state.cancel_on_wait
                && commands.contains(command)
            {
                token.cancel();
            }
            if cancel.is_cancelled() {
                return Err(ScriptedProviderError::Rejected(String::from("wait cancelled")));
            }
            if let Some(command) = commands
                .iter()
                .find(|command| state.failing_waits.contains(*command))
            {
                return Err(ScriptedProviderError::Rejected(format!("action {command} failed")));
            }
            Ok(())
        })
    }

    fn list_servers<'a>(
        &'a self,
        label_selector: &'a str,
    ) -> ProviderFuture<'a, Vec<LabeledResource>, Self::Error> {
        Box::pin(async move {
            let state = self.record(ProviderCall::ListServers(label_selector.to_owned()));
            state.check("list_servers")?;
            Ok(listing(&state.servers))
        })
    }

    fn list_ssh_keys<'a>(
        &'a self,
        label_selector: &'a str,
    ) -> ProviderFuture<'a, Vec<LabeledResource>, Self::Error> {
        Box::pin(async move {
            let state = self.record(ProviderCall::ListSshKeys(label_selector.to_owned()));
            state.check("list_ssh_keys")?;
            Ok(listing(&state.ssh_keys))
        })
    }
}

/// Scripted answer to a dial attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportStep {
    /// The dial succeeds.
    Connect,
    /// The dial fails with a retryable error.
    Retryable,
    /// The dial fails with a fatal error.
    Fatal,
}

#[derive(Debug)]
enum RunStep {
    Finish(CommandOutcome),
    Hang,
    Fail(String),
}

/// Error returned by [`ScriptedTransport`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("scripted transport: {0}")]
pub struct ScriptedTransportError(pub String);

/// Session handed out by [`ScriptedTransport`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptedSession {
    /// Target the session was opened for.
    pub target: SshTarget,
}

#[derive(Debug, Default)]
struct TransportState {
    dials: VecDeque<TransportStep>,
    runs: VecDeque<RunStep>,
    dial_count: u32,
    commands: Vec<String>,
    stdin: Vec<Vec<u8>>,
    closed: u32,
}

/// [`RemoteShell`] double answering from scripted queues. An empty queue
/// means success.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<TransportState>>,
}

impl ScriptedTransport {
    /// Creates a transport where every dial and command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the answer to the next dial attempt.
    pub fn push_dial(&self, step: TransportStep) {
        lock(&self.state).dials.push_back(step);
    }

    /// Queues the outcome of the next command.
    pub fn push_run(&self, outcome: CommandOutcome) {
        lock(&self.state).runs.push_back(RunStep::Finish(outcome));
    }

    /// Makes the next command never finish.
    pub fn push_hang(&self) {
        lock(&self.state).runs.push_back(RunStep::Hang);
    }

    /// Makes the next command fail at the transport level.
    pub fn push_transport_failure(&self, message: &str) {
        lock(&self.state)
            .runs
            .push_back(RunStep::Fail(message.to_owned()));
    }

    /// Number of dial attempts so far.
    #[must_use]
    pub fn dial_count(&self) -> u32 {
        lock(&self.state).dial_count
    }

    /// Commands run so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Bytes received on standard input, one entry per command that had a
    /// reader attached.
    #[must_use]
    pub fn stdin_payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.state).stdin.clone()
    }

    /// Number of closed sessions.
    #[must_use]
    pub fn closed_sessions(&self) -> u32 {
        lock(&self.state).closed
    }
}

impl RemoteShell for ScriptedTransport {
    type Session = ScriptedSession;
    type Error = ScriptedTransportError;

    fn dial<'a>(
        &'a self,
        target: &'a SshTarget,
        _private_key: &'a Utf8Path,
        _timeout: Duration,
    ) -> TransportFuture<'a, Self::Session, Attempt<Self::Error>> {
        Box::pin(async move {
            let step = {
                let mut state = lock(&self.state);
                state.dial_count += 1;
                state.dials.pop_front().unwrap_or(TransportStep::Connect)
            };
            match step {
                TransportStep::Connect => Ok(ScriptedSession {
                    target: target.clone(),
                }),
                TransportStep::Retryable => Err(Attempt::Retryable(ScriptedTransportError(
                    String::from("connection refused"),
                ))),
                TransportStep::Fatal => Err(Attempt::Fatal(ScriptedTransportError(
                    String::from("ssh binary missing"),
                ))),
            }
        })
    }

    fn run<'a>(
        &'a self,
        _session: &'a Self::Session,
        command: &'a str,
        stdin: Option<ImageReader>,
    ) -> TransportFuture<'a, CommandOutcome, Self::Error> {
        Box::pin(async move {
            if let Some(mut reader) = stdin {
                let mut payload = Vec::new();
                reader
                    .read_to_end(&mut payload)
                    .await
                    .map_err(|err| ScriptedTransportError(err.to_string()))?;
                lock(&self.state).stdin.push(payload);
            }

            let step = {
                let mut state = lock(&self.state);
                state.commands.push(command.to_owned());
                state.runs.pop_front()
            };
            match step {
                None => Ok(CommandOutcome {
                    exit_code: Some(0),
                    output: String::new(),
                    disconnected: false,
                }),
                Some(RunStep::Finish(outcome)) => Ok(outcome),
                Some(RunStep::Fail(message)) => Err(ScriptedTransportError(message)),
                Some(RunStep::Hang) => std::future::pending().await,
            }
        })
    }

    fn close(&self, _session: Self::Session) -> TransportFuture<'_, (), Self::Error> {
        Box::pin(async move {
            lock(&self.state).closed += 1;
            Ok(())
        })
    }
}

/// Key generator that returns a fixed key without touching the filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct FakeKeyGenerator;

impl KeyGenerator for FakeKeyGenerator {
    fn generate<'a>(&'a self, comment: &'a str) -> KeyFuture<'a> {
        Box::pin(async move {
            Ok(TemporaryKeyPair::from_parts(
                format!("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeKeyMaterial {comment}"),
                "/nonexistent/id_ed25519",
            ))
        })
    }
}

/// Event sink that keeps every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<UploadEvent>>,
}

impl RecordingEventSink {
    /// Returns a snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<UploadEvent> {
        lock(&self.events).clone()
    }

    /// Returns the names of the recorded events.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(UploadEvent::name).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: UploadEvent) {
        lock(&self.events).push(event);
    }
}
