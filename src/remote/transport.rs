//! Transport abstraction for running commands on the rescue system.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8Path;

use super::retry::Attempt;
use crate::request::ImageReader;

/// Future returned by transport operations.
pub type TransportFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Remote endpoint of a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Public address of the server.
    pub address: IpAddr,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
}

/// Result of a remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutcome {
    /// Exit code, if the command ran to completion.
    pub exit_code: Option<i32>,
    /// Interleaved stdout and stderr.
    pub output: String,
    /// Whether the connection dropped before an exit status arrived.
    pub disconnected: bool,
}

impl CommandOutcome {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// A way to reach a host with a private key and run shell commands on it.
pub trait RemoteShell: Send + Sync {
    /// Established session.
    type Session: Send + Sync;
    /// Transport specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens a session, classifying failures as retryable or fatal.
    fn dial<'a>(
        &'a self,
        target: &'a SshTarget,
        private_key: &'a Utf8Path,
        timeout: Duration,
    ) -> TransportFuture<'a, Self::Session, Attempt<Self::Error>>;

    /// Runs `command`, streaming `stdin` into it when given. An absent
    /// reader gives the command an empty standard input.
    fn run<'a>(
        &'a self,
        session: &'a Self::Session,
        command: &'a str,
        stdin: Option<ImageReader>,
    ) -> TransportFuture<'a, CommandOutcome, Self::Error>;

    /// Closes the session.
    fn close(&self, session: Self::Session) -> TransportFuture<'_, (), Self::Error>;
}
