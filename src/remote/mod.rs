//! Remote command execution on the temporary server.
//!
//! [`RemoteExecutor`] connects to the rescue system with bounded retries,
//! runs the write pipeline and powers the server down. The wire protocol is
//! hidden behind [`RemoteShell`]; [`OpenSshTransport`] drives the system
//! `ssh` client.

mod openssh;
mod retry;
mod transport;

use std::net::IpAddr;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SshConfig;
use crate::events::{EventSink, UploadEvent};
use crate::request::ImageReader;

pub use openssh::{OpenSshError, OpenSshSession, OpenSshTransport};
pub use retry::{Attempt, RetryError, RetryPolicy, retry_with_backoff};
pub use transport::{CommandOutcome, RemoteShell, SshTarget, TransportFuture};

/// Command that powers the rescue system off.
pub const SHUTDOWN_COMMAND: &str = "shutdown now";

const DEFAULT_SSH_PORT: u16 = 22;

/// Errors raised while talking to the remote host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when every connection attempt failed.
    #[error("host {address} unreachable after {attempts} attempts: {message}")]
    Unreachable {
        /// Address that was dialled.
        address: IpAddr,
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        message: String,
    },
    /// Raised when connecting failed in a way retries cannot fix.
    #[error("cannot connect to {address}: {message}")]
    Dial {
        /// Address that was dialled.
        address: IpAddr,
        /// Transport error message.
        message: String,
    },
    /// Raised when the cancellation token fired.
    #[error("remote operation cancelled")]
    Cancelled,
    /// Raised when the transport failed while running a command.
    #[error("remote transport failed: {message}")]
    Transport {
        /// Transport error message.
        message: String,
    },
    /// Raised when the remote command exits with a non-zero status.
    #[error("remote command failed with status {status_text}: {output}")]
    CommandFailed {
        /// Exit code, if one was reported.
        status: Option<i32>,
        /// Human readable status.
        status_text: String,
        /// Interleaved stdout and stderr.
        output: String,
    },
}

/// Connected session on a remote host.
#[derive(Debug)]
pub struct RemoteSession<S> {
    inner: S,
    address: IpAddr,
}

impl<S> RemoteSession<S> {
    /// Address of the connected host.
    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }
}

/// Settings for [`RemoteExecutor`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutorSettings {
    /// Login user.
    pub user: String,
    /// SSH port.
    pub port: u16,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Connection retry bounds.
    pub retry: RetryPolicy,
}

impl From<&SshConfig> for ExecutorSettings {
    fn from(config: &SshConfig) -> Self {
        Self {
            user: config.ssh_user.clone(),
            port: DEFAULT_SSH_PORT,
            connect_timeout: config.connect_timeout(),
            retry: config.retry_policy(),
        }
    }
}

/// Connects to hosts and runs commands through a [`RemoteShell`].
#[derive(Clone, Debug)]
pub struct RemoteExecutor<T: RemoteShell> {
    transport: T,
    settings: ExecutorSettings,
}

impl<T: RemoteShell> RemoteExecutor<T> {
    /// Creates an executor.
    #[must_use]
    pub const fn new(transport: T, settings: ExecutorSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Returns the executor settings.
    #[must_use]
    pub const fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Connects to `address`, retrying with exponential backoff. Each retry
    /// is reported as a `retry-scheduled` event.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Unreachable`] when the attempts run out,
    /// [`RemoteError::Dial`] on a non-retryable failure and
    /// [`RemoteError::Cancelled`] when `cancel` fires.
    pub async fn connect(
        &self,
        address: IpAddr,
        private_key: &Utf8Path,
        events: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<RemoteSession<T::Session>, RemoteError> {
        let target = &SshTarget {
            address,
            port: self.settings.port,
            user: self.settings.user.clone(),
        };

        let result = retry_with_backoff(
            &self.settings.retry,
            cancel,
            |attempt, backoff, err: &T::Error| {
                events.emit(UploadEvent::RetryScheduled {
                    operation: String::from("ssh-connect"),
                    attempt,
                    backoff,
                    message: err.to_string(),
                });
            },
            |_| {
                self.transport
                    .dial(target, private_key, self.settings.connect_timeout)
            },
        )
        .await;

        match result {
            Ok(inner) => Ok(RemoteSession { inner, address }),
            Err(RetryError::Exhausted { attempts, last }) => Err(RemoteError::Unreachable {
                address,
                attempts,
                message: last.to_string(),
            }),
            Err(RetryError::Fatal(err)) => Err(RemoteError::Dial {
                address,
                message: err.to_string(),
            }),
            Err(RetryError::Cancelled) => Err(RemoteError::Cancelled),
        }
    }

    /// Runs `command`, feeding `stdin` into it, and returns the combined
    /// output.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailed`] on a non-zero exit status,
    /// [`RemoteError::Transport`] when the transport fails and
    /// [`RemoteError::Cancelled`] when `cancel` fires.
    pub async fn run(
        &self,
        session: &RemoteSession<T::Session>,
        command: &str,
        stdin: Option<ImageReader>,
        cancel: &CancellationToken,
    ) -> Result<String, RemoteError> {
        let finished = tokio::select! {
            () = cancel.cancelled() => return Err(RemoteError::Cancelled),
            finished = self.transport.run(&session.inner, command, stdin) => finished,
        };
        let outcome = finished.map_err(|err| RemoteError::Transport {
            message: err.to_string(),
        })?;

        if outcome.is_success() {
            return Ok(outcome.output);
        }

        let status_text = outcome
            .exit_code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(RemoteError::CommandFailed {
            status: outcome.exit_code,
            status_text,
            output: outcome.output,
        })
    }

    /// Powers the host off and closes the session.
    ///
    /// The host drops the connection while powering off, so a lost
    /// connection counts as success.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the shutdown command fails.
    pub async fn shutdown(
        &self,
        session: RemoteSession<T::Session>,
        cancel: &CancellationToken,
    ) -> Result<(), RemoteError> {
        let finished = tokio::select! {
            () = cancel.cancelled() => Err(RemoteError::Cancelled),
            finished = self.transport.run(&session.inner, SHUTDOWN_COMMAND, None) => {
                finished.map_err(|err| RemoteError::Transport { message: err.to_string() })
            }
        };
        self.disconnect(session).await;

        let outcome = finished?;
        if outcome.is_success() || outcome.disconnected {
            return Ok(());
        }
        Err(RemoteError::CommandFailed {
            status: outcome.exit_code,
            status_text: outcome
                .exit_code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            output: outcome.output,
        })
    }

    /// Closes the session, logging failures.
    pub async fn disconnect(&self, session: RemoteSession<T::Session>) {
        let address = session.address;
        if let Err(err) = self.transport.close(session.inner).await {
            tracing::debug!(%address, error = %err, "closing ssh session failed");
        }
    }
}
