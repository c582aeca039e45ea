//! [`RemoteShell`] backed by the system `ssh` client.

use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::time::timeout;

use super::retry::Attempt;
use super::transport::{CommandOutcome, RemoteShell, SshTarget, TransportFuture};
use crate::request::ImageReader;

/// Exit status `ssh` reports for its own failures, as opposed to the remote
/// command's.
const SSH_FAILURE_STATUS: i32 = 255;

/// Errors raised by [`OpenSshTransport`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OpenSshError {
    /// Raised when the `ssh` program cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that was invoked.
        program: String,
        /// Error message from the operating system.
        message: String,
    },
    /// Raised when `ssh` could not reach or authenticate to the host.
    #[error("ssh connection failed: {message}")]
    Connect {
        /// Captured standard error.
        message: String,
    },
    /// Raised when a dial attempt exceeds its timeout.
    #[error("ssh connection timed out after {0:?}")]
    Timeout(Duration),
    /// Raised when streaming to or from the `ssh` process fails.
    #[error("ssh i/o failed: {0}")]
    Io(String),
}

/// Session state: where to connect and with which key. Each command spawns
/// its own `ssh` process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenSshSession {
    target: SshTarget,
    private_key: Utf8PathBuf,
    connect_timeout: Duration,
}

/// Transport that shells out to `ssh`.
#[derive(Clone, Debug)]
pub struct OpenSshTransport {
    program: String,
}

impl OpenSshTransport {
    /// Creates a transport that invokes `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_args(
        target: &SshTarget,
        private_key: &Utf8Path,
        connect_timeout: Duration,
        command: &str,
    ) -> Vec<OsString> {
        vec![
            OsString::from("-p"),
            OsString::from(target.port.to_string()),
            OsString::from("-i"),
            OsString::from(private_key.as_str()),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("IdentitiesOnly=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from("-o"),
            OsString::from("LogLevel=ERROR"),
            OsString::from("-o"),
            OsString::from(format!("ConnectTimeout={}", connect_timeout.as_secs().max(1))),
            OsString::from(format!("{}@{}", target.user, target.address)),
            OsString::from(command),
        ]
    }

    fn spawn_error(&self, err: &io::Error) -> OpenSshError {
        OpenSshError::Spawn {
            program: self.program.clone(),
            message: err.to_string(),
        }
    }

    async fn probe(
        &self,
        target: &SshTarget,
        private_key: &Utf8Path,
        connect_timeout: Duration,
    ) -> Result<OpenSshSession, Attempt<OpenSshError>> {
        let args = Self::build_args(target, private_key, connect_timeout, "true");
        let probe = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match timeout(connect_timeout, probe).await {
            Err(_) => return Err(Attempt::Retryable(OpenSshError::Timeout(connect_timeout))),
            Ok(Err(err)) => return Err(Attempt::Fatal(self.spawn_error(&err))),
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Ok(OpenSshSession {
                target: target.clone(),
                private_key: private_key.to_path_buf(),
                connect_timeout,
            });
        }

        // The rescue system keeps refusing or resetting connections while it
        // boots, so every non-zero status is worth another attempt.
        Err(Attempt::Retryable(OpenSshError::Connect {
            message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        }))
    }

    async fn execute(
        &self,
        session: &OpenSshSession,
        command: &str,
        stdin: Option<ImageReader>,
    ) -> Result<CommandOutcome, OpenSshError> {
        let args = Self::build_args(
            &session.target,
            &session.private_key,
            session.connect_timeout,
            command,
        );
        let stdin_mode = if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(stdin_mode)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| self.spawn_error(&err))?;

        let combined = Mutex::new(Vec::new());
        let child_stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (fed, stdout_pumped, stderr_pumped) = tokio::join!(
            feed(stdin, child_stdin),
            pump(stdout, &combined),
            pump(stderr, &combined),
        );
        stdout_pumped.map_err(|err| OpenSshError::Io(err.to_string()))?;
        stderr_pumped.map_err(|err| OpenSshError::Io(err.to_string()))?;

        let status = child
            .wait()
            .await
            .map_err(|err| OpenSshError::Io(err.to_string()))?;
        let output = String::from_utf8_lossy(
            &combined.into_inner().unwrap_or_else(PoisonError::into_inner),
        )
        .into_owned();

        // A broken pipe is expected when the remote side exits early; it only
        // matters if the command claims success without reading everything.
        if let Err(feed_err) = fed
            && status.success()
        {
            return Err(OpenSshError::Io(feed_err.to_string()));
        }

        let exit_code = status.code();
        Ok(CommandOutcome {
            exit_code,
            output,
            disconnected: exit_code.is_none_or(|code| code == SSH_FAILURE_STATUS),
        })
    }
}

impl Default for OpenSshTransport {
    fn default() -> Self {
        Self::new("ssh")
    }
}

async fn feed(source: Option<ImageReader>, sink: Option<ChildStdin>) -> io::Result<u64> {
    let (Some(mut reader), Some(mut stdin)) = (source, sink) else {
        return Ok(0);
    };
    let copied = tokio::io::copy(&mut reader, &mut stdin).await?;
    stdin.shutdown().await?;
    Ok(copied)
}

async fn pump<R: AsyncRead + Unpin>(stream: Option<R>, sink: &Mutex<Vec<u8>>) -> io::Result<()> {
    let Some(mut reader) = stream else {
        return Ok(());
    };
    let mut buf = vec![0_u8; 8192];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        if let Some(chunk) = buf.get(..read) {
            sink.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(chunk);
        }
    }
}

impl RemoteShell for OpenSshTransport {
    type Session = OpenSshSession;
    type Error = OpenSshError;

    fn dial<'a>(
        &'a self,
        target: &'a SshTarget,
        private_key: &'a Utf8Path,
        timeout: Duration,
    ) -> TransportFuture<'a, Self::Session, Attempt<Self::Error>> {
        Box::pin(self.probe(target, private_key, timeout))
    }

    fn run<'a>(
        &'a self,
        session: &'a Self::Session,
        command: &'a str,
        stdin: Option<ImageReader>,
    ) -> TransportFuture<'a, CommandOutcome, Self::Error> {
        Box::pin(self.execute(session, command, stdin))
    }

    fn close(&self, _session: Self::Session) -> TransportFuture<'_, (), Self::Error> {
        Box::pin(async { Ok(()) })
    }
}
