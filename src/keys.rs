//! Temporary SSH key pairs used to reach the rescue system.
//!
//! Keys are generated with the system `ssh-keygen` into a private temporary
//! directory. The directory, and with it the private key, is removed when the
//! [`TemporaryKeyPair`] is dropped.

use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;

use crate::paths::open_parent;

const KEY_FILE_NAME: &str = "id_ed25519";
const PUBLIC_KEY_PREFIX: &str = "ssh-ed25519 ";

/// Future returned by [`KeyGenerator::generate`].
pub type KeyFuture<'a> = Pin<Box<dyn Future<Output = Result<TemporaryKeyPair, KeyError>> + Send + 'a>>;

/// Errors raised while generating a key pair.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum KeyError {
    /// Raised when the scratch directory cannot be created.
    #[error("failed to create key directory: {0}")]
    TempDir(String),
    /// Raised when `ssh-keygen` cannot be spawned.
    #[error("failed to run {program}: {message}")]
    Spawn {
        /// Program that was invoked.
        program: String,
        /// Error message from the operating system.
        message: String,
    },
    /// Raised when `ssh-keygen` exits with a non-zero status.
    #[error("{program} failed: {message}")]
    Failed {
        /// Program that was invoked.
        program: String,
        /// Captured standard error.
        message: String,
    },
    /// Raised when the generated public key cannot be read.
    #[error("failed to read public key: {0}")]
    Read(String),
    /// Raised when the generated public key is not an ed25519 key.
    #[error("generated public key has unexpected format")]
    InvalidPublicKey,
}

/// Ephemeral ed25519 key pair.
///
/// The private key is written to a 0600 file in a temporary directory so the
/// system `ssh` can read it; the directory is removed on drop.
pub struct TemporaryKeyPair {
    public_key: String,
    private_key_path: Utf8PathBuf,
    _dir: Option<TempDir>,
}

impl TemporaryKeyPair {
    /// Wraps an existing key pair without taking ownership of any directory.
    ///
    /// Used by test doubles that never touch the filesystem.
    #[must_use]
    pub fn from_parts(public_key: impl Into<String>, private_key_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key_path: private_key_path.into(),
            _dir: None,
        }
    }

    /// Public key in OpenSSH authorized-keys format.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Path of the private key file, valid while `self` is alive.
    #[must_use]
    pub fn private_key_path(&self) -> &Utf8Path {
        &self.private_key_path
    }
}

impl std::fmt::Debug for TemporaryKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key_path", &self.private_key_path)
            .finish_non_exhaustive()
    }
}

/// Source of temporary key pairs.
pub trait KeyGenerator: Send + Sync {
    /// Generates a fresh key pair labelled with `comment`.
    fn generate<'a>(&'a self, comment: &'a str) -> KeyFuture<'a>;
}

/// Generates keys with the system `ssh-keygen`.
#[derive(Clone, Debug)]
pub struct SshKeygen {
    program: String,
}

impl SshKeygen {
    /// Creates a generator that invokes `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, comment: &str) -> Result<TemporaryKeyPair, KeyError> {
        let dir = tempfile::Builder::new()
            .prefix("hcloud-upload-image-")
            .tempdir()
            .map_err(|err| KeyError::TempDir(err.to_string()))?;
        let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|path| KeyError::TempDir(format!("non UTF-8 path: {}", path.display())))?;
        let private_key_path = dir_path.join(KEY_FILE_NAME);

        let output = Command::new(&self.program)
            .args(["-t", "ed25519", "-N", "", "-q", "-C", comment, "-f"])
            .arg(private_key_path.as_str())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| KeyError::Spawn {
                program: self.program.clone(),
                message: err.to_string(),
            })?;

        if !output.status.success() {
            return Err(KeyError::Failed {
                program: self.program.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let public_key = read_public_key(&dir_path.join(format!("{KEY_FILE_NAME}.pub")))?;
        tracing::debug!(path = %private_key_path, "generated temporary ssh key");

        Ok(TemporaryKeyPair {
            public_key,
            private_key_path,
            _dir: Some(dir),
        })
    }
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self::new("ssh-keygen")
    }
}

impl KeyGenerator for SshKeygen {
    fn generate<'a>(&'a self, comment: &'a str) -> KeyFuture<'a> {
        Box::pin(self.run(comment))
    }
}

fn read_public_key(path: &Utf8Path) -> Result<String, KeyError> {
    let (dir, file) = open_parent(path).map_err(KeyError::Read)?;
    let content = dir
        .read_to_string(file)
        .map_err(|err| KeyError::Read(format!("{path}: {err}")))?;
    let key = content.trim();
    if !key.starts_with(PUBLIC_KEY_PREFIX) {
        return Err(KeyError::InvalidPublicKey);
    }
    Ok(key.to_owned())
}
