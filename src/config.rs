//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::remote::RetryPolicy;

/// Public Hetzner Cloud API endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

/// Hetzner Cloud settings derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HCLOUD",
    discovery(
        app_name = "hcloud-upload-image",
        env_var = "HCLOUD_UPLOAD_IMAGE_CONFIG_PATH",
        config_file_name = "hcloud-upload-image.toml",
        dotfile_name = ".hcloud-upload-image.toml",
        project_file_name = "hcloud-upload-image.toml"
    )
)]
pub struct HcloudConfig {
    /// API token used for authentication. This value is required.
    #[ortho_config(default = String::new())]
    pub token: String,
    /// API base URL.
    #[ortho_config(default = DEFAULT_ENDPOINT.to_owned())]
    pub endpoint: String,
    /// Location of the temporary server.
    #[ortho_config(default = "fsn1".to_owned())]
    pub location: String,
    /// Image installed on the temporary server. It is never booted; the
    /// server only ever runs the rescue system.
    #[ortho_config(default = "ubuntu-24.04".to_owned())]
    pub base_image: String,
    /// Rescue system flavour.
    #[ortho_config(default = "linux64".to_owned())]
    pub rescue_type: String,
    /// Pause between action status polls, in milliseconds.
    #[ortho_config(default = 1000)]
    pub poll_interval_ms: u64,
    /// Upper bound for a single wait on provider actions, in seconds.
    #[ortho_config(default = 600)]
    pub action_timeout_secs: u64,
}

/// Remote shell settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HCLOUD_UPLOAD",
    discovery(
        app_name = "hcloud-upload-image",
        env_var = "HCLOUD_UPLOAD_IMAGE_CONFIG_PATH",
        config_file_name = "hcloud-upload-image.toml",
        dotfile_name = ".hcloud-upload-image.toml",
        project_file_name = "hcloud-upload-image.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// Remote user; the rescue system only offers `root`.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Timeout for a single connection attempt, in seconds.
    #[ortho_config(default = 60)]
    pub ssh_connect_timeout_secs: u64,
    /// Maximum number of connection attempts.
    #[ortho_config(default = 100)]
    pub ssh_max_attempts: u32,
    /// First backoff pause, in milliseconds.
    #[ortho_config(default = 200)]
    pub ssh_backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds.
    #[ortho_config(default = 2000)]
    pub ssh_backoff_ceiling_ms: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to hcloud-upload-image.toml",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!(
            "{} must be greater than zero: check {} or {} in hcloud-upload-image.toml",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

impl HcloudConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("hcloud-upload-image")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Pause between action status polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound for a single wait on provider actions.
    #[must_use]
    pub const fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide missing values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty or a duration
    /// is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.token,
            &FieldMetadata::new("Hetzner Cloud API token", "HCLOUD_TOKEN", "token"),
        )?;
        require_field(
            &self.endpoint,
            &FieldMetadata::new("API endpoint", "HCLOUD_ENDPOINT", "endpoint"),
        )?;
        require_field(
            &self.location,
            &FieldMetadata::new("server location", "HCLOUD_LOCATION", "location"),
        )?;
        require_field(
            &self.base_image,
            &FieldMetadata::new("base image", "HCLOUD_BASE_IMAGE", "base_image"),
        )?;
        require_field(
            &self.rescue_type,
            &FieldMetadata::new("rescue type", "HCLOUD_RESCUE_TYPE", "rescue_type"),
        )?;
        require_positive(
            self.poll_interval_ms,
            &FieldMetadata::new(
                "action poll interval",
                "HCLOUD_POLL_INTERVAL_MS",
                "poll_interval_ms",
            ),
        )?;
        require_positive(
            self.action_timeout_secs,
            &FieldMetadata::new(
                "action timeout",
                "HCLOUD_ACTION_TIMEOUT_SECS",
                "action_timeout_secs",
            ),
        )?;
        Ok(())
    }
}

impl SshConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("hcloud-upload-image")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Timeout for a single connection attempt.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    /// Retry policy for connecting to the rescue system.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.ssh_max_attempts,
            Duration::from_millis(self.ssh_backoff_base_ms),
            Duration::from_millis(self.ssh_backoff_ceiling_ms),
        )
    }

    /// Performs semantic validation on the remote shell settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required field is empty or a bound is
    /// zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh binary", "HCLOUD_UPLOAD_SSH_BIN", "ssh_bin"),
        )?;
        require_field(
            &self.ssh_keygen_bin,
            &FieldMetadata::new(
                "ssh-keygen binary",
                "HCLOUD_UPLOAD_SSH_KEYGEN_BIN",
                "ssh_keygen_bin",
            ),
        )?;
        require_field(
            &self.ssh_user,
            &FieldMetadata::new("ssh user", "HCLOUD_UPLOAD_SSH_USER", "ssh_user"),
        )?;
        require_positive(
            self.ssh_connect_timeout_secs,
            &FieldMetadata::new(
                "ssh connect timeout",
                "HCLOUD_UPLOAD_SSH_CONNECT_TIMEOUT_SECS",
                "ssh_connect_timeout_secs",
            ),
        )?;
        require_positive(
            u64::from(self.ssh_max_attempts),
            &FieldMetadata::new(
                "ssh connection attempts",
                "HCLOUD_UPLOAD_SSH_MAX_ATTEMPTS",
                "ssh_max_attempts",
            ),
        )?;
        if self.ssh_backoff_base_ms > self.ssh_backoff_ceiling_ms {
            return Err(ConfigError::Invalid(String::from(
                "ssh_backoff_base_ms must not exceed ssh_backoff_ceiling_ms",
            )));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
