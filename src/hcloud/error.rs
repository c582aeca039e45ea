//! Error types for the Hetzner Cloud provider.

use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::ProviderError;

/// Errors raised by [`super::HcloudProvider`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HcloudError {
    /// Raised when the provider configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the HTTP request could not be sent or read.
    #[error("request to {path} failed: {message}")]
    Http {
        /// API path that was requested.
        path: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when the API answers with an error status.
    #[error("API error on {path} (HTTP {status}, {code}): {message}")]
    Api {
        /// API path that was requested.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Error code from the response body, for example `not_found`.
        code: String,
        /// Error message from the response body.
        message: String,
    },
    /// Raised when a response body does not match the expected shape.
    #[error("unexpected response from {path}: {message}")]
    Decode {
        /// API path that was requested.
        path: String,
        /// Deserialisation error message.
        message: String,
    },
    /// Raised when an asynchronous action finished with an error.
    #[error("action {command} ({id}) failed with {code}: {message}")]
    ActionFailed {
        /// Action identifier.
        id: u64,
        /// Action command.
        command: String,
        /// Error code reported for the action.
        code: String,
        /// Error message reported for the action.
        message: String,
    },
    /// Raised when actions are still running once the wait deadline passed.
    #[error("timeout waiting for action {command} ({id})")]
    ActionTimeout {
        /// Action identifier.
        id: u64,
        /// Action command.
        command: String,
    },
    /// Raised when the caller cancelled while waiting on actions.
    #[error("wait for actions cancelled")]
    Cancelled,
}

impl ProviderError for HcloudError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
            || matches!(self, Self::Api { code, .. } if code == "not_found")
    }
}

impl From<ConfigError> for HcloudError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
