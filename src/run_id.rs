//! Per-upload random identity used to name temporary resources.

use std::fmt;

/// Prefix for every temporary resource name.
pub const RESOURCE_PREFIX: &str = "hcloud-upload-image-";

/// Eight lowercase hex characters generated once per upload.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RunIdentity(String);

impl RunIdentity {
    /// Generates a fresh identity from four random bytes.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("{:08x}", rand::random::<u32>()))
    }

    /// Wraps an existing token, for example one taken from an earlier log.
    #[must_use]
    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name shared by the temporary SSH key and server.
    #[must_use]
    pub fn resource_name(&self) -> String {
        format!("{RESOURCE_PREFIX}{}", self.0)
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
