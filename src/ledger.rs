//! Ordered record of the temporary resources created by one upload.

use std::fmt;

/// A provider resource that must be removed once the upload ends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionedResource {
    /// Temporary SSH key registered with the provider.
    SshKey {
        /// Provider identifier.
        id: u64,
        /// Resource name.
        name: String,
    },
    /// Temporary server.
    Server {
        /// Provider identifier.
        id: u64,
        /// Resource name.
        name: String,
    },
}

impl ProvisionedResource {
    /// Short name of the resource kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SshKey { .. } => "ssh_key",
            Self::Server { .. } => "server",
        }
    }

    /// Provider identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::SshKey { id, .. } | Self::Server { id, .. } => *id,
        }
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::SshKey { name, .. } | Self::Server { name, .. } => name,
        }
    }
}

impl fmt::Display for ProvisionedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.kind(), self.name(), self.id())
    }
}

/// Resources in creation order.
///
/// Cleanup walks the ledger back to front so dependants go before the
/// resources they were created from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResourceLedger {
    resources: Vec<ProvisionedResource>,
}

impl ResourceLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// Appends a freshly created resource.
    pub fn record(&mut self, resource: ProvisionedResource) {
        self.resources.push(resource);
    }

    /// Number of recorded resources.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns `true` when nothing was recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &ProvisionedResource> {
        self.resources.iter()
    }

    /// Consumes the ledger, yielding resources newest first.
    pub fn into_teardown_order(self) -> impl Iterator<Item = ProvisionedResource> {
        self.resources.into_iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_order_is_reverse_creation_order() {
        let mut ledger = ResourceLedger::new();
        ledger.record(ProvisionedResource::SshKey {
            id: 1,
            name: String::from("key"),
        });
        ledger.record(ProvisionedResource::Server {
            id: 2,
            name: String::from("server"),
        });

        let order: Vec<_> = ledger.into_teardown_order().map(|res| res.id()).collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn display_names_kind_and_id() {
        let resource = ProvisionedResource::Server {
            id: 42,
            name: String::from("hcloud-upload-image-cafebabe"),
        };
        assert_eq!(
            resource.to_string(),
            "server hcloud-upload-image-cafebabe (42)"
        );
    }
}
