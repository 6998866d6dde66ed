//! Service instance snapshots returned by the registry

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single reachable instance of a logical service.
///
/// Instances are immutable snapshots: backends hand out fresh copies on every
/// lookup or watch event and callers never mutate them in place.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceInstance {
    id: String,
    name: String,
    version: String,
    address: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create an instance of `name` reachable at `address` with a generated id.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let name = name.into();
        let id = format!("{name}-{}", Uuid::new_v4());

        Self {
            id,
            name,
            version: String::new(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    /// Replace the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the version label.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Unique id of this instance within its service
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Logical service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version label (empty when unversioned)
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Network address the transport dials
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Free-form labels
    pub const fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}
