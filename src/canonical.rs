use serde::{Deserialize, Serialize};
use std::fmt;

/// The virtual module name whose exports are provided by the runtime.
pub const HOST_NAMESPACE: &str = "funee";

/// Globally unique identifier of a top-level declaration: the module it
/// lives in plus its local name. Re-exports and import aliases never mint
/// new canonical names, they only point at existing ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalName {
    pub uri: String,
    pub name: String,
}

impl CanonicalName {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
        }
    }

    /// A name served by the host namespace rather than from source.
    pub fn host(name: impl Into<String>) -> Self {
        Self::new(HOST_NAMESPACE, name)
    }

    pub fn is_host(&self) -> bool {
        self.uri == HOST_NAMESPACE
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uri, self.name)
    }
}
