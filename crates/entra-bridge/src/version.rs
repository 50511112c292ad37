//! Version information reported by `getVersion`.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sentinel for "no native broker version tracked".
pub const UNTRACKED_BROKER_VERSION: i64 = -1;

/// Version information for the extension.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Broker version, or [`UNTRACKED_BROKER_VERSION`].
    pub linux_broker_version: i64,
    /// This bridge's version.
    pub native: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            linux_broker_version: UNTRACKED_BROKER_VERSION,
            native: BRIDGE_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
