// version information for self-deploy and remote re-invocation

use serde::{Deserialize, Serialize};

/// Version of the running rdeploy binary
///
/// The master runs whatever rdeploy the session re-invokes, so both sides
/// compare versions before trusting a previously deployed copy. The semantic
/// version decides compatibility; git details only help debugging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Semantic version from Cargo.toml (e.g., "0.4.0")
    pub semantic: String,

    /// Git describe output (e.g., "v0.3.2-7-g644da27"), if built from git
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_describe: Option<String>,

    /// Full git commit hash, if built from git
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_hash: Option<String>,
}

impl ProtocolVersion {
    /// Version baked in at compile time by build.rs
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("RDEPLOY_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("RDEPLOY_GIT_HASH").map(String::from),
        }
    }

    /// Versions are compatible only on an exact semantic match
    ///
    /// # Examples
    ///
    /// ```
    /// use common::version::ProtocolVersion;
    ///
    /// let local = ProtocolVersion {
    ///     semantic: "0.4.0".to_string(),
    ///     git_describe: None,
    ///     git_hash: None,
    /// };
    /// let deployed = ProtocolVersion {
    ///     semantic: "0.4.0".to_string(),
    ///     git_describe: Some("v0.3.2-7-g644da27".to_string()),
    ///     git_hash: None,
    /// };
    /// assert!(local.is_compatible_with(&deployed));
    /// ```
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.semantic == other.semantic
    }

    pub fn display(&self) -> String {
        match self.git_describe {
            Some(ref git_describe) => format!("{} ({})", self.semantic, git_describe),
            None => self.semantic.clone(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize version: {:#}", e))
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json.trim())
            .map_err(|e| anyhow::anyhow!("failed to parse version JSON: {:#}", e))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}
