//! Session-level failure taxonomy
//!
//! Per-host transfer failures are isolated inside the fan-out and only show up
//! here once aggregated into [`Error::HostsFailed`]. Everything else is global
//! and ends the session immediately.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed options; raised before any remote action
    #[error("configuration error: {0}")]
    Config(String),

    /// The control channel never reported ready
    #[error("control channel setup failed: {0}")]
    ChannelSetup(String),

    #[error(transparent)]
    Hook(#[from] crate::hooks::HookError),

    /// A single transfer outside of fan-out (source to master) failed
    #[error("transfer to {host} failed: {reason}")]
    Transfer { host: String, reason: String },

    #[error("deployment failed on {} host(s): {}", .hosts.len(), .hosts.join(", "))]
    HostsFailed { hosts: Vec<String> },

    /// The remote half of the session failed without naming a host
    #[error("remote deploy failed: {0}")]
    Remote(String),

    #[error("interrupted by {0}")]
    Interrupted(String),
}
