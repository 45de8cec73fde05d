//! Configuration types shared by every rdeploy component
//!
//! [`DeployContext`] is built once from the command line, validated, and then
//! passed by reference into the session, the fan-out coordinator, the
//! transfer runner and the hook runner. Nothing downstream reads process
//! state (environment, current directory) to decide what to deploy.

use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

/// Hooks live inside the deployed tree unless overridden
pub const DEFAULT_HOOKS_SUBDIR: &str = ".deploy/hooks";

/// Root of the per-repo/per-stage trees on the master
pub const DEFAULT_MASTER_ROOT: &str = "/srv/deploy";

/// Local end of the tunnel to the master's rsync daemon
pub const DEFAULT_TUNNEL_PORT: u16 = 8873;

/// Settings for reaching the master and re-invoking rdeploy on it
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    /// Program name or path used to re-invoke rdeploy on the master
    pub remote_binary: String,
    /// Upload the running executable to the master before re-invoking it
    pub self_deploy: bool,
    /// Local port forwarded to the master's rsync daemon port
    pub tunnel_port: u16,
    /// How long to wait for the control channel to become ready
    pub channel_timeout: Duration,
    /// Upper bound on the whole remote fan-out run
    pub remote_timeout: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            remote_binary: "rdeploy".to_string(),
            self_deploy: false,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            channel_timeout: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Immutable description of one deployment
#[derive(Debug, Clone, Default)]
pub struct DeployContext {
    pub repo: String,
    pub stage: String,
    /// Tree to push; on the master (deploy mode) this is the master's copy
    pub source_dir: PathBuf,
    /// rsync daemon module receiving the tree
    pub transfer_module: String,
    pub transfer_user: Option<String>,
    pub master_host: String,
    /// Production servers; the master itself is filtered out during fan-out
    pub servers: Vec<String>,
    pub debug: bool,
    pub dry_run: bool,
    /// Running on the master as the fan-out half of a session
    pub deploy_mode: bool,
    /// Overrides `<source_dir>/.deploy/hooks`
    pub hooks_dir: Option<PathBuf>,
    /// Overrides `/srv/deploy/<repo>/<stage>`
    pub master_dir: Option<PathBuf>,
    pub remote: RemoteSettings,
}

fn require(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("missing required option --{field}")));
    }
    Ok(())
}

fn require_path_component(field: &str, value: &str) -> Result<(), Error> {
    require(field, value)?;
    if value.contains('/') || value == "." || value == ".." {
        return Err(Error::Config(format!(
            "--{field} must be a single path component, got {value:?}"
        )));
    }
    Ok(())
}

impl DeployContext {
    /// Check that every field needed before touching the network is present
    pub fn validate(&self) -> Result<(), Error> {
        require_path_component("repo", &self.repo)?;
        require_path_component("stage", &self.stage)?;
        if self.source_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "missing required option --source-dir".to_string(),
            ));
        }
        require("rsync-module", &self.transfer_module)?;
        require("master", &self.master_host)?;
        if let Some(bad) = self
            .servers
            .iter()
            .find(|s| s.is_empty() || s.contains(char::is_whitespace))
        {
            return Err(Error::Config(format!("invalid server name {bad:?}")));
        }
        if self.remote.tunnel_port == 0 {
            return Err(Error::Config("--tunnel-port must not be 0".to_string()));
        }
        Ok(())
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.hooks_dir
            .clone()
            .unwrap_or_else(|| self.source_dir.join(DEFAULT_HOOKS_SUBDIR))
    }

    /// Filesystem path behind the transfer module on the master
    pub fn master_dir(&self) -> PathBuf {
        self.master_dir.clone().unwrap_or_else(|| {
            PathBuf::from(DEFAULT_MASTER_ROOT)
                .join(&self.repo)
                .join(&self.stage)
        })
    }

    pub fn has_servers(&self) -> bool {
        !self.servers.is_empty()
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Only report errors
    pub quiet: bool,
    /// Verbosity level: 0=INFO, 1=DEBUG, 2=TRACE
    pub verbose: u8,
    /// Print summary at the end
    pub print_summary: bool,
    /// Send logs to stderr (deploy mode keeps stdout for the wire protocol)
    pub log_to_stderr: bool,
}

impl OutputConfig {
    pub fn level(&self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        if self.quiet {
            return LevelFilter::ERROR;
        }
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// Runtime configuration for tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
}
