//! Ways of starting the shell loop behind a [`ControlChannel`]

use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::SshSession;
use crate::channel::{ChannelError, ControlChannel, LOOP_SCRIPT, Process};

/// Port of the rsync daemon on the master
pub const RSYNC_DAEMON_PORT: u16 = 873;

pub trait Connector: Send + Sync {
    /// Host the channel leads to, for messages
    fn host(&self) -> &str;

    fn open(&self) -> impl std::future::Future<Output = Result<ControlChannel, ChannelError>> + Send;
}

/// Control channel over SSH, with the local tunnel port forwarded to the
/// master's rsync daemon for as long as the channel is open
#[derive(Debug, Clone)]
pub struct SshConnector {
    session: SshSession,
    display: String,
    tunnel_port: u16,
    ready_timeout: Duration,
}

impl SshConnector {
    pub fn new(session: SshSession, tunnel_port: u16, ready_timeout: Duration) -> Self {
        let display = session.to_string();
        Self {
            session,
            display,
            tunnel_port,
            ready_timeout,
        }
    }

    fn ssh_error(&self, action: &'static str) -> impl FnOnce(openssh::Error) -> ChannelError + '_ {
        move |source| ChannelError::Ssh {
            host: self.display.clone(),
            action,
            source,
        }
    }
}

impl Connector for SshConnector {
    fn host(&self) -> &str {
        &self.display
    }

    #[tracing::instrument(skip(self), fields(host = %self.display))]
    async fn open(&self) -> Result<ControlChannel, ChannelError> {
        let destination = self.session.destination();
        tracing::debug!("connecting to {}", destination);
        let session = openssh::Session::connect(&destination, openssh::KnownHosts::Accept)
            .await
            .map_err(self.ssh_error("connect"))?;
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, self.tunnel_port));
        let remote = SocketAddr::from((Ipv4Addr::LOCALHOST, RSYNC_DAEMON_PORT));
        session
            .request_port_forward(openssh::ForwardType::Local, local, remote)
            .await
            .map_err(self.ssh_error("forward the rsync port"))?;
        tracing::debug!("forwarding {} to {} on {}", local, remote, self.display);
        let session = Arc::new(session);
        let mut child = Arc::clone(&session)
            .arc_command("sh")
            .arg("-c")
            .arg(LOOP_SCRIPT)
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped())
            .spawn()
            .await
            .map_err(self.ssh_error("start the control shell"))?;
        let missing = |stream: &str| ChannelError::Spawn {
            host: self.display.clone(),
            source: std::io::Error::other(format!("no {stream} on control shell")),
        };
        let stdin = child.stdin().take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout().take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr().take().ok_or_else(|| missing("stderr"))?;
        ControlChannel::start(
            self.display.clone(),
            Box::pin(stdin),
            Box::pin(stdout),
            Box::pin(stderr),
            Process::Ssh { child, session },
            self.ready_timeout,
        )
        .await
    }
}

/// Runs the shell loop as a local child process
///
/// Stands in for the master wherever the "remote" side is this machine,
/// which is how the session and self-deploy are exercised in tests.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    shell: PathBuf,
    script: String,
    envs: Vec<(OsString, OsString)>,
    ready_timeout: Duration,
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("sh"),
            script: LOOP_SCRIPT.to_string(),
            envs: Vec::new(),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

impl LocalConnector {
    /// Replace the loop with another script, e.g. one that never answers
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }
}

impl Connector for LocalConnector {
    fn host(&self) -> &str {
        "localhost"
    }

    async fn open(&self) -> Result<ControlChannel, ChannelError> {
        let spawn_error = |source| ChannelError::Spawn {
            host: "localhost".to_string(),
            source,
        };
        let mut child = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(&self.script)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        let missing = |stream: &str| {
            spawn_error(std::io::Error::other(format!(
                "no {stream} on control shell"
            )))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        ControlChannel::start(
            "localhost".to_string(),
            Box::pin(stdin),
            Box::pin(stdout),
            Box::pin(stderr),
            Process::Local(child),
            self.ready_timeout,
        )
        .await
    }
}
