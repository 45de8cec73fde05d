//! The operator-side half of a deployment
//!
//! A [`Session`] opens the control channel to the master, optionally installs
//! the running binary there, pushes the source tree to the master through the
//! tunnel and, when servers are configured, re-invokes rdeploy on the master
//! in deploy mode. The status lines deploy mode prints come back over the
//! channel and decide the outcome of the session.
//!
//! The channel is closed on every exit path, including an interrupt: the
//! signal wins the race against the running phase, the phase future is
//! dropped (killing any in-flight rsync) and the channel is closed before the
//! error is returned. A signal that arrives while the channel is still being
//! opened drops the connection attempt instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{Signal, SignalKind, signal};

use common::hooks::{self, HookType};
use common::progress::{ProgressSink, SpinnerProgress};
use common::version::ProtocolVersion;
use common::{DeployContext, Error};
use remote::protocol::{self, HostLog, WireLine};
use remote::{Connector, ControlChannel, ReadEvent, StreamLine, shell_escape};
use transfer::{Transfer, TransferJob, TransferOutcome};

fn chain(error: impl Into<anyhow::Error>) -> String {
    format!("{:#}", error.into())
}

/// What deploy mode on the master reported, line by line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteReport {
    /// From the `HOSTS=` line
    pub hosts: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Last percentage seen per host
    pub progress: HashMap<String, u8>,
    /// Exit status of deploy mode, from the completion sentinel
    pub status: i32,
}

impl RemoteReport {
    fn record(&mut self, host: String, log: HostLog) {
        match log {
            HostLog::Failed(reason) => {
                tracing::warn!("{} failed: {}", host, reason);
                if !self.failed.iter().any(|(h, _)| *h == host) {
                    self.failed.push((host, reason));
                }
            }
            HostLog::Ok(summary) => {
                tracing::info!("{}: {}", host, summary);
                if !self.succeeded.contains(&host) {
                    self.succeeded.push(host);
                }
            }
            HostLog::Progress(pct) => {
                tracing::debug!("{}: {}%", host, pct);
                self.progress.insert(host, pct);
            }
            HostLog::Message(text) => tracing::info!("{}: {}", host, text),
        }
    }

    pub fn failed_hosts(&self) -> Vec<String> {
        self.failed.iter().map(|(host, _)| host.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub master: String,
    pub master_transfer: TransferOutcome,
    /// Absent when no servers were configured
    pub remote: Option<RemoteReport>,
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "master {}: {}", self.master, self.master_transfer)?;
        match &self.remote {
            Some(remote) => write!(
                f,
                "\nservers: {} ok, {} failed",
                remote.succeeded.len(),
                remote.failed.len()
            ),
            None => write!(f, "\nservers: none configured"),
        }
    }
}

/// SIGINT, SIGTERM, SIGHUP and SIGPIPE, watched from the moment of creation
///
/// The handlers are registered by [`ShutdownSignals::install`], not on the
/// first poll, so a signal that arrives while nothing is awaiting yet is not
/// left to the default disposition.
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
    pipe: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            pipe: signal(SignalKind::pipe())?,
        })
    }

    /// Name of the first signal received
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.pipe.recv() => "SIGPIPE",
        }
    }
}

pub struct Session<C, T> {
    ctx: Arc<DeployContext>,
    connector: C,
    transfer: T,
    verbose: u8,
    local_binary: Option<PathBuf>,
}

impl<C: Connector, T: Transfer> Session<C, T> {
    pub fn new(ctx: Arc<DeployContext>, connector: C, transfer: T) -> Self {
        Self {
            ctx,
            connector,
            transfer,
            verbose: 0,
            local_binary: None,
        }
    }

    /// Verbosity forwarded to deploy mode
    pub fn verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    /// Binary to self-deploy instead of the running executable
    pub fn local_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_binary = Some(path.into());
        self
    }

    /// Run the session, cleaning up on SIGINT, SIGTERM, SIGHUP and SIGPIPE
    pub async fn run(&self) -> anyhow::Result<SessionSummary> {
        let signals = ShutdownSignals::install()
            .inspect_err(|error| tracing::warn!("cannot watch for signals: {:#}", error))
            .ok();
        let shutdown = async move {
            match signals {
                Some(mut signals) => signals.recv().await.to_string(),
                None => std::future::pending().await,
            }
        };
        self.run_until(shutdown).await
    }

    /// Run the session until it finishes or `shutdown` resolves
    #[tracing::instrument(skip(self, shutdown), fields(repo = %self.ctx.repo, stage = %self.ctx.stage))]
    pub async fn run_until(
        &self,
        shutdown: impl std::future::Future<Output = String>,
    ) -> anyhow::Result<SessionSummary> {
        tokio::pin!(shutdown);
        tracing::info!("opening control channel to {}", self.connector.host());
        // a half-open connection is dropped with the open future, which
        // kills the shell started for it
        let opened = tokio::select! {
            biased;
            opened = self.connector.open() => opened,
            signal = &mut shutdown => {
                tracing::warn!(
                    "received {} while opening control channel to {}",
                    signal,
                    self.connector.host()
                );
                return Err(Error::Interrupted(signal).into());
            }
        };
        let mut channel = opened.map_err(|error| Error::ChannelSetup(chain(error)))?;
        let result = tokio::select! {
            result = self.drive(&mut channel) => result,
            signal = &mut shutdown => {
                tracing::warn!("received {}, closing control channel", signal);
                Err(Error::Interrupted(signal).into())
            }
        };
        channel.close().await;
        result
    }

    async fn drive(&self, channel: &mut ControlChannel) -> anyhow::Result<SessionSummary> {
        let ctx = self.ctx.as_ref();
        let remote_binary = if ctx.remote.self_deploy && ctx.has_servers() {
            self.deploy_self(channel).await?
        } else {
            ctx.remote.remote_binary.clone()
        };
        let master_transfer = self.sync_to_master().await?;
        let remote = if ctx.has_servers() {
            Some(self.reexec(channel, &remote_binary).await?)
        } else {
            tracing::info!("no servers configured, skipping fan-out");
            None
        };
        if let Some(remote) = &remote {
            if !remote.failed.is_empty() {
                return Err(Error::HostsFailed {
                    hosts: remote.failed_hosts(),
                }
                .into());
            }
            if remote.status != 0 {
                return Err(Error::Remote(format!(
                    "deploy mode on {} exited with status {}",
                    channel.host(),
                    remote.status
                ))
                .into());
            }
        }
        hooks::run(HookType::Report, ctx).await.map_err(Error::from)?;
        Ok(SessionSummary {
            master: ctx.master_host.clone(),
            master_transfer,
            remote,
        })
    }

    async fn deploy_self(&self, channel: &mut ControlChannel) -> anyhow::Result<String> {
        let local = match &self.local_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|error| {
                Error::Config(format!("cannot locate the running executable: {error}"))
            })?,
        };
        remote::deploy::deploy_self(
            channel,
            &local,
            &ProtocolVersion::current(),
            self.ctx.remote.channel_timeout,
        )
        .await
        .map_err(|error| Error::Remote(format!("self-deploy failed: {error:#}")).into())
    }

    async fn sync_to_master(&self) -> anyhow::Result<TransferOutcome> {
        let ctx = self.ctx.as_ref();
        tracing::info!(
            "syncing {} to {}::{}",
            ctx.source_dir.display(),
            ctx.master_host,
            ctx.transfer_module
        );
        let progress = SpinnerProgress::new(&ctx.master_host);
        let result = self
            .transfer
            .run(TransferJob::to_master(ctx), &progress)
            .await;
        progress.finish();
        let outcome = result.map_err(|error| Error::Config(chain(error)))?;
        if !outcome.success {
            let reason = match &outcome.failure {
                Some(failure) => failure.to_string(),
                None => format!("rsync exited with code {}", outcome.raw_exit_code),
            };
            return Err(Error::Transfer {
                host: ctx.master_host.clone(),
                reason,
            }
            .into());
        }
        tracing::info!("{}: {}", ctx.master_host, outcome);
        Ok(outcome)
    }

    fn reexec_command(&self, remote_binary: &str) -> String {
        let mut command = shell_escape(remote_binary);
        for arg in protocol::deploy_mode_args(&self.ctx, self.verbose) {
            command.push(' ');
            command.push_str(&shell_escape(&arg));
        }
        command.push_str(&protocol::completion_suffix());
        command
    }

    async fn reexec(
        &self,
        channel: &mut ControlChannel,
        remote_binary: &str,
    ) -> anyhow::Result<RemoteReport> {
        let command = self.reexec_command(remote_binary);
        tracing::debug!("running on {}: {}", channel.host(), command);
        channel
            .write_command(&command)
            .await
            .map_err(|error| Error::Remote(chain(error)))?;
        let limit = self.ctx.remote.remote_timeout;
        let deadline = tokio::time::Instant::now() + limit;
        let mut report = RemoteReport::default();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = channel
                .next_line(remaining)
                .await
                .map_err(|error| Error::Remote(chain(error)))?;
            match event {
                ReadEvent::Line(StreamLine::Stdout(line)) => match WireLine::parse(&line) {
                    WireLine::Done(status) => {
                        report.status = status;
                        return Ok(report);
                    }
                    WireLine::Hosts(hosts) => {
                        tracing::debug!("deploy mode targets: {}", hosts.join(", "));
                        report.hosts = hosts;
                    }
                    WireLine::Host { host, log } => report.record(host, log),
                    WireLine::Other(line) => tracing::info!(target: "remote", "{}", line),
                },
                ReadEvent::Line(StreamLine::Stderr(line)) => {
                    tracing::info!(target: "remote", "{}", line)
                }
                ReadEvent::TimedOut => {
                    return Err(Error::Remote(format!(
                        "deploy mode on {} did not finish within {}",
                        channel.host(),
                        humantime::format_duration(limit)
                    ))
                    .into());
                }
                ReadEvent::Closed => {
                    return Err(Error::Remote(format!(
                        "control channel to {} closed before deploy mode finished",
                        channel.host()
                    ))
                    .into());
                }
            }
        }
    }
}
