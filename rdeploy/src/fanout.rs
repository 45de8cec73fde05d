//! Concurrent fan-out from the master to every production server
//!
//! One task per server runs its transfer and reports through a single
//! unbounded queue. A dedicated aggregator task is the only writer to the
//! output sink: it renders each event as a `HOST=<id>|LOG=<text>` line, in
//! the order events were queued, until it receives [`FanoutMessage::Done`].
//! `Done` is queued only after every server task has been joined, so no event
//! can be lost or printed after it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::Context;
use common::DeployContext;
use common::progress::{ProgressSink, TransferProgress};
use remote::protocol::{HostLog, WireLine};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use transfer::{Transfer, TransferJob};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatusEvent {
    pub host: String,
    pub log: HostLog,
}

impl HostStatusEvent {
    pub fn is_failure_marker(&self) -> bool {
        self.log.is_failure()
    }

    fn to_wire(&self) -> WireLine {
        WireLine::Host {
            host: self.host.clone(),
            log: self.log.clone(),
        }
    }
}

#[derive(Debug)]
pub enum FanoutMessage {
    Event(HostStatusEvent),
    Done,
}

/// Per-server result of one fan-out pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub hosts: Vec<String>,
    pub succeeded: Vec<String>,
    /// Failed servers with the reason reported for each
    pub failed: Vec<(String, String)>,
}

impl FanoutReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_hosts(&self) -> Vec<String> {
        self.failed.iter().map(|(host, _)| host.clone()).collect()
    }
}

impl std::fmt::Display for FanoutReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "servers: {} ok, {} failed",
            self.succeeded.len(),
            self.failed.len()
        )?;
        for (host, reason) in &self.failed {
            write!(f, "\n  {host}: {reason}")?;
        }
        Ok(())
    }
}

/// Host name without user, port and domain: `ops@web1.example.com:22` is `web1`
pub fn short_name(host: &str) -> &str {
    let host = host.rsplit_once('@').map_or(host, |(_, h)| h);
    let host = host.split(':').next().unwrap_or(host);
    host.split('.').next().unwrap_or(host)
}

/// Servers to sync: the list in order, without duplicates and without the
/// master itself
pub fn targets(servers: &[String], master: &str) -> Vec<String> {
    let master = short_name(master);
    let mut seen = std::collections::HashSet::new();
    servers
        .iter()
        .filter(|host| {
            if short_name(host) == master {
                tracing::debug!("skipping {} (it is the master)", host);
                return false;
            }
            seen.insert(host.as_str())
        })
        .cloned()
        .collect()
}

/// Turns transfer progress into `NN%` events at every 10% step
struct HostProgress {
    host: String,
    events: mpsc::UnboundedSender<FanoutMessage>,
    last_step: AtomicU8,
}

impl ProgressSink for HostProgress {
    fn update(&self, progress: TransferProgress) {
        let Some(pct) = progress.percent() else {
            return;
        };
        let step = pct - pct % 10;
        if step > self.last_step.fetch_max(step, Ordering::Relaxed) {
            let _ = self.events.send(FanoutMessage::Event(HostStatusEvent {
                host: self.host.clone(),
                log: HostLog::Progress(step),
            }));
        }
    }
}

async fn sync_host<T: Transfer>(
    transfer: &T,
    ctx: &DeployContext,
    host: String,
    events: mpsc::UnboundedSender<FanoutMessage>,
) -> Result<(), String> {
    let progress = HostProgress {
        host: host.clone(),
        events: events.clone(),
        last_step: AtomicU8::new(0),
    };
    let result = match transfer
        .run(TransferJob::to_server(ctx, &host), &progress)
        .await
    {
        Ok(outcome) if outcome.success => {
            tracing::info!("{}: {}", host, outcome);
            Ok(outcome.to_string())
        }
        Ok(outcome) => {
            let reason = match outcome.failure {
                Some(failure) => failure.to_string(),
                None => format!("rsync exited with code {}", outcome.raw_exit_code),
            };
            tracing::warn!("{}: {}", host, reason);
            Err(reason)
        }
        Err(error) => {
            let reason = format!("{:#}", anyhow::Error::from(error));
            tracing::warn!("{}: {}", host, reason);
            Err(reason)
        }
    };
    let log = match &result {
        Ok(summary) => HostLog::Ok(summary.clone()),
        Err(reason) => HostLog::Failed(reason.clone()),
    };
    let _ = events.send(FanoutMessage::Event(HostStatusEvent { host, log }));
    result.map(|_| ())
}

async fn write_line<W: AsyncWrite + Unpin>(sink: &mut W, line: &WireLine) -> std::io::Result<()> {
    sink.write_all(format!("{line}\n").as_bytes()).await?;
    sink.flush().await
}

/// Drain `events` into `sink` until [`FanoutMessage::Done`]
pub async fn aggregate<W: AsyncWrite + Unpin>(
    mut events: mpsc::UnboundedReceiver<FanoutMessage>,
    mut sink: W,
) -> W {
    let mut writable = true;
    while let Some(message) = events.recv().await {
        let event = match message {
            FanoutMessage::Event(event) => event,
            FanoutMessage::Done => break,
        };
        if !writable {
            continue;
        }
        if let Err(error) = write_line(&mut sink, &event.to_wire()).await {
            // keep draining so workers are never held up by a dead reader
            tracing::error!("failed to write status for {}: {:#}", event.host, error);
            writable = false;
        }
    }
    sink
}

/// Sync the master's tree to every host in `hosts`, concurrently
///
/// Writes `HOSTS=` first and then one line per status event to `sink`.
/// A failed server is recorded in the report and does not affect the
/// others; the only error is the aggregator task itself dying.
#[tracing::instrument(skip(ctx, transfer, sink), fields(repo = %ctx.repo, stage = %ctx.stage))]
pub async fn fanout<T, W>(
    hosts: &[String],
    ctx: Arc<DeployContext>,
    transfer: Arc<T>,
    mut sink: W,
) -> anyhow::Result<(FanoutReport, W)>
where
    T: Transfer + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut report = FanoutReport {
        hosts: hosts.to_vec(),
        ..Default::default()
    };
    if let Err(error) = write_line(&mut sink, &WireLine::Hosts(hosts.to_vec())).await {
        tracing::error!("failed to write host list: {:#}", error);
    }
    tracing::info!("syncing {} server(s)", hosts.len());
    let (events, receiver) = mpsc::unbounded_channel();
    let aggregator = tokio::spawn(aggregate(receiver, sink));
    let mut workers = tokio::task::JoinSet::new();
    let mut task_hosts = HashMap::new();
    for host in hosts {
        let ctx = Arc::clone(&ctx);
        let transfer = Arc::clone(&transfer);
        let events = events.clone();
        let task_host = host.clone();
        let handle = workers.spawn(async move {
            let result = sync_host(transfer.as_ref(), &ctx, task_host.clone(), events).await;
            (task_host, result)
        });
        task_hosts.insert(handle.id(), host.clone());
    }
    while let Some(joined) = workers.join_next_with_id().await {
        match joined {
            Ok((_, (host, Ok(())))) => report.succeeded.push(host),
            Ok((_, (host, Err(reason)))) => report.failed.push((host, reason)),
            Err(error) => {
                let host = task_hosts
                    .get(&error.id())
                    .cloned()
                    .unwrap_or_else(|| "<unknown>".to_string());
                let reason = format!("sync task failed: {error}");
                tracing::error!("{}: {}", host, reason);
                let _ = events.send(FanoutMessage::Event(HostStatusEvent {
                    host: host.clone(),
                    log: HostLog::Failed(reason.clone()),
                }));
                report.failed.push((host, reason));
            }
        }
    }
    let _ = events.send(FanoutMessage::Done);
    let sink = aggregator.await.context("status aggregator failed")?;
    tracing::info!("{}", report);
    Ok((report, sink))
}
