//! Persistent command channel to the master
//!
//! The channel is one long-lived shell on the master running [`LOOP_SCRIPT`]:
//! it reads one command per line from stdin and `eval`s it, and a blank line
//! makes it print `EXIT` and quit. Everything the session does on the master
//! (discovering `$HOME`, self-deploy, re-invoking rdeploy in deploy mode)
//! goes through this one process, and nothing else touches its streams.
//!
//! Reads are multiplexed over stdout and stderr and come back tagged with
//! the stream they came from, see [`StreamLine`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::{self, WireLine};

/// Shell loop run on the master; stdin of each command is detached so a
/// command can never swallow the lines that follow it
pub const LOOP_SCRIPT: &str = r#"while IFS= read -r cmd; do if [ -z "$cmd" ]; then echo EXIT; exit 0; fi; eval "$cmd" </dev/null; done"#;

pub const READY_TOKEN: &str = "RDEPLOY_CHANNEL_READY";

const EXIT_TOKEN: &str = "EXIT";

/// Stderr chatter from ssh and login shells that says nothing about the
/// health of the channel
const BENIGN_NOISE: &[&str] = &[
    "Pseudo-terminal will not be allocated",
    "stdin: is not a tty",
    "Warning: Permanently added",
];

/// Upper bound on waiting for the remote loop to wind down
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;
pub type BoxedRead = Pin<Box<dyn AsyncRead + Send>>;
type LineReader = tokio::io::Split<BufReader<BoxedRead>>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("ssh to {host} failed while trying to {action}")]
    Ssh {
        host: String,
        action: &'static str,
        #[source]
        source: openssh::Error,
    },

    #[error("failed to start control shell for {host}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control shell on {host} did not report ready within {waited:?}")]
    NotReady { host: String, waited: Duration },

    #[error("control shell on {host} went away")]
    Closed { host: String },

    #[error("no response within {waited:?} to: {command}")]
    Timeout { command: String, waited: Duration },

    #[error("control channel I/O error")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Line(StreamLine),
    TimedOut,
    /// Both streams reached end of file
    Closed,
}

/// What [`ControlChannel::send`] collected before it stopped reading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub stdout: String,
    pub stderr: String,
    pub bytes: usize,
    /// False when the timeout elapsed or the channel closed first
    pub complete: bool,
}

/// Result of [`ControlChannel::exec`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }
}

pub(crate) enum Process {
    Ssh {
        child: openssh::Child<Arc<openssh::Session>>,
        session: Arc<openssh::Session>,
    },
    Local(tokio::process::Child),
}

pub struct ControlChannel {
    host: String,
    stdin: Option<BoxedWrite>,
    stdout: Option<LineReader>,
    stderr: Option<LineReader>,
    process: Option<Process>,
    ready: bool,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("host", &self.host)
            .field("ready", &self.ready)
            .field("open", &self.stdin.is_some())
            .finish()
    }
}

fn is_benign_noise(line: &str) -> bool {
    BENIGN_NOISE.iter().any(|noise| line.contains(noise))
}

async fn next_segment(reader: &mut Option<LineReader>) -> std::io::Result<Option<Vec<u8>>> {
    match reader {
        Some(reader) => reader.next_segment().await,
        None => Ok(None),
    }
}

fn decode(bytes: Vec<u8>) -> String {
    let mut line = match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    };
    if line.ends_with('\r') {
        line.pop();
    }
    line
}

impl ControlChannel {
    /// Wrap a freshly spawned shell loop and wait for it to answer the
    /// readiness probe
    pub(crate) async fn start(
        host: String,
        stdin: BoxedWrite,
        stdout: BoxedRead,
        stderr: BoxedRead,
        process: Process,
        ready_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let mut channel = Self {
            host,
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout).split(b'\n')),
            stderr: Some(BufReader::new(stderr).split(b'\n')),
            process: Some(process),
            ready: false,
        };
        match channel.wait_ready(ready_timeout).await {
            Ok(()) => Ok(channel),
            Err(error) => {
                channel.close().await;
                Err(error)
            }
        }
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        self.write_command(&format!("printf '%s\\n' {READY_TOKEN}"))
            .await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_line(remaining).await? {
                ReadEvent::Line(StreamLine::Stdout(line)) if line.trim() == READY_TOKEN => {
                    tracing::debug!("control channel to {} is ready", self.host);
                    self.ready = true;
                    return Ok(());
                }
                ReadEvent::Line(StreamLine::Stdout(line)) => {
                    // login banners and motd end up here
                    tracing::debug!("{}: {}", self.host, line);
                }
                ReadEvent::Line(StreamLine::Stderr(line)) => {
                    if is_benign_noise(&line) {
                        tracing::debug!("{}: {}", self.host, line);
                    } else {
                        tracing::warn!("{}: {}", self.host, line);
                    }
                }
                ReadEvent::TimedOut | ReadEvent::Closed => {
                    return Err(ChannelError::NotReady {
                        host: self.host.clone(),
                        waited: timeout,
                    });
                }
            }
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The SSH connection behind the channel, when there is one
    pub fn session(&self) -> Option<&Arc<openssh::Session>> {
        match &self.process {
            Some(Process::Ssh { session, .. }) => Some(session),
            _ => None,
        }
    }

    /// Submit one command line to the remote loop without waiting for output
    pub async fn write_command(&mut self, command: &str) -> Result<(), ChannelError> {
        if command.contains('\n') {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "commands sent over the control channel must be a single line",
            )));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ChannelError::Closed {
                host: self.host.clone(),
            });
        };
        tracing::trace!("{} <- {}", self.host, command);
        stdin.write_all(command.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> std::io::Result<Option<StreamLine>> {
        loop {
            // stderr first: diagnostics written before a result line on
            // stdout are then read before it
            tokio::select! {
                biased;
                segment = next_segment(&mut self.stderr), if self.stderr.is_some() => {
                    match segment? {
                        Some(bytes) => return Ok(Some(StreamLine::Stderr(decode(bytes)))),
                        None => self.stderr = None,
                    }
                }
                segment = next_segment(&mut self.stdout), if self.stdout.is_some() => {
                    match segment? {
                        Some(bytes) => return Ok(Some(StreamLine::Stdout(decode(bytes)))),
                        None => self.stdout = None,
                    }
                }
                else => return Ok(None),
            }
        }
    }

    /// Wait up to `timeout` for the next line from either stream
    pub async fn next_line(&mut self, timeout: Duration) -> Result<ReadEvent, ChannelError> {
        if self.stdout.is_none() && self.stderr.is_none() {
            return Ok(ReadEvent::Closed);
        }
        match tokio::time::timeout(timeout, self.read_line()).await {
            Err(_) => Ok(ReadEvent::TimedOut),
            Ok(Ok(Some(line))) => Ok(ReadEvent::Line(line)),
            Ok(Ok(None)) => Ok(ReadEvent::Closed),
            Ok(Err(error)) => Err(ChannelError::Io(error)),
        }
    }

    /// Send `command` and collect what comes back
    ///
    /// With `expect_single_line` reading stops at the first stdout line;
    /// otherwise it continues until `timeout`. Running out of time is not an
    /// error: whatever arrived is returned with `complete` unset.
    pub async fn send(
        &mut self,
        command: &str,
        expect_single_line: bool,
        timeout: Duration,
    ) -> Result<Response, ChannelError> {
        self.write_command(command).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut response = Response::default();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_line(remaining).await? {
                ReadEvent::Line(StreamLine::Stdout(line)) => {
                    response.bytes += line.len() + 1;
                    response.stdout.push_str(&line);
                    response.stdout.push('\n');
                    if expect_single_line {
                        response.complete = true;
                        return Ok(response);
                    }
                }
                ReadEvent::Line(StreamLine::Stderr(line)) => {
                    response.bytes += line.len() + 1;
                    response.stderr.push_str(&line);
                    response.stderr.push('\n');
                }
                ReadEvent::TimedOut => {
                    // multi-line reads always run to the timeout
                    response.complete = !expect_single_line;
                    return Ok(response);
                }
                ReadEvent::Closed => return Ok(response),
            }
        }
    }

    /// Run `command` to completion and capture its exit status
    ///
    /// The command's output must be newline terminated; the status is read
    /// from the completion sentinel printed right after it.
    pub async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ChannelError> {
        self.write_command(&format!("{{ {command}; }}{}", protocol::completion_suffix()))
            .await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut output = CommandOutput::default();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_line(remaining).await? {
                ReadEvent::Line(StreamLine::Stdout(line)) => match WireLine::parse(&line) {
                    WireLine::Done(status) => {
                        output.status = status;
                        return Ok(output);
                    }
                    _ => output.stdout.push(line),
                },
                ReadEvent::Line(StreamLine::Stderr(line)) => output.stderr.push(line),
                ReadEvent::TimedOut => {
                    return Err(ChannelError::Timeout {
                        command: command.to_string(),
                        waited: timeout,
                    });
                }
                ReadEvent::Closed => {
                    return Err(ChannelError::Closed {
                        host: self.host.clone(),
                    });
                }
            }
        }
    }

    /// Stop the remote loop and release the process and SSH connection
    ///
    /// Safe to call more than once; every step is best effort.
    pub async fn close(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        tracing::debug!("closing control channel to {}", self.host);
        if let Some(mut stdin) = self.stdin.take() {
            // a blank line ends the loop
            let _ = stdin.write_all(b"\n").await;
            let _ = stdin.flush().await;
            let _ = stdin.shutdown().await;
        }
        let deadline = tokio::time::Instant::now() + CLOSE_GRACE;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_line(remaining).await {
                Ok(ReadEvent::Line(StreamLine::Stdout(line))) if line == EXIT_TOKEN => break,
                Ok(ReadEvent::Line(line)) => tracing::trace!("{}: {:?}", self.host, line),
                Ok(ReadEvent::TimedOut | ReadEvent::Closed) | Err(_) => break,
            }
        }
        self.stdout = None;
        self.stderr = None;
        self.ready = false;
        match process {
            Process::Local(mut child) => {
                match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                    Ok(Ok(status)) => tracing::debug!("control shell exited: {status}"),
                    Ok(Err(error)) => tracing::debug!("failed to reap control shell: {error:#}"),
                    Err(_) => {
                        tracing::debug!("control shell did not exit, killing it");
                        let _ = child.kill().await;
                    }
                }
            }
            Process::Ssh { child, session } => {
                match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                    Ok(Ok(status)) => tracing::debug!("control shell exited: {status}"),
                    Ok(Err(error)) => tracing::debug!("failed to reap control shell: {error:#}"),
                    Err(_) => tracing::debug!("control shell did not exit in time"),
                }
                match Arc::try_unwrap(session) {
                    Ok(session) => {
                        if let Err(error) = session.close().await {
                            tracing::debug!("failed to close ssh session: {error:#}");
                        }
                    }
                    Err(_) => {
                        tracing::debug!("ssh session still referenced, leaving it to drop")
                    }
                }
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if self.process.is_some() {
            // local shells are kill_on_drop, the ssh master exits with the session
            tracing::debug!("control channel to {} dropped without close", self.host);
        }
    }
}
