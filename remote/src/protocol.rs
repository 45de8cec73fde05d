//! Line protocol spoken by deploy mode on the master
//!
//! Deploy mode writes to its stdout, which the session on the operator's
//! machine reads back through the control channel:
//!
//! ```text
//! HOSTS=web1,web2,web3
//! HOST=web2|LOG=40%
//! HOST=web1|LOG=OK 12 files transferred, 0 deleted, 4.1 KiB of 2.0 MiB sent
//! HOST=web3|LOG=FAILED connection to rsync daemon refused
//! __RDEPLOY_DONE__ 1
//! ```
//!
//! The last line is not printed by rdeploy itself: the session appends
//! [`completion_suffix`] to the command it sends so the remote shell prints
//! it with the command's exit status.

pub const HOSTS_PREFIX: &str = "HOSTS=";
pub const HOST_PREFIX: &str = "HOST=";
pub const LOG_SEPARATOR: &str = "|LOG=";
pub const DONE_SENTINEL: &str = "__RDEPLOY_DONE__";

const FAILED_MARKER: &str = "FAILED";
const OK_MARKER: &str = "OK";

/// Shell fragment appended to a command to report its completion and status
pub fn completion_suffix() -> String {
    format!("; printf '%s %s\\n' {DONE_SENTINEL} \"$?\"")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireLine {
    Hosts(Vec<String>),
    Host { host: String, log: HostLog },
    Done(i32),
    Other(String),
}

impl WireLine {
    pub fn parse(line: &str) -> Self {
        if let Some(list) = line.strip_prefix(HOSTS_PREFIX) {
            let hosts = list
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
            return Self::Hosts(hosts);
        }
        if let Some(rest) = line.strip_prefix(HOST_PREFIX) {
            if let Some((host, log)) = rest.split_once(LOG_SEPARATOR) {
                if !host.is_empty() {
                    return Self::Host {
                        host: host.to_string(),
                        log: HostLog::parse(log),
                    };
                }
            }
        }
        if let Some(status) = line.strip_prefix(DONE_SENTINEL) {
            if let Ok(status) = status.trim().parse() {
                return Self::Done(status);
            }
        }
        Self::Other(line.to_string())
    }
}

impl std::fmt::Display for WireLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hosts(hosts) => write!(f, "{HOSTS_PREFIX}{}", hosts.join(",")),
            Self::Host { host, log } => write!(f, "{HOST_PREFIX}{host}{LOG_SEPARATOR}{log}"),
            Self::Done(status) => write!(f, "{DONE_SENTINEL} {status}"),
            Self::Other(line) => write!(f, "{line}"),
        }
    }
}

/// The `LOG=` payload of a host line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLog {
    /// Terminal success event
    Ok(String),
    /// Terminal failure event; the host is counted as failed
    Failed(String),
    /// Percentage of the expected file count processed so far
    Progress(u8),
    Message(String),
}

fn marker_text<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(marker)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix(' ')
}

impl HostLog {
    pub fn parse(text: &str) -> Self {
        if let Some(reason) = marker_text(text, FAILED_MARKER) {
            return Self::Failed(reason.to_string());
        }
        if let Some(summary) = marker_text(text, OK_MARKER) {
            return Self::Ok(summary.to_string());
        }
        if let Some(pct) = text.strip_suffix('%').and_then(|p| p.parse::<u8>().ok()) {
            if pct <= 100 {
                return Self::Progress(pct);
            }
        }
        Self::Message(text.to_string())
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

fn one_line(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains(['\n', '\r']) {
        std::borrow::Cow::Owned(text.replace(['\n', '\r'], " "))
    } else {
        std::borrow::Cow::Borrowed(text)
    }
}

fn write_marker(f: &mut std::fmt::Formatter<'_>, marker: &str, text: &str) -> std::fmt::Result {
    if text.is_empty() {
        write!(f, "{marker}")
    } else {
        write!(f, "{marker} {}", one_line(text))
    }
}

impl std::fmt::Display for HostLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok(summary) => write_marker(f, OK_MARKER, summary),
            Self::Failed(reason) => write_marker(f, FAILED_MARKER, reason),
            Self::Progress(pct) => write!(f, "{pct}%"),
            Self::Message(text) => write!(f, "{}", one_line(text)),
        }
    }
}

/// Arguments that re-invoke rdeploy in deploy mode on the master
///
/// The master's copy of the tree becomes the source; everything else is
/// carried over from the operator's context.
pub fn deploy_mode_args(ctx: &common::DeployContext, verbose: u8) -> Vec<String> {
    let mut args = vec![
        "--deploy".to_string(),
        format!("--repo={}", ctx.repo),
        format!("--stage={}", ctx.stage),
        format!("--source-dir={}", ctx.master_dir().display()),
        format!("--rsync-module={}", ctx.transfer_module),
        format!("--master={}", ctx.master_host),
    ];
    if let Some(user) = &ctx.transfer_user {
        args.push(format!("--rsync-user={user}"));
    }
    if ctx.has_servers() {
        args.push(format!("--servers={}", ctx.servers.join(",")));
    }
    if let Some(hooks_dir) = &ctx.hooks_dir {
        args.push(format!("--hooks-dir={}", hooks_dir.display()));
    }
    if ctx.dry_run {
        args.push("--dry-run".to_string());
    }
    if ctx.debug {
        args.push("--debug".to_string());
    } else if verbose > 0 {
        args.push(format!("-{}", "v".repeat(verbose as usize)));
    }
    args
}
