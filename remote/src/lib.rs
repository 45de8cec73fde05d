//! Everything rdeploy does on the master goes through here
//!
//! - [`channel::ControlChannel`]: the persistent shell loop on the master
//! - [`connector`]: starting that loop over SSH, or locally
//! - [`protocol`]: the line format deploy mode reports host status in
//! - [`deploy`]: installing the running binary on the master

pub mod channel;
pub mod connector;
pub mod deploy;
pub mod protocol;

pub use channel::{
    ChannelError, CommandOutput, ControlChannel, ReadEvent, Response, StreamLine,
};
pub use connector::{Connector, LocalConnector, SshConnector};

/// Where to find the master: `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSession {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshSession {
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, spec),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| anyhow::anyhow!("invalid ssh port in {:?}", spec))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if host.is_empty() || user.as_deref() == Some("") {
            anyhow::bail!("invalid master host {:?}, expected [user@]host[:port]", spec);
        }
        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    /// Destination in the form `openssh` connects to
    pub fn destination(&self) -> String {
        let host = self.host.as_str();
        match (self.user.as_deref(), self.port) {
            (Some(user), Some(port)) => format!("ssh://{user}@{host}:{port}"),
            (None, Some(port)) => format!("ssh://{host}:{port}"),
            (Some(user), None) => format!("ssh://{user}@{host}"),
            (None, None) => format!("ssh://{host}"),
        }
    }
}

impl std::fmt::Display for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Quote `s` for a POSIX shell unless it is made only of safe characters
pub fn shell_escape(s: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c);
    if !s.is_empty() && s.chars().all(safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
