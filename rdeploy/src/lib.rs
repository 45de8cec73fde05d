//! Two-hop deployment orchestration
//!
//! `rdeploy` pushes a source tree to a master staging server through an SSH
//! tunnel and then, from the master, to every production server at once:
//!
//! - [`session`]: the operator side; channel, master sync, remote re-invocation
//! - [`deploy_mode`]: the master side; hooks around the fan-out
//! - [`fanout`]: concurrent per-server transfers and their status stream

pub mod deploy_mode;
pub mod fanout;
pub mod session;

#[cfg(test)]
mod testutils;

pub use fanout::{FanoutReport, HostStatusEvent};
pub use session::{Session, SessionSummary};

/// What a successful run of either mode has to report
#[derive(Debug, Clone)]
pub enum Summary {
    Session(SessionSummary),
    Deploy(FanoutReport),
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(summary) => write!(f, "{summary}"),
            Self::Deploy(report) => write!(f, "{report}"),
        }
    }
}
