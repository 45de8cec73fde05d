//! Transfer progress reporting
//!
//! The transfer runner reports how many items it has processed against the
//! count rsync announced up front. Where that goes depends on the caller: a
//! terminal spinner when pushing to the master, wire-protocol events during
//! fan-out.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub processed: u64,
    /// From rsync's "N files to consider" line, when it was printed
    pub expected: Option<u64>,
}

impl TransferProgress {
    pub fn percent(&self) -> Option<u8> {
        let expected = self.expected.filter(|&e| e > 0)?;
        let pct = (self.processed.min(expected) * 100) / expected;
        Some(pct as u8)
    }
}

impl std::fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.percent(), self.expected) {
            (Some(pct), Some(expected)) => {
                write!(f, "{pct}% ({}/{expected} files)", self.processed)
            }
            _ => write!(f, "{} files", self.processed),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn update(&self, progress: TransferProgress);

    fn finish(&self) {}
}

/// Discards all updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _progress: TransferProgress) {}
}

/// Rotating spinner on stderr; hidden automatically when stderr is not a tty
pub struct SpinnerProgress {
    bar: indicatif::ProgressBar,
}

impl SpinnerProgress {
    pub fn new(prefix: &str) -> Self {
        let bar = indicatif::ProgressBar::new_spinner();
        let style = indicatif::ProgressStyle::with_template("{spinner} {prefix}: {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_prefix(prefix.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(120));
        Self { bar }
    }
}

impl ProgressSink for SpinnerProgress {
    fn update(&self, progress: TransferProgress) {
        self.bar.set_message(progress.to_string());
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
