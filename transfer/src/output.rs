//! Classification of rsync's streamed output
//!
//! rsync is run with `--stats --itemize-changes --progress --no-inc-recursive`
//! so that it announces the file count up front, itemizes every change and
//! ends with a statistics block. Numbers may carry thousands separators
//! (newer rsync prints `1,234`).
//!
//! `--progress` redraws counters in place with `\r`, so a single `\n`
//! terminated line can hold several of them; only the last one counts.

use std::sync::LazyLock;

use regex::Regex;

static ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:rsync(?: error)?:|@ERROR)").expect("valid regex"));
static EXCLUDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"skipping daemon-excluded").expect("valid regex"));
static TO_CONSIDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([\d,]+) files? to consider").expect("valid regex"));
static DELETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*?deleting\s+\S").expect("valid regex"));
static ITEMIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([<>ch.])([fdLDS])\S{9}\s+\S").expect("valid regex"));
static REFUSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^rsync(?: error)?:.*(?:Connection refused|error in socket IO)")
        .expect("valid regex")
});
static FILES_TRANSFERRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Number of (?:regular )?files transferred: ([\d,]+)").expect("valid regex")
});
static TRANSFERRED_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Total transferred file size: ([\d,]+) bytes").expect("valid regex")
});
static TOTAL_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Total file size: ([\d,]+) bytes").expect("valid regex"));

/// Error lines produced when the other end hangs up first; the exit code
/// still tells whether the transfer failed
const BENIGN_ERRORS: &[&str] = &[
    "connection unexpectedly closed",
    "Connection reset by peer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Error { benign: bool },
    /// The daemon could not be reached; retryable on the tunnel hop
    Refused,
    Excluded,
    ToConsider(u64),
    Deleted,
    /// An itemized change; `sent` is set for regular file content that
    /// went over the wire, not for attribute-only updates
    Itemized { sent: bool },
    FilesTransferred(u64),
    TotalSize(u64),
    TransferredSize(u64),
    Other,
}

fn number(re: &Regex, line: &str) -> Option<u64> {
    let digits = re.captures(line)?.get(1)?.as_str().replace(',', "");
    digits.parse().ok()
}

pub fn classify(line: &str) -> LineKind {
    let line = line.rsplit('\r').next().unwrap_or(line);
    if EXCLUDED.is_match(line) {
        return LineKind::Excluded;
    }
    if REFUSED.is_match(line) {
        return LineKind::Refused;
    }
    if ERROR.is_match(line) {
        let benign = BENIGN_ERRORS.iter().any(|b| line.contains(b));
        return LineKind::Error { benign };
    }
    if let Some(n) = number(&TO_CONSIDER, line) {
        return LineKind::ToConsider(n);
    }
    if DELETED.is_match(line) {
        return LineKind::Deleted;
    }
    if let Some(captures) = ITEMIZED.captures(line) {
        let update = captures.get(1).map(|m| m.as_str());
        let file = captures.get(2).is_some_and(|m| m.as_str() == "f");
        let sent = file && matches!(update, Some("<" | ">"));
        return LineKind::Itemized { sent };
    }
    if let Some(n) = number(&FILES_TRANSFERRED, line) {
        return LineKind::FilesTransferred(n);
    }
    if let Some(n) = number(&TRANSFERRED_SIZE, line) {
        return LineKind::TransferredSize(n);
    }
    if let Some(n) = number(&TOTAL_SIZE, line) {
        return LineKind::TotalSize(n);
    }
    LineKind::Other
}

/// Counters accumulated over one rsync run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub files_transferred: u64,
    pub files_deleted: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub excluded: u64,
    pub errors: u64,
    pub refusals: u64,
    pub expected: Option<u64>,
    /// Itemized and deleted entries seen so far, drives progress
    pub processed: u64,
    summary_seen: bool,
}

impl OutputStats {
    pub fn consume(&mut self, line: &str) -> LineKind {
        let kind = classify(line);
        match kind {
            LineKind::Error { benign: false } => self.errors += 1,
            LineKind::Refused => self.refusals += 1,
            LineKind::Error { benign: true } | LineKind::Other => {}
            LineKind::Excluded => self.excluded += 1,
            LineKind::ToConsider(n) => self.expected = Some(n),
            LineKind::Deleted => {
                self.files_deleted += 1;
                self.processed += 1;
            }
            LineKind::Itemized { sent } => {
                self.processed += 1;
                if sent && !self.summary_seen {
                    self.files_transferred += 1;
                }
            }
            LineKind::FilesTransferred(n) => {
                // the statistics block is authoritative over our own count
                self.summary_seen = true;
                self.files_transferred = n;
            }
            LineKind::TotalSize(n) => self.total_bytes = n,
            LineKind::TransferredSize(n) => self.transferred_bytes = n,
        }
        kind
    }

    pub fn progress(&self) -> common::progress::TransferProgress {
        common::progress::TransferProgress {
            processed: self.processed,
            expected: self.expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(
            classify("rsync: change_dir \"/x\" failed: No such file or directory (2)"),
            LineKind::Error { benign: false }
        );
        assert_eq!(
            classify("rsync error: some files could not be transferred (code 23)"),
            LineKind::Error { benign: false }
        );
        assert_eq!(
            classify("@ERROR: Unknown module 'shop'"),
            LineKind::Error { benign: false }
        );
        assert_eq!(
            classify("rsync: connection unexpectedly closed (0 bytes received so far) [sender]"),
            LineKind::Error { benign: true }
        );
    }

    #[test]
    fn classifies_progress_lines() {
        assert_eq!(classify("1,234 files to consider"), LineKind::ToConsider(1234));
        assert_eq!(classify("       1 file to consider"), LineKind::ToConsider(1));
        assert_eq!(classify("*deleting   old/file.txt"), LineKind::Deleted);
        assert_eq!(classify("deleting old/file.txt"), LineKind::Deleted);
        assert_eq!(
            classify(">f+++++++++ src/main.rs"),
            LineKind::Itemized { sent: true }
        );
        assert_eq!(
            classify("<f.st...... src/lib.rs"),
            LineKind::Itemized { sent: true }
        );
        assert_eq!(
            classify("cd+++++++++ src/"),
            LineKind::Itemized { sent: false }
        );
        assert_eq!(
            classify(".f...p..... src/run.sh"),
            LineKind::Itemized { sent: false }
        );
        assert_eq!(
            classify("skipping daemon-excluded file \".git\""),
            LineKind::Excluded
        );
    }

    #[test]
    fn classifies_statistics() {
        assert_eq!(
            classify("Number of files transferred: 5"),
            LineKind::FilesTransferred(5)
        );
        assert_eq!(
            classify("Number of regular files transferred: 1,024"),
            LineKind::FilesTransferred(1024)
        );
        assert_eq!(
            classify("Total file size: 100 bytes"),
            LineKind::TotalSize(100)
        );
        assert_eq!(
            classify("Total transferred file size: 20 bytes"),
            LineKind::TransferredSize(20)
        );
        assert_eq!(classify("sent 1,024 bytes  received 35 bytes"), LineKind::Other);
        assert_eq!(classify(""), LineKind::Other);
    }

    #[test]
    fn stats_prefer_summary_over_itemized_count() {
        let mut stats = OutputStats::default();
        for line in [
            "3 files to consider",
            ">f+++++++++ a",
            ">f.st...... b",
            "*deleting   c",
            "Number of files transferred: 5",
            "Total file size: 100 bytes",
            "Total transferred file size: 20 bytes",
        ] {
            stats.consume(line);
        }
        assert_eq!(stats.files_transferred, 5);
        assert_eq!(stats.files_deleted, 1);
        assert_eq!(stats.total_bytes, 100);
        assert_eq!(stats.transferred_bytes, 20);
        assert_eq!(stats.expected, Some(3));
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.progress().percent(), Some(100));
    }

    #[test]
    fn benign_errors_are_not_counted() {
        let mut stats = OutputStats::default();
        stats.consume("rsync: read error: Connection reset by peer (104)");
        stats.consume("rsync: change_dir \"/x\" failed: No such file or directory (2)");
        stats.consume("skipping daemon-excluded directory \".svn\"");
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.excluded, 1);
    }

    #[test]
    fn refusals_are_kept_apart_from_errors() {
        let mut stats = OutputStats::default();
        for line in [
            "rsync: failed to connect to 127.0.0.1 (127.0.0.1): Connection refused (111)",
            "rsync error: error in socket IO (code 10) at clientserver.c(139) [sender=3.2.7]",
        ] {
            assert_eq!(stats.consume(line), LineKind::Refused);
        }
        assert_eq!(stats.refusals, 2);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn counter_redrawn_in_place_is_read_from_the_last_segment() {
        let line = " 100 files...\r 200 files...\r250 files to consider";
        assert_eq!(classify(line), LineKind::ToConsider(250));
        let mut stats = OutputStats::default();
        stats.consume(line);
        stats.consume(">f+++++++++ a");
        assert_eq!(stats.expected, Some(250));
        assert_eq!(stats.progress().processed, 1);
        assert_eq!(
            classify("1,000 files...\r2,000 files...\r"),
            LineKind::Other
        );
    }

    #[test]
    fn attribute_only_changes_are_not_transfers() {
        let mut stats = OutputStats::default();
        for line in [".f...p..... run.sh", ".d..t...... src/", ">f+++++++++ a"] {
            stats.consume(line);
        }
        assert_eq!(stats.files_transferred, 1);
        assert_eq!(stats.processed, 3);
    }
}
