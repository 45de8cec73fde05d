//! rsync-backed tree transfer
//!
//! Both hops of a deployment push a directory tree into an rsync daemon
//! module: first from the operator's machine to the master through the SSH
//! tunnel, then from the master to each production server directly. This
//! crate owns building the rsync command line, reading its output as it
//! streams, deciding what the exit status means and retrying connection
//! refusals on the tunnel hop (the forward may not be listening yet).
//!
//! The [`Transfer`] trait is the seam the session and the fan-out coordinator
//! are written against; [`RsyncRunner`] is the real implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::progress::ProgressSink;
use tokio::io::{AsyncBufReadExt, BufReader};

pub mod exit;
pub mod output;

pub use exit::ExitClass;
pub use output::OutputStats;

/// Attempts made on the tunnel hop before a connection refusal is final
pub const MAX_ATTEMPTS: u32 = 3;

const TUNNEL_ADDR: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Through the local end of the SSH port forward to the master
    Tunnel { port: u16 },
    /// Straight to the destination's rsync daemon
    Daemon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub source: PathBuf,
    /// Host the tree ends up on; for tunnel jobs only used in messages
    pub host: String,
    pub stage: String,
    pub module: String,
    pub user: Option<String>,
    pub mode: TransferMode,
    /// 1-based attempt number, maintained by the runner
    pub attempt: u32,
}

impl TransferJob {
    /// The first hop: the local tree into the master's module via the tunnel
    pub fn to_master(ctx: &common::DeployContext) -> Self {
        Self {
            source: ctx.source_dir.clone(),
            host: ctx.master_host.clone(),
            stage: ctx.stage.clone(),
            module: ctx.transfer_module.clone(),
            user: ctx.transfer_user.clone(),
            mode: TransferMode::Tunnel {
                port: ctx.remote.tunnel_port,
            },
            attempt: 0,
        }
    }

    /// The second hop: the master's copy into one production server
    pub fn to_server(ctx: &common::DeployContext, host: &str) -> Self {
        Self {
            source: ctx.source_dir.clone(),
            host: host.to_string(),
            stage: ctx.stage.clone(),
            module: ctx.transfer_module.clone(),
            user: ctx.transfer_user.clone(),
            mode: TransferMode::Daemon,
            attempt: 0,
        }
    }

    /// rsync daemon URL of the destination module
    pub fn destination(&self) -> String {
        let user = self
            .user
            .as_deref()
            .map(|u| format!("{u}@"))
            .unwrap_or_default();
        match self.mode {
            TransferMode::Tunnel { port } => {
                format!("rsync://{user}{TUNNEL_ADDR}:{port}/{}/", self.module)
            }
            TransferMode::Daemon => format!("rsync://{user}{}/{}/", self.host, self.module),
        }
    }
}

/// Why a transfer that ran did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferFailure {
    #[error(
        "rsync module '{module}' is missing or its path does not exist on the destination (exit code 5)"
    )]
    ModuleMissing { module: String },

    #[error("connection to rsync daemon refused")]
    ConnectionRefused,

    #[error("transfer canceled")]
    Canceled,

    #[error("rsync exited with code {0}")]
    ExitCode(i32),

    #[error("rsync was killed by a signal")]
    Killed,

    #[error("failed to run rsync: {0}")]
    Spawn(String),
}

/// Transfers that cannot even be attempted
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cannot resolve source directory {path:?}")]
    SourceUnresolved {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source {0:?} is not a directory")]
    NotADirectory(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    pub success: bool,
    pub files_transferred: u64,
    pub files_deleted: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub excluded_count: u64,
    /// Exit code of the last attempt; -1 when rsync did not run or was killed
    pub raw_exit_code: i32,
    pub attempts: u32,
    pub failure: Option<TransferFailure>,
}

impl std::fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} files transferred, {} deleted, {} of {} sent",
            self.files_transferred,
            self.files_deleted,
            bytesize::ByteSize(self.transferred_bytes),
            bytesize::ByteSize(self.total_bytes),
        )?;
        if self.excluded_count > 0 {
            write!(f, ", {} excluded by daemon", self.excluded_count)?;
        }
        Ok(())
    }
}

/// Pushes one tree to one destination
pub trait Transfer: Send + Sync {
    fn run(
        &self,
        job: TransferJob,
        progress: &dyn ProgressSink,
    ) -> impl std::future::Future<Output = Result<TransferOutcome, TransferError>> + Send;
}

#[derive(Debug, Clone)]
pub struct RsyncRunner {
    program: PathBuf,
    retry_delay: Duration,
    dry_run: bool,
}

impl Default for RsyncRunner {
    fn default() -> Self {
        Self::new(false)
    }
}

impl RsyncRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            program: PathBuf::from("rsync"),
            retry_delay: Duration::from_secs(1),
            dry_run,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn args(&self, job: &TransferJob, source: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "--archive",
            "--delete",
            "--stats",
            "--itemize-changes",
            "--progress",
            "--no-inc-recursive",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if matches!(job.mode, TransferMode::Tunnel { .. }) {
            args.push("--compress".to_string());
        }
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        // trailing slash: sync the directory's contents, not the directory
        let mut src = source.to_string_lossy().into_owned();
        if !src.ends_with('/') {
            src.push('/');
        }
        args.push(src);
        args.push(job.destination());
        args
    }

    fn handle_line(
        &self,
        job: &TransferJob,
        stats: &mut OutputStats,
        line: &str,
        progress: &dyn ProgressSink,
    ) {
        use output::LineKind;
        match stats.consume(line) {
            LineKind::Error { benign: true } => {
                tracing::debug!("{}: {}", job.host, line);
            }
            LineKind::Error { benign: false } => {
                tracing::warn!("{}: {}", job.host, line);
            }
            LineKind::Refused if may_retry(job) => {
                tracing::debug!("{}: {}", job.host, line);
            }
            LineKind::Refused => tracing::warn!("{}: {}", job.host, line),
            LineKind::Excluded => tracing::trace!("{}: {}", job.host, line),
            LineKind::ToConsider(_) | LineKind::Deleted | LineKind::Itemized { .. } => {
                tracing::trace!("{}: {}", job.host, line);
                progress.update(stats.progress());
            }
            LineKind::FilesTransferred(_)
            | LineKind::TotalSize(_)
            | LineKind::TransferredSize(_)
            | LineKind::Other => {
                if !line.is_empty() {
                    tracing::trace!("{}: {}", job.host, line);
                }
            }
        }
    }

    async fn attempt(
        &self,
        job: &TransferJob,
        source: &Path,
        progress: &dyn ProgressSink,
    ) -> TransferOutcome {
        let args = self.args(job, source);
        tracing::debug!(
            "{}: attempt {}: {:?} {}",
            job.host,
            job.attempt,
            self.program,
            args.join(" ")
        );
        let failed = |failure: TransferFailure| TransferOutcome {
            raw_exit_code: -1,
            attempts: job.attempt,
            failure: Some(failure),
            ..Default::default()
        };
        let mut child = match tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => return failed(TransferFailure::Spawn(format!("{error:#}"))),
        };
        let mut stats = OutputStats::default();
        // rsync may print file names that are not valid UTF-8, so split on
        // bytes and convert lossily instead of using `lines()`
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));
        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                segment = next_segment(&mut stdout), if stdout.is_some() => match segment {
                    Some(bytes) => self.handle_line(job, &mut stats, &decode(&bytes), progress),
                    None => stdout = None,
                },
                segment = next_segment(&mut stderr), if stderr.is_some() => match segment {
                    Some(bytes) => self.handle_line(job, &mut stats, &decode(&bytes), progress),
                    None => stderr = None,
                },
            }
        }
        let status = match child.wait().await {
            Ok(status) => status,
            Err(error) => return failed(TransferFailure::Spawn(format!("{error:#}"))),
        };
        let Some(code) = status.code() else {
            return TransferOutcome {
                failure: Some(TransferFailure::Killed),
                ..outcome_from(&stats, -1, job.attempt)
            };
        };
        let failure = match exit::classify(code, stats.excluded) {
            ExitClass::Success => None,
            ExitClass::ModuleMissing => Some(TransferFailure::ModuleMissing {
                module: job.module.clone(),
            }),
            ExitClass::ConnectionRefused => Some(TransferFailure::ConnectionRefused),
            ExitClass::Canceled => Some(TransferFailure::Canceled),
            ExitClass::Failed(code) => Some(TransferFailure::ExitCode(code)),
        };
        TransferOutcome {
            success: failure.is_none(),
            failure,
            ..outcome_from(&stats, code, job.attempt)
        }
    }
}

/// A refused connection on this attempt would be retried
fn may_retry(job: &TransferJob) -> bool {
    matches!(job.mode, TransferMode::Tunnel { .. }) && job.attempt < MAX_ATTEMPTS
}

fn outcome_from(stats: &OutputStats, code: i32, attempts: u32) -> TransferOutcome {
    TransferOutcome {
        success: false,
        files_transferred: stats.files_transferred,
        files_deleted: stats.files_deleted,
        total_bytes: stats.total_bytes,
        transferred_bytes: stats.transferred_bytes,
        excluded_count: stats.excluded,
        raw_exit_code: code,
        attempts,
        failure: None,
    }
}

async fn next_segment<R>(reader: &mut Option<tokio::io::Split<R>>) -> Option<Vec<u8>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match reader {
        Some(reader) => reader.next_segment().await.ok().flatten(),
        None => None,
    }
}

fn decode(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    line.trim_end_matches('\r').to_string()
}

impl Transfer for RsyncRunner {
    #[tracing::instrument(skip(self, job, progress), fields(host = %job.host, module = %job.module))]
    async fn run(
        &self,
        job: TransferJob,
        progress: &dyn ProgressSink,
    ) -> Result<TransferOutcome, TransferError> {
        let source = tokio::fs::canonicalize(&job.source).await.map_err(|source| {
            TransferError::SourceUnresolved {
                path: job.source.clone(),
                source,
            }
        })?;
        if !tokio::fs::metadata(&source)
            .await
            .map(|md| md.is_dir())
            .unwrap_or(false)
        {
            return Err(TransferError::NotADirectory(source));
        }
        let mut job = job;
        job.attempt = 0;
        loop {
            job.attempt += 1;
            let outcome = self.attempt(&job, &source, progress).await;
            let retry = matches!(outcome.failure, Some(TransferFailure::ConnectionRefused))
                && may_retry(&job);
            if !retry {
                match &outcome.failure {
                    None if outcome.excluded_count > 0 && outcome.raw_exit_code != 0 => {
                        tracing::info!(
                            "{}: {} (rsync exit code {} ignored, files excluded by daemon)",
                            job.host,
                            outcome,
                            outcome.raw_exit_code
                        );
                    }
                    None => tracing::debug!("{}: {}", job.host, outcome),
                    Some(failure) => tracing::debug!(
                        "{}: giving up after {} attempt(s): {}",
                        job.host,
                        job.attempt,
                        failure
                    ),
                }
                return Ok(outcome);
            }
            tracing::debug!(
                "{}: connection refused on attempt {}/{}, retrying in {:?}",
                job.host,
                job.attempt,
                MAX_ATTEMPTS,
                self.retry_delay
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::progress::{NoProgress, TransferProgress};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    /// Writes an executable stand-in for rsync that records its arguments and
    /// how often it ran next to itself
    fn fake_rsync(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("rsync");
        let script = format!(
            "#!/bin/sh\n\
             here=$(dirname \"$0\")\n\
             echo \"$@\" > \"$here/args\"\n\
             n=$(cat \"$here/count\" 2>/dev/null || echo 0)\n\
             n=$((n + 1))\n\
             echo $n > \"$here/count\"\n\
             {body}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runs(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("count"))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    fn job(source: &Path, mode: TransferMode) -> TransferJob {
        TransferJob {
            source: source.to_path_buf(),
            host: "web1".to_string(),
            stage: "prod".to_string(),
            module: "shop".to_string(),
            user: None,
            mode,
            attempt: 0,
        }
    }

    fn runner(program: PathBuf) -> RsyncRunner {
        RsyncRunner::new(false)
            .with_program(program)
            .with_retry_delay(Duration::from_millis(10))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TransferProgress>>);

    impl ProgressSink for Recorder {
        fn update(&self, progress: TransferProgress) {
            self.0.lock().unwrap().push(progress);
        }
    }

    #[test]
    fn destination_urls() {
        let mut job = job(Path::new("/src"), TransferMode::Tunnel { port: 8873 });
        assert_eq!(job.destination(), "rsync://127.0.0.1:8873/shop/");
        job.user = Some("deploy".to_string());
        assert_eq!(job.destination(), "rsync://deploy@127.0.0.1:8873/shop/");
        job.mode = TransferMode::Daemon;
        assert_eq!(job.destination(), "rsync://deploy@web1/shop/");
    }

    #[test]
    fn jobs_from_context() {
        let ctx = common::DeployContext {
            repo: "shop".to_string(),
            stage: "prod".to_string(),
            source_dir: PathBuf::from("/build/shop"),
            transfer_module: "shop-prod".to_string(),
            master_host: "deploy1".to_string(),
            ..Default::default()
        };
        let master = TransferJob::to_master(&ctx);
        assert_eq!(master.mode, TransferMode::Tunnel { port: 8873 });
        assert_eq!(master.host, "deploy1");
        let server = TransferJob::to_server(&ctx, "web3");
        assert_eq!(server.mode, TransferMode::Daemon);
        assert_eq!(server.destination(), "rsync://web3/shop-prod/");
    }

    #[test]
    fn command_line_depends_on_mode() {
        let runner = RsyncRunner::new(false);
        let tunnel = job(Path::new("/src"), TransferMode::Tunnel { port: 9000 });
        let args = runner.args(&tunnel, Path::new("/src"));
        assert!(args.contains(&"--compress".to_string()));
        assert!(args.contains(&"--delete".to_string()));
        assert!(!args.contains(&"--dry-run".to_string()));
        assert_eq!(args[args.len() - 2], "/src/");
        assert_eq!(args[args.len() - 1], "rsync://127.0.0.1:9000/shop/");

        let daemon = job(Path::new("/src"), TransferMode::Daemon);
        let args = RsyncRunner::new(true).args(&daemon, Path::new("/src/"));
        assert!(!args.contains(&"--compress".to_string()));
        assert!(args.contains(&"--dry-run".to_string()));
        assert_eq!(args[args.len() - 2], "/src/");
    }

    #[tokio::test]
    async fn parses_statistics_and_reports_progress() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(
            bin.path(),
            "echo '2 files to consider'\n\
             echo '>f+++++++++ a.txt'\n\
             echo '*deleting   old.txt'\n\
             echo ''\n\
             echo 'Number of files transferred: 5'\n\
             echo 'Total file size: 100 bytes'\n\
             echo 'Total transferred file size: 20 bytes'\n\
             exit 0",
        );
        let recorder = Recorder::default();
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Daemon), &recorder)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.failure, None);
        assert_eq!(outcome.files_transferred, 5);
        assert_eq!(outcome.files_deleted, 1);
        assert_eq!(outcome.total_bytes, 100);
        assert_eq!(outcome.transferred_bytes, 20);
        assert_eq!(outcome.raw_exit_code, 0);
        assert_eq!(outcome.attempts, 1);
        let updates = recorder.0.lock().unwrap();
        assert_eq!(updates.last().and_then(|p| p.percent()), Some(100));
        let args = std::fs::read_to_string(bin.path().join("args")).unwrap();
        assert!(args.trim_end().ends_with("rsync://web1/shop/"));
    }

    #[tokio::test]
    async fn tunnel_retries_connection_refused() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(
            bin.path(),
            "if [ \"$n\" -lt 2 ]; then echo 'rsync: failed to connect to 127.0.0.1: Connection refused (111)' >&2; exit 10; fi\n\
             exit 0",
        );
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Tunnel { port: 8873 }), &NoProgress)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(runs(bin.path()), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn retried_refusal_is_only_logged_at_debug() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(
            bin.path(),
            "if [ \"$n\" -lt 2 ]; then\n\
               echo 'rsync: failed to connect to 127.0.0.1 (127.0.0.1): Connection refused (111)' >&2\n\
               echo 'rsync error: error in socket IO (code 10) at clientserver.c(139) [sender=3.2.7]' >&2\n\
               exit 10\n\
             fi\n\
             exit 0",
        );
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Tunnel { port: 8873 }), &NoProgress)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(logs_contain("Connection refused (111)"));
        logs_assert(|lines: &[&str]| {
            match lines.iter().find(|line| line.contains(" WARN ")) {
                Some(line) => Err(format!("unexpected warning: {line}")),
                None => Ok(()),
            }
        });
        assert!(!logs_contain("job=TransferJob"));
    }

    #[tokio::test]
    #[traced_test]
    async fn refusal_on_the_last_attempt_is_warned() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(
            bin.path(),
            "echo \"rsync: failed to connect to 127.0.0.1: Connection refused (111) run $n\" >&2\n\
             exit 10",
        );
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Tunnel { port: 8873 }), &NoProgress)
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(TransferFailure::ConnectionRefused));
        logs_assert(|lines: &[&str]| {
            let warned: Vec<_> = lines
                .iter()
                .filter(|line| line.contains(" WARN ") && line.contains("Connection refused"))
                .collect();
            match warned.as_slice() {
                [line] if line.contains(&format!("run {MAX_ATTEMPTS}")) => Ok(()),
                other => Err(format!("unexpected warnings: {other:?}")),
            }
        });
    }

    #[tokio::test]
    async fn counter_redrawn_in_place_drives_progress() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(
            bin.path(),
            "printf ' 100 files...\\r 200 files...\\r250 files to consider\\n'\n\
             echo '>f+++++++++ a.txt'\n\
             exit 0",
        );
        let recorder = Recorder::default();
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Daemon), &recorder)
            .await
            .unwrap();
        assert!(outcome.success);
        let updates = recorder.0.lock().unwrap();
        assert_eq!(
            updates.last(),
            Some(&TransferProgress {
                processed: 1,
                expected: Some(250),
            })
        );
    }

    #[tokio::test]
    async fn tunnel_gives_up_after_max_attempts() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(bin.path(), "exit 35");
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Tunnel { port: 8873 }), &NoProgress)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(TransferFailure::ConnectionRefused));
        assert_eq!(outcome.attempts, MAX_ATTEMPTS);
        assert_eq!(runs(bin.path()), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn daemon_mode_does_not_retry() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(bin.path(), "exit 10");
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Daemon), &NoProgress)
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(TransferFailure::ConnectionRefused));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(runs(bin.path()), 1);
    }

    #[tokio::test]
    async fn missing_module_is_explained() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(bin.path(), "echo '@ERROR: Unknown module' >&2; exit 5");
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Daemon), &NoProgress)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.raw_exit_code, 5);
        let failure = outcome.failure.unwrap();
        assert!(failure.to_string().contains("'shop'"));
    }

    #[tokio::test]
    async fn partial_transfer_counts_only_with_exclusions() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let program = fake_rsync(
            bin.path(),
            "echo 'skipping daemon-excluded file \"secret\"'\nexit 23",
        );
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Daemon), &NoProgress)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.excluded_count, 1);
        assert_eq!(outcome.raw_exit_code, 23);

        let bin = tempfile::tempdir().unwrap();
        let program = fake_rsync(bin.path(), "exit 24");
        let outcome = runner(program)
            .run(job(source.path(), TransferMode::Daemon), &NoProgress)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(TransferFailure::ExitCode(24)));
    }

    #[tokio::test]
    async fn missing_program_is_a_failed_outcome() {
        let bin = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let outcome = runner(bin.path().join("no-such-rsync"))
            .run(job(source.path(), TransferMode::Daemon), &NoProgress)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.raw_exit_code, -1);
        assert!(matches!(outcome.failure, Some(TransferFailure::Spawn(_))));
    }

    #[tokio::test]
    async fn unresolvable_source_is_an_error() {
        let bin = tempfile::tempdir().unwrap();
        let program = fake_rsync(bin.path(), "exit 0");
        let err = runner(program)
            .run(
                job(&bin.path().join("missing"), TransferMode::Daemon),
                &NoProgress,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceUnresolved { .. }));
        assert!(!bin.path().join("count").exists());

        let file = bin.path().join("args");
        std::fs::write(&file, "x").unwrap();
        let err = runner(bin.path().join("rsync"))
            .run(job(&file, TransferMode::Daemon), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotADirectory(_)));
    }
}
