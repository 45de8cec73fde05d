//! Lifecycle hooks
//!
//! A hook is an optional executable at `<hooks_dir>/<type>-deploy`. It runs
//! with the source tree as its working directory and receives
//! `(stage, repo)` as positional arguments. A missing or non-executable hook
//! is silently skipped; a hook that runs and exits non-zero aborts the
//! session.
//!
//! Hook output is relayed line by line through tracing rather than inherited,
//! because in deploy mode stdout carries the wire protocol.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::DeployContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum HookType {
    /// On the master, after the tree arrived and before fan-out
    Mid,
    /// On the master, after every server was synced
    Post,
    /// Locally, after the whole session succeeded
    Report,
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{hook}-deploy hook failed ({status})")]
    Failed {
        hook: HookType,
        status: std::process::ExitStatus,
    },

    #[error("failed to run {hook}-deploy hook {path:?}")]
    Spawn {
        hook: HookType,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// No executable hook installed
    Absent,
    /// Hook exists but dry-run was requested
    Skipped,
    Succeeded,
}

pub fn hook_path(hooks_dir: &Path, hook: HookType) -> PathBuf {
    hooks_dir.join(format!("{hook}-deploy"))
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(md) => md.is_file() && md.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Run `hook` for the given deployment if it is installed
pub async fn run(hook: HookType, ctx: &DeployContext) -> Result<HookOutcome, HookError> {
    let path = hook_path(&ctx.hooks_dir(), hook);
    if !is_executable(&path) {
        tracing::debug!("no executable {hook}-deploy hook at {:?}", path);
        return Ok(HookOutcome::Absent);
    }
    if ctx.dry_run {
        tracing::info!("dry run: skipping {hook}-deploy hook {:?}", path);
        return Ok(HookOutcome::Skipped);
    }
    tracing::info!("running {hook}-deploy hook");
    // the child gets its own working directory, ours never changes
    let mut child = tokio::process::Command::new(&path)
        .arg(&ctx.stage)
        .arg(&ctx.repo)
        .current_dir(&ctx.source_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HookError::Spawn {
            hook,
            path: path.clone(),
            source,
        })?;
    let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
    let relay_stdout = async {
        if let Some(mut lines) = stdout {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "hook", "[{hook}] {line}");
            }
        }
    };
    let relay_stderr = async {
        if let Some(mut lines) = stderr {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "hook", "[{hook}] {line}");
            }
        }
    };
    tokio::join!(relay_stdout, relay_stderr);
    let status = child.wait().await.map_err(|source| HookError::Spawn {
        hook,
        path: path.clone(),
        source,
    })?;
    if !status.success() {
        return Err(HookError::Failed { hook, status });
    }
    tracing::debug!("{hook}-deploy hook finished");
    Ok(HookOutcome::Succeeded)
}
