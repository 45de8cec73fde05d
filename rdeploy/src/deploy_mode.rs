//! Deploy mode: the half of a session that runs on the master
//!
//! Runs the `mid` hook, fans the master's copy of the tree out to every
//! server, and runs the `post` hook once all of them succeeded. Status lines
//! go to `sink` (stdout in the binary); logs must go elsewhere.

use std::sync::Arc;

use common::hooks::{self, HookType};
use common::{DeployContext, Error};
use tokio::io::AsyncWrite;
use transfer::Transfer;

use crate::fanout::{self, FanoutReport};

#[tracing::instrument(skip(ctx, transfer, sink), fields(repo = %ctx.repo, stage = %ctx.stage))]
pub async fn run<T, W>(
    ctx: Arc<DeployContext>,
    transfer: Arc<T>,
    sink: W,
) -> anyhow::Result<FanoutReport>
where
    T: Transfer + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    match tokio::fs::metadata(&ctx.source_dir).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(Error::Config(format!(
                "source {:?} is not a directory",
                ctx.source_dir
            ))
            .into());
        }
        Err(error) => {
            return Err(Error::Config(format!(
                "cannot resolve source directory {:?}: {}",
                ctx.source_dir, error
            ))
            .into());
        }
    }
    hooks::run(HookType::Mid, &ctx).await.map_err(Error::from)?;
    let hosts = fanout::targets(&ctx.servers, &ctx.master_host);
    let (report, _) = fanout::fanout(&hosts, Arc::clone(&ctx), transfer, sink).await?;
    if !report.all_succeeded() {
        return Err(Error::HostsFailed {
            hosts: report.failed_hosts(),
        }
        .into());
    }
    hooks::run(HookType::Post, &ctx).await.map_err(Error::from)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeTransfer;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_hook(hooks: &Path, name: &str, body: &str) {
        let path = hooks.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn context(source: &Path, hooks: &Path, servers: &[&str]) -> Arc<DeployContext> {
        Arc::new(DeployContext {
            repo: "shop".to_string(),
            stage: "prod".to_string(),
            source_dir: source.to_path_buf(),
            transfer_module: "shop".to_string(),
            master_host: "deploy1".to_string(),
            servers: servers.iter().map(|s| s.to_string()).collect(),
            deploy_mode: true,
            hooks_dir: Some(hooks.to_path_buf()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn hooks_wrap_a_successful_fanout() {
        let source = tempfile::tempdir().unwrap();
        let hooks = tempfile::tempdir().unwrap();
        write_hook(hooks.path(), "mid-deploy", "echo mid >> order");
        write_hook(hooks.path(), "post-deploy", "echo post >> order");
        let transfer = Arc::new(FakeTransfer::default());
        let report = run(
            context(source.path(), hooks.path(), &["web1", "deploy1", "web2"]),
            Arc::clone(&transfer),
            tokio::io::sink(),
        )
        .await
        .unwrap();
        assert!(report.all_succeeded());
        assert_eq!(transfer.hosts(), ["web1", "web2"]);
        let order = std::fs::read_to_string(source.path().join("order")).unwrap();
        assert_eq!(order, "mid\npost\n");
    }

    #[tokio::test]
    async fn failing_mid_hook_stops_before_fanout() {
        let source = tempfile::tempdir().unwrap();
        let hooks = tempfile::tempdir().unwrap();
        write_hook(hooks.path(), "mid-deploy", "exit 3");
        let transfer = Arc::new(FakeTransfer::default());
        let error = run(
            context(source.path(), hooks.path(), &["web1"]),
            Arc::clone(&transfer),
            tokio::io::sink(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Hook(hooks::HookError::Failed {
                hook: HookType::Mid,
                ..
            }))
        ));
        assert!(transfer.hosts().is_empty());
    }

    #[tokio::test]
    async fn failed_host_skips_post_hook() {
        let source = tempfile::tempdir().unwrap();
        let hooks = tempfile::tempdir().unwrap();
        write_hook(hooks.path(), "post-deploy", "touch posted");
        let transfer = Arc::new(FakeTransfer::failing(&["web2"]));
        let error = run(
            context(source.path(), hooks.path(), &["web1", "web2", "web3"]),
            Arc::clone(&transfer),
            tokio::io::sink(),
        )
        .await
        .unwrap_err();
        match error.downcast_ref::<Error>() {
            Some(Error::HostsFailed { hosts }) => assert_eq!(hosts, &["web2"]),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transfer.hosts(), ["web1", "web2", "web3"]);
        assert!(!source.path().join("posted").exists());
    }

    #[tokio::test]
    async fn missing_source_is_a_configuration_error() {
        let hooks = tempfile::tempdir().unwrap();
        let transfer = Arc::new(FakeTransfer::default());
        let error = run(
            context(Path::new("/nonexistent/shop"), hooks.path(), &["web1"]),
            Arc::clone(&transfer),
            tokio::io::sink(),
        )
        .await
        .unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Config(_))));
        assert!(transfer.hosts().is_empty());
    }
}
