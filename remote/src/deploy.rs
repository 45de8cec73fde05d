//! Self-deploy of the rdeploy binary to the master
//!
//! Before re-invoking itself in deploy mode the session can install the
//! running executable on the master at
//! `$HOME/.cache/rdeploy/bin/rdeploy-{version}`. The upload goes through the
//! control channel as base64 text, is verified with SHA-256 and moved into
//! place atomically. A copy that already reports the same protocol version
//! is reused, and only the newest few versions are kept around.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use common::version::ProtocolVersion;
use sha2::Digest;

use crate::channel::ControlChannel;
use crate::shell_escape;

/// Cache directory relative to `$HOME` on the master
pub const CACHE_SUBDIR: &str = ".cache/rdeploy/bin";

/// Versions left behind by [`cleanup_old_versions`]
pub const KEEP_VERSIONS: usize = 3;

/// Base64 characters written per command line
const CHUNK_SIZE: usize = 48 * 1024;

pub fn binary_name(version: &str) -> String {
    format!("rdeploy-{version}")
}

/// `$HOME` of the account the control channel runs as
pub async fn remote_home(channel: &mut ControlChannel, timeout: Duration) -> anyhow::Result<String> {
    let output = channel
        .exec("printf '%s\\n' \"$HOME\"", timeout)
        .await
        .context("failed to query HOME on the master")?;
    let home = output.stdout_text().trim().to_string();
    if home.is_empty() || !home.starts_with('/') {
        anyhow::bail!(
            "HOME is not set to an absolute path on {} (got {:?})",
            channel.host(),
            home
        );
    }
    Ok(home)
}

/// Version reported by an installed binary, `None` if it is missing or broken
pub async fn deployed_version(
    channel: &mut ControlChannel,
    remote_path: &str,
    timeout: Duration,
) -> Option<ProtocolVersion> {
    let command = format!("{} --protocol-version 2>/dev/null", shell_escape(remote_path));
    let output = match channel.exec(&command, timeout).await {
        Ok(output) => output,
        Err(error) => {
            tracing::debug!("version probe of {} failed: {:#}", remote_path, error);
            return None;
        }
    };
    if !output.success() {
        tracing::debug!(
            "no usable binary at {} (exit status {})",
            remote_path,
            output.status
        );
        return None;
    }
    match ProtocolVersion::from_json(&output.stdout_text()) {
        Ok(version) => Some(version),
        Err(error) => {
            tracing::debug!("{}: {:#}", remote_path, error);
            None
        }
    }
}

/// Install `local_binary` on the master and return its remote path
#[tracing::instrument(skip(channel, version), fields(host = %channel.host()))]
pub async fn deploy_self(
    channel: &mut ControlChannel,
    local_binary: &Path,
    version: &ProtocolVersion,
    timeout: Duration,
) -> anyhow::Result<String> {
    let home = remote_home(channel, timeout).await?;
    let cache_dir = format!("{home}/{CACHE_SUBDIR}");
    let remote_path = format!("{cache_dir}/{}", binary_name(&version.semantic));
    if let Some(deployed) = deployed_version(channel, &remote_path, timeout).await {
        if deployed.is_compatible_with(version) {
            tracing::info!("rdeploy {} already installed at {}", deployed, remote_path);
            return Ok(remote_path);
        }
        tracing::info!(
            "replacing rdeploy {} at {} with {}",
            deployed,
            remote_path,
            version
        );
    }
    let binary = tokio::fs::read(local_binary)
        .await
        .with_context(|| format!("failed to read local binary {}", local_binary.display()))?;
    tracing::info!(
        "deploying rdeploy {} ({} bytes) to {}:{}",
        version,
        binary.len(),
        channel.host(),
        remote_path
    );
    let expected = compute_sha256(&binary);
    tracing::debug!("expected SHA-256: {}", hex::encode(&expected));
    upload_base64(channel, &binary, &cache_dir, &remote_path, timeout).await?;
    verify_remote_checksum(channel, &remote_path, &expected, timeout).await?;
    tracing::info!("checksum verified");
    if let Err(error) = cleanup_old_versions(channel, &cache_dir, KEEP_VERSIONS, timeout).await {
        tracing::warn!("cleanup of old versions failed (non-fatal): {:#}", error);
    }
    Ok(remote_path)
}

async fn run_checked(
    channel: &mut ControlChannel,
    command: &str,
    what: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let output = channel
        .exec(command, timeout)
        .await
        .with_context(|| format!("failed to {what}"))?;
    if !output.success() {
        anyhow::bail!(
            "failed to {} (exit status {}): {}",
            what,
            output.status,
            output.stderr_text()
        );
    }
    Ok(())
}

async fn upload_base64(
    channel: &mut ControlChannel,
    binary: &[u8],
    cache_dir: &str,
    remote_path: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(binary);
    let encoded_path = format!("{remote_path}.b64.tmp");
    let temp_path = format!("{remote_path}.tmp");
    let encoded_escaped = shell_escape(&encoded_path);
    let temp_escaped = shell_escape(&temp_path);
    run_checked(
        channel,
        &format!(
            "mkdir -p {} && : > {}",
            shell_escape(cache_dir),
            encoded_escaped
        ),
        "create the cache directory",
        timeout,
    )
    .await?;
    let chunks = encoded.as_bytes().chunks(CHUNK_SIZE);
    let total = chunks.len();
    for (index, chunk) in chunks.enumerate() {
        // base64 output is plain ASCII without shell metacharacters
        let chunk = std::str::from_utf8(chunk).context("base64 output is not ASCII")?;
        run_checked(
            channel,
            &format!("printf '%s' {chunk} >> {encoded_escaped}"),
            "upload binary",
            timeout,
        )
        .await?;
        tracing::trace!("uploaded chunk {}/{}", index + 1, total);
    }
    run_checked(
        channel,
        &format!(
            "base64 -d {enc} > {tmp} && rm -f {enc} && chmod 700 {tmp} && mv -f {tmp} {dst}",
            enc = encoded_escaped,
            tmp = temp_escaped,
            dst = shell_escape(remote_path),
        ),
        "decode and install binary",
        timeout,
    )
    .await
    .context("installing rdeploy on the master failed; check free space, permissions and that base64 is installed")
}

async fn verify_remote_checksum(
    channel: &mut ControlChannel,
    remote_path: &str,
    expected: &[u8],
    timeout: Duration,
) -> anyhow::Result<()> {
    let output = channel
        .exec(&format!("sha256sum {}", shell_escape(remote_path)), timeout)
        .await
        .context("failed to run sha256sum on the master")?;
    if !output.success() {
        anyhow::bail!(
            "failed to compute checksum on the master: {}",
            output.stderr_text()
        );
    }
    let stdout = output.stdout_text();
    let remote = stdout
        .split_whitespace()
        .next()
        .context("unexpected sha256sum output")?;
    let expected = hex::encode(expected);
    if remote != expected {
        anyhow::bail!(
            "checksum mismatch after upload: expected {}, got {}",
            expected,
            remote
        );
    }
    Ok(())
}

fn compute_sha256(data: &[u8]) -> Vec<u8> {
    sha2::Sha256::digest(data).to_vec()
}

/// Remove all but the `keep` most recently modified binaries in `cache_dir`
pub async fn cleanup_old_versions(
    channel: &mut ControlChannel,
    cache_dir: &str,
    keep: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    tracing::debug!("cleaning up old rdeploy versions (keeping {})", keep);
    run_checked(
        channel,
        &format!(
            "(cd {} 2>/dev/null && ls -t rdeploy-* 2>/dev/null | tail -n +{} | xargs -r rm -f)",
            shell_escape(cache_dir),
            keep + 1
        ),
        "remove old versions",
        timeout,
    )
    .await
}
