//! Shared plumbing for the rdeploy tools
//!
//! - [`DeployContext`]: the immutable description of a deployment
//! - [`Error`]: the session-level failure taxonomy
//! - [`hooks`]: optional lifecycle hook scripts
//! - [`progress`]: transfer progress sinks
//! - [`run`]: tokio runtime and tracing bootstrap used by the binary

pub mod config;
pub mod error;
pub mod hooks;
pub mod progress;
pub mod version;

pub use config::{DeployContext, OutputConfig, RemoteSettings, RuntimeConfig};
pub use error::Error;

fn init_tracing(output: &OutputConfig) {
    use std::io::IsTerminal;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    let filter = tracing_subscriber::EnvFilter::new(output.level().to_string());
    let (writer, ansi) = if output.log_to_stderr {
        (
            BoxMakeWriter::new(std::io::stderr),
            std::io::stderr().is_terminal(),
        )
    } else {
        (
            BoxMakeWriter::new(std::io::stdout),
            std::io::stdout().is_terminal(),
        )
    };
    // a subscriber may already be installed (e.g. by tests), keep it
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    builder.build()
}

/// Install logging, build the runtime and drive `func` to completion
///
/// Returns `None` after logging the error chain if `func` fails; the caller
/// turns that into a non-zero exit status.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
    Summary: std::fmt::Display,
{
    init_tracing(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {:#}", error);
            return None;
        }
    };
    let res = runtime.block_on(func());
    // transfer subprocesses are kill_on_drop, don't wait on stragglers
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    match res {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            None
        }
    }
}
