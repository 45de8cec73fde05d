use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::instrument;

use common::{DeployContext, Error, RemoteSettings};
use rdeploy_tools_rdeploy::{Session, Summary, deploy_mode};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rdeploy",
    version,
    about = "Deploy a tree to a master server over ssh, then fan it out to production servers",
    long_about = "`rdeploy` syncs a source tree into an rsync daemon module on a master staging server through an ssh tunnel, then re-invokes itself on the master to push the master's copy to every production server concurrently.

Optional hook scripts run at fixed points: `mid-deploy` and `post-deploy` on the master around the fan-out, `report-deploy` locally once everything succeeded. Hooks are looked up in <source-dir>/.deploy/hooks and get the stage and repo as arguments.

EXAMPLES:
    # Sync to the master and fan out to three servers
    rdeploy --repo shop --stage prod --source-dir ./build --rsync-module shop \\
        --master ops@deploy1.example.com --servers web1,web2,web3

    # See what would change without touching anything
    rdeploy --repo shop --stage prod --source-dir ./build --rsync-module shop \\
        --master deploy1 --servers web1 --dry-run

    # Install this rdeploy binary on the master first
    rdeploy ... --self-deploy"
)]
struct Args {
    // Deployment
    /// Repository name, also the first path component under the master root
    #[arg(long, value_name = "NAME", help_heading = "Deployment")]
    repo: Option<String>,

    /// Stage (deployment slot) within the repository
    #[arg(long, value_name = "NAME", help_heading = "Deployment")]
    stage: Option<String>,

    /// Tree to deploy
    #[arg(long, value_name = "PATH", help_heading = "Deployment")]
    source_dir: Option<PathBuf>,

    /// rsync daemon module receiving the tree on the master and on every server
    #[arg(long, value_name = "MODULE", help_heading = "Deployment")]
    rsync_module: Option<String>,

    /// User to authenticate to the rsync daemons as
    #[arg(long, value_name = "USER", help_heading = "Deployment")]
    rsync_user: Option<String>,

    /// Master staging server, `[user@]host[:port]`
    #[arg(long, value_name = "HOST", help_heading = "Deployment")]
    master: Option<String>,

    /// Production servers to fan out to, comma separated
    ///
    /// The master is skipped if it appears in the list.
    #[arg(
        long,
        value_delimiter = ',',
        value_name = "HOSTS",
        help_heading = "Deployment"
    )]
    servers: Vec<String>,

    /// Run the master side: hooks and fan-out, status lines on stdout
    ///
    /// Used by rdeploy itself when it re-invokes itself on the master.
    #[arg(long, help_heading = "Deployment")]
    deploy: bool,

    /// Pass --dry-run to rsync and skip hooks
    #[arg(long, help_heading = "Deployment")]
    dry_run: bool,

    /// Directory holding the hook scripts
    ///
    /// Default is `<source-dir>/.deploy/hooks`
    #[arg(long, value_name = "PATH", help_heading = "Deployment")]
    hooks_dir: Option<PathBuf>,

    /// Path behind the rsync module on the master
    ///
    /// Becomes the source of the fan-out. Default is `/srv/deploy/<repo>/<stage>`
    #[arg(long, value_name = "PATH", help_heading = "Deployment")]
    master_dir: Option<PathBuf>,

    // Remote
    /// rdeploy executable to run on the master
    #[arg(
        long,
        default_value = "rdeploy",
        value_name = "PATH",
        help_heading = "Remote"
    )]
    remote_binary: String,

    /// Install this rdeploy binary on the master before re-invoking it there
    ///
    /// The binary is cached in ~/.cache/rdeploy/bin on the master and reused
    /// while its version matches.
    #[arg(long, help_heading = "Remote")]
    self_deploy: bool,

    /// Local port forwarded to the master's rsync daemon
    #[arg(
        long,
        default_value_t = common::config::DEFAULT_TUNNEL_PORT,
        value_name = "PORT",
        help_heading = "Remote"
    )]
    tunnel_port: u16,

    /// How long to wait for the control channel to come up, and for each
    /// command sent over it
    #[arg(
        long,
        default_value = "30s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Remote"
    )]
    channel_timeout: Duration,

    /// Upper bound on the whole fan-out run on the master
    #[arg(
        long,
        default_value = "2h",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Remote"
    )]
    remote_timeout: Duration,

    // Output
    /// Debug logging, also forwarded to the master
    #[arg(long, help_heading = "Output")]
    debug: bool,

    /// Verbose level: -v DEBUG / -vv TRACE (default: INFO)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, only report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,

    /// Print summary at the end
    #[arg(long, help_heading = "Output")]
    summary: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Print protocol version information as JSON and exit
    #[arg(long, help_heading = "Advanced settings")]
    protocol_version: bool,
}

impl Args {
    fn context(&self) -> DeployContext {
        DeployContext {
            repo: self.repo.clone().unwrap_or_default(),
            stage: self.stage.clone().unwrap_or_default(),
            source_dir: self.source_dir.clone().unwrap_or_default(),
            transfer_module: self.rsync_module.clone().unwrap_or_default(),
            transfer_user: self.rsync_user.clone(),
            master_host: self.master.clone().unwrap_or_default(),
            servers: self
                .servers
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            debug: self.debug,
            dry_run: self.dry_run,
            deploy_mode: self.deploy,
            hooks_dir: self.hooks_dir.clone(),
            master_dir: self.master_dir.clone(),
            remote: RemoteSettings {
                remote_binary: self.remote_binary.clone(),
                self_deploy: self.self_deploy,
                tunnel_port: self.tunnel_port,
                channel_timeout: self.channel_timeout,
                remote_timeout: self.remote_timeout,
            },
        }
    }

    fn verbosity(&self) -> u8 {
        if self.debug {
            self.verbose.max(1)
        } else {
            self.verbose
        }
    }
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> anyhow::Result<Summary> {
    let ctx = Arc::new(args.context());
    ctx.validate()?;
    let rsync = transfer::RsyncRunner::new(ctx.dry_run);
    if ctx.deploy_mode {
        tracing::debug!("deploy mode, fanning out from {}", ctx.source_dir.display());
        let report = deploy_mode::run(ctx, Arc::new(rsync), tokio::io::stdout()).await?;
        return Ok(Summary::Deploy(report));
    }
    let master = remote::SshSession::parse(&ctx.master_host)
        .map_err(|error| Error::Config(format!("{error:#}")))?;
    let connector = remote::SshConnector::new(
        master,
        ctx.remote.tunnel_port,
        ctx.remote.channel_timeout,
    );
    let summary = Session::new(Arc::clone(&ctx), connector, rsync)
        .verbose(args.verbosity())
        .run()
        .await?;
    Ok(Summary::Session(summary))
}

fn main() -> Result<(), anyhow::Error> {
    // handle --protocol-version before parsing, so it works without the
    // required deployment options; only look before a -- separator
    let args: Vec<String> = std::env::args().collect();
    let args_to_check = match args.iter().position(|arg| arg == "--") {
        Some(pos) => &args[..pos],
        None => &args[..],
    };
    if args_to_check.iter().any(|arg| arg == "--protocol-version") {
        let version = common::version::ProtocolVersion::current();
        println!("{}", version.to_json()?);
        return Ok(());
    }

    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbosity(),
        // deploy mode's stdout belongs to the status lines
        print_summary: args.summary && !args.deploy,
        log_to_stderr: args.deploy,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
