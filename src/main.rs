use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use humantime_serde::re::humantime::parse_duration;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use logpipe::accounting::Aggregator;
use logpipe::clock::Clock;
use logpipe::config::{Config, Overrides};
use logpipe::ingest::parse::LineParser;
use logpipe::ingest::Ingest;
use logpipe::sink::SinkRegistry;
use logpipe::telemetry::dispatcher::Dispatcher;
use logpipe::telemetry::Telemetry;

/// Pipe for access logs: writes every line to a rotating file and accounts
/// response times per domain for Zabbix.
#[derive(Parser)]
#[command(name = "logpipe", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output file name with strftime placeholders, e.g. /var/log/apache2/access.log.%Y-%m-%d
    #[arg(short = 'l', long)]
    output_logfile: Option<String>,

    /// Symlink kept pointing at the current output file.
    #[arg(long)]
    symlink: Option<PathBuf>,

    /// Interval between data exports, e.g. "2m".
    #[arg(long, value_parser = parse_duration)]
    sending_interval: Option<Duration>,

    /// Interval between discovery exports, e.g. "15m".
    #[arg(long, value_parser = parse_duration)]
    discovery_interval: Option<Duration>,

    /// Zabbix submission timeout, e.g. "5s".
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Zabbix trapper server.
    #[arg(long)]
    zabbix_server: Option<String>,

    /// Host name the Zabbix items belong to.
    #[arg(long)]
    zabbix_host: Option<String>,

    /// Do not export any statistics.
    #[arg(long)]
    disable_zabbix: bool,

    /// Print the statistics table at the end of input.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            output_pattern: self.output_logfile.clone(),
            symlink: self.symlink.clone(),
            sending_interval: self.sending_interval,
            discovery_interval: self.discovery_interval,
            timeout: self.timeout,
            zabbix_server: self.zabbix_server.clone(),
            zabbix_host: self.zabbix_host.clone(),
            disable_telemetry: self.disable_zabbix,
        }
    }
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

/// How the pipeline stopped.
enum Exit {
    EndOfInput,
    Signalled,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("logpipe {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    // stdout may carry the statistics table; logs go to stderr.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.apply(cli.overrides());
    cfg.validate().context("invalid configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        output = %cfg.output.pattern,
        telemetry = cfg.telemetry.enabled,
        exporter = ?cfg.telemetry.exporter,
        zabbix_server = %cfg.telemetry.zabbix.server,
        zabbix_host = %cfg.telemetry.zabbix.host,
        sending_interval = ?cfg.telemetry.sending_interval,
        discovery_interval = ?cfg.telemetry.discovery_interval,
        "starting logpipe",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = rt.block_on(run(cfg, cli.verbose));
    // A pending stdin read would otherwise hold up runtime shutdown.
    rt.shutdown_background();

    match result? {
        Exit::EndOfInput => Ok(()),
        Exit::Signalled => std::process::exit(1),
    }
}

async fn run(cfg: Config, verbose: bool) -> Result<Exit> {
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let registry = SinkRegistry::new(Clock::System, cfg.output.mailbox_capacity);
    let sink = registry
        .acquire(&cfg.output.pattern, cfg.output.symlink.as_deref())
        .context("starting log sink")?;

    let aggregator = Aggregator::from_config(&cfg.accounting)?;
    let telemetry = Telemetry::new(&cfg.telemetry, Clock::System);
    let dispatcher = Dispatcher::new(aggregator, telemetry, &cfg.telemetry)
        .spawn(cfg.accounting.mailbox_capacity, cancel.clone());

    let parser = LineParser::new(&cfg.ingest.line_regex)?;
    let ingest = Ingest::new(parser, sink.clone(), dispatcher.mailbox());
    let input = BufReader::new(tokio::io::stdin());

    tokio::select! {
        report = ingest.run(input) => {
            let report = report?;
            report.reconcile();

            let outcome = dispatcher.join().await?;
            if verbose {
                print!("{}", outcome.report().aggregator.dump_table());
            }

            let lines = sink.terminate().await.context("terminating log sink")?;
            tracing::info!(lines, "logpipe stopped");
            Ok(Exit::EndOfInput)
        }
        _ = cancel.cancelled() => {
            let outcome = dispatcher.join().await?;
            tracing::warn!(
                accounted = outcome.report().accounted,
                failed_sends = outcome.report().failed_sends,
                "stopped by signal",
            );
            Ok(Exit::Signalled)
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
        cancel.cancel();
    });

    Ok(())
}
