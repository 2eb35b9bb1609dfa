use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use epg2xml::{
    config::{Config, Settings, defaults::DEFAULT_CONFIG_FILE},
    providers::ProviderRegistry,
    runner::{self, RunOutcome},
    xmltv::OutputSink,
};

#[derive(Parser)]
#[command(name = "epg2xml")]
#[command(version)]
#[command(about = "Aggregates EPG data from multiple providers into a single XMLTV document")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Log level (overrides config file)
    #[arg(short = 'v', long, global = true)]
    log_level: Option<String>,

    /// Channel snapshot path (overrides config file)
    #[arg(long = "channelfile", value_name = "PATH", global = true)]
    channel_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch channels and programs and write the XMLTV document
    Run(RunArgs),
    /// Refresh the channel snapshot only
    UpdateChannels,
}

#[derive(clap::Args, Default)]
struct RunArgs {
    /// Write the document to a file instead of stdout
    #[arg(long = "xmlfile", value_name = "PATH", conflicts_with = "xml_sock")]
    xml_file: Option<PathBuf>,

    /// Write the document to a unix domain socket instead of stdout
    #[arg(long = "xmlsock", value_name = "PATH")]
    xml_sock: Option<PathBuf>,

    /// Fetch providers concurrently
    #[arg(long)]
    parallel: bool,

    /// Worker pool size for parallel fetching
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    workers: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_cli().await {
        Ok(outcome) => ExitCode::from(outcome.exit_code() as u8),
        Err(e) => {
            // logging may not be up yet
            eprintln!("epg2xml: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli() -> Result<RunOutcome> {
    let cli = Cli::parse();

    let first_run = !cli.config.exists();
    let mut config = Config::load_from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let command = cli.command.unwrap_or(Command::Run(RunArgs::default()));
    apply_overrides(&mut config.settings, &cli.log_level, &cli.channel_file, &command);
    config.validate()?;

    let _log_guard = init_logging(&config.settings)?;
    info!("Starting epg2xml v{}", env!("CARGO_PKG_VERSION"));
    if first_run {
        info!("Created default config file: {}", cli.config.display());
    } else {
        info!("Configuration loaded from: {}", cli.config.display());
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    let registry = ProviderRegistry::with_builtin();

    let result = match command {
        Command::Run(_) => {
            let sink = OutputSink::from_settings(&config.settings).await?;
            runner::run(&config, &registry, sink, cancel).await
        }
        Command::UpdateChannels => runner::update_channels(&config, &registry, cancel).await,
    };

    match result {
        Ok(report) => {
            if report.outcome == RunOutcome::Interrupted {
                warn!("Run interrupted");
            } else {
                info!(
                    "Done: {} providers, {} fetched, {} failed",
                    report.providers,
                    report.schedule.fetched.len(),
                    report.schedule.failed.len()
                );
            }
            Ok(report.outcome)
        }
        Err(e) => {
            error!("Run aborted: {}", e);
            Err(e.into())
        }
    }
}

fn apply_overrides(
    settings: &mut Settings,
    log_level: &Option<String>,
    channel_file: &Option<PathBuf>,
    command: &Command,
) {
    if let Some(level) = log_level {
        settings.log_level = level.clone();
    }
    if let Some(path) = channel_file {
        settings.channel_file = path.clone();
    }
    if let Command::Run(args) = command {
        if let Some(path) = &args.xml_file {
            settings.xml_file = Some(path.clone());
            settings.xml_sock = None;
        }
        if let Some(path) = &args.xml_sock {
            settings.xml_sock = Some(path.clone());
            settings.xml_file = None;
        }
        if args.parallel {
            settings.parallel = true;
        }
        if let Some(workers) = args.workers {
            settings.max_workers = Some(workers as usize);
        }
    }
}

/// Logs go to stderr (stdout may carry the document), plus an optional
/// daily rolling file. The returned guard must outlive the run.
fn init_logging(settings: &Settings) -> Result<Option<WorkerGuard>> {
    let log_filter = format!("epg2xml={}", settings.log_level.to_lowercase());

    let (file_layer, guard) = match &settings.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .context("log_file must name a file")?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(guard)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = handle_signals(cancel).await {
            error!("Failed to install signal handlers: {}", e);
        }
    });
}

/// The first signal cancels the run; a second one exits at once.
async fn handle_signals(cancel: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down"),
            }
            if cancel.is_cancelled() {
                break;
            }
            cancel.cancel();
        }
    }

    #[cfg(not(unix))]
    {
        loop {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down");
            if cancel.is_cancelled() {
                break;
            }
            cancel.cancel();
        }
    }

    warn!("Interrupted again, exiting without waiting for the run");
    std::process::exit(RunOutcome::Interrupted.exit_code())
}
