use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use vmark::AppConfig;
use vmark::discovery::{Recipient, discover_items, load_recipients};
use vmark::logging::{LOG_RETENTION_DAYS, Verbosity, cleanup_old_logs, init_logging};
use vmark::pipeline::commands::FfmpegCommands;
use vmark::pipeline::tools::CommandWatermarker;
use vmark::pipeline::{
    ConcurrencyGate, Layout, MediaItemProcessor, PipelineOrchestrator, Recovery, StageRunner,
};
use vmark::process::{ProgressDisplay, ProcessSupervisor};
use vmark::state::StateStore;
use vmark::storage::{PcsCliStorage, UploadSink, UploadSync};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "VMARK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory scanned for source videos
    #[arg(long, env = "VMARK_SOURCE_DIR")]
    source_dir: Option<PathBuf>,

    /// Root of all generated files
    #[arg(long, env = "VMARK_TARGET_DIR")]
    target_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Produce watermarked copies for every (or the selected) recipient
    Run {
        #[arg(short, long = "recipient")]
        recipients: Vec<String>,
    },
    /// Upload results that are missing from remote storage
    Upload {
        #[arg(short, long = "recipient")]
        recipients: Vec<String>,
    },
    /// Recover the invisible mark from a distributed copy
    Recover {
        #[arg(long)]
        metadata: PathBuf,
        #[arg(long)]
        video: PathBuf,
    },
    /// Show completed and pending items per recipient
    Status,
    /// Print the effective configuration
    Config,
}

fn select_recipients(all: Vec<Recipient>, wanted: &[String]) -> Vec<Recipient> {
    if wanted.is_empty() {
        return all;
    }
    for name in wanted {
        if !all.iter().any(|r| &r.name == name) {
            warn!(recipient = %name, "Unknown recipient, ignoring");
        }
    }
    all.into_iter()
        .filter(|r| wanted.contains(&r.name))
        .collect()
}

fn build_supervisor(config: &AppConfig) -> ProcessSupervisor {
    let display = if config.display.dedicated_lines {
        ProgressDisplay::stdout()
    } else {
        ProgressDisplay::disabled()
    };
    ProcessSupervisor::new(display).with_terminate_grace(config.timeouts.terminate_grace())
}

async fn run(config: AppConfig, recipients: &[String]) -> anyhow::Result<()> {
    let recipients = select_recipients(load_recipients(&config.paths.recipients_file)?, recipients);
    if recipients.is_empty() {
        warn!(path = %config.paths.recipients_file.display(), "No recipients to process");
        return Ok(());
    }
    let items = discover_items(&config)?;
    if items.is_empty() {
        warn!(path = %config.paths.source_dir.display(), "No source videos found");
        return Ok(());
    }

    let supervisor = build_supervisor(&config);
    let gate = ConcurrencyGate::new(config.concurrency.bounded_capacity);
    let runner = StageRunner::new(supervisor.clone(), gate);
    let state = Arc::new(StateStore::new(&config.paths.state_dir));
    let processor = Arc::new(MediaItemProcessor::from_config(&config, runner));

    let mut orchestrator = PipelineOrchestrator::new(state.clone(), processor)
        .with_retry_missed(config.concurrency.retry_missed);
    if config.upload.enabled {
        let storage = PcsCliStorage::new(supervisor, &config.upload)
            .with_timeouts(config.timeouts.upload_total(), config.timeouts.upload_idle());
        let sync = UploadSync::new(
            Arc::new(storage),
            state,
            Layout::from_config(&config),
            config.upload.clone(),
        );
        orchestrator = orchestrator.with_sink(Arc::new(UploadSink::new(Arc::new(sync))));
    }

    let report = orchestrator.run(&recipients, &items).await;
    println!(
        "processed {}, failed {}, skipped recipients {}, uploads {} ok / {} failed",
        report.processed(),
        report.failed(),
        report.skipped(),
        report.uploads_succeeded,
        report.uploads_failed
    );
    Ok(())
}

async fn upload(config: AppConfig, recipients: &[String]) -> anyhow::Result<()> {
    let recipients = select_recipients(load_recipients(&config.paths.recipients_file)?, recipients);
    let supervisor = build_supervisor(&config);
    let storage = PcsCliStorage::new(supervisor, &config.upload)
        .with_timeouts(config.timeouts.upload_total(), config.timeouts.upload_idle());
    let sync = UploadSync::new(
        Arc::new(storage),
        Arc::new(StateStore::new(&config.paths.state_dir)),
        Layout::from_config(&config),
        config.upload.clone(),
    );

    for recipient in &recipients {
        match sync.sync_recipient(&recipient.name).await {
            Ok(report) => println!(
                "{}: uploaded {}, failed {}, skipped {}",
                recipient.name,
                report.uploaded.len(),
                report.failed.len(),
                report.skipped
            ),
            Err(e) => error!(recipient = %recipient.name, error = %e, "Upload sync failed"),
        }
    }
    Ok(())
}

async fn recover(config: AppConfig, metadata: PathBuf, video: PathBuf) -> anyhow::Result<()> {
    let supervisor = build_supervisor(&config);
    let watermarker = CommandWatermarker::new(
        supervisor.clone(),
        &config.watermark,
        config.timeouts.tool_idle(),
    );
    let recovery = Recovery::new(
        Layout::from_config(&config),
        FfmpegCommands::new(config.encode.clone()),
        StageRunner::new(supervisor, ConcurrencyGate::new(config.concurrency.bounded_capacity)),
        Arc::new(watermarker),
        config.timeouts.ffmpeg_idle(),
    );
    let report = recovery
        .recover(&metadata, &video)
        .await
        .with_context(|| format!("recovering {}", video.display()))?;
    for path in &report.recovered {
        println!("{}", path.display());
    }
    if !report.failed.is_empty() {
        println!("failed frames: {:?}", report.failed);
    }
    Ok(())
}

async fn status(config: AppConfig) -> anyhow::Result<()> {
    let recipients = load_recipients(&config.paths.recipients_file)?;
    let items = discover_items(&config)?;
    let discovered: Vec<String> = items.iter().map(|item| item.id.clone()).collect();
    let state = StateStore::new(&config.paths.state_dir);

    for recipient in &recipients {
        let pending = state.pending(&recipient.name, &discovered).await?;
        let finished = state.is_finished(&recipient.name).await?;
        println!(
            "{:<24} completed {:>4}  pending {:>4}{}",
            recipient.name,
            discovered.len() - pending.len(),
            pending.len(),
            if finished { "  finished" } else { "" }
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = args.source_dir {
        config.paths.source_dir = dir;
    }
    if let Some(dir) = args.target_dir {
        config.paths.target_dir = dir;
    }

    if let Command::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let _guard = init_logging(
        &config.paths.log_dir,
        Verbosity::from_flags(args.verbose, args.quiet),
    )?;
    if let Err(e) = cleanup_old_logs(&config.paths.log_dir, LOG_RETENTION_DAYS).await {
        warn!(error = %e, "Failed to clean up old log files");
    }
    info!(version = env!("CARGO_PKG_VERSION"), "vmark starting");

    let command = args.command;
    let work = async move {
        match command {
            Command::Run { recipients } => run(config, &recipients).await,
            Command::Upload { recipients } => upload(config, &recipients).await,
            Command::Recover { metadata, video } => recover(config, metadata, video).await,
            Command::Status => status(config).await,
            Command::Config => Ok(()),
        }
    };

    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, completed items are kept and the next run resumes");
            Ok(())
        }
    }
}
