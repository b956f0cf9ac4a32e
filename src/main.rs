use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use revtally::client::MediaWikiClient;
use revtally::config::{
    FileConfig, DEFAULT_BATCH_SIZE, DEFAULT_ENDPOINT, DEFAULT_SLICE_PARALLELISM,
    DEFAULT_SLICE_SIZE, DEFAULT_WORKERS, FETCH_MAX_ATTEMPTS, REQUEST_TIMEOUT_SECS,
};
use revtally::fetch::RetryPolicy;
use revtally::models::EditTable;
use revtally::partition::ChunkLayout;
use revtally::pipeline::{Pipeline, RunConfig};
use revtally::report::{default_report_name, write_report_file, NamespaceCatalog};
use revtally::stats::PipelineStats;
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, Layer};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "revtally")]
#[command(about = "Count edits per user and namespace on a MediaWiki site")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write DEBUG and above to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and cache every revision chunk without counting
    Download {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Count cached chunks (fetching any still missing) and write the report
    Aggregate {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        report: ReportArgs,
    },
    /// Download, then aggregate
    Run {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        report: ReportArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Highest revision ID to cover
    #[arg(short, long)]
    total: u64,

    /// Directory for cached chunks and slice checkpoints
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// MediaWiki api.php URL (overrides the settings file)
    #[arg(long)]
    endpoint: Option<String>,

    /// JSON settings file with endpoint, credentials, headers and namespaces
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Revision IDs per API request
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: u64,

    /// Concurrent download workers
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Attempts per chunk before giving up
    #[arg(long, default_value_t = FETCH_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Timeout for a single API call in seconds
    #[arg(long, default_value_t = REQUEST_TIMEOUT_SECS)]
    timeout: u64,

    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args)]
struct ReportArgs {
    /// Revision IDs per slice checkpoint
    #[arg(long, default_value_t = DEFAULT_SLICE_SIZE)]
    slice_size: u64,

    /// Slices counted concurrently
    #[arg(long, default_value_t = DEFAULT_SLICE_PARALLELISM)]
    slice_parallelism: usize,

    /// Report path (default: editcount-<timestamp>.csv)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Discard slice checkpoints before counting
    #[arg(long)]
    clean: bool,
}

#[derive(Clone, Copy)]
enum Mode {
    Download,
    Aggregate,
    Run,
}

fn run_config(common: &CommonArgs, report: Option<&ReportArgs>) -> Result<RunConfig> {
    let layout = ChunkLayout::new(common.batch_size, common.total)?;
    let retry = RetryPolicy {
        max_attempts: common.max_attempts,
        request_timeout: Duration::from_secs(common.timeout),
        ..RetryPolicy::default()
    };

    Ok(RunConfig {
        data_dir: common.data_dir.clone(),
        layout,
        workers: common.workers,
        slice_size: report.map_or(DEFAULT_SLICE_SIZE, |r| r.slice_size),
        slice_parallelism: report.map_or(DEFAULT_SLICE_PARALLELISM, |r| r.slice_parallelism),
        retry,
        show_progress: !common.no_progress,
    })
}

fn execute(command: Commands) -> Result<()> {
    let (mode, common, report) = match command {
        Commands::Download { common } => (Mode::Download, common, None),
        Commands::Aggregate { common, report } => (Mode::Aggregate, common, Some(report)),
        Commands::Run { common, report } => (Mode::Run, common, Some(report)),
    };

    let file_config = match &common.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = run_config(&common, report.as_ref())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("revtally-worker")
        .enable_io()
        .enable_time()
        .build()?;
    rt.block_on(run(mode, common, report, file_config, config))
}

async fn run(
    mode: Mode,
    common: CommonArgs,
    report: Option<ReportArgs>,
    file_config: FileConfig,
    config: RunConfig,
) -> Result<()> {
    let endpoint = common
        .endpoint
        .or_else(|| file_config.endpoint.clone())
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let client = MediaWikiClient::new(
        endpoint,
        &file_config.headers,
        Duration::from_secs(common.timeout),
    )?;

    if let Some(credentials) = file_config.credentials() {
        client
            .login(&credentials)
            .await
            .with_context(|| format!("Login as {} failed", credentials.username))?;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping workers");
                cancel.cancel();
            }
        });
    }

    info!(endpoint = client.endpoint(), data_dir = ?config.data_dir, "Starting");
    let pipeline = Pipeline::new(config, Arc::new(client), cancel)?;

    if report.as_ref().is_some_and(|r| r.clean) {
        pipeline.slice_store().clear()?;
    }

    let start = Instant::now();
    let table = match mode {
        Mode::Download => {
            pipeline.download().await?;
            None
        }
        Mode::Aggregate => Some(pipeline.aggregate().await?),
        Mode::Run => Some(pipeline.run().await?),
    };
    let elapsed = start.elapsed();

    let mut report_path = None;
    if let (Some(table), Some(report)) = (&table, report) {
        let catalog = match file_config.namespaces {
            Some(labels) => NamespaceCatalog::new(labels),
            None => NamespaceCatalog::minecraft_wiki_zh(),
        };
        let path = report
            .output
            .unwrap_or_else(|| PathBuf::from(default_report_name(Local::now())));
        write_report_file(table, &catalog, &path)?;
        report_path = Some(path);
    }

    print_summary(pipeline.stats(), table.as_ref(), report_path, elapsed);
    Ok(())
}

fn print_summary(
    stats: &PipelineStats,
    table: Option<&EditTable>,
    report_path: Option<PathBuf>,
    elapsed: Duration,
) {
    println!();
    println!("=== Summary ===");
    println!("Total time:          {:.2}s", elapsed.as_secs_f64());
    println!();
    println!("Chunks fetched:      {}", stats.fetched());
    println!("Chunks cached:       {}", stats.cached());
    println!("Fetch retries:       {}", stats.retries());
    println!("Missing revisions:   {}", stats.missing());
    println!("Slices computed:     {}", stats.slices_computed());
    println!("Slices cached:       {}", stats.slices_cached());
    println!("Revisions counted:   {}", stats.counted());
    println!("Malformed records:   {}", stats.malformed());
    println!("Out of range:        {}", stats.out_of_range());
    if let Some(table) = table {
        println!();
        println!("Users:               {}", table.len());
        println!("Edits:               {}", table.total_edits());
    }
    if let Some(path) = report_path {
        println!("Report:              {}", path.display());
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let log_file = match cli.log_file.as_ref().map(File::create).transpose() {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error: failed to open log file: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let console = fmt::layer()
        .with_target(false)
        .with_filter(LevelFilter::from_level(level));
    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .with_filter(LevelFilter::DEBUG)
    });
    let subscriber = tracing_subscriber::registry().with(console).with(file_layer);

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    match execute(cli.command) {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
