use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crawl_dedup::cancel::{install_interrupt_handler, CancelToken};
use crawl_dedup::document::discover_batches;
use crawl_dedup::index::checker::source_key;
use crawl_dedup::index::open_index;
use crawl_dedup::jobs::{open_jobs, Stage};
use crawl_dedup::{AppConfig, DedupWorker};

#[derive(Parser)]
#[command(name = "dedup-worker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Near-duplicate removal worker for crawled text batches")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long, global = true, env = "DEDUP_CONFIG", default_value = "dedup.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process pending dedup jobs
    Run {
        /// Keep polling for new jobs every N seconds instead of exiting when idle
        #[arg(long)]
        poll_secs: Option<u64>,
    },
    /// Enqueue every batch file under the input root
    Enqueue,
    /// Show job counts per state
    Status,
    /// Return a PROCESSING job to PENDING
    Release { job_id: i64 },
    /// Delete the index records of one batch file, e.g. after its unique
    /// partition was lost
    RemoveSource {
        /// Batch file path relative to the output roots, as stored in the index
        source_path: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn execute(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Run { poll_secs } => {
            let cancel = CancelToken::new();
            install_interrupt_handler(&cancel)?;
            let worker = DedupWorker::open(&config, cancel).context("starting worker")?;
            let summary = worker.run(poll_secs.map(Duration::from_secs))?;
            println!(
                "finished={} failed={} released={}",
                summary.finished, summary.failed, summary.released
            );
        }
        Commands::Enqueue => {
            let jobs = open_jobs(&config.store).context("opening job store")?;
            let batches = discover_batches(&config.paths.input_root)
                .with_context(|| format!("scanning {}", config.paths.input_root.display()))?;
            let mut added = 0usize;
            for rel in &batches {
                if jobs.enqueue(Stage::Dedup, &source_key(rel))? {
                    added += 1;
                }
            }
            info!(found = batches.len(), added, "enqueued batches");
            println!("{} of {} batches enqueued", added, batches.len());
        }
        Commands::Status => {
            let jobs = open_jobs(&config.store).context("opening job store")?;
            let counts = jobs.counts(Stage::Dedup)?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Release { job_id } => {
            let jobs = open_jobs(&config.store).context("opening job store")?;
            jobs.release(job_id)
                .with_context(|| format!("releasing job {}", job_id))?;
            println!("job {} is pending again", job_id);
        }
        Commands::RemoveSource { source_path } => {
            let index = open_index(&config.store, config.dedup.num_bands)
                .context("opening duplicate index")?;
            let removed = index
                .remove_source(&source_path)
                .with_context(|| format!("removing records of {}", source_path))?;
            info!(source_path = %source_path, removed, "index records removed");
            println!("{} records removed for {}", removed, source_path);
        }
    }
    Ok(())
}
