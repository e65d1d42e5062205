//! Vehicle telemetry ingestion utility

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};

use vehicle_ingest::{
    config::{AppConfig, Overrides},
    database::Database,
    errors::IngestError,
    scheduler::{FanOutScheduler, JobReport},
    source::{FileSourceProvider, ReadPolicy},
};

/// Load a delimited vehicle telemetry file into PostgreSQL
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Input file; overrides VEHICLE_INGEST__INPUT__FILE
    input: Option<PathBuf>,

    /// Number of lanes
    #[arg(long)]
    lanes: Option<usize>,

    /// Lanes running at the same time
    #[arg(long)]
    concurrency: Option<usize>,

    /// Records per bulk write
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Leading lines to skip, e.g. 1 for a header row
    #[arg(long)]
    skip_lines: Option<u64>,

    /// Stop remaining lanes as soon as one fails
    #[arg(long)]
    fail_fast: bool,

    /// Every lane reads the whole file instead of its own partition
    #[arg(long)]
    full_pass: bool,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Print the job report as JSON on stdout
    #[arg(long)]
    json_report: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            input_file: self.input.clone(),
            lines_to_skip: self.skip_lines,
            read_policy: self.full_pass.then_some(ReadPolicy::FullPass),
            lanes: self.lanes,
            concurrency: self.concurrency,
            chunk_size: self.chunk_size,
            fail_fast: self.fail_fast.then_some(true),
            database_url: self.database_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    #[cfg(feature = "dotenv")]
    dotenvy::dotenv().ok();

    let started = Instant::now();
    let result = run(Args::parse()).await;
    info!(
        "Runtime: {} seconds.",
        started.elapsed().as_millis() as f64 / 1000.0
    );

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(IngestError::Config(e)) => {
            error!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), IngestError> {
    let config = AppConfig::load_with(args.overrides())?;
    config.validate()?;
    let input = config.input.resolve()?.to_path_buf();

    let database = Database::connect(&config.database).await?;
    let provider = FileSourceProvider::new(input, config.input.read_policy)
        .lines_to_skip(config.input.lines_to_skip);
    let scheduler =
        FanOutScheduler::new(config.pipeline.clone(), Arc::new(provider), Arc::new(database));

    match scheduler.run().await {
        Ok(report) => {
            print_report(args.json_report, &report)?;
            Ok(())
        }
        Err(e) => {
            print_report(args.json_report, &e.report)?;
            Err(e.into())
        }
    }
}

fn print_report(enabled: bool, report: &JobReport) -> Result<(), IngestError> {
    if enabled {
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    Ok(())
}
