//! CLI entry point for the bus stop-visit pipeline.
//!
//! `process` reconciles a range of service dates from a local input tree and
//! publishes the stop visits; `capture` samples a live GTFS-RT vehicle
//! positions feed into that input tree.

use anyhow::{Context, Result, bail};
use bus_events::{
    config::PipelineConfig,
    error::PipelineError,
    fetch::{BasicClient, fetch_bytes},
    input::LocalSource,
    output::{append_observations, append_record, output_exists, upload_files, write_date_outputs},
    parser::{observations_from_feed, parse_feed},
    pipeline::process_service_date,
    service_date::{date_range, service_date_of},
    stats::RunStats,
};
use bytes::Bytes;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "bus_events")]
#[command(about = "Reconcile bus stop visits from schedule, AVL and GTFS-RT sources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a range of service dates
    Process {
        /// First service date (YYYY-MM-DD); defaults to yesterday
        #[arg(long)]
        start_date: Option<NaiveDate>,

        /// Last service date, inclusive; defaults to the start date
        #[arg(long)]
        end_date: Option<NaiveDate>,

        /// Root of the partitioned input files
        #[arg(short, long, default_value = "data")]
        input_dir: String,

        /// Directory to write stop visits and the runs log to
        #[arg(short, long, default_value = "output")]
        output_dir: String,

        /// Optional: S3 bucket name to upload outputs to (e.g., "my-bucket")
        #[arg(long)]
        s3_bucket: Option<String>,

        /// Gzip compress stop-visit CSV files
        #[arg(long, default_value_t = false)]
        gzip: bool,

        /// Maximum number of service dates processed at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// JSON pipeline configuration file
        #[arg(long)]
        config: Option<String>,

        /// Reprocess dates whose output already exists
        #[arg(long, default_value_t = false)]
        backfill: bool,
    },
    /// Sample a GTFS-RT vehicle positions feed into the input tree
    Capture {
        /// Path to file or URL to fetch
        #[arg(long, value_name = "FILE_OR_URL")]
        url: String,

        /// Root of the partitioned input files
        #[arg(short, long, default_value = "data")]
        output_dir: String,

        /// Sample rate: query the feed every X seconds
        #[arg(short = 'r', long, default_value_t = 30)]
        sample_rate: u64,

        /// Number of samples to collect (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 1)]
        num_samples: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/bus_events.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("bus_events.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Process {
            start_date,
            end_date,
            input_dir,
            output_dir,
            s3_bucket,
            gzip,
            concurrency,
            config,
            backfill,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::load(&path)
                    .with_context(|| format!("loading config {path}"))?,
                None => PipelineConfig::default(),
            };
            let start_date = start_date.unwrap_or_else(|| {
                service_date_of(Utc::now(), config.timezone, config.service_day_start_hour)
                    - Duration::days(1)
            });
            let end_date = end_date.unwrap_or(start_date);

            process_dates(
                config,
                start_date,
                end_date,
                &input_dir,
                &output_dir,
                s3_bucket,
                gzip,
                concurrency,
                backfill,
            )
            .await?;
        }
        Commands::Capture {
            url,
            output_dir,
            sample_rate,
            num_samples,
        } => {
            capture(&url, &output_dir, sample_rate, num_samples).await?;
        }
    }

    Ok(())
}

/// Loads, reconciles and publishes one service date. Runs on a blocking
/// worker.
fn run_date(
    source: &LocalSource,
    config: &PipelineConfig,
    output_dir: &Path,
    service_date: NaiveDate,
    gzip: bool,
) -> Result<(RunStats, Vec<(PathBuf, String)>)> {
    let inputs = source.load(service_date, config)?;
    let outcome = process_service_date(service_date, &inputs, config)?;
    let files = write_date_outputs(output_dir, &outcome, config.schema_version, gzip)?;
    Ok((RunStats::from_outcome(&outcome, config.schema_version), files))
}

fn error_kind(e: &anyhow::Error) -> &'static str {
    e.downcast_ref::<PipelineError>()
        .map(PipelineError::kind)
        .unwrap_or("output_error")
}

/// Processes every service date in the range, at most `concurrency` at a
/// time. A failing date is logged and recorded in the runs log; the
/// remaining dates still run.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(
    skip(config, s3_bucket, gzip),
    fields(start_date = %start_date, end_date = %end_date, concurrency, backfill)
)]
async fn process_dates(
    config: PipelineConfig,
    start_date: NaiveDate,
    end_date: NaiveDate,
    input_dir: &str,
    output_dir: &str,
    s3_bucket: Option<String>,
    gzip: bool,
    concurrency: usize,
    backfill: bool,
) -> Result<()> {
    if end_date < start_date {
        bail!("end date {end_date} is before start date {start_date}");
    }
    if concurrency == 0 {
        bail!("concurrency must be at least 1");
    }
    config.validate()?;

    let s3_client = if s3_bucket.is_some() {
        let aws_config = aws_config::load_from_env().await;
        Some(aws_sdk_s3::Client::new(&aws_config))
    } else {
        None
    };
    if let Some(ref bucket) = s3_bucket {
        info!(bucket = %bucket, "S3 upload enabled");
    }

    let output_dir = PathBuf::from(output_dir);
    std::fs::create_dir_all(&output_dir)?;

    let config = Arc::new(config);
    let source = Arc::new(LocalSource::new(input_dir));
    let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));

    let mut tasks = vec![];
    let mut skipped = 0;

    for service_date in date_range(start_date, end_date) {
        if !backfill && output_exists(&output_dir, config.schema_version, service_date) {
            debug!(%service_date, "Output exists, skipping");
            skipped += 1;
            continue;
        }

        let sem = semaphore.clone();
        let config = config.clone();
        let source = source.clone();
        let output_dir = output_dir.clone();

        let date_span = tracing::info_span!("process_service_date", service_date = %service_date);

        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire_owned().await?;
                let span = tracing::Span::current();
                tokio::task::spawn_blocking(move || {
                    span.in_scope(|| run_date(&source, &config, &output_dir, service_date, gzip))
                })
                .await?
            }
            .instrument(date_span),
        );

        tasks.push((service_date, task));
    }

    info!(dates = tasks.len(), skipped, "Service dates scheduled");

    let runs_path = output_dir.join("runs.csv");
    let mut failures = 0;

    // Wait for all tasks; the runs log is appended in date order
    for (service_date, task) in tasks {
        let stats = match task.await {
            Ok(Ok((stats, files))) => {
                if let (Some(s3), Some(bucket)) = (&s3_client, &s3_bucket) {
                    if let Err(e) = upload_files(s3, bucket, &files).await {
                        error!(%service_date, error = %e, "Failed to upload outputs");
                    }
                }
                info!(%service_date, valid = stats.valid_rows, rejected = stats.rejected_rows, "Service date complete");
                stats
            }
            Ok(Err(e)) => {
                failures += 1;
                error!(%service_date, error = %e, "Service date failed");
                RunStats::from_error(service_date, error_kind(&e), &e.to_string())
            }
            Err(e) => {
                failures += 1;
                error!(%service_date, error = %e, "Service date task aborted");
                RunStats::from_error(service_date, "task_error", &e.to_string())
            }
        };
        append_record(&runs_path, &stats)?;
    }

    info!(failures, runs = %runs_path.display(), "Finished processing service dates");
    Ok(())
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(skip(client), fields(source = %url))]
async fn fetcher(client: &BasicClient, url: &str) -> Result<Bytes> {
    let bytes = if url.starts_with("http") {
        fetch_bytes(client, url).await?
    } else {
        Bytes::from(std::fs::read(url).with_context(|| format!("reading {url}"))?)
    };
    Ok(bytes)
}

/// Samples a vehicle positions feed at a fixed interval, appending every
/// position to the GTFS-RT input partitions.
#[tracing::instrument(fields(url, output_dir, sample_rate, num_samples))]
async fn capture(url: &str, output_dir: &str, sample_rate: u64, num_samples: usize) -> Result<()> {
    let client = BasicClient::new(std::time::Duration::from_secs(30))?;
    let partition_dir = Path::new(output_dir).join("gtfs_rt");
    std::fs::create_dir_all(&partition_dir)?;

    if num_samples == 0 {
        info!(sample_rate, "Sampling infinitely. Press Ctrl+C to stop.");
    } else {
        info!(num_samples, sample_rate, "Starting sample collection");
    }

    let mut sample_count = 0;

    loop {
        // Check if we've reached the sample limit (0 = infinite)
        if num_samples > 0 && sample_count >= num_samples {
            break;
        }
        sample_count += 1;

        let fetch_start = std::time::Instant::now();
        match fetcher(&client, url).await {
            Ok(bytes) => {
                let elapsed = fetch_start.elapsed();
                if elapsed.as_secs() > 15 {
                    warn!(elapsed_secs = elapsed.as_secs(), "Feed fetch was slow");
                }
                debug!(bytes = bytes.len(), "Feed bytes received, parsing");
                match parse_feed(&bytes) {
                    Ok(feed) => {
                        let observations = observations_from_feed(&feed);
                        let written = append_observations(&partition_dir, &observations)?;
                        info!(
                            sample = sample_count,
                            entity_count = feed.entity.len(),
                            written,
                            "Feed sample captured"
                        );
                    }
                    Err(e) => error!(error = %e, "Feed parse failed"),
                }
            }
            Err(e) => error!(error = %e, "Feed fetch failed"),
        }

        // If not the last sample, wait before next iteration
        if num_samples == 0 || sample_count < num_samples {
            tokio::time::sleep(tokio::time::Duration::from_secs(sample_rate)).await;
        }
    }

    info!(output_dir, "Finished capturing feed");
    Ok(())
}
