//! obsframe export binary
//!
//! Aggregates a JSON series dump into one Parquet artifact on the storage
//! backend configured through the environment.

use obsframe::aggregate::{AggregationConfig, AggregationFunction, IntegrityPolicy};
use obsframe::config::ComponentFactory;
use obsframe::context::ExportContext;
use obsframe::encoder::ParquetEncoder;
use obsframe::pipeline::{ExportRequest, Pipeline};
use obsframe::series::{InMemorySeriesReader, LabelMatcher, ReadParams};
use obsframe::storage::Destination;
use obsframe::telemetry::{init_tracing, LogFormat};
use obsframe::{Error, Result, StorageConfig};

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

/// Export aggregated time series to a columnar file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON series dump: [{"labels": {..}, "samples": [[ts_ms, value], ..]}]
    #[arg(long)]
    input: PathBuf,

    /// Series selector, e.g. __name__=up or job=~"api.*" (repeatable)
    #[arg(long = "match")]
    matchers: Vec<String>,

    /// Start of the export range, RFC 3339 (inclusive; default: Unix epoch)
    #[arg(long)]
    min_time: Option<String>,

    /// End of the export range, RFC 3339 (exclusive; default: now)
    #[arg(long)]
    max_time: Option<String>,

    /// Aggregation window in seconds
    #[arg(long, default_value = "60")]
    window_secs: u64,

    /// Aggregation functions in column order
    #[arg(long, value_delimiter = ',', default_value = "count,sum,min,max")]
    functions: Vec<String>,

    /// Destination key of the artifact
    #[arg(long, env = "EXPORT_DESTINATION")]
    destination: String,

    /// Give up after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Series aggregated concurrently
    #[arg(long, default_value = "1")]
    parallelism: usize,

    /// What to do with series whose samples go backwards (abort, skip)
    #[arg(long, default_value = "abort")]
    on_integrity_error: String,

    /// Log level
    #[arg(long = "log.level", default_value = "info")]
    log_level: String,

    /// Log format (logfmt, json)
    #[arg(long = "log.format", default_value = "logfmt")]
    log_format: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let format = match args.log_format.parse::<LogFormat>() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_tracing(&args.log_level, format) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(stage = e.stage().map(|s| s.as_str()), error = %e, "Export failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let request = build_request(&args)?;
    let storage = StorageConfig::from_env()?;
    storage.ensure_durable()?;
    let backend = ComponentFactory::create_storage_backend(&storage)?;
    let reader = InMemorySeriesReader::from_json_file(&args.input).await?;

    info!(
        input = %args.input.display(),
        series = reader.len(),
        backend = %backend.describe(),
        "Loaded series dump"
    );

    let pipeline = Pipeline::new(Arc::new(reader), backend, Arc::new(ParquetEncoder::new()));

    let cancel = CancellationToken::new();
    let mut ctx = ExportContext::new(cancel.clone())
        .with_span(info_span!("export", destination = %request.destination));
    if let Some(secs) = args.timeout_secs {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }

    let signals = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            warn!("Received shutdown signal, cancelling export");
            cancel.cancel();
        }
    });

    let outcome = pipeline.run(&ctx, &request).await;
    signals.abort();

    let summary = outcome?;
    info!(summary = %summary, "Done");
    Ok(())
}

fn build_request(args: &Args) -> Result<ExportRequest> {
    let matchers = args
        .matchers
        .iter()
        .map(|raw| raw.parse::<LabelMatcher>())
        .collect::<Result<Vec<_>>>()?;

    let min_time_ms = match &args.min_time {
        Some(raw) => parse_time(raw)?,
        None => 0,
    };
    let max_time_ms = match &args.max_time {
        Some(raw) => parse_time(raw)?,
        None => chrono::Utc::now().timestamp_millis(),
    };
    let params = ReadParams::new(matchers, min_time_ms, max_time_ms)?;

    let functions = args
        .functions
        .iter()
        .map(|raw| raw.parse::<AggregationFunction>())
        .collect::<Result<Vec<_>>>()?;
    let aggregation = AggregationConfig::new(Duration::from_secs(args.window_secs), functions)?
        .with_parallelism(args.parallelism)
        .with_integrity_policy(args.on_integrity_error.parse::<IntegrityPolicy>()?);

    let destination = Destination::new(args.destination.clone())?;

    Ok(ExportRequest::new(params, aggregation, destination))
}

fn parse_time(raw: &str) -> Result<i64> {
    chrono::DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.timestamp_millis())
        .map_err(|e| Error::Config(format!("invalid time '{}': {}", raw, e)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
