use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::warn;

use bootlog_core::{Aggregator, AggregatorConfig, FileSink, Sink};

/// Bootlog - collect module-tagged log lines from stdin and flush them to a file
///
/// Each input line is `module|dep1,dep2|message` or `module|message`.
#[derive(Parser, Debug)]
#[command(name = "bootlog")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Buffer size for log entries
    #[arg(long)]
    capacity: Option<usize>,

    /// Buffered entries that trigger a flush
    #[arg(long)]
    threshold: Option<usize>,

    /// Timer-driven flush interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// File the log lines are appended to
    #[arg(long, value_name = "PATH")]
    sink: Option<PathBuf>,

    /// File the module report is appended to (defaults to the sink)
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Skip writing the module report
    #[arg(long)]
    no_report: bool,
}

/// One parsed input line
#[derive(Debug, PartialEq, Eq)]
struct InputRecord<'a> {
    module: &'a str,
    dependencies: Option<&'a str>,
    message: &'a str,
}

/// Split `module|deps|message` or `module|message`
fn parse_line(line: &str) -> Option<InputRecord<'_>> {
    let mut parts = line.splitn(3, '|');
    let module = parts.next()?.trim();
    let second = parts.next()?;
    if module.is_empty() {
        return None;
    }

    Some(match parts.next() {
        Some(message) => InputRecord {
            module,
            dependencies: Some(second),
            message,
        },
        None => InputRecord {
            module,
            dependencies: None,
            message: second,
        },
    })
}

/// Decode one raw input line, replacing invalid UTF-8 and dropping the line ending
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Record every well-formed line of `input`, returning how many were skipped
async fn ingest<R: AsyncBufRead + Unpin>(aggregator: &Aggregator, mut input: R) -> Result<usize> {
    let mut raw = Vec::new();
    let mut skipped = 0usize;
    loop {
        raw.clear();
        if input.read_until(b'\n', &mut raw).await? == 0 {
            break;
        }

        let line = decode_line(&raw);
        let Some(record) = parse_line(&line) else {
            if !line.trim().is_empty() {
                skipped += 1;
            }
            continue;
        };
        let dependencies: Vec<&str> = record.dependencies.into_iter().collect();
        aggregator.record(record.module, &dependencies, record.message)?;
    }
    Ok(skipped)
}

/// Ingest `input`, then shut down whether or not reading succeeded
async fn collect<R: AsyncBufRead + Unpin>(aggregator: &Aggregator, input: R) -> Result<usize> {
    let ingested = ingest(aggregator, input).await;
    if let Err(e) = aggregator.shutdown().await {
        warn!(error = %e, "final flush failed");
    }
    ingested.context("Failed to ingest input")
}

fn build_config(args: &Args) -> Result<AggregatorConfig> {
    let mut config = match &args.config {
        Some(path) => AggregatorConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AggregatorConfig::default(),
    };

    if let Some(capacity) = args.capacity {
        config = config.with_capacity(capacity);
    }
    if let Some(threshold) = args.threshold {
        config = config.with_flush_threshold(threshold);
    }
    if let Some(interval_ms) = args.interval_ms {
        config = config.with_flush_interval(Duration::from_millis(interval_ms));
    }
    if let Some(sink) = &args.sink {
        config = config.with_sink_path(sink);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing for debugging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run_app(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run_app(args: Args) -> Result<()> {
    let config = build_config(&args)?;
    let sink_path = config.sink_path.clone();
    let aggregator = Aggregator::open(config)?;

    let skipped = collect(&aggregator, BufReader::new(tokio::io::stdin())).await?;

    if !args.no_report {
        let report_path = args.report.clone().unwrap_or(sink_path);
        let mut report_sink = FileSink::new(&report_path);
        report_sink
            .append(&aggregator.report())
            .and_then(|()| report_sink.flush())
            .with_context(|| format!("Failed to write report to {}", report_path.display()))?;
    }

    let stats = aggregator.stats();
    eprintln!(
        "recorded {} entries from {} modules: {} flushed, {} evicted, {} pending, {} malformed lines skipped",
        stats.recorded, stats.modules, stats.flushed, stats.evicted, stats.pending, skipped
    );

    Ok(())
}
