//! CLI for the fluxline write pipeline.
//!
//! Streams line-protocol records from a file or stdin into InfluxDB through
//! the buffered pipeline and reports write outcomes.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use fluxline::{
    BatchOptions, ContentEncoding, HttpConfig, HttpTransport, WriteApi, WriteDefaults, WriteEvent,
    WritePrecision,
};
use tracing_subscriber::EnvFilter;

/// fluxline: buffered line-protocol writer for InfluxDB.
#[derive(Parser)]
#[command(name = "fluxline", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Write line-protocol records from a file or stdin.
    Write(WriteArgs),

    /// Print the default batch options as JSON.
    Defaults,
}

/// Arguments of `fluxline write`.
#[derive(clap::Args)]
struct WriteArgs {
    /// Server URL.
    #[arg(long, env = "INFLUX_URL", default_value = "http://localhost:8086")]
    url: String,

    /// API token.
    #[arg(long, env = "INFLUX_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Destination organization.
    #[arg(long, env = "INFLUX_ORG")]
    org: String,

    /// Destination bucket.
    #[arg(long, env = "INFLUX_BUCKET")]
    bucket: String,

    /// Timestamp precision of the records (ns, us, ms, s).
    #[arg(long, default_value = "ns")]
    precision: WritePrecision,

    /// Input file; reads stdin when omitted.
    #[arg(long)]
    file: Option<PathBuf>,

    /// JSON file with batch options; missing keys take the defaults.
    #[arg(long)]
    options: Option<PathBuf>,

    /// Overrides the batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Overrides the flush interval in milliseconds.
    #[arg(long)]
    flush_interval_ms: Option<u64>,

    /// Overrides the jitter interval in milliseconds.
    #[arg(long)]
    jitter_interval_ms: Option<u64>,

    /// Overrides the maximum number of retries.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Default tag added to every point, as `key=value`. Repeatable.
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,

    /// Gzip request bodies.
    #[arg(long)]
    gzip: bool,

    /// Request timeout in seconds.
    #[arg(long, default_value = "10")]
    timeout_secs: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Write(args) => cmd_write(&args),
        Commands::Defaults => cmd_defaults(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `fluxline write`.
fn cmd_write(args: &WriteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let options = batch_options(args)?;
    options.validate()?;

    let mut defaults = WriteDefaults::default()
        .with_bucket(&args.bucket)
        .with_organization(&args.org);
    for (key, value) in &args.tags {
        defaults = defaults.with_default_tag(key, value);
    }

    let mut http = HttpConfig::new(&args.url)
        .with_timeout(Duration::from_secs(args.timeout_secs))
        .with_header("User-Agent", concat!("fluxline-cli/", env!("CARGO_PKG_VERSION")));
    if let Some(token) = &args.token {
        http = http.with_token(token);
    }
    let transport = HttpTransport::new(http)?;

    let encoding = if args.gzip {
        ContentEncoding::Gzip
    } else {
        ContentEncoding::Identity
    };

    let input: Box<dyn BufRead> = match &args.file {
        Some(path) => Box::new(BufReader::new(open_input(path)?)),
        None => Box::new(std::io::stdin().lock()),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let _guard = runtime.enter();

    let api = WriteApi::builder(Arc::new(transport))
        .with_batch_options(options)
        .with_defaults(defaults)
        .with_content_encoding(encoding)
        .build()?;

    let tally = Arc::new(Tally::default());
    let sink = Arc::clone(&tally);
    api.events().add_listener(move |event| sink.record(event));

    let start = Instant::now();
    let mut lines = 0usize;
    for line in input.lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        api.write_record(args.precision, &line)?;
        lines += 1;
    }

    tracing::debug!(lines, "input drained, closing pipeline");
    runtime.block_on(api.close());
    let elapsed = start.elapsed();

    let written = tally.written_lines.load(Ordering::Relaxed);
    let failed = tally.failed_lines.load(Ordering::Relaxed);
    let dropped = tally.dropped_lines.load(Ordering::Relaxed);

    println!("Records read:    {lines}");
    println!("Lines written:   {written}");
    println!("Lines failed:    {failed}");
    println!("Lines dropped:   {dropped}");
    println!("Retries:         {}", tally.retries.load(Ordering::Relaxed));
    println!("Elapsed:         {:.3}s", elapsed.as_secs_f64());

    if failed > 0 || dropped > 0 {
        return Err(format!("{} lines were not written", failed + dropped).into());
    }
    Ok(())
}

/// Implements `fluxline defaults`.
fn cmd_defaults() -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(&BatchOptions::default())?;
    println!("{json}");
    Ok(())
}

/// Counts outcomes reported by the pipeline.
#[derive(Default)]
struct Tally {
    written_lines: AtomicUsize,
    failed_lines: AtomicUsize,
    dropped_lines: AtomicUsize,
    retries: AtomicUsize,
}

impl Tally {
    fn record(&self, event: &WriteEvent) {
        match event {
            WriteEvent::Success(success) => {
                self.written_lines
                    .fetch_add(count_lines(&success.line_protocol), Ordering::Relaxed);
            }
            WriteEvent::Error(error) => {
                eprintln!(
                    "write to {}/{} failed: {}",
                    error.organization, error.bucket, error.cause
                );
                self.failed_lines
                    .fetch_add(count_lines(&error.line_protocol), Ordering::Relaxed);
            }
            WriteEvent::RetriableError(retry) => {
                eprintln!(
                    "write failed, retrying in {:?} ({} attempts left): {}",
                    retry.retry_delay, retry.attempts_remaining, retry.cause
                );
                self.retries.fetch_add(1, Ordering::Relaxed);
            }
            WriteEvent::Backpressure(backpressure) => {
                eprintln!(
                    "buffer full, dropped {} lines for {}/{}",
                    backpressure.dropped_lines, backpressure.organization, backpressure.bucket
                );
                self.dropped_lines
                    .fetch_add(backpressure.dropped_lines, Ordering::Relaxed);
            }
        }
    }
}

fn count_lines(payload: &str) -> usize {
    payload.split('\n').count()
}

/// Loads options from `--options` and applies the flag overrides.
fn batch_options(args: &WriteArgs) -> Result<BatchOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.options {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read options '{}': {e}", path.display()))?;
            serde_json::from_str(&data)?
        }
        None => BatchOptions::default(),
    };

    if let Some(batch_size) = args.batch_size {
        options = options.with_batch_size(batch_size);
    }
    if let Some(ms) = args.flush_interval_ms {
        options = options.with_flush_interval(Duration::from_millis(ms));
    }
    if let Some(ms) = args.jitter_interval_ms {
        options = options.with_jitter_interval(Duration::from_millis(ms));
    }
    if let Some(max_retries) = args.max_retries {
        options = options.with_max_retries(max_retries);
    }
    Ok(options)
}

fn open_input(path: &Path) -> Result<std::fs::File, Box<dyn std::error::Error>> {
    std::fs::File::open(path)
        .map_err(|e| format!("cannot open input '{}': {e}", path.display()).into())
}

/// Parses a `key=value` tag argument.
fn parse_tag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}
