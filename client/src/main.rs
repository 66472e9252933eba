//! netprobe - ping and iperf3 measurement runner
//!
//! Runs network probes, stores their parsed results, encodes them as line
//! protocol and optionally uploads them to InfluxDB.

mod config;
mod encoder;
mod metrics;
mod output;
mod parameter;
mod parser;
mod pipeline;
mod runner;
mod storage;
mod upload;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parameter::{ProbeKind, ProbeParameter, TestInput};
use pipeline::{Pipeline, PipelineDeps};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long buffered uploads may take to flush before exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "netprobe")]
#[command(version)]
#[command(about = "Network measurement runner for ping and iperf3", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "netprobe.toml")]
    config: PathBuf,

    /// Debug logging and per-sample status output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a JSON test plan
    Run {
        #[arg(long)]
        plan: PathBuf,
    },

    /// Run a single ping test
    Ping {
        destination: String,
        #[arg(long)]
        count: Option<u32>,
        /// Seconds between requests
        #[arg(long)]
        interval: Option<f64>,
        /// Seconds to wait for each reply
        #[arg(long)]
        timeout: Option<u32>,
        #[arg(long)]
        packet_size: Option<u32>,
        /// Overall limit in seconds
        #[arg(long)]
        deadline: Option<u32>,
    },

    /// Run a single iperf3 test
    Iperf3 {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        server: bool,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        time: Option<u32>,
        /// up, down or bidir
        #[arg(long)]
        direction: Option<String>,
        #[arg(long)]
        udp: bool,
        /// e.g. 10M; a bare number means Mbit/s
        #[arg(long)]
        bitrate: Option<String>,
        #[arg(long)]
        streams: Option<u32>,
    },

    /// Encode and upload runs left unfinished by an earlier invocation
    Resume,

    /// Upload existing line protocol files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Re-parse a raw probe output file and print its events as JSON
    Parse {
        /// ping or iperf3
        #[arg(long)]
        probe: String,
        file: PathBuf,
    },

    /// Export run summaries as CSV
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Time range: --last 24h, 7d, etc.
        #[arg(long)]
        last: Option<String>,

        /// Start time for range: YYYY-MM-DD HH:MM
        #[arg(long)]
        start: Option<String>,

        /// End time for range: YYYY-MM-DD HH:MM
        #[arg(long)]
        end: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = config::Config::load(&args.config)?;

    let level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                level
                    .parse()
                    .with_context(|| format!("Invalid log level {:?}", level))?,
            ),
        )
        .init();

    info!("netprobe v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", args.config);

    match &args.command {
        Command::Run { plan } => {
            let contents = std::fs::read_to_string(plan)
                .with_context(|| format!("Failed to read test plan {:?}", plan))?;
            let inputs = parameter::parse_plan(&contents, &config)?;
            info!("Test plan has {} runnable tests", inputs.len());
            run_tests(&config, inputs, args.verbose).await
        }
        Command::Ping {
            destination,
            count,
            interval,
            timeout,
            packet_size,
            deadline,
        } => {
            let mut params = Map::new();
            params.insert(parameter::ping::DESTINATION.into(), json!(destination));
            insert_opt(&mut params, parameter::ping::COUNT, *count);
            insert_opt(&mut params, parameter::ping::INTERVAL, *interval);
            insert_opt(&mut params, parameter::ping::TIMEOUT, *timeout);
            insert_opt(&mut params, parameter::ping::PACKET_SIZE, *packet_size);
            insert_opt(&mut params, parameter::ping::DEADLINE, *deadline);
            let input = single_test(&config, ProbeKind::Ping, &params)?;
            run_tests(&config, vec![input], args.verbose).await
        }
        Command::Iperf3 {
            host,
            server,
            port,
            time,
            direction,
            udp,
            bitrate,
            streams,
        } => {
            use parameter::iperf3 as keys;

            let mut params = Map::new();
            insert_opt(&mut params, keys::HOST, host.clone());
            if *server {
                params.insert(keys::SERVER.into(), json!(true));
            }
            insert_opt(&mut params, keys::PORT, *port);
            insert_opt(&mut params, keys::TIME, *time);
            insert_opt(&mut params, keys::DIRECTION, direction.clone());
            if *udp {
                params.insert(keys::PROTOCOL.into(), json!("udp"));
            }
            insert_opt(&mut params, keys::BITRATE, bitrate.clone());
            insert_opt(&mut params, keys::STREAMS, *streams);
            let input = single_test(&config, ProbeKind::Iperf3, &params)?;
            run_tests(&config, vec![input], args.verbose).await
        }
        Command::Resume => run_resume(&config, args.verbose).await,
        Command::Upload { files } => run_upload(&config, files, args.verbose).await,
        Command::Parse { probe, file } => run_parse(probe, file).await,
        Command::Export {
            output,
            last,
            start,
            end,
        } => run_export(&config, output.clone(), last.as_deref(), start.as_deref(), end.as_deref()),
    }
}

fn insert_opt<T: Into<Value>>(params: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        params.insert(key.to_string(), value.into());
    }
}

fn single_test(
    config: &config::Config,
    kind: ProbeKind,
    params: &Map<String, Value>,
) -> Result<TestInput> {
    let merged = config.merged_params(kind.as_str(), params);
    let parameter = ProbeParameter::from_map(kind, &merged)
        .with_context(|| format!("Invalid {} parameters", kind))?;
    Ok(TestInput::new(parameter))
}

async fn start_pipeline(config: &config::Config) -> Result<Pipeline> {
    info!("Database: {:?}", config.general.database_path);
    let db = storage::Database::new(&config.general.database_path)?;
    db.initialize()?;

    let sink: Option<Arc<dyn upload::Sink>> = if config.influx.enabled {
        info!("Uploading to {} (bucket {})", config.influx.url, config.influx.bucket);
        Some(Arc::new(upload::InfluxSink::new(&config.influx)?))
    } else {
        None
    };

    Pipeline::start(PipelineDeps {
        config: config.clone(),
        db: Arc::new(db),
        launcher: Arc::new(runner::TokioLauncher),
        sink,
    })
    .await
}

async fn run_tests(config: &config::Config, inputs: Vec<TestInput>, verbose: bool) -> Result<()> {
    let pipeline = start_pipeline(config).await?;
    let printer = tokio::spawn(output::StatusPrinter::new(verbose).run(pipeline.events()));

    let handles: Vec<_> = inputs
        .into_iter()
        .map(|input| pipeline.submit(input))
        .collect();

    let join = join_runs(handles);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(join, interrupted);
    let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
    progress.tick().await;
    let finished = loop {
        tokio::select! {
            outcomes = &mut join => break Some(outcomes),
            _ = &mut interrupted => break None,
            _ = progress.tick() => {
                for (test_uuid, name, snapshot) in pipeline.live_metrics() {
                    if snapshot.count > 0 {
                        info!("{} {} so far: {}", test_uuid, name, output::describe(name, &snapshot));
                    }
                }
            }
        }
    };
    let outcomes = match finished {
        Some(outcomes) => outcomes,
        None => {
            warn!("Interrupted, cancelling {} runs", pipeline.in_flight());
            pipeline.cancel_all();
            join.await
        }
    };

    let mut failed = 0;
    for outcome in &outcomes {
        match outcome {
            Ok(outcome) if outcome.state == runner::RunState::Succeeded => {
                for (name, snapshot) in &outcome.metrics {
                    if snapshot.count > 0 {
                        info!(
                            "{} {}: {}",
                            outcome.test_uuid,
                            name,
                            output::describe(*name, snapshot)
                        );
                    }
                }
            }
            Ok(_) => failed += 1,
            Err(e) => {
                error!("Run failed: {:#}", e);
                failed += 1;
            }
        }
    }

    pipeline.shutdown(DRAIN_TIMEOUT).await;
    printer.abort();

    info!("{} of {} runs succeeded", outcomes.len() - failed, outcomes.len());
    if failed > 0 {
        anyhow::bail!("{} runs failed", failed);
    }
    Ok(())
}

/// Await every run handle, in submission order
async fn join_runs(
    handles: Vec<tokio::task::JoinHandle<Result<runner::RunOutcome>>>,
) -> Vec<Result<runner::RunOutcome>> {
    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("Run task panicked: {}", e)),
        });
    }
    outcomes
}

async fn run_resume(config: &config::Config, verbose: bool) -> Result<()> {
    info!("Resuming unfinished work...");
    let pipeline = start_pipeline(config).await?;
    let printer = tokio::spawn(output::StatusPrinter::new(verbose).run(pipeline.events()));
    pipeline.shutdown(DRAIN_TIMEOUT).await;
    printer.abort();
    Ok(())
}

async fn run_upload(config: &config::Config, files: &[PathBuf], verbose: bool) -> Result<()> {
    if !config.influx.enabled {
        anyhow::bail!("Upload requires [influx] enabled = true in the configuration");
    }
    let pipeline = start_pipeline(config).await?;
    let printer = tokio::spawn(output::StatusPrinter::new(verbose).run(pipeline.events()));

    for file in files {
        let points = encoder::read_points(file)
            .await
            .with_context(|| format!("Failed to read {:?}", file))?;
        info!("Queued {} points from {:?}", points.len(), file);
        pipeline.upload(points);
    }

    pipeline.shutdown(DRAIN_TIMEOUT).await;
    printer.abort();
    Ok(())
}

async fn run_parse(probe: &str, file: &PathBuf) -> Result<()> {
    let kind = ProbeKind::parse(probe)
        .with_context(|| format!("Unknown probe type {:?}, expected ping or iperf3", probe))?;
    let reader = tokio::io::BufReader::new(
        tokio::fs::File::open(file)
            .await
            .with_context(|| format!("Failed to open {:?}", file))?,
    );

    let mut stream = parser::EventStream::new(reader, parser::parser_for(kind));
    while let Some(event) = stream.next_event().await? {
        println!("{}", serde_json::to_string(&event)?);
    }
    if stream.skipped() > 0 {
        warn!("Skipped {} unparseable lines", stream.skipped());
    }
    Ok(())
}

fn run_export(
    config: &config::Config,
    output: Option<PathBuf>,
    last: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<()> {
    info!("Running export...");

    let (start, end) = parse_time_range(last, start, end)?;

    let db = storage::Database::new(&config.general.database_path)?;
    db.initialize()?;

    let runs = db.query_runs(start, end)?;
    info!("Found {} runs", runs.len());

    let output_path = output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "netprobe_export_{}.csv",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ))
    });

    output::export_csv(&runs, &output_path)?;
    info!("Exported to {:?}", output_path);
    Ok(())
}

/// Range in unix milliseconds; defaults to the last 24 hours
fn parse_time_range(
    last: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<(i64, i64)> {
    if let Some(last) = last {
        let duration = parse_duration(last)?;
        let end = chrono::Utc::now().timestamp_millis();
        Ok((end - duration.num_milliseconds(), end))
    } else if let (Some(start), Some(end)) = (start, end) {
        let parse = |s: &str| -> Result<i64> {
            Ok(chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
                .with_context(|| format!("Invalid time {:?}, expected YYYY-MM-DD HH:MM", s))?
                .and_utc()
                .timestamp_millis())
        };
        Ok((parse(start)?, parse(end)?))
    } else {
        let end = chrono::Utc::now().timestamp_millis();
        Ok((end - 24 * 3600 * 1000, end))
    }
}

fn parse_duration(s: &str) -> Result<chrono::Duration> {
    let s = s.trim();
    let invalid = || anyhow::anyhow!("Invalid duration {:?}. Use: 24h, 7d, 30m, etc.", s);
    let unit = s.chars().last().ok_or_else(invalid)?;
    let value: i64 = s[..s.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    let duration = match unit {
        'h' => chrono::Duration::try_hours(value),
        'd' => chrono::Duration::try_days(value),
        'm' => chrono::Duration::try_minutes(value),
        _ => None,
    };
    duration.ok_or_else(invalid)
}
