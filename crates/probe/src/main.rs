use anyhow::{Context, Result};
use clap::Parser;
use probe_core::{
    run_until, Aggregator, Config, LastWave, MockSender, Outcome, PostSender, RequestSender,
    RunReport, StopPolicy, TracedClient, TransportKind, UrlReport, WaveScheduler,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "probe")]
#[command(about = "Fires POST waves at a target and reports connection reuse per URL")]
struct Args {
    /// Path to configuration file; defaults apply without one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Request mode: mock or http
    #[arg(long, default_value = "http")]
    mode: String,

    /// Target URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Requests per wave
    #[arg(long)]
    rps: Option<u64>,

    /// Total requests
    #[arg(long)]
    total: Option<u64>,

    /// Pause between waves, milliseconds
    #[arg(long, alias = "int")]
    interval_ms: Option<u64>,

    /// Use HTTP/2 (h2c on http://, ALPN h2 on https://)
    #[arg(long)]
    http2: bool,

    /// Use TLS
    #[arg(long)]
    tls: bool,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Extra CA bundle to trust
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Max idle connections
    #[arg(long = "mic")]
    max_idle_conns: Option<usize>,

    /// Max idle connections per host
    #[arg(long = "micph")]
    max_idle_conns_per_host: Option<usize>,

    /// Trim the last wave to what is left of --total instead of overshooting
    #[arg(long)]
    trim_last_wave: bool,

    /// Apply queued statistics before reporting
    #[arg(long)]
    drain: bool,

    /// Simulated latency in mock mode, milliseconds
    #[arg(long, default_value = "5")]
    mock_delay_ms: u64,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Do not write results/report_<timestamp>.json
    #[arg(long)]
    no_results: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunResult {
    timestamp: String,
    mode: String,
    target: String,
    transport: String,
    rps: u64,
    total: u64,
    interval_ms: u64,
    outcome: String,
    error: Option<String>,
    waves: Option<u64>,
    issued: Option<u64>,
    duration_ms: Option<u64>,
    urls: Vec<UrlReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_file.as_ref())?;

    let config = load_config(&args)?;
    config.validate().context("Invalid configuration")?;

    info!(
        "Starting probe in {} mode against {} ({})",
        args.mode,
        config.target.url,
        config.transport.kind.as_str()
    );
    info!(
        "rps={} total={} interval={}ms max_idle={} max_idle_per_host={}",
        config.load.rps,
        config.load.total,
        config.load.interval_ms,
        config.transport.max_idle_conns,
        config.transport.max_idle_conns_per_host
    );

    let scheduler = WaveScheduler::from_config(&config.load)?;

    let mut aggregator = Aggregator::new(config.stats.channel_capacity, config.stats.stop_policy);
    let sink = aggregator.start();

    let sender: Result<Arc<dyn RequestSender>> = match args.mode.as_str() {
        "mock" => Ok(Arc::new(
            MockSender::new(args.mock_delay_ms).with_sink(sink, config.target.url.clone()),
        ) as Arc<dyn RequestSender>),
        "http" => TracedClient::from_config(&config.transport, sink)
            .and_then(|client| {
                PostSender::new(client, &config.target.url, config.target.timeout())
            })
            .map(|sender| Arc::new(sender) as Arc<dyn RequestSender>)
            .context("Failed to create HTTP sender"),
        _ => Err(anyhow::anyhow!(
            "Invalid mode: {}, must be 'mock' or 'http'",
            args.mode
        )),
    };
    let sender = match sender {
        Ok(sender) => sender,
        Err(e) => {
            aggregator.stop().await?;
            return Err(e);
        }
    };

    let report = run_until(
        &mut aggregator,
        &scheduler,
        sender,
        shutdown_signal(),
        |wave| println!("{}", wave.throughput()),
    )
    .await?;

    print!("{}", report.snapshot);

    if !args.no_results {
        if let Err(e) = write_results(&args, &config, &report) {
            warn!("Failed to write results: {:#}", e);
        }
    }

    match report.outcome {
        Outcome::Completed(summary) => {
            info!(
                "Done: {} waves, {} requests in {}ms",
                summary.waves,
                summary.issued,
                summary.elapsed.as_millis()
            );
            Ok(())
        }
        Outcome::Interrupted => {
            info!("Interrupted");
            Ok(())
        }
        Outcome::Failed(e) => {
            println!("{:#}", e);
            Err(e)
        }
    }
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {:?}", path))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    if let Some(url) = &args.url {
        config.target.url = url.clone();
    }
    if let Some(rps) = args.rps {
        config.load.rps = rps;
    }
    if let Some(total) = args.total {
        config.load.total = total;
    }
    if let Some(interval_ms) = args.interval_ms {
        config.load.interval_ms = interval_ms;
    }
    if args.trim_last_wave {
        config.load.last_wave = LastWave::Trim;
    }
    if args.http2 || args.tls {
        let tls = args.tls || config.transport.kind == TransportKind::Tls;
        config.transport.kind = TransportKind::from_flags(args.http2, tls);
    }
    if args.http2 {
        config.transport.tls.http2 = true;
    }
    if args.insecure {
        config.transport.tls.verify = false;
    }
    if let Some(ca_file) = &args.ca_file {
        config.transport.tls.ca_file = Some(ca_file.clone());
    }
    if let Some(n) = args.max_idle_conns {
        config.transport.max_idle_conns = n;
    }
    if let Some(n) = args.max_idle_conns_per_host {
        config.transport.max_idle_conns_per_host = n;
    }
    if args.drain {
        config.stats.stop_policy = StopPolicy::Drain;
    }

    Ok(config)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            println!();
            println!("interrupt");
        }
        _ = terminate => {
            println!();
            println!("terminated");
        }
    }
}

fn write_results(args: &Args, config: &Config, report: &RunReport) -> Result<()> {
    let (waves, issued, duration_ms, error) = match &report.outcome {
        Outcome::Completed(s) => (
            Some(s.waves),
            Some(s.issued),
            Some(s.elapsed.as_millis() as u64),
            None,
        ),
        Outcome::Failed(e) => (None, None, None, Some(format!("{:#}", e))),
        Outcome::Interrupted => (None, None, None, None),
    };

    let result = RunResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: args.mode.clone(),
        target: config.target.url.clone(),
        transport: config.transport.kind.as_str().to_string(),
        rps: config.load.rps,
        total: config.load.total,
        interval_ms: config.load.interval_ms,
        outcome: report.outcome.as_str().to_string(),
        error,
        waves,
        issued,
        duration_ms,
        urls: report.snapshot.entries(),
    };

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = format!("results/report_{}.json", timestamp);

    std::fs::create_dir_all("results").ok();
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)?;

    info!("Results written to {}", output_path);
    Ok(())
}
