use anyhow::{Context, Result};
use clap::Parser;
use probe_core::{Config, TransportKind};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const HEALTH_PATH: &str = "_health";

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Checks that the probe target answers its health endpoint")]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Health check timeout, milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(url) = &args.url {
        cfg.target.url = url.clone();
        if url.starts_with("https://") {
            cfg.transport.kind = TransportKind::Tls;
        }
    }
    cfg.validate().context("Invalid configuration")?;

    let base = url::Url::parse(&cfg.target.url)
        .with_context(|| format!("Invalid target URL: {}", cfg.target.url))?;
    let health = health_url(&base)?;
    let verify = cfg.transport.tls.verify && !args.insecure;

    info!("Checking {} (tls verify: {})", health, verify);
    println!();
    println!("=== Preflight ===");
    println!("Target: {}", base);
    println!("Transport: {}", cfg.transport.kind.as_str());

    // Separate client so the check never warms the probe's pool.
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(args.timeout_ms.max(1)))
        .danger_accept_invalid_certs(!verify)
        .build()
        .context("Failed to build HTTP client")?;

    if !check_health(&client, &health).await {
        anyhow::bail!("Preflight failed: {} did not answer 200", health);
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

fn health_url(base: &url::Url) -> Result<url::Url> {
    let mut root = base.clone();
    root.set_path("/");
    root.set_query(None);
    root.set_fragment(None);
    root.join(HEALTH_PATH)
        .with_context(|| format!("Failed to build health URL from {base}"))
}

async fn check_health(client: &reqwest::Client, url: &url::Url) -> bool {
    let start = Instant::now();
    let resp = client.get(url.clone()).send().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match resp {
        Ok(r) => {
            let status = r.status().as_u16();
            println!("GET {} -> {} ({}ms)", url.path(), status, latency_ms);
            if status != 200 {
                warn!("Health endpoint returned non-200: {}", status);
                false
            } else {
                true
            }
        }
        Err(e) => {
            println!("GET {} -> ERROR ({}ms)", url.path(), latency_ms);
            warn!("Health request failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_replaces_path() {
        let base = url::Url::parse("http://localhost:8080/api/post?x=1").unwrap();
        assert_eq!(
            health_url(&base).unwrap().as_str(),
            "http://localhost:8080/_health"
        );
    }

    #[tokio::test]
    async fn test_check_health_against_live_server() {
        let addr = echo_server::spawn("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let base = url::Url::parse(&format!("http://{addr}/api")).unwrap();
        let client = reqwest::Client::new();
        assert!(check_health(&client, &health_url(&base).unwrap()).await);
    }

    #[tokio::test]
    async fn test_check_health_fails_on_closed_port() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let base = url::Url::parse(&format!("http://{addr}/")).unwrap();
        let client = reqwest::Client::new();
        assert!(!check_health(&client, &health_url(&base).unwrap()).await);
    }
}
