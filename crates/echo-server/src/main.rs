use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(about = "Always-200 target for the probe (HTTP/1.1 + h2c, or TLS)")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// PEM certificate; enables TLS together with --key
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
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

    let tls = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(echo_server::tls_acceptor(cert, key)?),
        _ => None,
    };

    let listener = TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.addr))?;
    info!(
        "Listening [{}] ({})...",
        listener.local_addr()?,
        if tls.is_some() { "tls" } else { "plain, h2c" }
    );

    echo_server::serve(listener, tls).await
}
