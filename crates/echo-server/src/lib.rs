//! Always-200 fixture server for the probe.
//!
//! Serves HTTP/1.1 and prior-knowledge HTTP/2 on the same plain listener, or
//! both over TLS (ALPN) when given a certificate.

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

pub const HEALTH_PATH: &str = "/_health";

/// Body returned for every request other than the health check.
pub const PAYLOAD: &str = "\n\t{\"foo\": \"bar\"}\n\n";

pub async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == HEALTH_PATH {
        return Ok(Response::new(Full::new(Bytes::from_static(b"OK"))));
    }

    let version = req.version();
    if let Err(e) = req.into_body().collect().await {
        debug!("Failed to read body: {}", e);
        let mut response = Response::new(Full::new(Bytes::from_static(b"can't read body")));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return Ok(response);
    }

    debug!(?version, "Served request");
    Ok(Response::new(Full::new(Bytes::from_static(PAYLOAD.as_bytes()))))
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, tls: Option<TlsAcceptor>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("Failed to accept")?;
        let tls = tls.clone();
        tokio::spawn(async move {
            let builder = auto::Builder::new(TokioExecutor::new());
            let served = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        builder
                            .serve_connection(TokioIo::new(stream), service_fn(handle))
                            .await
                    }
                    Err(e) => {
                        debug!(%peer, "TLS handshake failed: {}", e);
                        return;
                    }
                },
                None => {
                    builder
                        .serve_connection(TokioIo::new(stream), service_fn(handle))
                        .await
                }
            };
            if let Err(e) = served {
                debug!(%peer, "Connection ended: {}", e);
            }
        });
    }
}

/// Bind `addr` and serve in the background; returns the bound address.
pub async fn spawn(addr: SocketAddr, tls: Option<TlsAcceptor>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = serve(listener, tls).await {
            debug!("Echo server stopped: {:#}", e);
        }
    });
    Ok(local)
}

/// TLS acceptor from PEM files, offering h2 and http/1.1.
pub fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert).with_context(|| format!("Failed to open {:?}", cert))?;
    let key_pem = std::fs::read(key).with_context(|| format!("Failed to open {:?}", key))?;
    tls_acceptor_from_pem(&cert_pem, &key_pem)
        .with_context(|| format!("Invalid TLS material in {:?} / {:?}", cert, key))
}

/// Same as [`tls_acceptor`], from PEM already in memory.
pub fn tls_acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read certificates")?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("Failed to read private key")?
        .context("No private key found")?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid certificate or key")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}
