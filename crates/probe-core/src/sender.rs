use crate::client::TracedClient;
use crate::stats::{StatEvent, StatSink};
use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Empty};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Trait for the request a wave fires
pub trait RequestSender: Send + Sync {
    fn name(&self) -> &'static str;

    fn send_one<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Mock sender for testing (always succeeds after a delay unless told to fail)
pub struct MockSender {
    delay_ms: u64,
    fail_at: Option<u64>,
    calls: AtomicU64,
    sink: Option<(StatSink, String)>,
}

impl MockSender {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            fail_at: None,
            calls: AtomicU64::new(0),
            sink: None,
        }
    }

    /// Fail the call with this zero-based index.
    pub fn fail_at(mut self, call: u64) -> Self {
        self.fail_at = Some(call);
        self
    }

    /// Report every call to `sink` as a request to `url`; only the first is fresh.
    pub fn with_sink(mut self, sink: StatSink, url: impl Into<String>) -> Self {
        self.sink = Some((sink, url.into()));
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RequestSender for MockSender {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn send_one<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail_at == Some(call) {
                anyhow::bail!("mock request {} failed", call);
            }
            if let Some((sink, url)) = &self.sink {
                sink.record(StatEvent::new(url.as_str(), call > 0)).await;
            }
            Ok(())
        })
    }
}

/// POSTs an empty JSON request to one URL through a [`TracedClient`]
pub struct PostSender {
    client: TracedClient,
    uri: Uri,
    timeout: Duration,
}

impl PostSender {
    pub fn new(client: TracedClient, url: &str, timeout: Duration) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .with_context(|| format!("Invalid target URL: {url}"))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            anyhow::bail!("Target URL must be absolute (got {url})");
        }
        let sender = Self {
            client,
            uri,
            timeout,
        };
        // surface a malformed request before any wave starts
        sender.request()?;
        Ok(sender)
    }

    fn request(&self) -> Result<Request<Empty<Bytes>>> {
        Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Empty::new())
            .context("Failed to build request")
    }
}

impl RequestSender for PostSender {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send_one<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let request = self.request()?;
            let exchange = async {
                let response = self
                    .client
                    .send(request)
                    .await
                    .with_context(|| format!("POST {} failed", self.uri))?;
                let status = response.status();
                let body = response
                    .into_body()
                    .collect()
                    .await
                    .with_context(|| format!("Failed to read response body from {}", self.uri))?
                    .to_bytes();
                debug!(%status, bytes = body.len(), "POST {} done", self.uri);
                Ok::<(), anyhow::Error>(())
            };

            match tokio::time::timeout(self.timeout, exchange).await {
                Ok(result) => result,
                Err(_) => anyhow::bail!("POST {} timed out after {:?}", self.uri, self.timeout),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::stats::{Aggregator, StopPolicy};

    #[tokio::test]
    async fn test_mock_fails_at_index() {
        let mock = MockSender::new(0).fail_at(1);
        assert!(mock.send_one().await.is_ok());
        assert!(mock.send_one().await.is_err());
        assert!(mock.send_one().await.is_ok());
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_reports_to_sink() {
        let mut agg = Aggregator::new(16, StopPolicy::Drain);
        let mock = MockSender::new(0).with_sink(agg.start(), "mock://target");
        for _ in 0..3 {
            mock.send_one().await.unwrap();
        }
        let snapshot = agg.stop().await.unwrap();
        let counter = snapshot.get("mock://target").unwrap();
        assert_eq!((counter.total, counter.reused), (3, 2));
    }

    #[tokio::test]
    async fn test_post_sender_rejects_relative_url() {
        let mut agg = Aggregator::new(16, StopPolicy::Discard);
        let client = TracedClient::from_config(&TransportConfig::default(), agg.start()).unwrap();
        assert!(PostSender::new(client.clone(), "/relative", Duration::from_secs(1)).is_err());
        assert!(PostSender::new(client.clone(), "not a url", Duration::from_secs(1)).is_err());
        assert!(PostSender::new(client, "http://localhost:8080/", Duration::from_secs(1)).is_ok());
    }
}
