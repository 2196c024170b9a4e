use crate::config::TransportConfig;
use crate::stats::StatSink;
use crate::tracer;
use crate::transport::{self, TracedHttpClient};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::capture_connection;

/// HTTP client that reports connection reuse for every request it sends.
///
/// Clones share the connection pool and the statistics sink.
#[derive(Clone)]
pub struct TracedClient {
    client: TracedHttpClient,
    sink: StatSink,
}

impl TracedClient {
    pub fn new(client: TracedHttpClient, sink: StatSink) -> Self {
        Self { client, sink }
    }

    pub fn from_config(config: &TransportConfig, sink: StatSink) -> anyhow::Result<Self> {
        Ok(Self::new(transport::build_client(config)?, sink))
    }

    /// Send `request` and return the client's answer untouched.
    ///
    /// The request is recorded as soon as the pool hands it a connection, so
    /// it counts even if no response ever arrives. Requests that never get a
    /// connection are not recorded.
    pub async fn send(
        &self,
        mut request: Request<Empty<Bytes>>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        let url = request.uri().to_string();
        let mut captured = capture_connection(&mut request);
        let response = self.client.request(request);
        tokio::pin!(response);

        let checked_out = async {
            let connected = captured.wait_for_connection_metadata().await;
            let event = connected
                .as_ref()
                .and_then(|connected| tracer::observe(&url, connected));
            event
        };
        tokio::pin!(checked_out);

        // metadata is set before the request is written, so with `biased` a
        // connection is always seen before its response
        tokio::select! {
            biased;
            event = &mut checked_out => {
                if let Some(event) = event {
                    self.sink.record(event).await;
                }
                response.await
            }
            result = &mut response => result,
        }
    }
}
