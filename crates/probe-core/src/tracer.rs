//! Connection reuse tracing at the connector seam.
//!
//! Every connection opened through [`TracingConnector`] carries a
//! [`ConnectionMark`] in its `Connected` metadata. The pooled client hands that
//! metadata to a captured request as soon as it checks a connection out, so the
//! first request to claim a mark got a fresh connection and every later one a
//! reused connection.

use crate::stats::StatEvent;
use http::{Extensions, Uri};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_service::Service;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ConnectionMark {
    id: u64,
    claimed: Arc<AtomicBool>,
}

impl ConnectionMark {
    fn new(id: u64) -> Self {
        Self {
            id,
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true if an earlier request already used this connection.
    pub fn claim(&self) -> bool {
        self.claimed.swap(true, Ordering::AcqRel)
    }
}

/// Turn the mark carried by `connected` into a stat event for `url`.
///
/// Connections that did not come through a [`TracingConnector`] yield nothing.
pub fn observe(url: &str, connected: &Connected) -> Option<StatEvent> {
    let mut extras = Extensions::new();
    connected.get_extras(&mut extras);
    let mark = extras.get::<ConnectionMark>()?;
    let reused = mark.claim();
    debug!(conn = mark.id(), reused, "Got connection for {}", url);
    Some(StatEvent::new(url, reused))
}

/// Wraps a connector and marks every connection it establishes.
#[derive(Debug, Clone)]
pub struct TracingConnector<C> {
    inner: C,
    next_id: Arc<AtomicU64>,
}

impl<C> TracingConnector<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<C> Service<Uri> for TracingConnector<C>
where
    C: Service<Uri>,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
{
    type Response = Traced<C::Response>;
    type Error = C::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connecting = self.inner.call(dst.clone());
        let next_id = self.next_id.clone();
        Box::pin(async move {
            let io = connecting.await?;
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            debug!(conn = id, "Opened connection to {}", dst);
            Ok(Traced {
                inner: io,
                mark: ConnectionMark::new(id),
            })
        })
    }
}

/// A connection opened by [`TracingConnector`].
#[derive(Debug)]
pub struct Traced<T> {
    inner: T,
    mark: ConnectionMark,
}

impl<T: Connection> Connection for Traced<T> {
    fn connected(&self) -> Connected {
        self.inner.connected().extra(self.mark.clone())
    }
}

impl<T: Read + Unpin> Read for Traced<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: Write + Unpin> Write for Traced<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_on(mark: &ConnectionMark) -> Connected {
        Connected::new().extra(mark.clone())
    }

    #[test]
    fn test_first_use_is_fresh() {
        let mark = ConnectionMark::new(7);
        assert_eq!(mark.id(), 7);

        let first = observe("http://a/", &connected_on(&mark)).unwrap();
        assert_eq!(first, StatEvent::new("http://a/", false));

        let second = observe("http://a/", &connected_on(&mark)).unwrap();
        assert_eq!(second, StatEvent::new("http://a/", true));
    }

    #[test]
    fn test_marks_are_per_connection() {
        let a = ConnectionMark::new(0);
        let b = ConnectionMark::new(1);
        assert!(!a.claim());
        assert!(!b.claim());
        assert!(a.claim());
    }

    #[test]
    fn test_untraced_connection_yields_nothing() {
        assert!(observe("http://a/", &Connected::new()).is_none());
    }
}
