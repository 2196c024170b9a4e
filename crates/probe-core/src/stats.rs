use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sized to absorb the connection events of a burst without stalling producers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// One observation: the request to `url` got a connection, fresh or pooled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEvent {
    pub url: String,
    pub reused: bool,
}

impl StatEvent {
    pub fn new(url: impl Into<String>, reused: bool) -> Self {
        Self {
            url: url.into(),
            reused,
        }
    }
}

/// Per-URL tally. `reused <= total` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub total: u64,
    pub reused: u64,
}

impl Counter {
    fn record(&mut self, reused: bool) {
        self.total += 1;
        if reused {
            self.reused += 1;
        }
    }

    /// Share of requests served on a reused connection. NaN when nothing was recorded.
    pub fn ratio(&self) -> f64 {
        self.reused as f64 / self.total as f64
    }
}

/// Counters of a run, ordered by URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    counters: BTreeMap<String, Counter>,
}

impl Snapshot {
    fn apply(&mut self, event: StatEvent) {
        self.counters
            .entry(event.url)
            .or_default()
            .record(event.reused);
    }

    pub fn get(&self, url: &str) -> Option<&Counter> {
        self.counters.get(url)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Counter)> {
        self.counters.iter().map(|(url, c)| (url.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn entries(&self) -> Vec<UrlReport> {
        self.iter()
            .map(|(url, c)| UrlReport {
                url: url.to_string(),
                total: c.total,
                reused: c.reused,
                ratio: c.ratio(),
            })
            .collect()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (url, c) in self.iter() {
            writeln!(f, "url {url}")?;
            writeln!(f, "total requests: {}", c.total)?;
            writeln!(f, "total reused connections: {}", c.reused)?;
            writeln!(f, "reused connections / total request: {:.6}", c.ratio())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlReport {
    pub url: String,
    pub total: u64,
    pub reused: u64,
    pub ratio: f64,
}

/// What `stop` does with events still queued when it is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Stop at once; queued events are lost.
    #[default]
    Discard,
    /// Apply every event already queued, then stop.
    Drain,
}

/// Write side of the aggregator. Cheap to clone, one per producer.
#[derive(Debug, Clone)]
pub struct StatSink {
    tx: mpsc::Sender<StatEvent>,
}

impl StatSink {
    /// Queue an event, waiting for room when the channel is full.
    ///
    /// Once the aggregator has stopped the event is dropped right away.
    pub async fn record(&self, event: StatEvent) {
        if let Err(e) = self.tx.send(event).await {
            debug!("Aggregator stopped, dropping event for {}", e.0.url);
        }
    }
}

enum State {
    Idle,
    Running {
        sink: StatSink,
        cancel: CancellationToken,
        consumer: JoinHandle<Snapshot>,
    },
}

/// Owns the per-URL counters of a run.
///
/// A single consumer task is the only writer to the counter map; producers
/// only ever touch the channel through a [`StatSink`].
pub struct Aggregator {
    capacity: usize,
    policy: StopPolicy,
    state: State,
}

impl Aggregator {
    pub fn new(capacity: usize, policy: StopPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            state: State::Idle,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Spawn the consumer loop. A second call while running changes nothing
    /// and hands back another sink to the same loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> StatSink {
        if let State::Running { sink, .. } = &self.state {
            return sink.clone();
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume(rx, cancel.clone(), self.policy));
        let sink = StatSink { tx };

        debug!(capacity = self.capacity, policy = ?self.policy, "Statistics started");
        self.state = State::Running {
            sink: sink.clone(),
            cancel,
            consumer,
        };
        sink
    }

    /// Cancel the consumer loop and wait for it to return its counters.
    ///
    /// The snapshot is complete once this resolves. Stopping an aggregator
    /// that never started yields an empty snapshot.
    pub async fn stop(&mut self) -> anyhow::Result<Snapshot> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => Ok(Snapshot::default()),
            State::Running {
                sink,
                cancel,
                consumer,
            } => {
                drop(sink);
                cancel.cancel();
                let snapshot = consumer
                    .await
                    .map_err(|e| anyhow::anyhow!("Statistics consumer failed: {e}"))?;
                debug!(urls = snapshot.len(), "Statistics stopped");
                Ok(snapshot)
            }
        }
    }
}

async fn consume(
    mut rx: mpsc::Receiver<StatEvent>,
    cancel: CancellationToken,
    policy: StopPolicy,
) -> Snapshot {
    let mut snapshot = Snapshot::default();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => snapshot.apply(event),
                None => break,
            },
        }
    }

    rx.close();
    if policy == StopPolicy::Drain {
        while let Ok(event) = rx.try_recv() {
            snapshot.apply(event);
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn events() -> Vec<StatEvent> {
        vec![
            StatEvent::new("http://a/", false),
            StatEvent::new("http://a/", true),
            StatEvent::new("http://b/", false),
            StatEvent::new("http://a/", true),
            StatEvent::new("http://b/", false),
            StatEvent::new("http://c/", true),
        ]
    }

    #[tokio::test]
    async fn test_counts_match_events() {
        let mut agg = Aggregator::new(DEFAULT_CHANNEL_CAPACITY, StopPolicy::Drain);
        let sink = agg.start();
        for event in events() {
            sink.record(event).await;
        }

        let snapshot = agg.stop().await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get("http://a/"), Some(&Counter { total: 3, reused: 2 }));
        assert_eq!(snapshot.get("http://b/"), Some(&Counter { total: 2, reused: 0 }));
        assert_eq!(snapshot.get("http://c/"), Some(&Counter { total: 1, reused: 1 }));
        for (_, c) in snapshot.iter() {
            assert!(c.reused <= c.total);
        }
    }

    #[tokio::test]
    async fn test_start_twice_keeps_counters() {
        let mut agg = Aggregator::new(DEFAULT_CHANNEL_CAPACITY, StopPolicy::Drain);
        let first = agg.start();
        first.record(StatEvent::new("http://a/", false)).await;
        // let the consumer pick it up before restarting
        tokio::task::yield_now().await;

        let second = agg.start();
        assert!(agg.is_started());
        second.record(StatEvent::new("http://a/", true)).await;

        let snapshot = agg.stop().await.unwrap();
        assert_eq!(snapshot.get("http://a/"), Some(&Counter { total: 2, reused: 1 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_order_independence() {
        let mut forward = Aggregator::new(DEFAULT_CHANNEL_CAPACITY, StopPolicy::Drain);
        let sink = forward.start();
        for event in events() {
            sink.record(event).await;
        }

        // same multiset, reversed and spread over concurrent producers
        let mut scattered = Aggregator::new(4, StopPolicy::Drain);
        let sink = scattered.start();
        let mut handles = Vec::new();
        for event in events().into_iter().rev() {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move { sink.record(event).await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(forward.stop().await.unwrap(), scattered.stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_full_channel_applies_back_pressure() {
        let mut agg = Aggregator::new(2, StopPolicy::Drain);
        let sink = agg.start();
        let mut producers = Vec::new();
        for i in 0..50 {
            let sink = sink.clone();
            producers.push(tokio::spawn(async move {
                sink.record(StatEvent::new("http://a/", i % 2 == 0)).await
            }));
        }
        for p in producers {
            p.await.unwrap();
        }

        let snapshot = agg.stop().await.unwrap();
        assert_eq!(snapshot.get("http://a/"), Some(&Counter { total: 50, reused: 25 }));
    }

    #[tokio::test]
    async fn test_stop_discards_queued_events() {
        let mut agg = Aggregator::new(DEFAULT_CHANNEL_CAPACITY, StopPolicy::Discard);
        let sink = agg.start();
        // the consumer has not been polled yet, so these stay queued
        for event in events() {
            sink.record(event).await;
        }

        let snapshot = agg.stop().await.unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_record_after_stop_does_not_block() {
        let mut agg = Aggregator::new(1, StopPolicy::Discard);
        let sink = agg.start();
        agg.stop().await.unwrap();

        let sent = tokio::time::timeout(
            Duration::from_secs(1),
            sink.record(StatEvent::new("http://a/", false)),
        )
        .await;
        assert!(sent.is_ok());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut agg = Aggregator::new(DEFAULT_CHANNEL_CAPACITY, StopPolicy::Discard);
        assert!(!agg.is_started());
        assert!(agg.stop().await.unwrap().is_empty());
    }

    #[test]
    fn test_ratio_and_report_format() {
        let mut snapshot = Snapshot::default();
        snapshot.apply(StatEvent::new("http://a/", false));
        snapshot.apply(StatEvent::new("http://a/", true));
        snapshot.apply(StatEvent::new("http://a/", true));
        snapshot.apply(StatEvent::new("http://a/", true));

        let out = snapshot.to_string();
        assert_eq!(
            out,
            "url http://a/\n\
             total requests: 4\n\
             total reused connections: 3\n\
             reused connections / total request: 0.750000\n"
        );

        assert!(Counter::default().ratio().is_nan());
        let entries = snapshot.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ratio, 0.75);
    }
}
