use crate::config::LoadConfig;
use crate::sender::RequestSender;
use crate::waves::WavePlan;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Outcome of one completed wave.
#[derive(Debug, Clone)]
pub struct WaveReport {
    pub index: u64,
    pub size: u64,
    pub elapsed: Duration,
    pub finished_at: Instant,
}

impl WaveReport {
    /// Achieved requests per second for this wave.
    pub fn throughput(&self) -> f64 {
        self.size as f64 / self.elapsed.as_secs_f64()
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub waves: u64,
    pub issued: u64,
    pub elapsed: Duration,
}

/// Fires waves of concurrent requests with a pause between them.
#[derive(Debug, Clone)]
pub struct WaveScheduler {
    plan: WavePlan,
    interval: Duration,
}

impl WaveScheduler {
    pub fn new(plan: WavePlan, interval: Duration) -> Self {
        Self { plan, interval }
    }

    pub fn from_config(config: &LoadConfig) -> Result<Self> {
        Ok(Self::new(WavePlan::from_config(config)?, config.interval()))
    }

    /// Run every wave of the plan, calling `on_wave` after each one.
    ///
    /// The first failed request ends the run once its wave has finished.
    pub async fn run(
        &self,
        sender: Arc<dyn RequestSender>,
        mut on_wave: impl FnMut(&WaveReport),
    ) -> Result<RunSummary> {
        info!(
            sender = sender.name(),
            rps = self.plan.rps(),
            waves = self.plan.wave_count(),
            requests = self.plan.planned_requests(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting waves"
        );

        let started = Instant::now();
        let mut issued = 0u64;
        let mut waves = 0u64;

        for (index, size) in self.plan.sizes().enumerate() {
            let index = index as u64;
            let wave_start = Instant::now();
            run_wave(&sender, size)
                .await
                .with_context(|| format!("Wave {index} failed"))?;

            let report = WaveReport {
                index,
                size,
                elapsed: wave_start.elapsed(),
                finished_at: Instant::now(),
            };
            info!(
                wave = index,
                size,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Wave done, {:.2} req/s",
                report.throughput()
            );
            on_wave(&report);

            issued += size;
            waves += 1;
            sleep(self.interval).await;
        }

        Ok(RunSummary {
            waves,
            issued,
            elapsed: started.elapsed(),
        })
    }
}

/// Fire `size` requests at once and wait for all of them.
async fn run_wave(sender: &Arc<dyn RequestSender>, size: u64) -> Result<()> {
    let mut tasks = JoinSet::new();
    for _ in 0..size {
        let sender = sender.clone();
        tasks.spawn(async move { sender.send_one().await });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .context("Request task panicked")
            .and_then(|result| result);
        if let Err(e) = outcome {
            if first_error.is_none() {
                warn!("Request failed: {:#}", e);
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
