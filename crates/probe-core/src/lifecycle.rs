use crate::scheduler::{RunSummary, WaveReport, WaveScheduler};
use crate::sender::RequestSender;
use crate::stats::{Aggregator, Snapshot};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    Completed(RunSummary),
    Failed(anyhow::Error),
    Interrupted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: Outcome,
    pub snapshot: Snapshot,
}

/// Run the waves until they finish, fail, or `shutdown` resolves, whichever
/// comes first, then stop the aggregator and collect its counters.
pub async fn run_until<F>(
    aggregator: &mut Aggregator,
    scheduler: &WaveScheduler,
    sender: Arc<dyn RequestSender>,
    shutdown: F,
    on_wave: impl FnMut(&WaveReport),
) -> anyhow::Result<RunReport>
where
    F: Future<Output = ()>,
{
    if !aggregator.is_started() {
        warn!("Statistics not started, the report will be empty");
    }

    let outcome = tokio::select! {
        result = scheduler.run(sender, on_wave) => match result {
            Ok(summary) => {
                info!(waves = summary.waves, issued = summary.issued, "All waves done");
                Outcome::Completed(summary)
            }
            Err(e) => {
                warn!("Run failed: {:#}", e);
                Outcome::Failed(e)
            }
        },
        _ = shutdown => {
            info!("Shutdown requested, no further waves");
            Outcome::Interrupted
        }
    };

    let snapshot = aggregator.stop().await?;
    Ok(RunReport { outcome, snapshot })
}
