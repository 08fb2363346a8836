//! Periodic ingestion: discover candidate URLs and fan out one pipeline each.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::core::activities::DiscoverCandidateUrls;
use crate::core::{ShutdownSignal, StartOutcome, WorkflowContext, WorkflowError, WorkflowHost};
use crate::domain::{WorkflowId, WorkflowKind};

/// Tally of one ingestion cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// URLs returned by discovery, repeats included
    pub discovered: usize,
    pub started: usize,
    pub resumed: usize,
    pub already_running: usize,
    pub already_completed: usize,
    /// URLs that failed validation
    pub rejected: usize,
}

/// Runs ingestion cycles on a fixed interval
pub struct IngestionScheduler {
    host: WorkflowHost,
    interval: Duration,
}

impl IngestionScheduler {
    pub fn new(host: WorkflowHost, interval: Duration) -> Self {
        Self { host, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One cycle under a fresh identity
    pub async fn run_cycle(&self) -> Result<CycleReport, WorkflowError> {
        self.run_cycle_as(WorkflowId::for_cycle()).await
    }

    /// One cycle under `id`; resuming a cycle replays its discovery result
    #[instrument(skip(self), fields(cycle = %id))]
    pub async fn run_cycle_as(&self, id: WorkflowId) -> Result<CycleReport, WorkflowError> {
        let reaped = self.host.reap_finished().await;
        if reaped > 0 {
            info!(reaped, "Released finished child runs");
        }

        let mut ctx = self
            .host
            .open_context(
                &id,
                WorkflowKind::IngestionCycle,
                &(),
                self.host.settings().discovery.clone(),
            )
            .await?;

        let result = self.fan_out(&mut ctx).await;
        ctx.finish(result).await
    }

    async fn fan_out(&self, ctx: &mut WorkflowContext) -> Result<CycleReport, WorkflowError> {
        let urls = ctx.execute::<DiscoverCandidateUrls>(&()).await?;

        let mut report = CycleReport {
            discovered: urls.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for url in urls {
            if !seen.insert(url.clone()) {
                continue;
            }
            if ctx.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }

            match self.host.start_pipeline(&url).await {
                Ok(StartOutcome::Started) => report.started += 1,
                Ok(StartOutcome::Resumed) => report.resumed += 1,
                Ok(StartOutcome::AlreadyRunning) => report.already_running += 1,
                Ok(StartOutcome::AlreadyCompleted) => report.already_completed += 1,
                Err(WorkflowError::InvalidInput(reason)) => {
                    warn!(%url, %reason, "Skipping invalid candidate URL");
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            discovered = report.discovered,
            started = report.started,
            resumed = report.resumed,
            already_running = report.already_running,
            already_completed = report.already_completed,
            "Ingestion cycle fanned out"
        );
        Ok(report)
    }

    /// Tick until shutdown. A failed cycle is logged and the loop goes on.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "Ingestion scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Ingestion scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(_) => {}
                        Err(WorkflowError::Cancelled) => {
                            info!("Ingestion cycle cancelled");
                            break;
                        }
                        Err(e) => error!(error = %e, "Ingestion cycle failed"),
                    }
                }
            }
        }
    }
}
