//! Background driver for due strategies

use super::{StrategyEngine, TickReport};
use crate::error::Result;
use crate::store::TenantId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Polls one tenant for due strategies and ticks each of them.
#[derive(Debug, Clone)]
pub struct StrategyScheduler {
    engine: Arc<StrategyEngine>,
    tenant: TenantId,
    poll_interval: Duration,
}

impl StrategyScheduler {
    pub fn new(engine: Arc<StrategyEngine>, tenant: TenantId, poll_interval: Duration) -> Self {
        Self {
            engine,
            tenant,
            poll_interval,
        }
    }

    /// One pass over the due strategies. A failing strategy does not stop
    /// the others.
    pub async fn run_once(&self) -> Result<Vec<(String, Result<TickReport>)>> {
        let labels = self.engine.due_labels(&self.tenant).await?;
        let mut results = Vec::with_capacity(labels.len());
        for label in labels {
            let result = self.engine.tick(&self.tenant, &label, false, None).await;
            match &result {
                Ok(report) => tracing::info!(
                    tenant = %self.tenant,
                    label = %label,
                    action = report.outcome_name(),
                    "Scheduled tick"
                ),
                Err(e) => tracing::warn!(
                    tenant = %self.tenant,
                    label = %label,
                    error = %e,
                    "Scheduled tick failed"
                ),
            }
            results.push((label, result));
        }
        Ok(results)
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                tenant = %self.tenant,
                poll_secs = self.poll_interval.as_secs_f64(),
                "Strategy scheduler started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::warn!(tenant = %self.tenant, error = %e, "Scheduler pass failed");
                        }
                    }
                }
            }
            tracing::info!(tenant = %self.tenant, "Strategy scheduler stopped");
        })
    }
}
