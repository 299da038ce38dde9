//! Billing Period Reset Job
//!
//! Periodically zeroes the counters of every record whose billing period
//! has ended. Records that are accessed between passes are rolled over
//! lazily by the store, so the job only has to keep idle records tidy.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::service::{QuotaService, ServiceError};
use crate::store::ResetReport;

/// Configuration for the reset job
#[derive(Debug, Clone)]
pub struct ResetJobConfig {
    /// Seconds between passes
    pub interval_secs: u64,
    /// Run a pass immediately on startup instead of after the first interval
    pub run_on_start: bool,
}

impl Default for ResetJobConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            run_on_start: true,
        }
    }
}

pub struct ResetJob {
    config: ResetJobConfig,
    service: QuotaService,
    passes: u64,
}

impl ResetJob {
    pub fn new(config: ResetJobConfig, service: QuotaService) -> Self {
        Self {
            config,
            service,
            passes: 0,
        }
    }

    /// Run a single reset pass at the current time
    pub async fn run_once(&mut self) -> Result<ResetReport, ServiceError> {
        self.passes += 1;
        self.service.reset_all_for_period(Utc::now()).await
    }

    /// Number of passes attempted so far
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!("🔄 Starting quota reset job");
        info!("   Interval: {}s", self.config.interval_secs);

        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !self.config.run_on_start {
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.failed > 0 => {
                            warn!("Reset pass {} finished with {} failures", self.passes, report.failed);
                        }
                        Ok(_) => {}
                        Err(e) => error!("Reset pass {} failed: {}", self.passes, e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Quota reset job stopped after {} passes", self.passes);
    }
}

/// Spawn the reset job; send `true` on the returned sender to stop it
pub fn spawn_reset_job(config: ResetJobConfig, service: QuotaService) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut job = ResetJob::new(config, service);
        job.run(shutdown_rx).await;
    });
    (shutdown_tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::TierLimitTable;
    use crate::store::InMemoryQuotaStore;
    use std::sync::Arc;

    fn service() -> QuotaService {
        QuotaService::new(Arc::new(InMemoryQuotaStore::new()), TierLimitTable::default())
    }

    #[tokio::test]
    async fn test_run_once_on_empty_store() {
        let mut job = ResetJob::new(ResetJobConfig::default(), service());
        let report = job.run_once().await.unwrap();
        assert_eq!(report, ResetReport::default());
        assert_eq!(job.passes(), 1);
    }

    #[tokio::test]
    async fn test_spawned_job_stops_on_shutdown() {
        let config = ResetJobConfig {
            interval_secs: 3600,
            run_on_start: true,
        };
        let (shutdown, handle) = spawn_reset_job(config, service());
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reset job did not stop")
            .unwrap();
    }
}
