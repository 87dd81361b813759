//! Matching scheduler
//!
//! Drives the matching engine. Two triggers exist:
//!
//! - **scheduled**: runs at most once per period (a calendar day at the
//!   configured UTC offset). A completed period is recorded in the store and
//!   never re-run.
//! - **manual**: always runs, for backfills and testing.
//!
//! Both take the run lease first, so only one batch is in flight across all
//! instances sharing the store. The lease is renewed between nodes while the
//! batch runs; a run that loses it stops early and leaves its period open.
//! After a run, pending wallet credits are retried if configured.

use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::errors::EngineError;
use crate::lease::{self, LeaseAcquisition, LeaseKeeper};
use crate::matching::{MatchRunReport, MatchingEngine};
use crate::reconcile::Reconciler;
use crate::store::{CompensationStore, CompletedRun};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed(MatchRunReport),
    /// The period already has a completed run
    AlreadyCompleted { period: String },
    /// Another instance holds the run lease
    LeaseHeld { holder: String, expires_at: u64 },
}

/// Period key (`YYYY-MM-DD`) of `now` at the given UTC offset
pub fn period_key(now: u64, utc_offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60));
    match (DateTime::<Utc>::from_timestamp(now as i64, 0), offset) {
        (Some(utc), Some(offset)) => utc.with_timezone(&offset).format("%Y-%m-%d").to_string(),
        _ => format!("day-{}", now / 86_400),
    }
}

pub struct MatchingScheduler {
    engine: Arc<MatchingEngine>,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn CompensationStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    holder: String,
}

impl MatchingScheduler {
    pub fn new(
        engine: Arc<MatchingEngine>,
        reconciler: Arc<Reconciler>,
        store: Arc<dyn CompensationStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            reconciler,
            store,
            clock,
            config,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn current_period(&self) -> String {
        period_key(self.clock.now(), self.config.period_utc_offset_minutes)
    }

    /// Run the batch for the current period unless it already completed
    pub async fn trigger_scheduled(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<TriggerOutcome, EngineError> {
        let period = self.current_period();
        if self.store.completed_run(&period).await?.is_some() {
            info!("Matching for period {} already completed, skipping", period);
            return Ok(TriggerOutcome::AlreadyCompleted { period });
        }

        let keeper = match self.acquire_lease().await? {
            Ok(keeper) => keeper,
            Err(outcome) => return Ok(outcome),
        };

        // another instance may have finished the period while we waited
        match self.store.completed_run(&period).await {
            Ok(Some(_)) => {
                self.release_lease(&keeper).await;
                return Ok(TriggerOutcome::AlreadyCompleted { period });
            }
            Ok(None) => {}
            Err(e) => {
                self.release_lease(&keeper).await;
                return Err(e.into());
            }
        }

        let result = self.engine.run_under_lease(shutdown, Some(&keeper)).await;
        if let Ok(report) = &result {
            if report.cancelled {
                warn!("Matching run for period {} was cancelled; period stays open", period);
            } else {
                self.record_period(&period, report).await;
            }
        }
        self.release_lease(&keeper).await;

        let report = result?;
        self.reconcile().await;
        Ok(TriggerOutcome::Completed(report))
    }

    /// Run the batch now, regardless of period bookkeeping
    pub async fn trigger_manual(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<TriggerOutcome, EngineError> {
        let keeper = match self.acquire_lease().await? {
            Ok(keeper) => keeper,
            Err(outcome) => return Ok(outcome),
        };

        info!("Manual matching run requested by {}", self.holder);
        let result = self.engine.run_under_lease(shutdown, Some(&keeper)).await;
        self.release_lease(&keeper).await;

        let report = result?;
        self.reconcile().await;
        Ok(TriggerOutcome::Completed(report))
    }

    /// Fire the scheduled trigger every `interval_secs` until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Matching scheduler started (every {}s, lease {})",
            self.config.interval_secs, self.config.lease_name
        );

        loop {
            let tick = tokio::select! {
                _ = interval.tick() => true,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, stopping scheduler");
                        break;
                    }
                    false
                }
            };

            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping scheduler");
                break;
            }
            if !tick {
                continue;
            }

            match self.trigger_scheduled(Some(&shutdown)).await {
                Ok(TriggerOutcome::Completed(report)) => {
                    info!("Scheduled run {} finished in {}ms", report.run_id, report.duration_ms)
                }
                Ok(TriggerOutcome::AlreadyCompleted { .. }) => {}
                Ok(TriggerOutcome::LeaseHeld { holder, expires_at }) => {
                    info!("Run lease held by {} until {}, skipping tick", holder, expires_at)
                }
                Err(e) => error!("Scheduled matching run failed: {}", e),
            }
        }
    }

    /// `Ok(Err(outcome))` when someone else holds the lease
    async fn acquire_lease(&self) -> Result<Result<LeaseKeeper, TriggerOutcome>, EngineError> {
        let acquisition = lease::acquire(
            self.store.as_ref(),
            &self.config.lease_name,
            &self.holder,
            self.clock.now(),
            self.config.lease_ttl_secs,
        )
        .await?;

        Ok(match acquisition {
            LeaseAcquisition::Acquired(lease) => Ok(LeaseKeeper::new(
                self.store.clone(),
                self.clock.clone(),
                lease,
                self.config.lease_ttl_secs,
            )),
            LeaseAcquisition::Held(current) => {
                info!("Matching lease held by {}, not running", current.holder);
                Err(TriggerOutcome::LeaseHeld {
                    holder: current.holder,
                    expires_at: current.expires_at,
                })
            }
        })
    }

    async fn release_lease(&self, keeper: &LeaseKeeper) {
        if let Err(e) = keeper.release().await {
            error!("Failed to release lease {}: {}", self.config.lease_name, e);
        }
    }

    async fn record_period(&self, period: &str, report: &MatchRunReport) {
        let run = CompletedRun {
            period: period.to_string(),
            run_id: report.run_id.clone(),
            completed_at: self.clock.now(),
            users_processed: report.users_processed,
            users_matched: report.users_matched,
            total_payout: report.total_payout,
            credit_failures: report.credit_failures,
        };
        if let Err(e) = self.store.record_completed_run(&run).await {
            error!("Failed to record completed period {}: {}", period, e);
        }
    }

    async fn reconcile(&self) {
        if !self.config.reconcile_after_run {
            return;
        }
        if let Err(e) = self.reconciler.retry_pending_credits().await {
            error!("Pending credit reconciliation failed: {}", e);
        }
    }
}
