//! Binary Matching Engine
//!
//! Batch job that pairs left and right carry-forward volume on every
//! eligible node and pays a percentage of the paired volume.
//!
//! # Fairness
//!
//! Nodes are processed in ascending `matched_to_date` order, ties broken by
//! user id, so accounts that have earned least are served first.
//!
//! # Atomicity
//!
//! The node update and the match record (plus the pending wallet credit)
//! are written in one store commit guarded by compare-and-swap. A volume
//! addition that races the match forces a re-read and recomputation; it is
//! never lost. The shutdown signal and the run lease are only checked
//! between nodes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::BinaryConfig;
use crate::errors::EngineError;
use crate::lease::LeaseKeeper;
use crate::store::{CompensationStore, StoreError, MAX_CAS_RETRIES};
use crate::types::{apply_bps, Amount, CreditReason, MatchRecord, PendingCredit, TreeNode, UserId};
use crate::wallet::{credit_with_timeout, CreditRequest, WalletService};

/// Result of processing one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { record: MatchRecord, credited: bool },
    /// The node already matched its cap within the current window
    DailyLimitReached,
    /// Candidate volume under the configured minimum
    BelowMinimum,
    /// A leg was emptied between selection and processing
    NoLongerEligible,
}

/// Statistics of one batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRunReport {
    pub run_id: String,
    pub started_at: u64,
    pub eligible_nodes: u64,
    pub users_processed: u64,
    pub users_matched: u64,
    pub skipped_daily_limit: u64,
    pub skipped_below_minimum: u64,
    pub no_longer_eligible: u64,
    pub credit_failures: u64,
    pub errors: u64,
    pub total_matched_volume: Amount,
    pub total_payout: Amount,
    pub duration_ms: u64,
    pub cancelled: bool,
    /// The run lease was taken over mid-run; implies `cancelled`
    pub lease_lost: bool,
}

pub struct MatchingEngine {
    store: Arc<dyn CompensationStore>,
    wallet: Arc<dyn WalletService>,
    clock: Arc<dyn Clock>,
    config: BinaryConfig,
}

/// Eligible nodes in processing order
pub fn fairness_order(nodes: Vec<TreeNode>) -> Vec<TreeNode> {
    let mut eligible: Vec<TreeNode> = nodes.into_iter().filter(TreeNode::is_eligible).collect();
    eligible.sort_by(|a, b| {
        a.matched_to_date
            .cmp(&b.matched_to_date)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    eligible
}

impl MatchingEngine {
    pub fn new(
        store: Arc<dyn CompensationStore>,
        wallet: Arc<dyn WalletService>,
        clock: Arc<dyn Clock>,
        config: BinaryConfig,
    ) -> Self {
        Self {
            store,
            wallet,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &BinaryConfig {
        &self.config
    }

    /// Run one matching batch over every eligible node
    ///
    /// # Errors
    /// Only if the node scan fails, before any node is touched. Per-node
    /// failures are counted in the report.
    pub async fn run(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<MatchRunReport, EngineError> {
        self.run_under_lease(shutdown, None).await
    }

    /// Like [`run`](Self::run), renewing `keeper` between nodes and stopping
    /// if the lease is lost
    pub async fn run_under_lease(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
        keeper: Option<&LeaseKeeper>,
    ) -> Result<MatchRunReport, EngineError> {
        let started = Instant::now();
        let mut report = MatchRunReport {
            run_id: Uuid::new_v4().to_string(),
            started_at: self.clock.now(),
            ..MatchRunReport::default()
        };

        let candidates = fairness_order(self.store.scan_nodes().await?);
        report.eligible_nodes = candidates.len() as u64;
        info!("Binary matching run {} starting with {} eligible nodes", report.run_id, candidates.len());

        for node in candidates {
            if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
                warn!(
                    "Matching run {} cancelled after {} nodes",
                    report.run_id, report.users_processed
                );
                report.cancelled = true;
                break;
            }
            if let Some(keeper) = keeper {
                let held = keeper.keep_alive().await.unwrap_or_else(|e| {
                    error!("Could not renew run lease: {}", e);
                    false
                });
                if !held {
                    warn!(
                        "Matching run {} lost its lease after {} nodes, stopping",
                        report.run_id, report.users_processed
                    );
                    report.cancelled = true;
                    report.lease_lost = true;
                    break;
                }
            }

            report.users_processed += 1;
            match self.match_node(&node.user_id).await {
                Ok(MatchOutcome::Matched { record, credited }) => {
                    report.users_matched += 1;
                    report.total_matched_volume = report.total_matched_volume.saturating_add(record.matched_volume);
                    report.total_payout = report.total_payout.saturating_add(record.payout_amount);
                    if !credited {
                        report.credit_failures += 1;
                    }
                }
                Ok(MatchOutcome::DailyLimitReached) => report.skipped_daily_limit += 1,
                Ok(MatchOutcome::BelowMinimum) => report.skipped_below_minimum += 1,
                Ok(MatchOutcome::NoLongerEligible) => report.no_longer_eligible += 1,
                Err(e) => {
                    error!("Matching {} failed: {}", node.user_id, e);
                    report.errors += 1;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Matching run {} done: {}/{} matched, volume {}, payout {}, {} credit failures, {} errors",
            report.run_id,
            report.users_matched,
            report.users_processed,
            report.total_matched_volume,
            report.total_payout,
            report.credit_failures,
            report.errors
        );
        Ok(report)
    }

    /// Match a single node against its current stored state
    pub async fn match_node(&self, user_id: &UserId) -> Result<MatchOutcome, EngineError> {
        for _ in 0..MAX_CAS_RETRIES {
            let node = match self.store.get_node(user_id).await? {
                Some(node) => node,
                None => return Ok(MatchOutcome::NoLongerEligible),
            };
            if !node.is_eligible() {
                return Ok(MatchOutcome::NoLongerEligible);
            }

            let now = self.clock.now();
            let candidate = node.match_candidate();

            let remaining_cap = match self.config.daily_cap {
                Some(cap) => {
                    let used = self.matched_in_window(user_id, now).await?;
                    if used >= cap {
                        debug!("{} reached its cap ({} of {})", user_id, used, cap);
                        return Ok(MatchOutcome::DailyLimitReached);
                    }
                    Some(cap - used)
                }
                None => None,
            };

            if candidate < self.config.min_match_volume {
                return Ok(MatchOutcome::BelowMinimum);
            }

            let matched_volume = remaining_cap.map_or(candidate, |remaining| candidate.min(remaining));
            let payout = apply_bps(matched_volume, self.config.payout_bps);
            let (updated, record) = self.apply_match(&node, matched_volume, payout, now)?;
            let credit = (payout > 0).then(|| {
                PendingCredit::new(record.reference_id(), user_id.clone(), payout, CreditReason::BinaryMatch, now)
            });

            match self.store.commit_match(&node, &updated, &record, credit.as_ref()).await {
                Ok(()) => {}
                Err(StoreError::Conflict(_)) => {
                    debug!("{} changed during matching, retrying", user_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            debug!(
                "Matched {} for {}: L {}->{} R {}->{} payout {}",
                matched_volume,
                user_id,
                record.left_volume_before,
                record.left_volume_after,
                record.right_volume_before,
                record.right_volume_after,
                payout
            );

            let credited = match credit {
                Some(credit) => self.deliver(credit).await,
                None => true,
            };
            return Ok(MatchOutcome::Matched { record, credited });
        }

        Err(StoreError::Contention {
            key: format!("node {}", user_id),
            attempts: MAX_CAS_RETRIES,
        }
        .into())
    }

    async fn matched_in_window(&self, user_id: &UserId, now: u64) -> Result<Amount, EngineError> {
        let since = self.config.cap_window.window_start(now);
        let records = self.store.matches_since(user_id, since).await?;
        Ok(records
            .iter()
            .fold(0, |total: Amount, r| total.saturating_add(r.matched_volume)))
    }

    fn apply_match(
        &self,
        node: &TreeNode,
        matched_volume: Amount,
        payout: Amount,
        now: u64,
    ) -> Result<(TreeNode, MatchRecord), EngineError> {
        let violated = |detail: &str| EngineError::InvariantViolated {
            user: node.user_id.clone(),
            detail: detail.to_string(),
        };

        let mut updated = node.clone();
        updated.left_unmatched = node
            .left_unmatched
            .checked_sub(matched_volume)
            .ok_or_else(|| violated("left carry-forward below matched volume"))?;
        updated.right_unmatched = node
            .right_unmatched
            .checked_sub(matched_volume)
            .ok_or_else(|| violated("right carry-forward below matched volume"))?;
        updated.matched_to_date = node
            .matched_to_date
            .checked_add(payout)
            .ok_or_else(|| EngineError::Overflow {
                user: node.user_id.clone(),
                field: "matched_to_date",
            })?;
        updated.last_matched_at = Some(now);

        if !updated.invariants_hold() {
            return Err(violated("carry-forward exceeds cumulative volume"));
        }

        let record = MatchRecord {
            id: Uuid::new_v4(),
            user_id: node.user_id.clone(),
            matched_volume,
            left_volume_before: node.left_unmatched,
            left_volume_after: updated.left_unmatched,
            right_volume_before: node.right_unmatched,
            right_volume_after: updated.right_unmatched,
            payout_amount: payout,
            payout_percentage: self.config.payout_bps,
            created_at: now,
        };
        Ok((updated, record))
    }

    /// Credit a committed payout; on failure the pending entry is updated
    async fn deliver(&self, credit: PendingCredit) -> bool {
        let limit = Duration::from_millis(self.config.credit_timeout_ms);
        match credit_with_timeout(self.wallet.as_ref(), &CreditRequest::from(&credit), limit).await {
            Ok(_) => {
                if let Err(e) = self.store.remove_pending_credit(&credit.reference_id).await {
                    warn!("Credited {} but could not clear pending entry: {}", credit.reference_id, e);
                }
                true
            }
            Err(e) => {
                warn!("Binary payout {} to {} failed: {}", credit.reference_id, credit.user_id, e);
                let failed = credit.failed(e.to_string(), self.clock.now());
                if let Err(store_err) = self.store.put_pending_credit(&failed).await {
                    error!("Could not record failed credit {}: {}", failed.reference_id, store_err);
                }
                false
            }
        }
    }
}
