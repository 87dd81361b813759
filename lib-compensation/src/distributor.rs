//! Level-Income Distributor
//!
//! Walks the sponsor chain from an investor for up to 30 levels. At level
//! *k* the ancestor earns `amount * rate[k]` if their direct-referral count
//! has unlocked level *k*; otherwise the commission is forfeited and nobody
//! else receives it.
//!
//! # Idempotency
//!
//! Every level of an event is decided once. The decision (paid, forfeited or
//! zero) is claimed under [`LEVEL_INCOME_SCOPE`] before it takes effect, so a
//! replay after the sponsor unlocks more levels pays nothing new. Commission
//! record ids are derived from the event key and the level, and the wallet
//! reference id is the record id, so a retried credit is applied at most once.
//!
//! # Failure Isolation
//!
//! Each level is handled on its own. A storage or wallet failure is logged,
//! surfaces in the report, and the walk continues with the next sponsor.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::LevelIncomeConfig;
use crate::errors::EngineError;
use crate::store::CompensationStore;
use crate::types::{apply_bps, Amount, CommissionRecord, CreditReason, PendingCredit, UserId};
use crate::unlock::LevelUnlockEvaluator;
use crate::wallet::{credit_with_timeout, CreditRequest, WalletService};

/// Idempotency scope for per-level income decisions
pub const LEVEL_INCOME_SCOPE: &str = "level-income";

/// A committed commission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelPayout {
    pub level: u8,
    pub recipient: UserId,
    pub amount: Amount,
}

/// A level the recipient had not unlocked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForfeitedLevel {
    pub level: u8,
    pub recipient: UserId,
    pub direct_count: u32,
    pub amount: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionReport {
    /// Recorded and credited
    pub paid: Vec<LevelPayout>,
    pub forfeited: Vec<ForfeitedLevel>,
    /// Recorded, but the wallet credit is pending
    pub failed_credits: Vec<LevelPayout>,
    /// Levels whose record already existed
    pub duplicate_levels: Vec<u8>,
    /// Levels that rounded to zero
    pub zero_levels: Vec<u8>,
    /// Levels skipped on a storage error
    pub errors: u32,
    pub levels_walked: u8,
    pub total_paid: Amount,
}

enum LevelOutcome {
    Paid(LevelPayout),
    CreditFailed(LevelPayout),
    Forfeited(ForfeitedLevel),
    Duplicate,
    ZeroAmount,
}

pub struct LevelIncomeDistributor {
    store: Arc<dyn CompensationStore>,
    wallet: Arc<dyn WalletService>,
    clock: Arc<dyn Clock>,
    rates: LevelIncomeConfig,
    evaluator: LevelUnlockEvaluator,
    credit_timeout: Duration,
}

impl LevelIncomeDistributor {
    pub fn new(
        store: Arc<dyn CompensationStore>,
        wallet: Arc<dyn WalletService>,
        clock: Arc<dyn Clock>,
        rates: LevelIncomeConfig,
        evaluator: LevelUnlockEvaluator,
        credit_timeout: Duration,
    ) -> Self {
        Self {
            store,
            wallet,
            clock,
            rates,
            evaluator,
            credit_timeout,
        }
    }

    /// Pay level income for one investment
    pub async fn distribute(&self, investor: &UserId, amount: Amount, idempotency_key: &str) -> DistributionReport {
        let mut report = DistributionReport::default();
        let mut visited: HashSet<UserId> = HashSet::from([investor.clone()]);
        let mut current = investor.clone();

        for level in 1..=self.rates.max_levels() {
            let edge = match self.store.get_sponsor(&current).await {
                Ok(Some(edge)) => edge,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to load sponsor of {}: {}", current, e);
                    report.errors += 1;
                    break;
                }
            };
            let recipient = edge.sponsor_id;
            if !visited.insert(recipient.clone()) {
                error!("Sponsor chain of {} revisits {}, stopping", investor, recipient);
                report.errors += 1;
                break;
            }
            report.levels_walked = level;

            match self.pay_level(level, &recipient, investor, amount, idempotency_key).await {
                Ok(LevelOutcome::Paid(payout)) => {
                    report.total_paid = report.total_paid.saturating_add(payout.amount);
                    report.paid.push(payout);
                }
                Ok(LevelOutcome::CreditFailed(payout)) => report.failed_credits.push(payout),
                Ok(LevelOutcome::Forfeited(forfeit)) => report.forfeited.push(forfeit),
                Ok(LevelOutcome::Duplicate) => report.duplicate_levels.push(level),
                Ok(LevelOutcome::ZeroAmount) => report.zero_levels.push(level),
                Err(e) => {
                    error!("Level {} income for {} failed: {}", level, recipient, e);
                    report.errors += 1;
                }
            }

            current = recipient;
        }

        info!(
            "Level income for {} ({}): {} paid, {} forfeited, {} pending, total {}",
            idempotency_key,
            investor,
            report.paid.len(),
            report.forfeited.len(),
            report.failed_credits.len(),
            report.total_paid
        );
        report
    }

    async fn pay_level(
        &self,
        level: u8,
        recipient: &UserId,
        investor: &UserId,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<LevelOutcome, EngineError> {
        let rate = self.rates.percentage_for_level(level);
        let commission = apply_bps(amount, rate);

        let direct_count = self.store.direct_count(recipient).await?;
        let record_id = CommissionRecord::record_id(idempotency_key, level);
        if !self.store.claim_event(LEVEL_INCOME_SCOPE, &record_id, self.clock.now()).await? {
            debug!("Level {} of {} already decided", level, idempotency_key);
            return Ok(LevelOutcome::Duplicate);
        }

        if !self.evaluator.is_level_unlocked(direct_count, level) {
            debug!(
                "Level {} locked for {} ({} directs), forfeiting {}",
                level, recipient, direct_count, commission
            );
            return Ok(LevelOutcome::Forfeited(ForfeitedLevel {
                level,
                recipient: recipient.clone(),
                direct_count,
                amount: commission,
            }));
        }

        if commission == 0 {
            return Ok(LevelOutcome::ZeroAmount);
        }

        let now = self.clock.now();
        let record = CommissionRecord {
            id: record_id,
            recipient_id: recipient.clone(),
            source_user_id: investor.clone(),
            level,
            investment_amount: amount,
            percentage_applied: rate,
            commission_amount: commission,
            created_at: now,
        };
        let pending = PendingCredit::new(
            record.id.clone(),
            recipient.clone(),
            commission,
            CreditReason::LevelIncome { level },
            now,
        );

        if !self.store.insert_commission(&record, &pending).await? {
            debug!("Commission {} already recorded", record.id);
            return Ok(LevelOutcome::Duplicate);
        }

        let payout = LevelPayout {
            level,
            recipient: recipient.clone(),
            amount: commission,
        };

        match credit_with_timeout(self.wallet.as_ref(), &CreditRequest::from(&pending), self.credit_timeout).await {
            Ok(_) => {
                if let Err(e) = self.store.remove_pending_credit(&pending.reference_id).await {
                    warn!("Credited {} but could not clear pending entry: {}", pending.reference_id, e);
                }
                Ok(LevelOutcome::Paid(payout))
            }
            Err(e) => {
                warn!("Wallet credit {} for {} failed: {}", pending.reference_id, recipient, e);
                let failed = pending.failed(e.to_string(), self.clock.now());
                if let Err(store_err) = self.store.put_pending_credit(&failed).await {
                    error!("Could not record failed credit {}: {}", failed.reference_id, store_err);
                }
                Ok(LevelOutcome::CreditFailed(payout))
            }
        }
    }
}
