//! Read-only reporting over the tree and the ledgers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::store::{CompensationStore, StoreResult};
use crate::types::{Amount, MatchRecord, PendingCredit, UserId};
use crate::unlock::{LevelUnlockEvaluator, UnlockStatus};

/// Binary position and lifetime matching totals of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryStats {
    pub user_id: UserId,
    pub left_volume: Amount,
    pub right_volume: Amount,
    pub left_unmatched: Amount,
    pub right_unmatched: Amount,
    pub matched_to_date: Amount,
    pub total_matches: u64,
    pub total_matched_volume: Amount,
    pub total_payout: Amount,
    pub last_matched_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelIncomeSummary {
    pub recipient: UserId,
    pub total_commission: Amount,
    pub commission_count: u64,
    /// Commission total per level
    pub per_level: BTreeMap<u8, Amount>,
}

pub struct CompensationQueries {
    store: Arc<dyn CompensationStore>,
    evaluator: LevelUnlockEvaluator,
}

impl CompensationQueries {
    pub fn new(store: Arc<dyn CompensationStore>, evaluator: LevelUnlockEvaluator) -> Self {
        Self { store, evaluator }
    }

    /// `None` for an unknown user
    pub async fn binary_stats(&self, user_id: &UserId) -> StoreResult<Option<BinaryStats>> {
        let node = match self.store.get_node(user_id).await? {
            Some(node) => node,
            None => return Ok(None),
        };
        let history = self.store.match_history(user_id, None).await?;

        Ok(Some(BinaryStats {
            user_id: node.user_id,
            left_volume: node.left_volume,
            right_volume: node.right_volume,
            left_unmatched: node.left_unmatched,
            right_unmatched: node.right_unmatched,
            matched_to_date: node.matched_to_date,
            total_matches: history.len() as u64,
            total_matched_volume: history.iter().fold(0, |t: Amount, r| t.saturating_add(r.matched_volume)),
            total_payout: history.iter().fold(0, |t: Amount, r| t.saturating_add(r.payout_amount)),
            last_matched_at: node.last_matched_at,
        }))
    }

    /// Newest first
    pub async fn match_history(&self, user_id: &UserId, limit: usize) -> StoreResult<Vec<MatchRecord>> {
        self.store.match_history(user_id, Some(limit)).await
    }

    pub async fn level_income_summary(&self, recipient: &UserId) -> StoreResult<LevelIncomeSummary> {
        let records = self.store.commissions_for(recipient).await?;
        let mut summary = LevelIncomeSummary {
            recipient: recipient.clone(),
            total_commission: 0,
            commission_count: 0,
            per_level: BTreeMap::new(),
        };
        for record in records {
            summary.total_commission = summary.total_commission.saturating_add(record.commission_amount);
            summary.commission_count += 1;
            let level_total = summary.per_level.entry(record.level).or_insert(0);
            *level_total = level_total.saturating_add(record.commission_amount);
        }
        Ok(summary)
    }

    pub async fn unlock_status(&self, user_id: &UserId) -> StoreResult<UnlockStatus> {
        let direct_count = self.store.direct_count(user_id).await?;
        Ok(self.evaluator.status(direct_count))
    }

    /// Credits committed to the ledger but not yet confirmed by the wallet
    pub async fn pending_credits(&self, user_id: &UserId) -> StoreResult<Vec<PendingCredit>> {
        Ok(self
            .store
            .pending_credits()
            .await?
            .into_iter()
            .filter(|credit| &credit.user_id == user_id)
            .collect())
    }
}
