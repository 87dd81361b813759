//! Pending credit reconciliation
//!
//! Every payout is committed to the ledger together with a pending credit
//! entry. The entry is cleared once the wallet confirms. Whatever is left
//! (wallet down, timeout, crash between commit and credit) is retried here
//! under the same reference id, so the wallet applies it at most once.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::errors::EngineError;
use crate::store::CompensationStore;
use crate::types::Amount;
use crate::wallet::{credit_with_timeout, CreditRequest, WalletService};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub attempted: u64,
    pub succeeded: u64,
    /// Succeeded, but the wallet had already applied the reference
    pub already_applied: u64,
    pub still_failing: u64,
    pub amount_settled: Amount,
}

pub struct Reconciler {
    store: Arc<dyn CompensationStore>,
    wallet: Arc<dyn WalletService>,
    clock: Arc<dyn Clock>,
    credit_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn CompensationStore>,
        wallet: Arc<dyn WalletService>,
        clock: Arc<dyn Clock>,
        credit_timeout: Duration,
    ) -> Self {
        Self {
            store,
            wallet,
            clock,
            credit_timeout,
        }
    }

    /// Retry every pending credit once
    pub async fn retry_pending_credits(&self) -> Result<ReconcileReport, EngineError> {
        let pending = self.store.pending_credits().await?;
        let mut report = ReconcileReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        for credit in pending {
            report.attempted += 1;
            match credit_with_timeout(self.wallet.as_ref(), &CreditRequest::from(&credit), self.credit_timeout).await {
                Ok(receipt) => {
                    self.store.remove_pending_credit(&credit.reference_id).await?;
                    report.succeeded += 1;
                    report.amount_settled = report.amount_settled.saturating_add(credit.amount);
                    if receipt.duplicate {
                        report.already_applied += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        "Pending credit {} to {} still failing after {} attempts: {}",
                        credit.reference_id,
                        credit.user_id,
                        credit.attempts + 1,
                        e
                    );
                    let failed = credit.failed(e.to_string(), self.clock.now());
                    self.store.put_pending_credit(&failed).await?;
                    report.still_failing += 1;
                }
            }
        }

        info!(
            "Reconciled {} pending credits: {} settled ({} already applied), {} still failing",
            report.attempted, report.succeeded, report.already_applied, report.still_failing
        );
        Ok(report)
    }
}
