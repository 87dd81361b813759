//! Investment event intake
//!
//! Validates an investment once, then runs volume accumulation and level
//! income concurrently. Both subsystems are idempotent per event key, so the
//! same event may be delivered more than once.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::accumulator::{AccumulationReport, VolumeAccumulator};
use crate::distributor::{DistributionReport, LevelIncomeDistributor};
use crate::errors::{EngineError, ValidationError};
use crate::store::CompensationStore;
use crate::types::{Amount, UserId};

/// A purchase/investment as delivered by the upstream system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentEvent {
    pub investor_id: UserId,
    /// Signed as received; must be positive
    pub amount: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestmentReport {
    pub investor_id: UserId,
    pub amount: Amount,
    pub idempotency_key: String,
    pub accumulation: AccumulationReport,
    pub distribution: DistributionReport,
}

pub struct InvestmentProcessor {
    store: Arc<dyn CompensationStore>,
    accumulator: VolumeAccumulator,
    distributor: LevelIncomeDistributor,
}

impl InvestmentProcessor {
    pub fn new(
        store: Arc<dyn CompensationStore>,
        accumulator: VolumeAccumulator,
        distributor: LevelIncomeDistributor,
    ) -> Self {
        Self {
            store,
            accumulator,
            distributor,
        }
    }

    /// Check the event before either subsystem sees it
    pub async fn validate(&self, event: &InvestmentEvent) -> Result<Amount, EngineError> {
        if event.amount <= 0 {
            return Err(ValidationError::NonPositiveAmount(event.amount).into());
        }
        if event.idempotency_key.trim().is_empty() {
            return Err(ValidationError::EmptyIdempotencyKey.into());
        }
        ValidationError::check_user_id(&event.investor_id)?;
        if self.store.get_node(&event.investor_id).await?.is_none() {
            return Err(ValidationError::UnknownInvestor(event.investor_id.clone()).into());
        }
        Ok(event.amount as Amount)
    }

    /// Apply an investment to the binary tree and the sponsor chain
    ///
    /// # Errors
    /// Validation failures (and a store failure while validating). Anything
    /// after validation is reported, not raised.
    pub async fn process(&self, event: &InvestmentEvent) -> Result<InvestmentReport, EngineError> {
        let amount = self.validate(event).await?;
        let key = event.idempotency_key.as_str();

        let (accumulation, distribution) = tokio::join!(
            self.accumulator.accumulate(&event.investor_id, amount, key),
            self.distributor.distribute(&event.investor_id, amount, key),
        );
        let accumulation = accumulation.unwrap_or_else(|e| {
            error!("Volume accumulation for {} failed: {}", key, e);
            AccumulationReport::failed(e)
        });

        info!(
            "Processed investment {} of {} by {}: {} ancestors credited volume, level income {}",
            key, amount, event.investor_id, accumulation.ancestors_updated, distribution.total_paid
        );
        Ok(InvestmentReport {
            investor_id: event.investor_id.clone(),
            amount,
            idempotency_key: event.idempotency_key.clone(),
            accumulation,
            distribution,
        })
    }
}
