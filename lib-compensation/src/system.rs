//! Component wiring
//!
//! Builds every engine component from one validated configuration over a
//! shared store, wallet and clock.

use std::sync::Arc;
use std::time::Duration;

use crate::accumulator::VolumeAccumulator;
use crate::clock::Clock;
use crate::config::{CompensationConfig, ConfigError};
use crate::distributor::LevelIncomeDistributor;
use crate::investment::InvestmentProcessor;
use crate::matching::MatchingEngine;
use crate::queries::CompensationQueries;
use crate::reconcile::Reconciler;
use crate::registration::Registrar;
use crate::scheduler::MatchingScheduler;
use crate::store::CompensationStore;
use crate::wallet::WalletService;

pub struct CompensationSystem {
    pub store: Arc<dyn CompensationStore>,
    pub registrar: Registrar,
    pub investments: InvestmentProcessor,
    pub engine: Arc<MatchingEngine>,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Arc<MatchingScheduler>,
    pub queries: CompensationQueries,
}

impl CompensationSystem {
    /// `holder` identifies this instance in the run lease
    pub fn new(
        config: &CompensationConfig,
        store: Arc<dyn CompensationStore>,
        wallet: Arc<dyn WalletService>,
        clock: Arc<dyn Clock>,
        holder: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let evaluator = config.unlock_evaluator()?;
        let credit_timeout = Duration::from_millis(config.binary.credit_timeout_ms);
        let max_depth = config.binary.max_tree_depth;

        let engine = Arc::new(MatchingEngine::new(
            store.clone(),
            wallet.clone(),
            clock.clone(),
            config.binary.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            wallet.clone(),
            clock.clone(),
            credit_timeout,
        ));
        let scheduler = Arc::new(MatchingScheduler::new(
            engine.clone(),
            reconciler.clone(),
            store.clone(),
            clock.clone(),
            config.scheduler.clone(),
            holder,
        ));
        let investments = InvestmentProcessor::new(
            store.clone(),
            VolumeAccumulator::new(store.clone(), clock.clone(), max_depth),
            LevelIncomeDistributor::new(
                store.clone(),
                wallet,
                clock.clone(),
                config.level_income.clone(),
                evaluator.clone(),
                credit_timeout,
            ),
        );

        Ok(Self {
            registrar: Registrar::new(store.clone(), clock, max_depth),
            queries: CompensationQueries::new(store.clone(), evaluator),
            store,
            investments,
            engine,
            reconciler,
            scheduler,
        })
    }
}
