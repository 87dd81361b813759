//! Compensation Engine
//!
//! Binary matching and level income for a two-structure referral network.
//!
//! # Structures
//!
//! - **Binary placement tree**: every account has at most a left and a right
//!   child. Investment volume flows up to every ancestor, into the leg the
//!   investor sits under. A periodic batch pairs left against right volume
//!   and pays a percentage of the paired amount.
//! - **Sponsor chain**: who referred whom. Each investment pays a per-level
//!   commission to the first 30 sponsors, gated by how many direct referrals
//!   each sponsor has.
//!
//! # Flow
//!
//! 1. [`registration::Registrar`] adds accounts to both structures
//! 2. [`investment::InvestmentProcessor`] validates an investment event and
//!    runs the [`accumulator`] and the [`distributor`] for it
//! 3. [`scheduler::MatchingScheduler`] runs the [`matching`] batch once per
//!    period under a store-wide [`lease`]
//! 4. [`reconcile::Reconciler`] retries wallet credits that failed
//!
//! All money is integer atomic units; all rates are basis points.
//!
//! # Usage
//!
//! ```ignore
//! use lib_compensation::{CompensationConfig, CompensationSystem, InMemoryWallet, MemoryStore, SystemClock};
//!
//! let system = CompensationSystem::new(
//!     &CompensationConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(InMemoryWallet::new()),
//!     Arc::new(SystemClock),
//!     "node-1",
//! )?;
//! system.registrar.register_root("alice").await?;
//! ```

pub mod accumulator;
pub mod clock;
pub mod config;
pub mod distributor;
pub mod errors;
pub mod investment;
pub mod lease;
pub mod matching;
pub mod queries;
pub mod reconcile;
pub mod registration;
pub mod scheduler;
pub mod store;
pub mod system;
pub mod types;
pub mod unlock;
pub mod wallet;

pub use accumulator::{AccumulationReport, VolumeAccumulator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CapWindow, CompensationConfig, ConfigError};
pub use distributor::{DistributionReport, LevelIncomeDistributor};
pub use errors::{EngineError, RegistrationError, ValidationError};
pub use investment::{InvestmentEvent, InvestmentProcessor, InvestmentReport};
pub use matching::{MatchOutcome, MatchRunReport, MatchingEngine};
pub use queries::{BinaryStats, CompensationQueries, LevelIncomeSummary};
pub use reconcile::{ReconcileReport, Reconciler};
pub use registration::{Placement, Registrar, Registration};
pub use scheduler::{MatchingScheduler, TriggerOutcome};
pub use store::{CompensationStore, MemoryStore, StoreError};
#[cfg(feature = "sled")]
pub use store::SledStore;
pub use system::CompensationSystem;
pub use types::{Amount, BasisPoints, Side, TreeNode, UserId};
pub use unlock::{LevelUnlockEvaluator, UnlockStatus};
pub use wallet::{DeferredWallet, InMemoryWallet, WalletError, WalletService};
