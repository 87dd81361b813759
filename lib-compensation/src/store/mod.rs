//! Tree Store
//!
//! Pure data access for the binary tree, the sponsor chain and the
//! append-only ledgers. No business rules live here; the store only offers
//! the atomic primitives the engine needs:
//!
//! - compare-and-swap on a single tree node
//! - multi-record commits (node + match record + pending credit)
//! - insert-if-absent for commission records and idempotency keys
//! - compare-and-swap on lease records
//!
//! Two backends are provided: [`MemoryStore`] for tests and development and,
//! with the `sled` feature, [`SledStore`] for durable deployments.
//!
//! ## Example
//! ```rust,ignore
//! use lib_compensation::store::{CompensationStore, MemoryStore};
//!
//! async fn show(store: &dyn CompensationStore) -> anyhow::Result<()> {
//!     for node in store.scan_nodes().await? {
//!         println!("{} L={} R={}", node.user_id, node.left_unmatched, node.right_unmatched);
//!     }
//!     Ok(())
//! }
//! ```

pub mod memory;
#[cfg(feature = "sled")]
pub mod sled_store;

pub use memory::MemoryStore;
#[cfg(feature = "sled")]
pub use sled_store::SledStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CommissionRecord, MatchRecord, PendingCredit, SponsorEdge, TreeNode, UserId};

/// Bounded retries for optimistic read-modify-write loops
pub const MAX_CAS_RETRIES: usize = 32;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Compare-and-swap lost against a concurrent writer
    #[error("Compare-and-swap conflict on {0}")]
    Conflict(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Gave up after {attempts} conflicting updates of {key}")]
    Contention { key: String, attempts: usize },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Task execution failed: {0}")]
    TaskFailed(String),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Exclusive claim on a named batch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub name: String,
    pub holder: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl RunLease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Summary of a finished scheduled run, keyed by period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRun {
    pub period: String,
    pub run_id: String,
    pub completed_at: u64,
    pub users_processed: u64,
    pub users_matched: u64,
    pub total_payout: u64,
    pub credit_failures: u64,
}

/// Everything written when an account joins
///
/// `parent_before`/`parent_after` describe the child-slot update of the
/// placement parent; both are `None` for a root.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub node: TreeNode,
    pub parent_before: Option<TreeNode>,
    pub parent_after: Option<TreeNode>,
    pub sponsor_edge: Option<SponsorEdge>,
}

/// Async compensation store
#[async_trait]
pub trait CompensationStore: Send + Sync {
    // ---------------------------------------------------------------------
    // Binary tree
    // ---------------------------------------------------------------------

    async fn get_node(&self, user_id: &UserId) -> StoreResult<Option<TreeNode>>;

    /// All nodes, ordered by user id
    async fn scan_nodes(&self) -> StoreResult<Vec<TreeNode>>;

    /// Replace `expected` with `updated` iff the stored node still equals `expected`
    ///
    /// # Errors
    /// - `StoreError::Conflict` if the node changed since it was read
    /// - `StoreError::NotFound` if the node does not exist
    async fn compare_and_swap_node(&self, expected: &TreeNode, updated: &TreeNode) -> StoreResult<()>;

    /// Atomically create a node, link it into its parent, record the sponsor
    /// edge and bump the sponsor's direct count
    ///
    /// # Errors
    /// - `StoreError::AlreadyExists` if the node exists
    /// - `StoreError::Conflict` if the parent changed since it was read
    async fn insert_account(&self, account: &NewAccount) -> StoreResult<()>;

    // ---------------------------------------------------------------------
    // Sponsor chain
    // ---------------------------------------------------------------------

    async fn get_sponsor(&self, user_id: &UserId) -> StoreResult<Option<SponsorEdge>>;

    /// Number of sponsor edges pointing at `user_id`
    async fn direct_count(&self, user_id: &UserId) -> StoreResult<u32>;

    // ---------------------------------------------------------------------
    // Match ledger
    // ---------------------------------------------------------------------

    /// Commit a match: node swap, record append and pending credit in one unit
    ///
    /// # Errors
    /// - `StoreError::Conflict` if the node changed since it was read
    async fn commit_match(
        &self,
        expected: &TreeNode,
        updated: &TreeNode,
        record: &MatchRecord,
        credit: Option<&PendingCredit>,
    ) -> StoreResult<()>;

    /// Match records of a user, newest first
    async fn match_history(&self, user_id: &UserId, limit: Option<usize>) -> StoreResult<Vec<MatchRecord>>;

    /// Match records of a user created at or after `since`
    async fn matches_since(&self, user_id: &UserId, since: u64) -> StoreResult<Vec<MatchRecord>>;

    // ---------------------------------------------------------------------
    // Commission ledger
    // ---------------------------------------------------------------------

    /// Insert a commission record together with its pending credit
    ///
    /// Returns `false` without writing anything if the record id exists.
    async fn insert_commission(&self, record: &CommissionRecord, credit: &PendingCredit) -> StoreResult<bool>;

    async fn get_commission(&self, recipient: &UserId, record_id: &str) -> StoreResult<Option<CommissionRecord>>;

    /// Commission records of a recipient, oldest first
    async fn commissions_for(&self, recipient: &UserId) -> StoreResult<Vec<CommissionRecord>>;

    // ---------------------------------------------------------------------
    // Idempotency
    // ---------------------------------------------------------------------

    /// Claim `key` within `scope`; `false` if it was claimed before
    async fn claim_event(&self, scope: &str, key: &str, now: u64) -> StoreResult<bool>;

    // ---------------------------------------------------------------------
    // Pending wallet credits
    // ---------------------------------------------------------------------

    async fn put_pending_credit(&self, credit: &PendingCredit) -> StoreResult<()>;

    async fn remove_pending_credit(&self, reference_id: &str) -> StoreResult<()>;

    /// All pending credits, ordered by reference id
    async fn pending_credits(&self) -> StoreResult<Vec<PendingCredit>>;

    // ---------------------------------------------------------------------
    // Run coordination
    // ---------------------------------------------------------------------

    async fn get_lease(&self, name: &str) -> StoreResult<Option<RunLease>>;

    /// Swap the lease record iff it still equals `expected`
    ///
    /// # Errors
    /// - `StoreError::Conflict` if the lease changed since it was read
    async fn compare_and_swap_lease(
        &self,
        name: &str,
        expected: Option<&RunLease>,
        new: Option<&RunLease>,
    ) -> StoreResult<()>;

    async fn record_completed_run(&self, run: &CompletedRun) -> StoreResult<()>;

    async fn completed_run(&self, period: &str) -> StoreResult<Option<CompletedRun>>;

    /// Flush pending writes to durable storage
    async fn flush(&self) -> StoreResult<()>;
}

/// Optimistic read-modify-write of one node
///
/// Re-reads and re-applies `apply` whenever another writer wins the swap, so
/// concurrent volume additions and matches never lose updates.
pub async fn update_node<F, E>(store: &dyn CompensationStore, user_id: &UserId, mut apply: F) -> Result<TreeNode, E>
where
    F: FnMut(&TreeNode) -> Result<TreeNode, E> + Send,
    E: From<StoreError> + Send,
{
    for _ in 0..MAX_CAS_RETRIES {
        let current = store
            .get_node(user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {}", user_id)))?;
        let updated = apply(&current)?;

        match store.compare_and_swap_node(&current, &updated).await {
            Ok(()) => return Ok(updated),
            Err(StoreError::Conflict(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(StoreError::Contention {
        key: format!("node {}", user_id),
        attempts: MAX_CAS_RETRIES,
    }
    .into())
}
