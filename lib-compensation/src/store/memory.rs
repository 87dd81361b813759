//! In-memory compensation store for testing and development
//!
//! Every operation takes a single lock over the whole state, so multi-record
//! commits are trivially atomic. All data is lost on process termination.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::{CompensationStore, CompletedRun, NewAccount, RunLease, StoreError, StoreResult};
use crate::types::{CommissionRecord, MatchRecord, PendingCredit, SponsorEdge, TreeNode, UserId};

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<UserId, TreeNode>,
    sponsors: HashMap<UserId, SponsorEdge>,
    direct_counts: HashMap<UserId, u32>,
    /// Per-user match records in commit order
    matches: HashMap<UserId, Vec<MatchRecord>>,
    /// Per-recipient commissions keyed by record id
    commissions: HashMap<UserId, BTreeMap<String, CommissionRecord>>,
    events: HashSet<(String, String)>,
    pending_credits: BTreeMap<String, PendingCredit>,
    leases: HashMap<String, RunLease>,
    completed_runs: HashMap<String, CompletedRun>,
}

/// Thread-safe in-memory store
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes held
    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }
}

fn swap_node(state: &mut MemoryState, expected: &TreeNode, updated: &TreeNode) -> StoreResult<()> {
    let current = state
        .nodes
        .get_mut(&expected.user_id)
        .ok_or_else(|| StoreError::NotFound(format!("node {}", expected.user_id)))?;
    if current != expected {
        return Err(StoreError::Conflict(format!("node {}", expected.user_id)));
    }
    *current = updated.clone();
    Ok(())
}

#[async_trait]
impl CompensationStore for MemoryStore {
    async fn get_node(&self, user_id: &UserId) -> StoreResult<Option<TreeNode>> {
        Ok(self.state.read().nodes.get(user_id).cloned())
    }

    async fn scan_nodes(&self) -> StoreResult<Vec<TreeNode>> {
        Ok(self.state.read().nodes.values().cloned().collect())
    }

    async fn compare_and_swap_node(&self, expected: &TreeNode, updated: &TreeNode) -> StoreResult<()> {
        let mut state = self.state.write();
        swap_node(&mut state, expected, updated)
    }

    async fn insert_account(&self, account: &NewAccount) -> StoreResult<()> {
        let mut state = self.state.write();
        let user_id = &account.node.user_id;

        if state.nodes.contains_key(user_id) || state.sponsors.contains_key(user_id) {
            return Err(StoreError::AlreadyExists(format!("node {}", user_id)));
        }
        if let (Some(before), Some(after)) = (&account.parent_before, &account.parent_after) {
            swap_node(&mut state, before, after)?;
        }

        state.nodes.insert(user_id.clone(), account.node.clone());
        if let Some(edge) = &account.sponsor_edge {
            state.sponsors.insert(edge.user_id.clone(), edge.clone());
            let count = state.direct_counts.entry(edge.sponsor_id.clone()).or_insert(0);
            *count = count.saturating_add(1);
        }
        Ok(())
    }

    async fn get_sponsor(&self, user_id: &UserId) -> StoreResult<Option<SponsorEdge>> {
        Ok(self.state.read().sponsors.get(user_id).cloned())
    }

    async fn direct_count(&self, user_id: &UserId) -> StoreResult<u32> {
        Ok(self.state.read().direct_counts.get(user_id).copied().unwrap_or(0))
    }

    async fn commit_match(
        &self,
        expected: &TreeNode,
        updated: &TreeNode,
        record: &MatchRecord,
        credit: Option<&PendingCredit>,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        swap_node(&mut state, expected, updated)?;
        state
            .matches
            .entry(record.user_id.clone())
            .or_default()
            .push(record.clone());
        if let Some(credit) = credit {
            state.pending_credits.insert(credit.reference_id.clone(), credit.clone());
        }
        Ok(())
    }

    async fn match_history(&self, user_id: &UserId, limit: Option<usize>) -> StoreResult<Vec<MatchRecord>> {
        let state = self.state.read();
        let records = state.matches.get(user_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(records
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn matches_since(&self, user_id: &UserId, since: u64) -> StoreResult<Vec<MatchRecord>> {
        let state = self.state.read();
        Ok(state
            .matches
            .get(user_id)
            .map(|records| records.iter().filter(|r| r.created_at >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_commission(&self, record: &CommissionRecord, credit: &PendingCredit) -> StoreResult<bool> {
        let mut state = self.state.write();
        let ledger = state.commissions.entry(record.recipient_id.clone()).or_default();
        if ledger.contains_key(&record.id) {
            return Ok(false);
        }
        ledger.insert(record.id.clone(), record.clone());
        state.pending_credits.insert(credit.reference_id.clone(), credit.clone());
        Ok(true)
    }

    async fn get_commission(&self, recipient: &UserId, record_id: &str) -> StoreResult<Option<CommissionRecord>> {
        let state = self.state.read();
        Ok(state
            .commissions
            .get(recipient)
            .and_then(|ledger| ledger.get(record_id))
            .cloned())
    }

    async fn commissions_for(&self, recipient: &UserId) -> StoreResult<Vec<CommissionRecord>> {
        let state = self.state.read();
        let mut records: Vec<CommissionRecord> = state
            .commissions
            .get(recipient)
            .map(|ledger| ledger.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn claim_event(&self, scope: &str, key: &str, _now: u64) -> StoreResult<bool> {
        Ok(self.state.write().events.insert((scope.to_string(), key.to_string())))
    }

    async fn put_pending_credit(&self, credit: &PendingCredit) -> StoreResult<()> {
        self.state
            .write()
            .pending_credits
            .insert(credit.reference_id.clone(), credit.clone());
        Ok(())
    }

    async fn remove_pending_credit(&self, reference_id: &str) -> StoreResult<()> {
        self.state.write().pending_credits.remove(reference_id);
        Ok(())
    }

    async fn pending_credits(&self) -> StoreResult<Vec<PendingCredit>> {
        Ok(self.state.read().pending_credits.values().cloned().collect())
    }

    async fn get_lease(&self, name: &str) -> StoreResult<Option<RunLease>> {
        Ok(self.state.read().leases.get(name).cloned())
    }

    async fn compare_and_swap_lease(
        &self,
        name: &str,
        expected: Option<&RunLease>,
        new: Option<&RunLease>,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        if state.leases.get(name) != expected {
            return Err(StoreError::Conflict(format!("lease {}", name)));
        }
        match new {
            Some(lease) => state.leases.insert(name.to_string(), lease.clone()),
            None => state.leases.remove(name),
        };
        Ok(())
    }

    async fn record_completed_run(&self, run: &CompletedRun) -> StoreResult<()> {
        self.state
            .write()
            .completed_runs
            .insert(run.period.clone(), run.clone());
        Ok(())
    }

    async fn completed_run(&self, period: &str) -> StoreResult<Option<CompletedRun>> {
        Ok(self.state.read().completed_runs.get(period).cloned())
    }

    async fn flush(&self) -> StoreResult<()> {
        // No-op for in-memory storage
        Ok(())
    }
}
