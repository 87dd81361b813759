//! Sled-based compensation store
//!
//! Durable backend built on sled. Each record family lives in its own named
//! tree; values are bincode-encoded. Operations run on the blocking pool via
//! `spawn_blocking`.
//!
//! # Atomicity
//!
//! - Node updates use sled compare-and-swap on the encoded node.
//! - Account creation, match commits and commission inserts span several
//!   trees and run as sled multi-tree transactions.
//!
//! # Key Layout
//!
//! - `nodes`, `sponsors`, `direct_counts`: user id
//! - `matches`: user id, `0x00`, created_at (big endian), record uuid
//! - `commissions`: recipient id, `0x00`, record id
//! - `events`: scope, `0x00`, idempotency key

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use tracing::{debug, info};

use super::{CompensationStore, CompletedRun, NewAccount, RunLease, StoreError, StoreResult};
use crate::types::{CommissionRecord, MatchRecord, PendingCredit, SponsorEdge, TreeNode, UserId};

// =============================================================================
// TREE NAMES (FIXED - DO NOT CHANGE)
// =============================================================================

const TREE_NODES: &str = "nodes";
const TREE_SPONSORS: &str = "sponsors";
const TREE_DIRECT_COUNTS: &str = "direct_counts";
const TREE_MATCHES: &str = "matches";
const TREE_COMMISSIONS: &str = "commissions";
const TREE_EVENTS: &str = "events";
const TREE_PENDING_CREDITS: &str = "pending_credits";
const TREE_LEASES: &str = "leases";
const TREE_RUNS: &str = "completed_runs";

/// Default cache capacity (64 MB)
pub const DEFAULT_CACHE_CAPACITY: u64 = 64 * 1024 * 1024;

const KEY_SEPARATOR: u8 = 0x00;

/// Sled-backed implementation of [`CompensationStore`]
#[derive(Clone, Debug)]
pub struct SledStore {
    db: Db,
    nodes: Tree,
    sponsors: Tree,
    direct_counts: Tree,
    matches: Tree,
    commissions: Tree,
    events: Tree,
    pending_credits: Tree,
    leases: Tree,
    runs: Tree,
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn composite_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + suffix.len());
    key.extend_from_slice(prefix);
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(suffix);
    key
}

fn match_key(record: &MatchRecord) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(8 + 16);
    suffix.extend_from_slice(&record.created_at.to_be_bytes());
    suffix.extend_from_slice(record.id.as_bytes());
    composite_key(record.user_id.as_bytes(), &suffix)
}

fn user_prefix(user_id: &UserId) -> Vec<u8> {
    composite_key(user_id.as_bytes(), &[])
}

fn decode_count(bytes: Option<&[u8]>) -> u32 {
    match bytes {
        Some(b) if b.len() == 4 => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        _ => 0,
    }
}

fn map_transaction_error(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(inner) => db_err(inner),
    }
}

/// Run a blocking sled operation off the async executor
async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_with_config(path, DEFAULT_CACHE_CAPACITY)
    }

    /// Open or create a store with a custom page cache size
    pub fn open_with_config<P: AsRef<Path>>(path: P, cache_capacity: u64) -> StoreResult<Self> {
        let db = sled::Config::default()
            .path(path.as_ref())
            .cache_capacity(cache_capacity)
            .open()
            .map_err(|e| StoreError::Database(format!("open {:?}: {}", path.as_ref(), e)))?;

        info!(
            "Opened compensation store at {:?} with {}MB cache",
            path.as_ref(),
            cache_capacity / (1024 * 1024)
        );
        Self::from_db(db)
    }

    /// Open a temporary store that is deleted on drop (for testing)
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open().map_err(db_err)?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let open = |name: &str| -> StoreResult<Tree> {
            let tree = db.open_tree(name).map_err(db_err)?;
            debug!("Opened sled tree: {}", name);
            Ok(tree)
        };

        Ok(Self {
            nodes: open(TREE_NODES)?,
            sponsors: open(TREE_SPONSORS)?,
            direct_counts: open(TREE_DIRECT_COUNTS)?,
            matches: open(TREE_MATCHES)?,
            commissions: open(TREE_COMMISSIONS)?,
            events: open(TREE_EVENTS)?,
            pending_credits: open(TREE_PENDING_CREDITS)?,
            leases: open(TREE_LEASES)?,
            runs: open(TREE_RUNS)?,
            db,
        })
    }

    /// Database size on disk (approximate)
    pub fn size_on_disk(&self) -> StoreResult<u64> {
        self.db.size_on_disk().map_err(db_err)
    }

    async fn get_value<T>(tree: &Tree, key: Vec<u8>) -> StoreResult<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let tree = tree.clone();
        blocking(move || match tree.get(key).map_err(db_err)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        })
        .await
    }

    async fn scan_values<T>(tree: &Tree, prefix: Vec<u8>) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let tree = tree.clone();
        blocking(move || {
            let mut values = Vec::new();
            for item in tree.scan_prefix(prefix) {
                let (_, bytes) = item.map_err(db_err)?;
                values.push(decode(&bytes)?);
            }
            Ok(values)
        })
        .await
    }
}

#[async_trait]
impl CompensationStore for SledStore {
    async fn get_node(&self, user_id: &UserId) -> StoreResult<Option<TreeNode>> {
        Self::get_value(&self.nodes, user_id.as_bytes().to_vec()).await
    }

    async fn scan_nodes(&self) -> StoreResult<Vec<TreeNode>> {
        Self::scan_values(&self.nodes, Vec::new()).await
    }

    async fn compare_and_swap_node(&self, expected: &TreeNode, updated: &TreeNode) -> StoreResult<()> {
        let tree = self.nodes.clone();
        let key = expected.user_id.as_bytes().to_vec();
        let user = expected.user_id.to_string();
        let expected = encode(expected)?;
        let updated = encode(updated)?;

        blocking(move || {
            if !tree.contains_key(&key).map_err(db_err)? {
                return Err(StoreError::NotFound(format!("node {}", user)));
            }
            match tree
                .compare_and_swap(&key, Some(expected.as_slice()), Some(updated))
                .map_err(db_err)?
            {
                Ok(()) => Ok(()),
                Err(_) => Err(StoreError::Conflict(format!("node {}", user))),
            }
        })
        .await
    }

    async fn insert_account(&self, account: &NewAccount) -> StoreResult<()> {
        let trees = (self.nodes.clone(), self.sponsors.clone(), self.direct_counts.clone());
        let user = account.node.user_id.to_string();
        let node_key = account.node.user_id.as_bytes().to_vec();
        let node_bytes = encode(&account.node)?;
        let parent = match (&account.parent_before, &account.parent_after) {
            (Some(before), Some(after)) => Some((
                before.user_id.as_bytes().to_vec(),
                before.user_id.to_string(),
                encode(before)?,
                encode(after)?,
            )),
            _ => None,
        };
        let sponsor = match &account.sponsor_edge {
            Some(edge) => Some((edge.sponsor_id.as_bytes().to_vec(), encode(edge)?)),
            None => None,
        };

        blocking(move || {
            let (nodes, sponsors, direct_counts) = &trees;
            (nodes, sponsors, direct_counts)
                .transaction(|(nodes, sponsors, direct_counts)| {
                    if nodes.get(&node_key)?.is_some() || sponsors.get(&node_key)?.is_some() {
                        return Err(ConflictableTransactionError::Abort(StoreError::AlreadyExists(format!(
                            "node {}",
                            user
                        ))));
                    }
                    if let Some((parent_key, parent_id, before, after)) = &parent {
                        let current = nodes.get(parent_key)?;
                        if current.as_deref() != Some(before.as_slice()) {
                            return Err(ConflictableTransactionError::Abort(StoreError::Conflict(format!(
                                "node {}",
                                parent_id
                            ))));
                        }
                        nodes.insert(parent_key.as_slice(), after.as_slice())?;
                    }
                    nodes.insert(node_key.as_slice(), node_bytes.as_slice())?;
                    if let Some((sponsor_key, edge_bytes)) = &sponsor {
                        sponsors.insert(node_key.as_slice(), edge_bytes.as_slice())?;
                        let count = decode_count(direct_counts.get(sponsor_key)?.as_deref());
                        let next = count.saturating_add(1).to_be_bytes();
                        direct_counts.insert(sponsor_key.as_slice(), &next[..])?;
                    }
                    Ok(())
                })
                .map_err(map_transaction_error)
        })
        .await
    }

    async fn get_sponsor(&self, user_id: &UserId) -> StoreResult<Option<SponsorEdge>> {
        Self::get_value(&self.sponsors, user_id.as_bytes().to_vec()).await
    }

    async fn direct_count(&self, user_id: &UserId) -> StoreResult<u32> {
        let tree = self.direct_counts.clone();
        let key = user_id.as_bytes().to_vec();
        blocking(move || Ok(decode_count(tree.get(key).map_err(db_err)?.as_deref()))).await
    }

    async fn commit_match(
        &self,
        expected: &TreeNode,
        updated: &TreeNode,
        record: &MatchRecord,
        credit: Option<&PendingCredit>,
    ) -> StoreResult<()> {
        let trees = (self.nodes.clone(), self.matches.clone(), self.pending_credits.clone());
        let user = expected.user_id.to_string();
        let node_key = expected.user_id.as_bytes().to_vec();
        let expected = encode(expected)?;
        let updated = encode(updated)?;
        let record_key = match_key(record);
        let record_bytes = encode(record)?;
        let credit = match credit {
            Some(c) => Some((c.reference_id.as_bytes().to_vec(), encode(c)?)),
            None => None,
        };

        blocking(move || {
            let (nodes, matches, pending) = &trees;
            (nodes, matches, pending)
                .transaction(|(nodes, matches, pending)| {
                    let current = nodes.get(&node_key)?;
                    if current.as_deref() != Some(expected.as_slice()) {
                        return Err(ConflictableTransactionError::Abort(StoreError::Conflict(format!(
                            "node {}",
                            user
                        ))));
                    }
                    nodes.insert(node_key.as_slice(), updated.as_slice())?;
                    matches.insert(record_key.as_slice(), record_bytes.as_slice())?;
                    if let Some((credit_key, credit_bytes)) = &credit {
                        pending.insert(credit_key.as_slice(), credit_bytes.as_slice())?;
                    }
                    Ok(())
                })
                .map_err(map_transaction_error)
        })
        .await
    }

    async fn match_history(&self, user_id: &UserId, limit: Option<usize>) -> StoreResult<Vec<MatchRecord>> {
        let tree = self.matches.clone();
        let prefix = user_prefix(user_id);
        let max = limit.unwrap_or(usize::MAX);
        blocking(move || {
            let mut records = Vec::new();
            for item in tree.scan_prefix(prefix).rev().take(max) {
                let (_, bytes) = item.map_err(db_err)?;
                records.push(decode(&bytes)?);
            }
            Ok(records)
        })
        .await
    }

    async fn matches_since(&self, user_id: &UserId, since: u64) -> StoreResult<Vec<MatchRecord>> {
        let tree = self.matches.clone();
        let prefix = user_prefix(user_id);
        let start = composite_key(user_id.as_bytes(), &since.to_be_bytes());
        blocking(move || {
            let mut records = Vec::new();
            for item in tree.range(start..) {
                let (key, bytes) = item.map_err(db_err)?;
                if !key.starts_with(&prefix) {
                    break;
                }
                records.push(decode(&bytes)?);
            }
            Ok(records)
        })
        .await
    }

    async fn insert_commission(&self, record: &CommissionRecord, credit: &PendingCredit) -> StoreResult<bool> {
        let trees = (self.commissions.clone(), self.pending_credits.clone());
        let record_key = composite_key(record.recipient_id.as_bytes(), record.id.as_bytes());
        let record_bytes = encode(record)?;
        let credit_key = credit.reference_id.as_bytes().to_vec();
        let credit_bytes = encode(credit)?;

        blocking(move || {
            let (commissions, pending) = &trees;
            (commissions, pending)
                .transaction(|(commissions, pending)| {
                    if commissions.get(&record_key)?.is_some() {
                        return Ok(false);
                    }
                    commissions.insert(record_key.as_slice(), record_bytes.as_slice())?;
                    pending.insert(credit_key.as_slice(), credit_bytes.as_slice())?;
                    Ok(true)
                })
                .map_err(map_transaction_error)
        })
        .await
    }

    async fn get_commission(&self, recipient: &UserId, record_id: &str) -> StoreResult<Option<CommissionRecord>> {
        Self::get_value(&self.commissions, composite_key(recipient.as_bytes(), record_id.as_bytes())).await
    }

    async fn commissions_for(&self, recipient: &UserId) -> StoreResult<Vec<CommissionRecord>> {
        let mut records: Vec<CommissionRecord> = Self::scan_values(&self.commissions, user_prefix(recipient)).await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn claim_event(&self, scope: &str, key: &str, now: u64) -> StoreResult<bool> {
        let tree = self.events.clone();
        let key = composite_key(scope.as_bytes(), key.as_bytes());
        blocking(move || {
            let result = tree
                .compare_and_swap(key, None::<&[u8]>, Some(&now.to_be_bytes()[..]))
                .map_err(db_err)?;
            Ok(result.is_ok())
        })
        .await
    }

    async fn put_pending_credit(&self, credit: &PendingCredit) -> StoreResult<()> {
        let tree = self.pending_credits.clone();
        let key = credit.reference_id.as_bytes().to_vec();
        let value = encode(credit)?;
        blocking(move || {
            tree.insert(key, value).map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn remove_pending_credit(&self, reference_id: &str) -> StoreResult<()> {
        let tree = self.pending_credits.clone();
        let key = reference_id.as_bytes().to_vec();
        blocking(move || {
            tree.remove(key).map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn pending_credits(&self) -> StoreResult<Vec<PendingCredit>> {
        Self::scan_values(&self.pending_credits, Vec::new()).await
    }

    async fn get_lease(&self, name: &str) -> StoreResult<Option<RunLease>> {
        Self::get_value(&self.leases, name.as_bytes().to_vec()).await
    }

    async fn compare_and_swap_lease(
        &self,
        name: &str,
        expected: Option<&RunLease>,
        new: Option<&RunLease>,
    ) -> StoreResult<()> {
        let tree = self.leases.clone();
        let key = name.as_bytes().to_vec();
        let lease_name = name.to_string();
        let expected = expected.map(encode).transpose()?;
        let new = new.map(encode).transpose()?;

        blocking(move || {
            match tree
                .compare_and_swap(key, expected.as_deref(), new)
                .map_err(db_err)?
            {
                Ok(()) => Ok(()),
                Err(_) => Err(StoreError::Conflict(format!("lease {}", lease_name))),
            }
        })
        .await
    }

    async fn record_completed_run(&self, run: &CompletedRun) -> StoreResult<()> {
        let tree = self.runs.clone();
        let key = run.period.as_bytes().to_vec();
        let value = encode(run)?;
        blocking(move || {
            tree.insert(key, value).map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn completed_run(&self, period: &str) -> StoreResult<Option<CompletedRun>> {
        Self::get_value(&self.runs, period.as_bytes().to_vec()).await
    }

    async fn flush(&self) -> StoreResult<()> {
        let db = self.db.clone();
        blocking(move || {
            db.flush().map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreditReason, Side};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn root_account(id: &str) -> NewAccount {
        NewAccount {
            node: TreeNode::new_root(id.into(), 0),
            parent_before: None,
            parent_after: None,
            sponsor_edge: None,
        }
    }

    fn child_account(parent: &TreeNode, id: &str, side: Side) -> NewAccount {
        let mut parent_after = parent.clone();
        parent_after.set_child(side, id.into());
        NewAccount {
            node: TreeNode::new_child(id.into(), parent, side, 1),
            parent_before: Some(parent.clone()),
            parent_after: Some(parent_after),
            sponsor_edge: Some(SponsorEdge {
                user_id: id.into(),
                sponsor_id: parent.user_id.clone(),
                created_at: 1,
            }),
        }
    }

    fn match_record(user: &str, created_at: u64) -> MatchRecord {
        MatchRecord {
            id: Uuid::new_v4(),
            user_id: user.into(),
            matched_volume: 10,
            left_volume_before: 10,
            left_volume_after: 0,
            right_volume_before: 10,
            right_volume_after: 0,
            payout_amount: 1,
            payout_percentage: 1_000,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_account_insert_and_lookup() {
        let store = SledStore::open_temporary().unwrap();
        store.insert_account(&root_account("root")).await.unwrap();
        let root = store.get_node(&"root".into()).await.unwrap().unwrap();
        store.insert_account(&child_account(&root, "a", Side::Right)).await.unwrap();

        let root = store.get_node(&"root".into()).await.unwrap().unwrap();
        assert_eq!(root.right_child_id, Some(UserId::from("a")));
        assert_eq!(store.direct_count(&"root".into()).await.unwrap(), 1);
        assert_eq!(store.scan_nodes().await.unwrap().len(), 2);

        assert!(matches!(
            store.insert_account(&root_account("a")).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_parent_aborts_whole_transaction() {
        let store = SledStore::open_temporary().unwrap();
        store.insert_account(&root_account("root")).await.unwrap();
        let stale = store.get_node(&"root".into()).await.unwrap().unwrap();
        store.insert_account(&child_account(&stale, "a", Side::Left)).await.unwrap();

        let result = store.insert_account(&child_account(&stale, "b", Side::Right)).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.get_node(&"b".into()).await.unwrap().is_none());
        assert!(store.get_sponsor(&"b".into()).await.unwrap().is_none());
        assert_eq!(store.direct_count(&"root".into()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_node_compare_and_swap() {
        let store = SledStore::open_temporary().unwrap();
        store.insert_account(&root_account("root")).await.unwrap();
        let original = store.get_node(&"root".into()).await.unwrap().unwrap();

        let mut updated = original.clone();
        updated.add_volume(Side::Left, 500).unwrap();
        store.compare_and_swap_node(&original, &updated).await.unwrap();

        assert!(matches!(
            store.compare_and_swap_node(&original, &updated).await,
            Err(StoreError::Conflict(_))
        ));
        let missing = TreeNode::new_root("ghost".into(), 0);
        assert!(matches!(
            store.compare_and_swap_node(&missing, &missing).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_match_writes_all_or_nothing() {
        let store = SledStore::open_temporary().unwrap();
        store.insert_account(&root_account("root")).await.unwrap();
        let node = store.get_node(&"root".into()).await.unwrap().unwrap();
        let mut next = node.clone();
        next.last_matched_at = Some(50);

        let record = match_record("root", 50);
        let credit = PendingCredit::new(record.reference_id(), "root".into(), 1, CreditReason::BinaryMatch, 50);
        store.commit_match(&node, &next, &record, Some(&credit)).await.unwrap();

        // stale snapshot: nothing from the second commit may land
        let second = match_record("root", 60);
        let result = store.commit_match(&node, &next, &second, None).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let history = store.match_history(&"root".into(), None).await.unwrap();
        assert_eq!(history, vec![record]);
        assert_eq!(store.pending_credits().await.unwrap(), vec![credit]);
    }

    #[tokio::test]
    async fn test_match_ranges_are_per_user() {
        let store = SledStore::open_temporary().unwrap();
        store.insert_account(&root_account("ab")).await.unwrap();
        store.insert_account(&root_account("abc")).await.unwrap();

        for (user, ts) in [("ab", 10u64), ("ab", 20), ("ab", 30), ("abc", 25)] {
            let node = store.get_node(&user.into()).await.unwrap().unwrap();
            let mut next = node.clone();
            next.last_matched_at = Some(ts);
            store.commit_match(&node, &next, &match_record(user, ts), None).await.unwrap();
        }

        let since = store.matches_since(&"ab".into(), 20).await.unwrap();
        assert_eq!(since.iter().map(|r| r.created_at).collect::<Vec<_>>(), vec![20, 30]);

        let history = store.match_history(&"ab".into(), Some(2)).await.unwrap();
        assert_eq!(history.iter().map(|r| r.created_at).collect::<Vec<_>>(), vec![30, 20]);

        assert_eq!(store.match_history(&"abc".into(), None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commission_and_event_idempotency() {
        let store = SledStore::open_temporary().unwrap();
        let record = CommissionRecord {
            id: CommissionRecord::record_id("evt-1", 2),
            recipient_id: "sponsor".into(),
            source_user_id: "investor".into(),
            level: 2,
            investment_amount: 100_000,
            percentage_applied: 500,
            commission_amount: 5_000,
            created_at: 9,
        };
        let credit = PendingCredit::new(record.id.clone(), "sponsor".into(), 5_000, CreditReason::LevelIncome { level: 2 }, 9);

        assert!(store.insert_commission(&record, &credit).await.unwrap());
        assert!(!store.insert_commission(&record, &credit).await.unwrap());
        assert_eq!(
            store.get_commission(&"sponsor".into(), &record.id).await.unwrap(),
            Some(record.clone())
        );
        assert_eq!(store.commissions_for(&"sponsor".into()).await.unwrap(), vec![record]);

        assert!(store.claim_event("binary-volume", "evt-1", 9).await.unwrap());
        assert!(!store.claim_event("binary-volume", "evt-1", 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_and_runs() {
        let store = SledStore::open_temporary().unwrap();
        let lease = RunLease {
            name: "binary-matching".into(),
            holder: "node-a".into(),
            acquired_at: 0,
            expires_at: 100,
        };
        store.compare_and_swap_lease(&lease.name, None, Some(&lease)).await.unwrap();
        assert_eq!(store.get_lease(&lease.name).await.unwrap(), Some(lease.clone()));
        assert!(store.compare_and_swap_lease(&lease.name, None, Some(&lease)).await.is_err());
        store.compare_and_swap_lease(&lease.name, Some(&lease), None).await.unwrap();

        let run = CompletedRun {
            period: "2026-10-18".into(),
            run_id: "r1".into(),
            completed_at: 5,
            users_processed: 3,
            users_matched: 2,
            total_payout: 42,
            credit_failures: 0,
        };
        store.record_completed_run(&run).await.unwrap();
        assert_eq!(store.completed_run("2026-10-18").await.unwrap(), Some(run));
        assert!(store.completed_run("2026-10-19").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store");

        {
            let store = SledStore::open(&path).unwrap();
            store.insert_account(&root_account("root")).await.unwrap();
            store.flush().await.unwrap();
        }

        {
            let store = SledStore::open(&path).unwrap();
            assert!(store.get_node(&"root".into()).await.unwrap().is_some());
        }
    }
}
