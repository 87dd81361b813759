//! Binary Volume Accumulator
//!
//! Propagates an investment up the placement tree. Every ancestor gets the
//! amount added to the leg the investor sits under, both to the lifetime
//! volume and to the unmatched carry-forward. Nothing is paid here.
//!
//! The idempotency key is claimed before the first mutation, so a replayed
//! event is a no-op. Failures on one ancestor are logged and counted; the
//! walk moves on.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::errors::{EngineError, ValidationError};
use crate::store::{update_node, CompensationStore};
use crate::types::{Amount, Side, TreeNode, UserId};

/// Scope under which accumulation idempotency keys are claimed
pub const VOLUME_EVENT_SCOPE: &str = "binary-volume";

/// Outcome of one accumulation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulationReport {
    /// The key had been claimed before; nothing changed
    pub duplicate: bool,
    pub ancestors_updated: u32,
    pub ancestors_failed: u32,
    /// The walk stopped at the traversal bound or on a revisited node
    pub traversal_aborted: bool,
    /// Whole-operation failure (nothing was accumulated)
    pub error: Option<String>,
}

impl AccumulationReport {
    pub fn failed(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

pub struct VolumeAccumulator {
    store: Arc<dyn CompensationStore>,
    clock: Arc<dyn Clock>,
    max_depth: u32,
}

impl VolumeAccumulator {
    pub fn new(store: Arc<dyn CompensationStore>, clock: Arc<dyn Clock>, max_depth: u32) -> Self {
        Self { store, clock, max_depth }
    }

    /// Add `amount` to every ancestor of `investor`
    ///
    /// # Errors
    /// Only failures before the first mutation: unknown investor, or the
    /// store refusing the idempotency claim.
    pub async fn accumulate(
        &self,
        investor: &UserId,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<AccumulationReport, EngineError> {
        let investor_node = self
            .store
            .get_node(investor)
            .await?
            .ok_or_else(|| ValidationError::UnknownInvestor(investor.clone()))?;

        if !self
            .store
            .claim_event(VOLUME_EVENT_SCOPE, idempotency_key, self.clock.now())
            .await?
        {
            debug!("Volume event {} already applied, skipping", idempotency_key);
            return Ok(AccumulationReport {
                duplicate: true,
                ..AccumulationReport::default()
            });
        }

        let mut report = AccumulationReport::default();
        let mut visited: HashSet<UserId> = HashSet::from([investor.clone()]);
        let mut child = investor_node;
        let mut steps: u32 = 0;

        while let Some(parent_id) = child.parent_id.clone() {
            steps += 1;
            if steps > self.max_depth || !visited.insert(parent_id.clone()) {
                let err = EngineError::TraversalBound {
                    start: investor.clone(),
                    limit: self.max_depth,
                };
                error!("Volume walk aborted at {}: {}", parent_id, err);
                report.traversal_aborted = true;
                break;
            }

            let parent = match self.store.get_node(&parent_id).await {
                Ok(Some(parent)) => parent,
                Ok(None) => {
                    error!("Parent {} of {} is missing, stopping volume walk", parent_id, child.user_id);
                    report.ancestors_failed += 1;
                    break;
                }
                Err(e) => {
                    error!("Failed to load parent {}: {}", parent_id, e);
                    report.ancestors_failed += 1;
                    break;
                }
            };

            match parent.side_of_child(&child.user_id).or_else(|| child.position.side()) {
                Some(side) => match self.add_volume(&parent_id, side, amount).await {
                    Ok(_) => report.ancestors_updated += 1,
                    Err(e) => {
                        warn!("Failed to add {} {} volume to {}: {}", amount, side, parent_id, e);
                        report.ancestors_failed += 1;
                    }
                },
                None => {
                    warn!("{} is not linked under {}, skipping ancestor", child.user_id, parent_id);
                    report.ancestors_failed += 1;
                }
            }

            child = parent;
        }

        debug!(
            "Accumulated {} from {} into {} ancestors ({} failed)",
            amount, investor, report.ancestors_updated, report.ancestors_failed
        );
        Ok(report)
    }

    async fn add_volume(&self, user_id: &UserId, side: Side, amount: Amount) -> Result<TreeNode, EngineError> {
        update_node(self.store.as_ref(), user_id, |current| {
            let mut next = current.clone();
            next.add_volume(side, amount).ok_or_else(|| EngineError::Overflow {
                user: user_id.clone(),
                field: match side {
                    Side::Left => "left_volume",
                    Side::Right => "right_volume",
                },
            })?;
            Ok(next)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, NewAccount};
    use crate::types::SponsorEdge;

    async fn place(store: &MemoryStore, id: &str, parent: Option<(&str, Side)>) {
        let account = match parent {
            None => NewAccount {
                node: TreeNode::new_root(id.into(), 0),
                parent_before: None,
                parent_after: None,
                sponsor_edge: None,
            },
            Some((parent_id, side)) => {
                let parent = store.get_node(&parent_id.into()).await.unwrap().unwrap();
                let mut parent_after = parent.clone();
                parent_after.set_child(side, id.into());
                NewAccount {
                    node: TreeNode::new_child(id.into(), &parent, side, 0),
                    parent_before: Some(parent),
                    parent_after: Some(parent_after),
                    sponsor_edge: Some(SponsorEdge {
                        user_id: id.into(),
                        sponsor_id: parent_id.into(),
                        created_at: 0,
                    }),
                }
            }
        };
        store.insert_account(&account).await.unwrap();
    }

    fn accumulator(store: &MemoryStore) -> VolumeAccumulator {
        VolumeAccumulator::new(Arc::new(store.clone()), Arc::new(ManualClock::new(1_000)), 100)
    }

    async fn node(store: &MemoryStore, id: &str) -> TreeNode {
        store.get_node(&id.into()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_volume_reaches_every_ancestor_on_the_right_leg() {
        let store = MemoryStore::new();
        place(&store, "root", None).await;
        place(&store, "a", Some(("root", Side::Left))).await;
        place(&store, "b", Some(("a", Side::Right))).await;
        place(&store, "c", Some(("b", Side::Right))).await;

        let report = accumulator(&store).accumulate(&"c".into(), 10_000, "evt-1").await.unwrap();
        assert_eq!(report.ancestors_updated, 3);
        assert_eq!(report.ancestors_failed, 0);

        let b = node(&store, "b").await;
        assert_eq!((b.left_volume, b.right_volume), (0, 10_000));
        let a = node(&store, "a").await;
        assert_eq!((a.left_volume, a.right_volume), (0, 10_000));
        assert_eq!(a.right_unmatched, 10_000);
        let root = node(&store, "root").await;
        assert_eq!((root.left_volume, root.right_volume), (10_000, 0));
        assert_eq!(root.left_unmatched, 10_000);

        // the investor's own legs are untouched
        let c = node(&store, "c").await;
        assert_eq!((c.left_volume, c.right_volume), (0, 0));
    }

    #[tokio::test]
    async fn test_replayed_key_is_a_no_op() {
        let store = MemoryStore::new();
        place(&store, "root", None).await;
        place(&store, "a", Some(("root", Side::Right))).await;

        let acc = accumulator(&store);
        acc.accumulate(&"a".into(), 500, "evt-1").await.unwrap();
        let replay = acc.accumulate(&"a".into(), 500, "evt-1").await.unwrap();

        assert!(replay.duplicate);
        assert_eq!(replay.ancestors_updated, 0);
        assert_eq!(node(&store, "root").await.right_volume, 500);
    }

    #[tokio::test]
    async fn test_unknown_investor_is_rejected_before_claiming() {
        let store = MemoryStore::new();
        place(&store, "root", None).await;

        let acc = accumulator(&store);
        let err = acc.accumulate(&"ghost".into(), 500, "evt-1").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::UnknownInvestor(_))));

        // the key is still free
        assert!(store.claim_event(VOLUME_EVENT_SCOPE, "evt-1", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_root_investment_touches_nothing() {
        let store = MemoryStore::new();
        place(&store, "root", None).await;

        let report = accumulator(&store).accumulate(&"root".into(), 500, "evt-1").await.unwrap();
        assert_eq!(report, AccumulationReport::default());
    }

    #[tokio::test]
    async fn test_overflow_fails_one_ancestor_and_continues() {
        let store = MemoryStore::new();
        place(&store, "root", None).await;
        place(&store, "a", Some(("root", Side::Left))).await;
        place(&store, "b", Some(("a", Side::Left))).await;

        let a = node(&store, "a").await;
        let mut saturated = a.clone();
        saturated.add_volume(Side::Left, u64::MAX).unwrap();
        store.compare_and_swap_node(&a, &saturated).await.unwrap();

        let report = accumulator(&store).accumulate(&"b".into(), 1, "evt-1").await.unwrap();
        assert_eq!(report.ancestors_failed, 1);
        assert_eq!(report.ancestors_updated, 1);
        assert_eq!(node(&store, "a").await, saturated);
        assert_eq!(node(&store, "root").await.left_volume, 1);
    }

    #[tokio::test]
    async fn test_depth_bound_stops_walk() {
        let store = MemoryStore::new();
        place(&store, "root", None).await;
        place(&store, "a", Some(("root", Side::Left))).await;
        place(&store, "b", Some(("a", Side::Left))).await;
        place(&store, "c", Some(("b", Side::Left))).await;

        let acc = VolumeAccumulator::new(Arc::new(store.clone()), Arc::new(ManualClock::new(0)), 2);
        let report = acc.accumulate(&"c".into(), 5, "evt-1").await.unwrap();

        assert!(report.traversal_aborted);
        assert_eq!(report.ancestors_updated, 2);
        assert_eq!(node(&store, "root").await.left_volume, 0);
    }
}
