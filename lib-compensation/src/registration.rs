//! Account registration
//!
//! Creates the tree node, links it into its placement parent and records
//! the sponsor edge in one store commit. Because the sponsor and the parent
//! must already exist and the new id must be unused, neither the sponsor
//! chain nor the placement tree can form a cycle.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::errors::{RegistrationError, ValidationError};
use crate::store::{CompensationStore, NewAccount, StoreError, MAX_CAS_RETRIES};
use crate::types::{Side, SponsorEdge, TreeNode, UserId};

/// Where a new node goes in the binary tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    /// New tree root
    Root,
    /// Directly under `parent`; the slot must be free
    Direct { parent: UserId, side: Side },
    /// Spillover: the outermost free slot on `side` below `under`
    Extreme { under: UserId, side: Side },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub user_id: UserId,
    pub sponsor_id: Option<UserId>,
    pub placement: Placement,
}

pub struct Registrar {
    store: Arc<dyn CompensationStore>,
    clock: Arc<dyn Clock>,
    max_depth: u32,
}

impl Registrar {
    pub fn new(store: Arc<dyn CompensationStore>, clock: Arc<dyn Clock>, max_depth: u32) -> Self {
        Self { store, clock, max_depth }
    }

    pub async fn register_root(&self, user_id: impl Into<UserId>) -> Result<TreeNode, RegistrationError> {
        self.register(Registration {
            user_id: user_id.into(),
            sponsor_id: None,
            placement: Placement::Root,
        })
        .await
    }

    pub async fn register(&self, registration: Registration) -> Result<TreeNode, RegistrationError> {
        let Registration {
            user_id,
            sponsor_id,
            placement,
        } = registration;

        ValidationError::check_user_id(&user_id)?;
        if let Some(sponsor) = &sponsor_id {
            ValidationError::check_user_id(sponsor)?;
        }
        if placement == Placement::Root && sponsor_id.is_some() {
            return Err(RegistrationError::RootWithSponsor);
        }
        if self.store.get_node(&user_id).await?.is_some() || self.store.get_sponsor(&user_id).await?.is_some() {
            return Err(RegistrationError::AlreadyRegistered(user_id));
        }
        if let Some(sponsor) = &sponsor_id {
            if self.store.get_node(sponsor).await?.is_none() {
                return Err(RegistrationError::UnknownSponsor(sponsor.clone()));
            }
        }

        for _ in 0..MAX_CAS_RETRIES {
            let now = self.clock.now();
            let slot = match &placement {
                Placement::Root => None,
                Placement::Direct { parent, side } => {
                    let parent_node = self
                        .store
                        .get_node(parent)
                        .await?
                        .ok_or_else(|| RegistrationError::UnknownParent(parent.clone()))?;
                    if parent_node.child(*side).is_some() {
                        return Err(RegistrationError::SlotOccupied {
                            parent: parent.clone(),
                            side: *side,
                        });
                    }
                    Some((parent_node, *side))
                }
                Placement::Extreme { under, side } => Some((self.outermost_free(under, *side).await?, *side)),
            };

            let account = match slot {
                None => NewAccount {
                    node: TreeNode::new_root(user_id.clone(), now),
                    parent_before: None,
                    parent_after: None,
                    sponsor_edge: None,
                },
                Some((parent_node, side)) => {
                    let mut parent_after = parent_node.clone();
                    parent_after.set_child(side, user_id.clone());
                    NewAccount {
                        node: TreeNode::new_child(user_id.clone(), &parent_node, side, now),
                        parent_before: Some(parent_node),
                        parent_after: Some(parent_after),
                        sponsor_edge: sponsor_id.as_ref().map(|sponsor| SponsorEdge {
                            user_id: user_id.clone(),
                            sponsor_id: sponsor.clone(),
                            created_at: now,
                        }),
                    }
                }
            };

            match self.store.insert_account(&account).await {
                Ok(()) => {
                    info!(
                        "Registered {} under {} ({:?}), sponsor {}",
                        user_id,
                        account.node.parent_id.as_ref().map(UserId::as_str).unwrap_or("-"),
                        account.node.position,
                        sponsor_id.as_ref().map(UserId::as_str).unwrap_or("-")
                    );
                    return Ok(account.node);
                }
                Err(StoreError::AlreadyExists(_)) => return Err(RegistrationError::AlreadyRegistered(user_id)),
                Err(StoreError::Conflict(_)) => {
                    debug!("Placement parent changed while registering {}, retrying", user_id);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RegistrationError::Contention)
    }

    /// Follow `side` children from `under` until a free slot
    async fn outermost_free(&self, under: &UserId, side: Side) -> Result<TreeNode, RegistrationError> {
        let mut current = self
            .store
            .get_node(under)
            .await?
            .ok_or_else(|| RegistrationError::UnknownParent(under.clone()))?;
        let mut visited: HashSet<UserId> = HashSet::from([under.clone()]);

        loop {
            let next_id = match current.child(side) {
                Some(child) => child.clone(),
                None => return Ok(current),
            };
            if visited.len() as u32 > self.max_depth || !visited.insert(next_id.clone()) {
                return Err(RegistrationError::TreeTooDeep(under.clone()));
            }
            current = self
                .store
                .get_node(&next_id)
                .await?
                .ok_or_else(|| RegistrationError::UnknownParent(next_id.clone()))?;
        }
    }
}
