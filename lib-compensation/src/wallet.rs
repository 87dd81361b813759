//! Wallet credit interface
//!
//! The engine never moves money itself. Every payout is handed to a
//! [`WalletService`], which must treat `reference_id` as an idempotency key:
//! crediting the same reference twice applies the amount once.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Amount, CreditReason, PendingCredit, UserId};

/// One credit instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    pub user_id: UserId,
    pub amount: Amount,
    pub reason: CreditReason,
    pub reference_id: String,
}

impl From<&PendingCredit> for CreditRequest {
    fn from(credit: &PendingCredit) -> Self {
        Self {
            user_id: credit.user_id.clone(),
            amount: credit.amount,
            reason: credit.reason,
            reference_id: credit.reference_id.clone(),
        }
    }
}

/// Wallet acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReceipt {
    pub reference_id: String,
    /// The reference had already been applied
    pub duplicate: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Wallet service unavailable: {0}")]
    Unavailable(String),

    #[error("Credit to {user} rejected: {reason}")]
    Rejected { user: UserId, reason: String },

    #[error("Wallet credit timed out after {0:?}")]
    Timeout(Duration),
}

/// External wallet credit operation
#[async_trait]
pub trait WalletService: Send + Sync {
    /// Credit `amount` to `user_id`; idempotent per `reference_id`
    async fn credit(&self, request: &CreditRequest) -> Result<CreditReceipt, WalletError>;
}

/// Issue a credit bounded by `limit`
pub async fn credit_with_timeout(
    wallet: &dyn WalletService,
    request: &CreditRequest,
    limit: Duration,
) -> Result<CreditReceipt, WalletError> {
    match tokio::time::timeout(limit, wallet.credit(request)).await {
        Ok(result) => result,
        Err(_) => Err(WalletError::Timeout(limit)),
    }
}

#[derive(Debug, Default)]
struct WalletState {
    balances: HashMap<UserId, Amount>,
    applied: HashMap<String, CreditRequest>,
    failing: HashSet<UserId>,
}

/// In-process wallet for tests and local runs
///
/// Supports failure injection per user through [`InMemoryWallet::fail_for`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryWallet {
    state: Arc<RwLock<WalletState>>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, user_id: &UserId) -> Amount {
        self.state.read().balances.get(user_id).copied().unwrap_or(0)
    }

    /// Number of distinct references applied
    pub fn credits_applied(&self) -> usize {
        self.state.read().applied.len()
    }

    pub fn has_reference(&self, reference_id: &str) -> bool {
        self.state.read().applied.contains_key(reference_id)
    }

    /// Make every credit to `user_id` fail until [`InMemoryWallet::heal`]
    pub fn fail_for(&self, user_id: impl Into<UserId>) {
        self.state.write().failing.insert(user_id.into());
    }

    pub fn heal(&self, user_id: &UserId) {
        self.state.write().failing.remove(user_id);
    }
}

#[async_trait]
impl WalletService for InMemoryWallet {
    async fn credit(&self, request: &CreditRequest) -> Result<CreditReceipt, WalletError> {
        let mut state = self.state.write();

        if state.failing.contains(&request.user_id) {
            return Err(WalletError::Unavailable(format!("injected failure for {}", request.user_id)));
        }
        if state.applied.contains_key(&request.reference_id) {
            return Ok(CreditReceipt {
                reference_id: request.reference_id.clone(),
                duplicate: true,
            });
        }

        let balance = state.balances.entry(request.user_id.clone()).or_insert(0);
        *balance = balance.checked_add(request.amount).ok_or_else(|| WalletError::Rejected {
            user: request.user_id.clone(),
            reason: "balance overflow".to_string(),
        })?;
        state.applied.insert(request.reference_id.clone(), request.clone());

        Ok(CreditReceipt {
            reference_id: request.reference_id.clone(),
            duplicate: false,
        })
    }
}

/// Wallet that applies nothing
///
/// Every credit fails with [`WalletError::Unavailable`], so each payout stays
/// in the store's pending-credit outbox until a wallet that can apply it
/// drains the outbox through the reconciler.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferredWallet;

#[async_trait]
impl WalletService for DeferredWallet {
    async fn credit(&self, request: &CreditRequest) -> Result<CreditReceipt, WalletError> {
        Err(WalletError::Unavailable(format!(
            "no wallet service attached, {} stays pending",
            request.reference_id
        )))
    }
}
