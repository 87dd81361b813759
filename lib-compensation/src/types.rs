//! Core compensation data types
//!
//! Account identity, the binary tree node, the sponsor edge and the two
//! append-only ledgers (match records and commission records).
//!
//! # Integer Math
//!
//! All money is carried as [`Amount`] in atomic units (cents) and every
//! percentage as [`BasisPoints`] (10_000 = 100%). Multiplication happens in
//! `u128` and rounds down, so a payout can never exceed its source volume.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Monetary amount in atomic units (e.g. cents)
pub type Amount = u64;

/// Percentage expressed in basis points
pub type BasisPoints = u64;

/// 100% in basis points
pub const BASIS_POINTS_DENOMINATOR: u64 = 10_000;

/// Maximum accepted length of a user identifier
pub const MAX_USER_ID_LENGTH: usize = 128;

/// Apply a basis-point rate to an amount, rounding down
pub fn apply_bps(amount: Amount, bps: BasisPoints) -> Amount {
    let scaled = (amount as u128 * bps as u128) / BASIS_POINTS_DENOMINATOR as u128;
    scaled.min(u64::MAX as u128) as Amount
}

/// Account identifier shared by the binary tree and the sponsor chain
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Leg of a binary node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// Where a node sits relative to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
    Root,
}

impl From<Side> for Position {
    fn from(side: Side) -> Self {
        match side {
            Side::Left => Position::Left,
            Side::Right => Position::Right,
        }
    }
}

impl Position {
    pub fn side(self) -> Option<Side> {
        match self {
            Position::Left => Some(Side::Left),
            Position::Right => Some(Side::Right),
            Position::Root => None,
        }
    }
}

/// One node of the binary placement tree
///
/// # Invariants
///
/// - `left_unmatched <= left_volume` and `right_unmatched <= right_volume`
/// - `left_volume`, `right_volume` and `matched_to_date` never decrease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub user_id: UserId,
    pub parent_id: Option<UserId>,
    pub left_child_id: Option<UserId>,
    pub right_child_id: Option<UserId>,
    pub position: Position,
    /// Depth from the root (root = 0)
    pub level: u32,
    /// Lifetime volume that entered through the left leg
    pub left_volume: Amount,
    /// Lifetime volume that entered through the right leg
    pub right_volume: Amount,
    /// Left carry-forward not yet paired for payout
    pub left_unmatched: Amount,
    /// Right carry-forward not yet paired for payout
    pub right_unmatched: Amount,
    /// Lifetime binary payout
    pub matched_to_date: Amount,
    pub last_matched_at: Option<u64>,
    pub created_at: u64,
}

impl TreeNode {
    /// Create a root node with no parent
    pub fn new_root(user_id: UserId, created_at: u64) -> Self {
        Self {
            user_id,
            parent_id: None,
            left_child_id: None,
            right_child_id: None,
            position: Position::Root,
            level: 0,
            left_volume: 0,
            right_volume: 0,
            left_unmatched: 0,
            right_unmatched: 0,
            matched_to_date: 0,
            last_matched_at: None,
            created_at,
        }
    }

    /// Create a node placed on `side` of `parent`
    pub fn new_child(user_id: UserId, parent: &TreeNode, side: Side, created_at: u64) -> Self {
        Self {
            parent_id: Some(parent.user_id.clone()),
            position: side.into(),
            level: parent.level.saturating_add(1),
            ..Self::new_root(user_id, created_at)
        }
    }

    pub fn child(&self, side: Side) -> Option<&UserId> {
        match side {
            Side::Left => self.left_child_id.as_ref(),
            Side::Right => self.right_child_id.as_ref(),
        }
    }

    pub fn set_child(&mut self, side: Side, child: UserId) {
        match side {
            Side::Left => self.left_child_id = Some(child),
            Side::Right => self.right_child_id = Some(child),
        }
    }

    /// Which leg of this node holds `child`, if any
    pub fn side_of_child(&self, child: &UserId) -> Option<Side> {
        if self.left_child_id.as_ref() == Some(child) {
            Some(Side::Left)
        } else if self.right_child_id.as_ref() == Some(child) {
            Some(Side::Right)
        } else {
            None
        }
    }

    pub fn volume(&self, side: Side) -> Amount {
        match side {
            Side::Left => self.left_volume,
            Side::Right => self.right_volume,
        }
    }

    pub fn unmatched(&self, side: Side) -> Amount {
        match side {
            Side::Left => self.left_unmatched,
            Side::Right => self.right_unmatched,
        }
    }

    /// Add investment volume to one leg, both cumulative and carry-forward
    ///
    /// Returns `None` on overflow and leaves the node untouched.
    pub fn add_volume(&mut self, side: Side, amount: Amount) -> Option<()> {
        let volume = self.volume(side).checked_add(amount)?;
        let unmatched = self.unmatched(side).checked_add(amount)?;
        match side {
            Side::Left => {
                self.left_volume = volume;
                self.left_unmatched = unmatched;
            }
            Side::Right => {
                self.right_volume = volume;
                self.right_unmatched = unmatched;
            }
        }
        Some(())
    }

    /// Both legs carry unmatched volume
    pub fn is_eligible(&self) -> bool {
        self.left_unmatched > 0 && self.right_unmatched > 0
    }

    /// Volume that could be paired right now, before caps
    pub fn match_candidate(&self) -> Amount {
        self.left_unmatched.min(self.right_unmatched)
    }

    /// Carry-forward never exceeds cumulative volume
    pub fn invariants_hold(&self) -> bool {
        self.left_unmatched <= self.left_volume && self.right_unmatched <= self.right_volume
    }
}

/// Sponsor (unilevel) relationship, set once at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorEdge {
    pub user_id: UserId,
    pub sponsor_id: UserId,
    pub created_at: u64,
}

/// One executed binary match. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub matched_volume: Amount,
    /// Left carry-forward before the match
    pub left_volume_before: Amount,
    /// Left carry-forward after the match
    pub left_volume_after: Amount,
    /// Right carry-forward before the match
    pub right_volume_before: Amount,
    /// Right carry-forward after the match
    pub right_volume_after: Amount,
    pub payout_amount: Amount,
    pub payout_percentage: BasisPoints,
    pub created_at: u64,
}

impl MatchRecord {
    /// Reference id handed to the wallet; stable for retries
    pub fn reference_id(&self) -> String {
        format!("binary-match:{}", self.id)
    }
}

/// One level-income commission. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRecord {
    /// Derived from the investment idempotency key and the level
    pub id: String,
    pub recipient_id: UserId,
    pub source_user_id: UserId,
    pub level: u8,
    pub investment_amount: Amount,
    pub percentage_applied: BasisPoints,
    pub commission_amount: Amount,
    pub created_at: u64,
}

impl CommissionRecord {
    /// Deterministic id so a replayed event maps onto the same record
    pub fn record_id(idempotency_key: &str, level: u8) -> String {
        format!("level-income:{}:{:02}", idempotency_key, level)
    }
}

/// Why a wallet credit is issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    BinaryMatch,
    LevelIncome { level: u8 },
}

impl fmt::Display for CreditReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreditReason::BinaryMatch => write!(f, "binary match payout"),
            CreditReason::LevelIncome { level } => write!(f, "level {} income", level),
        }
    }
}

/// Wallet credit owed for a committed ledger record
///
/// Written in the same storage transaction as the record and removed once the
/// wallet confirms, so a crash between commit and credit is recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCredit {
    pub reference_id: String,
    pub user_id: UserId,
    pub amount: Amount,
    pub reason: CreditReason,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub last_attempt_at: Option<u64>,
}

impl PendingCredit {
    pub fn new(reference_id: String, user_id: UserId, amount: Amount, reason: CreditReason, created_at: u64) -> Self {
        Self {
            reference_id,
            user_id,
            amount,
            reason,
            attempts: 0,
            last_error: None,
            created_at,
            last_attempt_at: None,
        }
    }

    /// Record a failed attempt
    pub fn failed(mut self, error: impl Into<String>, at: u64) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_attempt_at = Some(at);
        self
    }
}
