//! Compensation Engine Errors

use thiserror::Error;

use crate::store::StoreError;
use crate::types::{Side, UserId, MAX_USER_ID_LENGTH};

/// Input rejected before any state is touched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Investment amount must be positive, got {0}")]
    NonPositiveAmount(i64),

    #[error("User id is empty")]
    EmptyUserId,

    #[error("User id is invalid: {0}")]
    InvalidUserId(String),

    #[error("Idempotency key is empty")]
    EmptyIdempotencyKey,

    #[error("Investor {0} has no tree node")]
    UnknownInvestor(UserId),
}

impl ValidationError {
    /// Check a user id is usable as a storage key
    pub fn check_user_id(user_id: &UserId) -> Result<(), ValidationError> {
        if user_id.is_empty() {
            return Err(ValidationError::EmptyUserId);
        }
        if user_id.as_str().len() > MAX_USER_ID_LENGTH {
            return Err(ValidationError::InvalidUserId(format!(
                "longer than {} bytes",
                MAX_USER_ID_LENGTH
            )));
        }
        if user_id.as_str().chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidUserId(format!("{:?} contains control characters", user_id.as_str())));
        }
        Ok(())
    }
}

/// Failure inside an engine operation
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Arithmetic overflow on {field} of {user}")]
    Overflow { user: UserId, field: &'static str },

    #[error("Tree invariant violated for {user}: {detail}")]
    InvariantViolated { user: UserId, detail: String },

    #[error("Traversal from {start} exceeded {limit} steps or revisited a node")]
    TraversalBound { start: UserId, limit: u32 },
}

/// Account registration failure
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("User {0} is already registered")]
    AlreadyRegistered(UserId),

    #[error("Sponsor {0} is not registered")]
    UnknownSponsor(UserId),

    #[error("Placement parent {0} is not registered")]
    UnknownParent(UserId),

    #[error("The {side} slot under {parent} is already taken")]
    SlotOccupied { parent: UserId, side: Side },

    #[error("A root account must not have a sponsor")]
    RootWithSponsor,

    #[error("Placement under {0} exceeded the tree depth bound")]
    TreeTooDeep(UserId),

    #[error("Placement kept conflicting with concurrent registrations")]
    Contention,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_validation() {
        assert!(ValidationError::check_user_id(&"alice".into()).is_ok());
        assert_eq!(
            ValidationError::check_user_id(&"".into()),
            Err(ValidationError::EmptyUserId)
        );
        assert!(matches!(
            ValidationError::check_user_id(&"a\0b".into()),
            Err(ValidationError::InvalidUserId(_))
        ));
        let long = "x".repeat(MAX_USER_ID_LENGTH + 1);
        assert!(matches!(
            ValidationError::check_user_id(&long.into()),
            Err(ValidationError::InvalidUserId(_))
        ));
    }

    #[test]
    fn test_error_messages() {
        let err = ValidationError::NonPositiveAmount(-5);
        assert_eq!(err.to_string(), "Investment amount must be positive, got -5");

        let err = RegistrationError::SlotOccupied { parent: "root".into(), side: Side::Left };
        assert_eq!(err.to_string(), "The left slot under root is already taken");
    }
}
