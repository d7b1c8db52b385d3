//! Error types for the Lounge Engine.
//!
//! Every operation on sessions and bills fails with a [`LoungeError`].
//! The variants mirror the categories callers need to tell apart:
//! bad input, unknown ids, illegal state transitions, and failures of
//! the underlying store.  Downstream errors (notifications, device
//! status) never surface here; they are logged where they happen.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using [`LoungeError`].
pub type Result<T> = std::result::Result<T, LoungeError>;

/// Unified error type for session and bill operations.
#[derive(Debug, Error)]
pub enum LoungeError {
    /// Input rejected before any mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A session, bill, device or table id did not resolve.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The record exists but is in a state that forbids the operation.
    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl LoungeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LoungeError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        LoungeError::StateConflict(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        LoungeError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Machine-distinguishable reason returned to API callers.
    pub fn reason(&self) -> &'static str {
        match self {
            LoungeError::Validation(_) => "validation",
            LoungeError::NotFound { .. } => "not_found",
            LoungeError::StateConflict(_) => "state_conflict",
            LoungeError::Store(_) => "internal",
        }
    }
}

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Bill not found: {0}")]
    BillNotFound(Uuid),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_distinct_per_category() {
        assert_eq!(LoungeError::validation("x").reason(), "validation");
        assert_eq!(LoungeError::not_found("Session", "abc").reason(), "not_found");
        assert_eq!(LoungeError::conflict("x").reason(), "state_conflict");
        let store: LoungeError = StoreError::Backend("down".into()).into();
        assert_eq!(store.reason(), "internal");
    }

    #[test]
    fn not_found_message_names_the_record() {
        let err = LoungeError::not_found("Bill", "b-1");
        assert_eq!(err.to_string(), "Bill not found: b-1");
    }
}
