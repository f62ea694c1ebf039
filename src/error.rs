//! Error types for the transaction core
//!
//! Every failure a protocol handler can see is one of the variants below.
//! All of them except [`TxnError::Internal`] are recoverable: the handler
//! translates them into a client-visible status code with [`TxnError::status_code`].
//! `Internal` marks a broken invariant and callers escalate it to a restart.

use std::fmt;
use std::io;

use crate::txn::state::{TxnOperation, TxnStatus};
use crate::types::TransactionUid;

/// Unified error type for transaction operations
#[derive(Debug)]
pub enum TxnError {
    /// Transaction (or external id) is unknown
    NotFound(String),
    /// Transaction or message was already resolved elsewhere
    Gone(String),
    /// Id reuse, duplicate acknowledgement, or a mismatched expected state
    Conflict(String),
    /// Operation requires STARTED but the transaction is in another live state
    PreconditionFailed(String),
    /// Transaction already timed out
    Timeout(String),
    /// Per-transaction produced/consumed message cap reached
    ResourceFull(String),
    /// Illegal remote transaction transition
    NotAllowed(String),
    /// Operation was already applied; nothing changed
    NotModified(String),
    /// Broken invariant. Callers treat this as broker-fatal.
    Internal(String),
    /// Failure reported by the persistent store collaborator
    Store(String),
    /// I/O error (transaction log file)
    Io(io::Error),
    /// Encoding/decoding error (bincode, JSON)
    Encoding(String),
}

impl TxnError {
    pub fn unknown_transaction(uid: TransactionUid) -> Self {
        TxnError::NotFound(format!("Unknown transaction {}", uid))
    }

    /// Illegal local state transition. When the transaction is FAILED the message
    /// carries the state it failed from and, if known, the state it was heading to.
    pub fn bad_transition(
        op: TxnOperation,
        current: TxnStatus,
        fail_from: Option<TxnStatus>,
        fail_to: Option<TxnStatus>,
        xid: Option<&str>,
    ) -> Self {
        let xid = xid.unwrap_or("-");
        let msg = match (current, fail_from, fail_to) {
            (TxnStatus::Failed, Some(from), Some(to)) => format!(
                "Transaction {} cannot {}: it failed in state {} while moving to {}",
                xid, op, from, to
            ),
            (TxnStatus::Failed, Some(from), None) => format!(
                "Transaction {} cannot {}: it failed in state {}",
                xid, op, from
            ),
            _ => format!("Transaction {} cannot {} in state {}", xid, op, current),
        };
        TxnError::Conflict(msg)
    }

    pub fn bad_remote_transition(uid: TransactionUid, from: TxnStatus, to: TxnStatus) -> Self {
        TxnError::NotAllowed(format!(
            "Remote transaction {} state {} can not transit to state {}",
            uid, from, to
        ))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TxnError::Internal(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        TxnError::Store(msg.into())
    }

    /// Broker status code for this error (HTTP-style numbering)
    pub fn status_code(&self) -> u16 {
        match self {
            TxnError::NotModified(_) => status_codes::NOT_MODIFIED,
            TxnError::NotFound(_) => status_codes::NOT_FOUND,
            TxnError::NotAllowed(_) => status_codes::NOT_ALLOWED,
            TxnError::Timeout(_) => status_codes::TIMEOUT,
            TxnError::Conflict(_) => status_codes::CONFLICT,
            TxnError::Gone(_) => status_codes::GONE,
            TxnError::PreconditionFailed(_) => status_codes::PRECONDITION_FAILED,
            TxnError::ResourceFull(_) => status_codes::RESOURCE_FULL,
            TxnError::Internal(_)
            | TxnError::Store(_)
            | TxnError::Io(_)
            | TxnError::Encoding(_) => status_codes::ERROR,
        }
    }

    /// True for broken invariants that require a controlled restart
    pub fn is_fatal(&self) -> bool {
        matches!(self, TxnError::Internal(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TxnError::NotFound(_))
    }
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnError::NotFound(msg) => write!(f, "{}", msg),
            TxnError::Gone(msg) => write!(f, "{}", msg),
            TxnError::Conflict(msg) => write!(f, "{}", msg),
            TxnError::PreconditionFailed(msg) => write!(f, "{}", msg),
            TxnError::Timeout(msg) => write!(f, "{}", msg),
            TxnError::ResourceFull(msg) => write!(f, "{}", msg),
            TxnError::NotAllowed(msg) => write!(f, "{}", msg),
            TxnError::NotModified(msg) => write!(f, "{}", msg),
            TxnError::Internal(msg) => write!(f, "Internal error: {}", msg),
            TxnError::Store(msg) => write!(f, "Store error: {}", msg),
            TxnError::Io(e) => write!(f, "{}", e),
            TxnError::Encoding(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TxnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TxnError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TxnError {
    fn from(e: io::Error) -> Self {
        TxnError::Io(e)
    }
}

impl From<bincode::Error> for TxnError {
    fn from(e: bincode::Error) -> Self {
        TxnError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for TxnError {
    fn from(e: serde_json::Error) -> Self {
        TxnError::Encoding(e.to_string())
    }
}

/// Result type alias for transaction operations
pub type Result<T> = std::result::Result<T, TxnError>;

/// Broker status codes returned to clients
pub mod status_codes {
    pub const OK: u16 = 200;
    pub const NOT_MODIFIED: u16 = 304;
    pub const NOT_FOUND: u16 = 404;
    pub const NOT_ALLOWED: u16 = 405;
    pub const TIMEOUT: u16 = 408;
    pub const CONFLICT: u16 = 409;
    pub const GONE: u16 = 410;
    pub const PRECONDITION_FAILED: u16 = 412;
    pub const RESOURCE_FULL: u16 = 413;
    pub const ERROR: u16 = 500;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TxnError::NotFound("x".into()).status_code(), 404);
        assert_eq!(TxnError::Gone("x".into()).status_code(), 410);
        assert_eq!(TxnError::Conflict("x".into()).status_code(), 409);
        assert_eq!(TxnError::ResourceFull("x".into()).status_code(), 413);
        assert_eq!(TxnError::NotModified("x".into()).status_code(), 304);
        assert_eq!(TxnError::internal("boom").status_code(), 500);
    }

    #[test]
    fn test_only_internal_is_fatal() {
        assert!(TxnError::internal("regression").is_fatal());
        assert!(!TxnError::Store("disk".into()).is_fatal());
        assert!(!TxnError::Timeout("late".into()).is_fatal());
    }

    #[test]
    fn test_bad_transition_mentions_failed_states() {
        let err = TxnError::bad_transition(
            TxnOperation::Prepare,
            TxnStatus::Failed,
            Some(TxnStatus::Started),
            Some(TxnStatus::Complete),
            Some("1:ab:cd"),
        );
        let msg = err.to_string();
        assert!(msg.contains("STARTED(1)"), "{}", msg);
        assert!(msg.contains("COMPLETE(4)"), "{}", msg);
        assert!(msg.contains("1:ab:cd"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: TxnError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, TxnError::Io(_)));
        assert_eq!(err.status_code(), 500);
    }
}
