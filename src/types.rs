//! Identifier and tag types shared by every part of the transaction core

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Process-unique 64-bit transaction identifier.
///
/// Layout: milliseconds since the epoch in the upper 48 bits, a wrapping
/// sequence in the lower 16 bits. Ids are immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionUid(u64);

static UID_SEQUENCE: AtomicU64 = AtomicU64::new(0);
static LAST_UID: AtomicU64 = AtomicU64::new(0);

impl TransactionUid {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a new id, strictly greater than every id previously
    /// generated by this process.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let seq = UID_SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
        let candidate = (millis << 16) | seq;

        let mut last = LAST_UID.load(Ordering::Acquire);
        loop {
            let next = candidate.max(last + 1);
            match LAST_UID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Self(next),
                Err(actual) => last = actual,
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TransactionUid {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// External (XA) transaction id supplied by a transaction manager
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch_qualifier: Vec<u8>,
}

impl Xid {
    pub const NULL_FORMAT_ID: i32 = -1;

    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch_qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    /// The sentinel some clients send in place of "no xid"
    pub fn null() -> Self {
        Self::new(Self::NULL_FORMAT_ID, Vec::new(), Vec::new())
    }

    pub fn is_null(&self) -> bool {
        self.format_id == Self::NULL_FORMAT_ID
            && self.global_id.is_empty()
            && self.branch_qualifier.is_empty()
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ":")?;
        for b in &self.branch_qualifier {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// System-wide message id assigned by the delivery layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consumer identifier (runtime or stored/durable consumer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerUid(pub u64);

impl fmt::Display for ConsumerUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Destination (queue or topic) a message belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationId(pub String);

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which broker coordinates a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnKind {
    /// Owned by this broker, no other broker involved
    Local,
    /// Owned by this broker, with participant brokers
    Cluster,
    /// Owned by another (home) broker; we only hold acknowledgements
    Remote,
}

impl fmt::Display for TxnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnKind::Local => "LOCAL",
            TxnKind::Cluster => "CLUSTER",
            TxnKind::Remote => "REMOTE",
        };
        write!(f, "{}", name)
    }
}

/// What happens to a transaction left open when its connection or the broker goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AutoRollback {
    /// Roll back regardless of state
    #[default]
    All,
    /// Roll back only if not yet prepared
    NotPrepared,
    /// Never roll back automatically
    Never,
}

impl fmt::Display for AutoRollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AutoRollback::All => "ALL",
            AutoRollback::NotPrepared => "NOT_PREPARED",
            AutoRollback::Never => "NEVER",
        };
        write!(f, "{}", name)
    }
}
