//! Persistence of transaction bookkeeping
//!
//! The registry talks to exactly one [`PersistenceStrategy`], chosen when the
//! broker starts:
//!
//! - [`StorePersistence`] forwards every change synchronously to a [`TxnStore`]
//!   (per-record store calls, one per operation).
//! - [`LogPersistence`] appends whole transactions, with their
//!   [`TransactionWork`], to a write-ahead [`TxnLog`] at prepare/commit time and
//!   skips the per-operation calls.
//!
//! Both produce the same [`RecoverySnapshot`] at startup, so recovery runs one
//! algorithm regardless of mode.

pub mod store;
pub mod memory;
pub mod txnlog;
pub mod file_log;

use std::collections::HashMap;
use std::fmt;

use crate::error::Result;
use crate::txn::{BrokerAddress, TransactionAck, TransactionBroker, TransactionState, TransactionWork, TxnStatus};
use crate::types::{TransactionUid, TxnKind};

pub use self::file_log::{FileTxnLog, TxnLogConfig};
pub use self::txnlog::{LogPersistence, LoggedTransaction, TxnLog};
pub use self::memory::MemoryStore;
pub use self::store::{StorePersistence, TxnStore};

/// A persisted local or cluster transaction
#[derive(Debug, Clone)]
pub struct StoredTransaction {
    pub uid: TransactionUid,
    pub kind: TxnKind,
    pub state: TransactionState,
    /// Participants of a cluster transaction
    pub brokers: Option<Vec<TransactionBroker>>,
    /// Work logged with the transaction (transaction-log mode only)
    pub work: Option<TransactionWork>,
}

impl StoredTransaction {
    pub fn local(uid: TransactionUid, state: TransactionState) -> Self {
        Self {
            uid,
            kind: TxnKind::Local,
            state,
            brokers: None,
            work: None,
        }
    }

    pub fn cluster(uid: TransactionUid, state: TransactionState, brokers: Vec<TransactionBroker>) -> Self {
        Self {
            uid,
            kind: TxnKind::Cluster,
            state,
            brokers: Some(brokers),
            work: None,
        }
    }
}

/// A persisted participation in another broker's transaction
#[derive(Debug, Clone)]
pub struct StoredRemoteTransaction {
    pub uid: TransactionUid,
    pub state: TransactionState,
    pub home: Option<BrokerAddress>,
    pub acks: Vec<TransactionAck>,
}

/// A persisted entry that could not be read back completely
#[derive(Debug, Clone)]
pub enum LoadFailure {
    /// The transaction id itself is unreadable; nothing can be done
    MissingKey { detail: String },
    /// Id readable, transaction info unreadable
    MissingValue { uid: TransactionUid },
    /// Transaction type unreadable
    UnknownType { uid: TransactionUid },
    /// Nested state unreadable
    MissingState { uid: TransactionUid },
    /// Cluster transaction without its participant list
    MissingBrokers { uid: TransactionUid, state: TransactionState },
    /// Remote transaction without its home broker
    MissingHome { uid: TransactionUid, state: TransactionState },
    /// Ack entry with an unreadable transaction id
    AckMissingKey { detail: String },
    /// Ack entry whose acknowledgements are unreadable
    AckMissingValue { uid: TransactionUid },
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadFailure::MissingKey { detail } => write!(f, "transaction id corrupted ({})", detail),
            LoadFailure::MissingValue { uid } => write!(f, "transaction {} info corrupted", uid),
            LoadFailure::UnknownType { uid } => write!(f, "transaction {} type corrupted", uid),
            LoadFailure::MissingState { uid } => write!(f, "transaction {} state corrupted", uid),
            LoadFailure::MissingBrokers { uid, .. } => {
                write!(f, "cluster transaction {} broker list corrupted", uid)
            }
            LoadFailure::MissingHome { uid, .. } => {
                write!(f, "remote transaction {} home broker corrupted", uid)
            }
            LoadFailure::AckMissingKey { detail } => write!(f, "transaction ack id corrupted ({})", detail),
            LoadFailure::AckMissingValue { uid } => write!(f, "transaction {} acks corrupted", uid),
        }
    }
}

/// Everything persisted, as read at startup
#[derive(Debug, Default)]
pub struct RecoverySnapshot {
    pub transactions: Vec<StoredTransaction>,
    pub remote: Vec<StoredRemoteTransaction>,
    pub acks: HashMap<TransactionUid, Vec<TransactionAck>>,
}

/// The single persistence interface used by the registry and recovery
pub trait PersistenceStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn store_transaction(&self, uid: TransactionUid, state: &TransactionState) -> Result<()>;

    /// Persist a state change, together with the transaction's work when given
    fn update_transaction_state(
        &self,
        uid: TransactionUid,
        kind: TxnKind,
        state: &TransactionState,
        work: Option<&TransactionWork>,
    ) -> Result<()>;

    /// Remove a finished transaction and its acks
    fn remove_transaction(&self, uid: TransactionUid, kind: TxnKind, final_status: TxnStatus) -> Result<()>;

    fn store_transaction_ack(&self, uid: TransactionUid, ack: &TransactionAck) -> Result<()>;

    fn remove_transaction_acks(&self, uid: TransactionUid) -> Result<()>;

    fn store_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: &[TransactionBroker],
    ) -> Result<()>;

    fn update_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: &[TransactionBroker],
    ) -> Result<()>;

    /// One participant changed; `all` is the full participant list after the change
    fn update_cluster_broker_state(
        &self,
        uid: TransactionUid,
        expected: TxnStatus,
        broker: &TransactionBroker,
        state: &TransactionState,
        all: &[TransactionBroker],
    ) -> Result<()>;

    fn store_remote_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        acks: &[TransactionAck],
        home: Option<&BrokerAddress>,
    ) -> Result<()>;

    fn update_remote_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        acks: &[TransactionAck],
        home: &BrokerAddress,
    ) -> Result<()>;

    fn update_remote_transaction_state(&self, uid: TransactionUid, state: &TransactionState) -> Result<()>;

    fn remove_remote_transaction(&self, uid: TransactionUid, final_status: TxnStatus) -> Result<()>;

    /// Entries that failed to load. Consumed by recovery before [`load`](Self::load).
    fn load_failures(&self) -> Result<Vec<LoadFailure>>;

    fn load(&self) -> Result<RecoverySnapshot>;
}
