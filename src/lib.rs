//! mqtxn - transaction coordination core of a clustered message broker
//!
//! Tracks local, cluster and remote transactions, enforces their state
//! machine, persists enough to recover after a crash and reaps finished
//! transactions in the background.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Protocol handlers / cluster transport          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Transaction Registry                      │
//! │     (local, cluster and remote records, XID index)          │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                    │
//!          ▼                   ▼                    ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────────┐
//! │ Completion      │ │ Detached        │ │ Persistence         │
//! │ Reaper          │ │ Watchdog        │ │ (store or txn log)  │
//! └─────────────────┘ └─────────────────┘ └─────────────────────┘
//!
//! At startup [`RecoveryLoader`] rebuilds the registry from persistence
//! before traffic is accepted.

pub mod error;
pub mod config;
pub mod types;
pub mod clock;
pub mod timer;
pub mod txn;
pub mod collaborators;
pub mod persist;
pub mod registry;
pub mod reaper;
pub mod watchdog;
pub mod recovery;

pub use crate::collaborators::{Collaborators, RollbackReason};
pub use crate::config::TxnConfig;
pub use crate::error::{Result, TxnError};
pub use crate::persist::{FileTxnLog, LogPersistence, MemoryStore, PersistenceStrategy, StorePersistence};
pub use crate::reaper::CompletionReaper;
pub use crate::recovery::{RecoveryLoader, RecoveryReport};
pub use crate::registry::{RemoteRegistration, StateChange, TransactionRegistry};
pub use crate::txn::{TransactionState, TxnOperation, TxnStatus};
pub use crate::types::{ConsumerUid, MessageId, TransactionUid, TxnKind, Xid};
pub use crate::watchdog::DetachedWatchdog;
