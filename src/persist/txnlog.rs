//! Transaction-log persistence
//!
//! Instead of one store call per operation, a transaction is written to the
//! log as a whole when it reaches PREPARED or COMMITTED, and a completion
//! record is appended once it is finished. At startup the log hands back every
//! transaction that never saw its completion record.
//!
//! | Change                                   | Logged as                      |
//! |------------------------------------------|--------------------------------|
//! | state PREPARED                           | transaction + work             |
//! | state COMMITTED with work                | transaction + work, then completion (local only) |
//! | state COMMITTED without work, ROLLEDBACK | completion                     |
//! | cluster participants changed             | transaction + participant list |
//! | remote transaction stored                | transaction + acks + home      |
//! | remove                                   | completion                     |
//!
//! Acks and plain store-transaction calls are not logged at all.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::txn::{BrokerAddress, TransactionAck, TransactionBroker, TransactionState, TransactionWork, TxnStatus};
use crate::types::{TransactionUid, TxnKind};

use super::{LoadFailure, PersistenceStrategy, RecoverySnapshot, StoredRemoteTransaction, StoredTransaction};

/// One transaction as written to the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedTransaction {
    pub uid: TransactionUid,
    pub kind: TxnKind,
    pub state: TransactionState,
    pub work: Option<TransactionWork>,
    /// Cluster participants
    pub brokers: Option<Vec<TransactionBroker>>,
    /// Home broker of a remote transaction
    pub home: Option<BrokerAddress>,
    /// Acks of a remote transaction
    pub acks: Vec<TransactionAck>,
}

impl LoggedTransaction {
    pub fn new(uid: TransactionUid, kind: TxnKind, state: TransactionState) -> Self {
        Self {
            uid,
            kind,
            state,
            work: None,
            brokers: None,
            home: None,
            acks: Vec::new(),
        }
    }

    pub fn with_work(mut self, work: TransactionWork) -> Self {
        self.work = Some(work);
        self
    }

    pub fn with_brokers(mut self, brokers: Vec<TransactionBroker>) -> Self {
        self.brokers = Some(brokers);
        self
    }

    pub fn with_home(mut self, home: BrokerAddress) -> Self {
        self.home = Some(home);
        self
    }

    pub fn with_acks(mut self, acks: Vec<TransactionAck>) -> Self {
        self.acks = acks;
        self
    }
}

/// A write-ahead transaction log
pub trait TxnLog: Send + Sync {
    /// Append a transaction; returns once the entry is durable.
    /// A later entry for the same uid replaces the earlier one.
    fn log_txn(&self, txn: &LoggedTransaction) -> Result<()>;

    /// The transaction is finished and needs no replay
    fn log_txn_completion(&self, uid: TransactionUid, status: TxnStatus, kind: TxnKind) -> Result<()>;

    /// Logged transactions of `kind` without a completion record
    fn get_incomplete_transactions(&self, kind: TxnKind) -> Result<Vec<LoggedTransaction>>;
}

pub struct LogPersistence {
    log: Arc<dyn TxnLog>,
}

impl LogPersistence {
    pub fn new(log: Arc<dyn TxnLog>) -> Self {
        Self { log }
    }
}

impl PersistenceStrategy for LogPersistence {
    fn name(&self) -> &'static str {
        "txnlog"
    }

    fn store_transaction(&self, _uid: TransactionUid, _state: &TransactionState) -> Result<()> {
        Ok(())
    }

    fn update_transaction_state(
        &self,
        uid: TransactionUid,
        kind: TxnKind,
        state: &TransactionState,
        work: Option<&TransactionWork>,
    ) -> Result<()> {
        match state.status() {
            TxnStatus::Prepared => {
                let entry = LoggedTransaction::new(uid, kind, state.clone())
                    .with_work(work.cloned().unwrap_or_default());
                self.log.log_txn(&entry)
            }
            TxnStatus::Committed => match work {
                Some(work) => {
                    let entry = LoggedTransaction::new(uid, kind, state.clone()).with_work(work.clone());
                    self.log.log_txn(&entry)?;
                    if kind == TxnKind::Local {
                        self.log.log_txn_completion(uid, TxnStatus::Committed, kind)?;
                    }
                    Ok(())
                }
                // Cluster commits are logged with their participant list
                None if kind == TxnKind::Cluster => Ok(()),
                None => self.log.log_txn_completion(uid, TxnStatus::Committed, kind),
            },
            TxnStatus::RolledBack => self.log.log_txn_completion(uid, TxnStatus::RolledBack, kind),
            _ => Ok(()),
        }
    }

    fn remove_transaction(&self, uid: TransactionUid, kind: TxnKind, final_status: TxnStatus) -> Result<()> {
        self.log.log_txn_completion(uid, final_status, kind)
    }

    fn store_transaction_ack(&self, _uid: TransactionUid, _ack: &TransactionAck) -> Result<()> {
        Ok(())
    }

    fn remove_transaction_acks(&self, _uid: TransactionUid) -> Result<()> {
        Ok(())
    }

    fn store_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: &[TransactionBroker],
    ) -> Result<()> {
        let entry = LoggedTransaction::new(uid, TxnKind::Cluster, state.clone()).with_brokers(brokers.to_vec());
        self.log.log_txn(&entry)
    }

    fn update_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: &[TransactionBroker],
    ) -> Result<()> {
        self.store_cluster_transaction(uid, state, brokers)
    }

    fn update_cluster_broker_state(
        &self,
        uid: TransactionUid,
        _expected: TxnStatus,
        _broker: &TransactionBroker,
        state: &TransactionState,
        all: &[TransactionBroker],
    ) -> Result<()> {
        let entry = LoggedTransaction::new(uid, TxnKind::Cluster, state.clone()).with_brokers(all.to_vec());
        self.log.log_txn(&entry)?;
        if all.iter().all(TransactionBroker::is_completed) {
            self.log.log_txn_completion(uid, state.status(), TxnKind::Cluster)?;
        }
        Ok(())
    }

    fn store_remote_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        acks: &[TransactionAck],
        home: Option<&BrokerAddress>,
    ) -> Result<()> {
        let mut entry = LoggedTransaction::new(uid, TxnKind::Remote, state.clone()).with_acks(acks.to_vec());
        entry.home = home.cloned();
        self.log.log_txn(&entry)
    }

    fn update_remote_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        acks: &[TransactionAck],
        home: &BrokerAddress,
    ) -> Result<()> {
        self.store_remote_transaction(uid, state, acks, Some(home))
    }

    fn update_remote_transaction_state(&self, uid: TransactionUid, state: &TransactionState) -> Result<()> {
        match state.status() {
            status @ (TxnStatus::Committed | TxnStatus::RolledBack) => {
                self.log.log_txn_completion(uid, status, TxnKind::Remote)
            }
            _ => Ok(()),
        }
    }

    fn remove_remote_transaction(&self, uid: TransactionUid, final_status: TxnStatus) -> Result<()> {
        self.log.log_txn_completion(uid, final_status, TxnKind::Remote)
    }

    fn load_failures(&self) -> Result<Vec<LoadFailure>> {
        Ok(Vec::new())
    }

    fn load(&self) -> Result<RecoverySnapshot> {
        let mut snapshot = RecoverySnapshot::default();
        for kind in [TxnKind::Local, TxnKind::Cluster] {
            for txn in self.log.get_incomplete_transactions(kind)? {
                snapshot.transactions.push(StoredTransaction {
                    uid: txn.uid,
                    kind,
                    state: txn.state,
                    brokers: txn.brokers,
                    work: txn.work,
                });
            }
        }
        for txn in self.log.get_incomplete_transactions(TxnKind::Remote)? {
            snapshot.remote.push(StoredRemoteTransaction {
                uid: txn.uid,
                state: txn.state,
                home: txn.home,
                acks: txn.acks,
            });
        }
        snapshot.transactions.sort_by_key(|t| t.uid);
        snapshot.remote.sort_by_key(|t| t.uid);

        log::debug!(
            "Loaded {} transactions and {} remote transactions from transaction log",
            snapshot.transactions.len(),
            snapshot.remote.len()
        );
        Ok(snapshot)
    }
}
