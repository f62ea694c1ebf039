//! Synchronous per-operation persistence through the broker's store

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::txn::{BrokerAddress, TransactionAck, TransactionBroker, TransactionState, TransactionWork, TxnStatus};
use crate::types::{TransactionUid, TxnKind};

use super::{LoadFailure, PersistenceStrategy, RecoverySnapshot, StoredRemoteTransaction, StoredTransaction};

/// The persistent store, as far as transactions are concerned
pub trait TxnStore: Send + Sync {
    fn store_transaction(&self, uid: TransactionUid, state: &TransactionState) -> Result<()>;

    fn store_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: Option<&[TransactionBroker]>,
    ) -> Result<()>;

    fn store_remote_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        acks: &[TransactionAck],
        home: Option<&BrokerAddress>,
    ) -> Result<()>;

    fn update_transaction_state(&self, uid: TransactionUid, state: &TransactionState) -> Result<()>;

    /// Stores without a write-ahead log ignore the work
    fn update_transaction_state_with_work(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        _work: &TransactionWork,
    ) -> Result<()> {
        self.update_transaction_state(uid, state)
    }

    fn update_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: &[TransactionBroker],
    ) -> Result<()>;

    fn update_cluster_transaction_broker_state(
        &self,
        uid: TransactionUid,
        expected: TxnStatus,
        broker: &TransactionBroker,
    ) -> Result<()>;

    fn update_remote_transaction(
        &self,
        uid: TransactionUid,
        acks: &[TransactionAck],
        home: &BrokerAddress,
    ) -> Result<()>;

    fn remove_transaction(&self, uid: TransactionUid, remove_acks: bool) -> Result<()>;

    fn store_transaction_ack(&self, uid: TransactionUid, ack: &TransactionAck) -> Result<()>;

    fn remove_transaction_ack(&self, uid: TransactionUid) -> Result<()>;

    fn get_all_transaction_states(&self) -> Result<Vec<StoredTransaction>>;

    fn get_all_remote_transaction_states(&self) -> Result<Vec<StoredRemoteTransaction>>;

    fn get_transaction_acks(&self, uid: TransactionUid) -> Result<Vec<TransactionAck>>;

    fn get_load_failures(&self) -> Vec<LoadFailure> {
        Vec::new()
    }
}

/// Forwards every change to the store as it happens
pub struct StorePersistence {
    store: Arc<dyn TxnStore>,
}

impl StorePersistence {
    pub fn new(store: Arc<dyn TxnStore>) -> Self {
        Self { store }
    }
}

impl PersistenceStrategy for StorePersistence {
    fn name(&self) -> &'static str {
        "store"
    }

    fn store_transaction(&self, uid: TransactionUid, state: &TransactionState) -> Result<()> {
        self.store.store_transaction(uid, state)
    }

    fn update_transaction_state(
        &self,
        uid: TransactionUid,
        _kind: TxnKind,
        state: &TransactionState,
        work: Option<&TransactionWork>,
    ) -> Result<()> {
        match work {
            Some(work) => self.store.update_transaction_state_with_work(uid, state, work),
            None => self.store.update_transaction_state(uid, state),
        }
    }

    fn remove_transaction(&self, uid: TransactionUid, _kind: TxnKind, _final_status: TxnStatus) -> Result<()> {
        self.store.remove_transaction(uid, true)
    }

    fn store_transaction_ack(&self, uid: TransactionUid, ack: &TransactionAck) -> Result<()> {
        self.store.store_transaction_ack(uid, ack)
    }

    fn remove_transaction_acks(&self, uid: TransactionUid) -> Result<()> {
        self.store.remove_transaction_ack(uid)
    }

    fn store_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: &[TransactionBroker],
    ) -> Result<()> {
        self.store.store_cluster_transaction(uid, state, Some(brokers))
    }

    fn update_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: &[TransactionBroker],
    ) -> Result<()> {
        self.store.update_cluster_transaction(uid, state, brokers)
    }

    fn update_cluster_broker_state(
        &self,
        uid: TransactionUid,
        expected: TxnStatus,
        broker: &TransactionBroker,
        _state: &TransactionState,
        _all: &[TransactionBroker],
    ) -> Result<()> {
        self.store.update_cluster_transaction_broker_state(uid, expected, broker)
    }

    fn store_remote_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        acks: &[TransactionAck],
        home: Option<&BrokerAddress>,
    ) -> Result<()> {
        self.store.store_remote_transaction(uid, state, acks, home)
    }

    fn update_remote_transaction(
        &self,
        uid: TransactionUid,
        _state: &TransactionState,
        acks: &[TransactionAck],
        home: &BrokerAddress,
    ) -> Result<()> {
        self.store.update_remote_transaction(uid, acks, home)
    }

    fn update_remote_transaction_state(&self, uid: TransactionUid, state: &TransactionState) -> Result<()> {
        self.store.update_transaction_state(uid, state)
    }

    fn remove_remote_transaction(&self, uid: TransactionUid, _final_status: TxnStatus) -> Result<()> {
        self.store.remove_transaction(uid, true)
    }

    fn load_failures(&self) -> Result<Vec<LoadFailure>> {
        Ok(self.store.get_load_failures())
    }

    fn load(&self) -> Result<RecoverySnapshot> {
        let transactions = self.store.get_all_transaction_states()?;
        let mut remote = self.store.get_all_remote_transaction_states()?;

        let mut acks = HashMap::new();
        for txn in &transactions {
            let list = self.store.get_transaction_acks(txn.uid)?;
            if !list.is_empty() {
                acks.insert(txn.uid, list);
            }
        }
        for txn in &mut remote {
            if txn.acks.is_empty() {
                txn.acks = self.store.get_transaction_acks(txn.uid)?;
            }
        }

        log::debug!(
            "Loaded {} transactions, {} remote transactions, {} with acks from store",
            transactions.len(),
            remote.len(),
            acks.len()
        );
        Ok(RecoverySnapshot {
            transactions,
            remote,
            acks,
        })
    }
}
