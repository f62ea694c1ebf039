//! In-memory [`TxnStore`]
//!
//! Keeps everything in maps behind one lock. Used by embedded brokers that run
//! without a durable store, and by tests, which can seed records, inject load
//! failures and make the next write fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, TxnError};
use crate::txn::{BrokerAddress, TransactionAck, TransactionBroker, TransactionState, TxnStatus};
use crate::types::{TransactionUid, TxnKind};

use super::store::TxnStore;
use super::{LoadFailure, StoredRemoteTransaction, StoredTransaction};

#[derive(Default)]
struct MemoryData {
    transactions: HashMap<TransactionUid, StoredTransaction>,
    remote: HashMap<TransactionUid, StoredRemoteTransaction>,
    acks: HashMap<TransactionUid, Vec<TransactionAck>>,
}

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<MemoryData>,
    load_failures: Mutex<Vec<LoadFailure>>,
    fail_next_write: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a transaction record as if it had been persisted earlier
    pub fn insert(&self, txn: StoredTransaction) {
        self.data.write().transactions.insert(txn.uid, txn);
    }

    pub fn insert_remote(&self, txn: StoredRemoteTransaction) {
        self.data.write().remote.insert(txn.uid, txn);
    }

    pub fn insert_acks(&self, uid: TransactionUid, acks: Vec<TransactionAck>) {
        self.data.write().acks.entry(uid).or_default().extend(acks);
    }

    /// Report `failure` on the next load
    pub fn inject_load_failure(&self, failure: LoadFailure) {
        self.load_failures.lock().push(failure);
    }

    /// The next mutating call fails with a store error
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::Release);
    }

    pub fn contains(&self, uid: TransactionUid) -> bool {
        let data = self.data.read();
        data.transactions.contains_key(&uid) || data.remote.contains_key(&uid)
    }

    pub fn status(&self, uid: TransactionUid) -> Option<TxnStatus> {
        let data = self.data.read();
        data.transactions
            .get(&uid)
            .map(|t| t.state.status())
            .or_else(|| data.remote.get(&uid).map(|t| t.state.status()))
    }

    pub fn transaction(&self, uid: TransactionUid) -> Option<StoredTransaction> {
        self.data.read().transactions.get(&uid).cloned()
    }

    pub fn remote_transaction(&self, uid: TransactionUid) -> Option<StoredRemoteTransaction> {
        self.data.read().remote.get(&uid).cloned()
    }

    pub fn ack_count(&self, uid: TransactionUid) -> usize {
        self.data.read().acks.get(&uid).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        let data = self.data.read();
        data.transactions.len() + data.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::AcqRel) {
            return Err(TxnError::store("injected write failure"));
        }
        Ok(())
    }

    fn missing(uid: TransactionUid) -> TxnError {
        TxnError::NotFound(format!("Transaction {} not found in store", uid))
    }
}

impl TxnStore for MemoryStore {
    fn store_transaction(&self, uid: TransactionUid, state: &TransactionState) -> Result<()> {
        self.check_write()?;
        let mut data = self.data.write();
        if data.transactions.contains_key(&uid) {
            return Err(TxnError::Conflict(format!("Transaction {} already stored", uid)));
        }
        data.transactions.insert(uid, StoredTransaction::local(uid, state.clone()));
        Ok(())
    }

    fn store_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: Option<&[TransactionBroker]>,
    ) -> Result<()> {
        self.check_write()?;
        let txn = StoredTransaction {
            uid,
            kind: TxnKind::Cluster,
            state: state.clone(),
            brokers: brokers.map(<[TransactionBroker]>::to_vec),
            work: None,
        };
        self.data.write().transactions.insert(uid, txn);
        Ok(())
    }

    fn store_remote_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        acks: &[TransactionAck],
        home: Option<&BrokerAddress>,
    ) -> Result<()> {
        self.check_write()?;
        let mut data = self.data.write();
        data.remote.insert(
            uid,
            StoredRemoteTransaction {
                uid,
                state: state.clone(),
                home: home.cloned(),
                acks: Vec::new(),
            },
        );
        if !acks.is_empty() {
            data.acks.insert(uid, acks.to_vec());
        }
        Ok(())
    }

    fn update_transaction_state(&self, uid: TransactionUid, state: &TransactionState) -> Result<()> {
        self.check_write()?;
        let mut data = self.data.write();
        if let Some(txn) = data.transactions.get_mut(&uid) {
            txn.state = state.clone();
            return Ok(());
        }
        if let Some(txn) = data.remote.get_mut(&uid) {
            txn.state = state.clone();
            return Ok(());
        }
        Err(Self::missing(uid))
    }

    fn update_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: &TransactionState,
        brokers: &[TransactionBroker],
    ) -> Result<()> {
        self.check_write()?;
        let mut data = self.data.write();
        let txn = data.transactions.get_mut(&uid).ok_or_else(|| Self::missing(uid))?;
        txn.kind = TxnKind::Cluster;
        txn.state = state.clone();
        txn.brokers = Some(brokers.to_vec());
        Ok(())
    }

    fn update_cluster_transaction_broker_state(
        &self,
        uid: TransactionUid,
        expected: TxnStatus,
        broker: &TransactionBroker,
    ) -> Result<()> {
        self.check_write()?;
        let mut data = self.data.write();
        let txn = data.transactions.get_mut(&uid).ok_or_else(|| Self::missing(uid))?;
        if txn.state.status() != expected {
            return Err(TxnError::store(format!(
                "Transaction {} is {} in store, expected {}",
                uid,
                txn.state.status(),
                expected
            )));
        }
        let brokers = txn.brokers.as_mut().ok_or_else(|| {
            TxnError::store(format!("Transaction {} has no participants in store", uid))
        })?;
        let stored = brokers
            .iter_mut()
            .find(|b| b.address() == broker.address())
            .ok_or_else(|| Self::missing(uid))?;
        stored.copy_state(broker)?;
        Ok(())
    }

    fn update_remote_transaction(
        &self,
        uid: TransactionUid,
        acks: &[TransactionAck],
        home: &BrokerAddress,
    ) -> Result<()> {
        self.check_write()?;
        let mut data = self.data.write();
        let txn = data.remote.get_mut(&uid).ok_or_else(|| Self::missing(uid))?;
        txn.home = Some(home.clone());
        data.acks.entry(uid).or_default().extend(acks.iter().cloned());
        Ok(())
    }

    fn remove_transaction(&self, uid: TransactionUid, remove_acks: bool) -> Result<()> {
        self.check_write()?;
        let mut data = self.data.write();
        let found = data.transactions.remove(&uid).is_some() | data.remote.remove(&uid).is_some();
        if remove_acks {
            data.acks.remove(&uid);
        }
        if !found {
            return Err(Self::missing(uid));
        }
        Ok(())
    }

    fn store_transaction_ack(&self, uid: TransactionUid, ack: &TransactionAck) -> Result<()> {
        self.check_write()?;
        self.data.write().acks.entry(uid).or_default().push(ack.clone());
        Ok(())
    }

    fn remove_transaction_ack(&self, uid: TransactionUid) -> Result<()> {
        self.check_write()?;
        self.data.write().acks.remove(&uid);
        Ok(())
    }

    fn get_all_transaction_states(&self) -> Result<Vec<StoredTransaction>> {
        let mut all: Vec<StoredTransaction> = self.data.read().transactions.values().cloned().collect();
        all.sort_by_key(|t| t.uid);
        Ok(all)
    }

    fn get_all_remote_transaction_states(&self) -> Result<Vec<StoredRemoteTransaction>> {
        let mut all: Vec<StoredRemoteTransaction> = self.data.read().remote.values().cloned().collect();
        all.sort_by_key(|t| t.uid);
        Ok(all)
    }

    fn get_transaction_acks(&self, uid: TransactionUid) -> Result<Vec<TransactionAck>> {
        Ok(self.data.read().acks.get(&uid).cloned().unwrap_or_default())
    }

    fn get_load_failures(&self) -> Vec<LoadFailure> {
        std::mem::take(&mut *self.load_failures.lock())
    }
}
