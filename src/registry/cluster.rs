//! Cluster transactions and HA takeover
//!
//! A cluster transaction is a local transaction whose consumed messages live
//! on other brokers. Its participant list is fixed when the transaction is
//! logged; each participant is marked COMPLETE once it confirmed the outcome.

use std::sync::Arc;

use super::TransactionRegistry;
use crate::error::{Result, TxnError};
use crate::persist::StoredTransaction;
use crate::txn::broker::{BrokerAddress, TransactionBroker};
use crate::txn::record::TransactionRecord;
use crate::txn::state::{TransactionState, TxnStatus};
use crate::types::{TransactionUid, TxnKind};

impl TransactionRegistry {
    /// Record the participants of a cluster transaction. With `exist` the
    /// transaction must already be registered; otherwise it is created.
    pub fn log_cluster_transaction(
        &self,
        uid: TransactionUid,
        state: TransactionState,
        brokers: Vec<TransactionBroker>,
        exist: bool,
        persist: bool,
    ) -> Result<()> {
        let (record, added) = match self.record(uid) {
            Some(record) => (record, false),
            None if exist => {
                return Err(TxnError::internal(format!(
                    "Cluster transaction {} expected to be registered",
                    uid
                )));
            }
            None => (self.register(uid, state, TxnKind::Cluster, false, false)?, true),
        };
        if record.is_takeover_locked() {
            return Err(TxnError::NotFound(format!(
                "Transaction {} is being taken over by another thread",
                uid
            )));
        }
        record.set_cluster_brokers(brokers.clone());

        if persist {
            let state = record.state();
            let stored = if added {
                self.persistence.store_cluster_transaction(uid, &state, &brokers)
            } else {
                self.persistence.update_cluster_transaction(uid, &state, &brokers)
            };
            if let Err(e) = stored {
                log::error!("Unable to log cluster transaction {}: {}", uid, e);
                if added {
                    self.unregister(uid);
                }
                return Err(e);
            }
        }
        log::debug!("Logged cluster transaction {} with {} participants", uid, brokers.len());
        Ok(())
    }

    /// A participant confirmed the outcome of `uid`. The transaction must be
    /// in `expected`.
    pub fn complete_cluster_transaction_broker_state(
        &self,
        uid: TransactionUid,
        expected: TxnStatus,
        addr: &BrokerAddress,
        persist: bool,
    ) -> Result<()> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        {
            let mut guard = record.lock();
            let data = &mut *guard;
            let current = data.state.status();
            if current != expected {
                return Err(TxnError::internal(format!(
                    "Cluster transaction {} is in state {}, expected {}",
                    uid, current, expected
                )));
            }
            let view = self.collab.cluster_view.as_ref();
            let participants = data.participants.as_mut().ok_or_else(|| {
                TxnError::NotFound(format!("Transaction {} has no participants", uid))
            })?;
            let broker = participants.find_mut(addr, view).ok_or_else(|| {
                TxnError::NotFound(format!("{} is not a participant of transaction {}", addr, uid))
            })?;
            let changed = broker.copy_state(&TransactionBroker::completed(addr.clone()))?;
            if persist && changed {
                let broker = broker.clone();
                let all = participants.to_vec();
                self.persistence
                    .update_cluster_broker_state(uid, expected, &broker, &data.state, &all)?;
            }
        }
        self.reaper.cluster_transaction_completed(uid);
        Ok(())
    }

    /// Participants of a cluster transaction; empty for a local one
    pub fn cluster_transaction_brokers(&self, uid: TransactionUid) -> Result<Vec<TransactionBroker>> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        Ok(record.cluster_brokers().unwrap_or_default())
    }

    pub fn cluster_transaction_broker(&self, uid: TransactionUid, addr: &BrokerAddress) -> Option<TransactionBroker> {
        let record = self.record(uid)?;
        let data = record.lock();
        data.participants
            .as_ref()?
            .find(addr, self.collab.cluster_view.as_ref())
            .cloned()
    }

    /// True if any participant is a broker other than this one
    pub fn has_remote_broker(&self, uid: TransactionUid) -> bool {
        let Some(brokers) = self.record(uid).and_then(|r| r.cluster_brokers()) else {
            return false;
        };
        let local = self.collab.cluster_view.local_address();
        brokers.iter().any(|b| Some(b.address()) != local.as_ref())
    }

    /// Adopt a transaction from a failed broker's store. The record stays
    /// takeover-locked to other threads until
    /// [`unlock_takeover_transactions`](Self::unlock_takeover_transactions).
    pub fn add_takeover_transaction(&self, stored: &StoredTransaction) -> Result<Arc<TransactionRecord>> {
        let uid = stored.uid;
        let record = self.register(uid, stored.state.clone(), stored.kind, true, false)?;
        if stored.kind == TxnKind::Cluster {
            let brokers = stored.brokers.clone().unwrap_or_default();
            self.log_cluster_transaction(uid, stored.state.clone(), brokers, true, false)?;
        }
        if stored.state.status() == TxnStatus::Prepared && stored.state.is_one_phase() {
            self.add_detached(uid);
        }
        log::info!("Took over {} transaction {} {}", stored.kind, uid, stored.state);
        Ok(record)
    }

    pub fn unlock_takeover_transactions(&self, uids: &[TransactionUid]) {
        for uid in uids {
            if let Some(record) = self.record(*uid) {
                record.takeover_lock().release();
            }
        }
    }

    /// Hand a committed transaction that was taken over to the reaper
    pub fn reap_takeover_committed_transaction(&self, uid: TransactionUid) -> Result<()> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        if !record.processed() {
            return Ok(());
        }
        if record.kind() == TxnKind::Cluster {
            self.reaper.add_cluster(uid, false, true);
        } else {
            self.reaper.add_local(uid, false);
        }
        Ok(())
    }
}
