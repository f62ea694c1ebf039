//! Remote transactions: this broker holds acknowledgements for a transaction
//! coordinated by another (home) broker.

use std::sync::Arc;
use std::time::Duration;

use super::TransactionRegistry;
use crate::error::{Result, TxnError};
use crate::txn::broker::{BrokerAddress, TransactionBroker};
use crate::txn::remote::RemoteTransactionRecord;
use crate::txn::state::{remote_next_state, TransactionState, TxnStatus};
use crate::txn::work::TransactionAck;
use crate::types::TransactionUid;

/// Arguments of [`TransactionRegistry::log_remote_transaction`]
#[derive(Debug, Clone)]
pub struct RemoteRegistration {
    pub state: TransactionState,
    pub acks: Vec<TransactionAck>,
    pub home: BrokerAddress,
    /// Replayed by the home broker during its recovery
    pub recovery: bool,
    /// The id must not be known here yet
    pub new_transaction: bool,
    /// Acks of messages on this broker consumed through the remote home
    pub local_remote: bool,
}

impl RemoteRegistration {
    pub fn new(state: TransactionState, acks: Vec<TransactionAck>, home: BrokerAddress) -> Self {
        Self {
            state,
            acks,
            home,
            recovery: false,
            new_transaction: false,
            local_remote: false,
        }
    }

    pub fn recovery(mut self, recovery: bool) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn new_transaction(mut self, new_transaction: bool) -> Self {
        self.new_transaction = new_transaction;
        self
    }

    pub fn local_remote(mut self, local_remote: bool) -> Self {
        self.local_remote = local_remote;
        self
    }
}

impl TransactionRegistry {
    /// Register this broker's part of a remote transaction.
    ///
    /// Under HA the home broker replays its recovery to every participant, so
    /// an already registered transaction merges the replayed acks as a new
    /// recovery batch, provided home broker and state match.
    pub fn log_remote_transaction(&self, uid: TransactionUid, reg: RemoteRegistration, persist: bool) -> Result<()> {
        let (record, added) = {
            let mut maps = self.maps.write();
            if reg.new_transaction
                && (maps.remote.contains_key(&uid) || maps.in_use.contains(&uid) || maps.local.contains_key(&uid))
            {
                return Err(TxnError::Conflict(format!("Transaction id {} is already in use", uid)));
            }
            match maps.remote.get(&uid) {
                Some(record) => (Arc::clone(record), false),
                None => {
                    let record = Arc::new(RemoteTransactionRecord::new(
                        uid,
                        reg.state.clone(),
                        TransactionBroker::new(reg.home.clone()),
                    ));
                    if reg.recovery {
                        record.add_recovery_acks(reg.acks.clone());
                    } else {
                        record.set_acks(reg.acks.clone(), reg.local_remote);
                    }
                    maps.remote.insert(uid, Arc::clone(&record));
                    maps.in_use.insert(uid);
                    (record, true)
                }
            }
        };

        if !added {
            if !self.config.ha_enabled {
                return Err(TxnError::Conflict(format!("Remote transaction {} already registered", uid)));
            }
            let (home, status) = {
                let data = record.lock();
                (data.home.address().clone(), data.state.status())
            };
            if home != reg.home || !reg.recovery || status != reg.state.status() {
                return Err(TxnError::internal(format!(
                    "Remote transaction {} replay mismatch: home {} state {}, replayed home {} state {}",
                    uid,
                    home,
                    status,
                    reg.home,
                    reg.state.status()
                )));
            }
            record.add_recovery_acks(reg.acks);
            log::debug!("Merged recovery acks into remote transaction {}", uid);
            return Ok(());
        }

        if persist {
            let stored = if self.config.ha_enabled {
                self.persistence
                    .update_remote_transaction(uid, &reg.state, &reg.acks, &reg.home)
            } else {
                self.persistence
                    .store_remote_transaction(uid, &reg.state, &reg.acks, Some(&reg.home))
            };
            if let Err(e) = stored {
                let mut maps = self.maps.write();
                maps.remote.remove(&uid);
                if !maps.local.contains_key(&uid) {
                    maps.in_use.remove(&uid);
                }
                log::error!("Unable to store remote transaction {}: {}", uid, e);
                return Err(TxnError::store(format!("Remote transaction {}: {}", uid, e)));
            }
        }
        log::debug!("Registered remote transaction {} home {}", uid, reg.home);
        Ok(())
    }

    /// Move a remote transaction to COMMITTED or ROLLEDBACK. Returns false when
    /// the transaction already committed and was handed to the reaper.
    pub fn update_remote_transaction_state(
        &self,
        uid: TransactionUid,
        target: TxnStatus,
        recovery: bool,
        persist: bool,
    ) -> Result<bool> {
        let Some(record) = self.remote_record(uid) else {
            if target == TxnStatus::Committed && self.reaper.has_remote(uid) {
                return Ok(false);
            }
            return Err(TxnError::unknown_transaction(uid));
        };

        let updated = {
            let mut data = record.lock();
            let current = data.state.status();
            let next = remote_next_state(uid, current, target)?;
            if next != current {
                data.state.set_status(next, None);
                if persist && !self.config.ha_enabled {
                    self.persistence.update_remote_transaction_state(uid, &data.state)?;
                }
                true
            } else {
                false
            }
        };
        if updated && target == TxnStatus::Committed {
            self.reaper.add_remote(uid, recovery);
        }
        Ok(true)
    }

    /// Remove a remote transaction once every ack batch is processed
    pub fn remove_remote_transaction(&self, uid: TransactionUid, persist: bool) -> Result<()> {
        let record = self
            .remote_record(uid)
            .ok_or_else(|| TxnError::unknown_transaction(uid))?;
        if !record.is_processed() {
            log::debug!("Remote transaction {} still has unprocessed acks", uid);
            return Ok(());
        }
        if persist && !self.config.ha_enabled {
            match self.persistence.remove_remote_transaction(uid, record.status()) {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        let mut maps = self.maps.write();
        maps.remote.remove(&uid);
        if !maps.local.contains_key(&uid) {
            maps.in_use.remove(&uid);
        }
        Ok(())
    }

    pub fn mark_remote_transaction_processed(&self, uid: TransactionUid) -> Result<()> {
        let record = self
            .remote_record(uid)
            .ok_or_else(|| TxnError::unknown_transaction(uid))?;
        record.mark_processed();
        Ok(())
    }

    /// State of a remote transaction. One that committed and was reaped is
    /// still reported as COMMITTED while the reaper remembers it.
    pub fn remote_transaction_state(&self, uid: TransactionUid) -> Option<TransactionState> {
        match self.remote_record(uid) {
            Some(record) => Some(record.state()),
            None if self.reaper.has_remote(uid) => {
                Some(TransactionState::new(self.now()).with_status(TxnStatus::Committed))
            }
            None => None,
        }
    }

    pub fn remote_transaction_home_broker(&self, uid: TransactionUid) -> Option<TransactionBroker> {
        self.remote_record(uid).map(|r| r.home())
    }

    pub fn remote_transaction_acks(&self, uid: TransactionUid) -> Option<Vec<TransactionAck>> {
        self.remote_record(uid).and_then(|r| r.acks())
    }

    pub fn recovery_remote_transaction_acks(&self, uid: TransactionUid) -> Option<Vec<TransactionAck>> {
        self.remote_record(uid).map(|r| r.recovery_acks())
    }

    pub fn remote_transactions(&self, status: Option<TxnStatus>) -> Vec<TransactionUid> {
        let records: Vec<Arc<RemoteTransactionRecord>> = self.maps.read().remote.values().cloned().collect();
        let mut uids: Vec<TransactionUid> = records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status() == s))
            .map(|r| r.uid())
            .collect();
        uids.sort();
        uids
    }

    /// Start the clock on a PREPARED remote transaction waiting for its home broker
    pub fn pending_started_for_remote_prepared(&self, uid: TransactionUid) -> Result<()> {
        let record = self
            .remote_record(uid)
            .ok_or_else(|| TxnError::unknown_transaction(uid))?;
        record.pending_started(self.now());
        Ok(())
    }

    /// PREPARED remote transactions. With a timeout, only those that have
    /// been waiting on their home broker at least that long.
    pub fn prepared_remote_transactions(&self, timeout: Option<Duration>) -> Vec<TransactionUid> {
        let now = self.now();
        let records: Vec<Arc<RemoteTransactionRecord>> = self.maps.read().remote.values().cloned().collect();
        let mut uids: Vec<TransactionUid> = records
            .iter()
            .filter(|r| r.status() == TxnStatus::Prepared)
            .filter(|r| timeout.map_or(true, |t| r.is_pending_timeout(now, t.as_millis() as u64)))
            .map(|r| r.uid())
            .collect();
        uids.sort();
        uids
    }
}
