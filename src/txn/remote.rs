//! Participation in a transaction coordinated by another (home) broker

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::txn::broker::TransactionBroker;
use crate::txn::state::{TransactionState, TxnStatus};
use crate::txn::work::TransactionAck;
use crate::types::TransactionUid;

/// One batch of acknowledgements this broker holds for a remote transaction
#[derive(Debug)]
pub struct RemoteAckEntry {
    acks: Vec<TransactionAck>,
    local_remote: bool,
    processed: AtomicBool,
}

impl RemoteAckEntry {
    pub fn new(acks: Vec<TransactionAck>, local_remote: bool, processed: bool) -> Self {
        Self {
            acks,
            local_remote,
            processed: AtomicBool::new(processed),
        }
    }

    pub fn acks(&self) -> &[TransactionAck] {
        &self.acks
    }

    /// Acks for messages that live on this broker but were consumed through a
    /// remote transaction home
    pub fn is_local_remote(&self) -> bool {
        self.local_remote
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    pub fn mark_processed(&self) {
        self.processed.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct RemoteData {
    pub state: TransactionState,
    pub home: TransactionBroker,
    /// Acks registered during normal operation
    pub acks: Option<RemoteAckEntry>,
    /// Ack batches merged from recovery replays (one per reconnect attempt)
    pub recovery_acks: Vec<RemoteAckEntry>,
    /// When the participant started waiting on the home broker's decision
    pub pending_start: Option<u64>,
}

/// A remote transaction as seen by a participant broker
#[derive(Debug)]
pub struct RemoteTransactionRecord {
    uid: TransactionUid,
    data: Mutex<RemoteData>,
}

impl RemoteTransactionRecord {
    pub fn new(uid: TransactionUid, state: TransactionState, home: TransactionBroker) -> Self {
        Self {
            uid,
            data: Mutex::new(RemoteData {
                state,
                home,
                acks: None,
                recovery_acks: Vec::new(),
                pending_start: None,
            }),
        }
    }

    pub fn uid(&self) -> TransactionUid {
        self.uid
    }

    pub fn lock(&self) -> MutexGuard<'_, RemoteData> {
        self.data.lock()
    }

    pub fn state(&self) -> TransactionState {
        self.data.lock().state.clone()
    }

    pub fn status(&self) -> TxnStatus {
        self.data.lock().state.status()
    }

    pub fn home(&self) -> TransactionBroker {
        self.data.lock().home.clone()
    }

    pub fn set_acks(&self, acks: Vec<TransactionAck>, local_remote: bool) {
        self.data.lock().acks = Some(RemoteAckEntry::new(acks, local_remote, false));
    }

    /// Merge one recovery batch. A PREPARED transaction still needs its
    /// acks applied; any other state means they were already handled.
    pub fn add_recovery_acks(&self, acks: Vec<TransactionAck>) {
        let mut data = self.data.lock();
        let processed = data.state.status() != TxnStatus::Prepared;
        data.recovery_acks.push(RemoteAckEntry::new(acks, false, processed));
    }

    pub fn acks(&self) -> Option<Vec<TransactionAck>> {
        self.data.lock().acks.as_ref().map(|e| e.acks().to_vec())
    }

    pub fn recovery_acks(&self) -> Vec<TransactionAck> {
        self.data
            .lock()
            .recovery_acks
            .iter()
            .flat_map(|e| e.acks().iter().cloned())
            .collect()
    }

    pub fn has_recovery_acks(&self) -> bool {
        !self.data.lock().recovery_acks.is_empty()
    }

    /// Number of acknowledged messages across every batch
    pub fn num_remote_consumed(&self) -> usize {
        let data = self.data.lock();
        data.acks.as_ref().map_or(0, |e| e.acks().len())
            + data.recovery_acks.iter().map(|e| e.acks().len()).sum::<usize>()
    }

    /// Mark every ack batch processed
    pub fn mark_processed(&self) {
        let data = self.data.lock();
        if let Some(e) = &data.acks {
            e.mark_processed();
        }
        for e in &data.recovery_acks {
            e.mark_processed();
        }
    }

    /// Ready to discard only when every batch has been processed
    pub fn is_processed(&self) -> bool {
        let data = self.data.lock();
        data.acks.as_ref().map_or(true, RemoteAckEntry::is_processed)
            && data.recovery_acks.iter().all(RemoteAckEntry::is_processed)
    }

    pub fn pending_started(&self, now: u64) {
        self.data.lock().pending_start = Some(now);
    }

    /// True once the participant has waited at least `timeout_ms` for the home broker
    pub fn is_pending_timeout(&self, now: u64, timeout_ms: u64) -> bool {
        self.data
            .lock()
            .pending_start
            .map_or(false, |start| now.saturating_sub(start) >= timeout_ms)
    }

    pub fn debug_state(&self) -> serde_json::Value {
        let data = self.data.lock();
        serde_json::json!({
            "uid": self.uid.to_string(),
            "type": "REMOTE",
            "state": data.state.debug_state(),
            "home": data.home.to_string(),
            "acks": data.acks.as_ref().map_or(0, |e| e.acks().len()),
            "recoveryAckBatches": data.recovery_acks.len(),
            "pendingStart": data.pending_start,
        })
    }
}
