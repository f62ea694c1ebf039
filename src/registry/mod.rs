//! Transaction Registry
//!
//! The in-memory authority over every transaction this broker knows about.
//!
//! ## Maps
//!
//! - local and cluster transactions owned by this broker, by uid
//! - remote transactions (home on another broker), by uid
//! - external XA id -> uid
//! - the set of uids in use by either kind
//!
//! ## Locking
//!
//! One reader/writer lock guards the maps. Lookups take it shared; inserting
//! or removing a transaction takes it exclusively. Every record carries its
//! own mutex for field changes, so transactions make progress independently
//! and map membership never shares a critical section with record updates.
//! The registry never calls into the reaper or the watchdog while holding a
//! record lock.
//!
//! ## Persistence
//!
//! Every change is forwarded to one [`PersistenceStrategy`]. The registry
//! never looks at which strategy it has.
//!
//! ## Background components
//!
//! The registry owns a [`CompletionReaper`] and a [`DetachedWatchdog`] and
//! hands each a weak capability reference to itself ([`ReapTarget`],
//! [`DetachedTarget`]).

mod cluster;
mod remote;

pub use remote::RemoteRegistration;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::collaborators::{Collaborators, RollbackReason};
use crate::config::TxnConfig;
use crate::error::{Result, TxnError};
use crate::persist::PersistenceStrategy;
use crate::reaper::{CompletionReaper, ReapTarget};
use crate::txn::broker::{BrokerAddress, TransactionBroker};
use crate::txn::record::TransactionRecord;
use crate::txn::remote::RemoteTransactionRecord;
use crate::txn::state::{TransactionState, TxnOperation, TxnStatus};
use crate::txn::work::{TransactionAck, TransactionWork, WorkMessage, WorkMessageAck};
use crate::types::{ConsumerUid, MessageId, TransactionUid, TxnKind, Xid};
use crate::watchdog::{DetachedTarget, DetachedWatchdog};

#[derive(Default)]
struct TxnMaps {
    local: HashMap<TransactionUid, Arc<TransactionRecord>>,
    remote: HashMap<TransactionUid, Arc<RemoteTransactionRecord>>,
    xids: HashMap<Xid, TransactionUid>,
    in_use: HashSet<TransactionUid>,
}

/// A requested state change
///
/// ```ignore
/// registry.change_state(uid, StateChange::to(TxnStatus::Prepared).one_phase(true).persist(true))?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StateChange {
    pub target: TxnStatus,
    /// Fail with Conflict unless the transaction is currently in this state
    pub expected: Option<TxnStatus>,
    /// Recorded when entering PREPARED
    pub one_phase: bool,
    /// Recorded when entering FAILED: the state the failed operation was heading to
    pub fail_to: Option<TxnStatus>,
    pub persist: bool,
}

impl StateChange {
    pub fn to(target: TxnStatus) -> Self {
        Self {
            target,
            expected: None,
            one_phase: false,
            fail_to: None,
            persist: false,
        }
    }

    pub fn expecting(mut self, state: TxnStatus) -> Self {
        self.expected = Some(state);
        self
    }

    pub fn one_phase(mut self, one_phase: bool) -> Self {
        self.one_phase = one_phase;
        self
    }

    pub fn failing_to(mut self, state: TxnStatus) -> Self {
        self.fail_to = Some(state);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }
}

pub struct TransactionRegistry {
    config: Arc<TxnConfig>,
    persistence: Arc<dyn PersistenceStrategy>,
    collab: Collaborators,
    maps: RwLock<TxnMaps>,
    reaper: Arc<CompletionReaper>,
    watchdog: Arc<DetachedWatchdog>,
    load_complete: Mutex<bool>,
    load_cv: Condvar,
    /// Committed transactions reaped from memory whose persisted record was kept
    retained: Mutex<HashMap<TransactionUid, TxnKind>>,
}

impl TransactionRegistry {
    pub fn new(
        config: TxnConfig,
        persistence: Arc<dyn PersistenceStrategy>,
        collab: Collaborators,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        log::info!(
            "Transaction registry using {} persistence (reap limit {}, detached timeout {}s)",
            persistence.name(),
            config.reap_limit,
            config.detached_timeout.as_secs()
        );
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let reap_target: Weak<dyn ReapTarget> = weak.clone();
            let detached_target: Weak<dyn DetachedTarget> = weak.clone();
            Self {
                reaper: CompletionReaper::new(Arc::clone(&config), reap_target, &collab),
                watchdog: DetachedWatchdog::new(Arc::clone(&config), detached_target, &collab),
                config,
                persistence,
                collab,
                maps: RwLock::new(TxnMaps::default()),
                load_complete: Mutex::new(false),
                load_cv: Condvar::new(),
                retained: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceStrategy> {
        &self.persistence
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    pub fn reaper(&self) -> &Arc<CompletionReaper> {
        &self.reaper
    }

    pub fn watchdog(&self) -> &Arc<DetachedWatchdog> {
        &self.watchdog
    }

    fn now(&self) -> u64 {
        self.collab.clock.now_millis()
    }

    fn record(&self, uid: TransactionUid) -> Option<Arc<TransactionRecord>> {
        self.maps.read().local.get(&uid).cloned()
    }

    fn remote_record(&self, uid: TransactionUid) -> Option<Arc<RemoteTransactionRecord>> {
        self.maps.read().remote.get(&uid).cloned()
    }

    pub fn transaction_record(&self, uid: TransactionUid) -> Option<Arc<TransactionRecord>> {
        self.record(uid)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a new local transaction. With `persist` the state is stored
    /// before the transaction becomes visible.
    pub fn add_transaction(
        &self,
        uid: TransactionUid,
        state: TransactionState,
        persist: bool,
    ) -> Result<Arc<TransactionRecord>> {
        self.register(uid, state, TxnKind::Local, false, persist)
    }

    fn register(
        &self,
        uid: TransactionUid,
        state: TransactionState,
        kind: TxnKind,
        takeover: bool,
        persist: bool,
    ) -> Result<Arc<TransactionRecord>> {
        let xid = state.xid().filter(|x| !x.is_null()).cloned();
        {
            let maps = self.maps.read();
            // a cluster transaction taken over from a failed broker may
            // already be known here as a remote transaction
            let remote_only = maps.remote.contains_key(&uid) && !maps.local.contains_key(&uid);
            if maps.in_use.contains(&uid) && !(takeover && kind == TxnKind::Cluster && remote_only) {
                return Err(TxnError::Conflict(format!("Transaction id {} is already in use", uid)));
            }
            if let Some(xid) = &xid {
                if maps.xids.contains_key(xid) {
                    return Err(TxnError::Conflict(format!("Transaction XID {} is already in use", xid)));
                }
            }
        }

        if persist {
            self.persistence.store_transaction(uid, &state).map_err(|e| {
                log::error!("Unable to store transaction {}: {}", uid, e);
                e
            })?;
        }

        let record = Arc::new(TransactionRecord::new(
            uid,
            state,
            self.config.producer_max_messages,
            self.config.consumer_max_messages,
        ));
        record.lock().kind = kind;
        if takeover {
            record.takeover_lock().acquire();
        }

        let mut maps = self.maps.write();
        if maps.local.contains_key(&uid) {
            return Err(TxnError::Conflict(format!("Transaction id {} is already in use", uid)));
        }
        maps.in_use.insert(uid);
        maps.local.insert(uid, Arc::clone(&record));
        if let Some(xid) = xid {
            maps.xids.insert(xid, uid);
        }
        log::debug!("Registered {} transaction {}", kind, uid);
        Ok(record)
    }

    /// Drop a transaction from the maps only
    fn unregister(&self, uid: TransactionUid) -> Option<Arc<TransactionRecord>> {
        let mut maps = self.maps.write();
        let record = maps.local.remove(&uid);
        if !maps.remote.contains_key(&uid) {
            maps.in_use.remove(&uid);
        }
        if let Some(record) = &record {
            if let Some(xid) = record.lock().state.xid() {
                if maps.xids.get(xid) == Some(&uid) {
                    maps.xids.remove(xid);
                }
            }
        }
        record
    }

    // ------------------------------------------------------------------
    // Messages and acknowledgements
    // ------------------------------------------------------------------

    fn check_open(uid: TransactionUid, state: &TransactionState, any_state: bool) -> Result<()> {
        match state.status() {
            TxnStatus::TimedOut => Err(TxnError::Timeout(format!("Transaction {} has timed out", uid))),
            TxnStatus::Started => Ok(()),
            _ if any_state => Ok(()),
            other => Err(TxnError::PreconditionFailed(format!(
                "Transaction {} is in state {}, expected {}",
                uid,
                other,
                TxnStatus::Started
            ))),
        }
    }

    fn gone(uid: TransactionUid) -> TxnError {
        TxnError::Gone(format!("Unknown transaction {}", uid))
    }

    /// Record a message produced in the transaction. `any_state` is for
    /// recovery replay only.
    pub fn add_message(&self, uid: TransactionUid, msg: MessageId, any_state: bool) -> Result<()> {
        let record = self.record(uid).ok_or_else(|| Self::gone(uid))?;
        let mut data = record.lock();
        Self::check_open(uid, &data.state, any_state)?;
        data.messages.add_published(uid, msg)
    }

    /// Record a message consumed in the transaction and, with `persist`,
    /// store the acknowledgement. Returns whether the transaction is XA.
    pub fn add_acknowledgement(
        &self,
        uid: TransactionUid,
        msg: MessageId,
        consumer: ConsumerUid,
        stored: ConsumerUid,
        any_state: bool,
        persist: bool,
    ) -> Result<bool> {
        let record = self.record(uid).ok_or_else(|| Self::gone(uid))?;
        let is_xa = {
            let mut data = record.lock();
            Self::check_open(uid, &data.state, any_state)?;
            data.messages.add_consumed(uid, msg.clone(), consumer, stored)?;
            data.state.is_xa()
        };
        if persist {
            let mut ack = TransactionAck::new(msg, consumer);
            if stored != consumer {
                ack = ack.with_stored_consumer(stored);
            }
            self.persistence.store_transaction_ack(uid, &ack)?;
        }
        Ok(is_xa)
    }

    pub fn check_acknowledgement(&self, uid: TransactionUid, msg: &MessageId, consumer: ConsumerUid) -> Result<bool> {
        let record = self.record(uid).ok_or_else(|| Self::gone(uid))?;
        let data = record.lock();
        if data.state.status() == TxnStatus::TimedOut {
            return Err(TxnError::Timeout(format!("Transaction {} has timed out", uid)));
        }
        Ok(data.messages.is_consumed(msg, consumer))
    }

    /// The transaction that currently claims `msg` for `consumer`
    pub fn consumed_in_transaction(&self, msg: &MessageId, consumer: ConsumerUid) -> Option<TransactionUid> {
        let records: Vec<Arc<TransactionRecord>> = self.maps.read().local.values().cloned().collect();
        records
            .iter()
            .find(|r| r.is_consumed_message(msg, consumer))
            .map(|r| r.uid())
    }

    /// Take back a consumed message (rerouted to another consumer, or its
    /// remote broker went down). Returns the consumer it is stored under.
    pub fn remove_acknowledgement(
        &self,
        uid: TransactionUid,
        msg: &MessageId,
        consumer: ConsumerUid,
        rerouted: bool,
    ) -> Result<ConsumerUid> {
        let record = self
            .record(uid)
            .ok_or_else(|| TxnError::internal(format!("Unknown transaction {} removing ack of {}", uid, msg)))?;
        let stored = record.lock().messages.remove_consumed(uid, msg, consumer, rerouted)?;
        Ok(stored)
    }

    pub fn retrieve_removed_consumed(
        &self,
        uid: TransactionUid,
        rerouted: bool,
    ) -> Option<HashMap<MessageId, Vec<ConsumerUid>>> {
        self.record(uid).map(|r| r.lock().messages.removed_consumed(rerouted))
    }

    pub fn published_messages(&self, uid: TransactionUid) -> Option<Vec<MessageId>> {
        self.record(uid).map(|r| r.published_messages())
    }

    pub fn consumed_messages(&self, uid: TransactionUid) -> Option<Vec<(MessageId, Vec<ConsumerUid>)>> {
        self.record(uid).map(|r| r.consumed_messages())
    }

    pub fn add_orphan_ack(&self, uid: TransactionUid, msg: MessageId, consumer: ConsumerUid, stored: Option<ConsumerUid>) {
        if let Some(record) = self.record(uid) {
            record.lock().messages.add_orphan_ack(msg, consumer, stored);
        }
    }

    pub fn remove_orphan_ack(
        &self,
        uid: TransactionUid,
        msg: &MessageId,
        consumer: ConsumerUid,
        stored: Option<ConsumerUid>,
    ) -> bool {
        self.record(uid)
            .map_or(false, |r| r.lock().messages.remove_orphan_ack(msg, consumer, stored))
    }

    pub fn orphan_acks(&self, uid: TransactionUid) -> Option<HashMap<MessageId, HashMap<ConsumerUid, Vec<ConsumerUid>>>> {
        self.record(uid).map(|r| r.lock().messages.orphan_acks())
    }

    /// Remember the broker the acknowledgement of `msg` goes to. Gone if the
    /// message has been requeued to a different broker in between.
    pub fn set_ack_broker_address(&self, uid: TransactionUid, msg: MessageId, addr: BrokerAddress) -> Result<()> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        let mut data = record.lock();
        data.messages.set_ack_broker(msg, addr)
    }

    pub fn ack_broker_address(&self, uid: TransactionUid, msg: &MessageId) -> Option<BrokerAddress> {
        self.record(uid)
            .and_then(|r| r.lock().messages.ack_broker(msg).cloned())
    }

    pub fn ack_brokers(&self, uid: TransactionUid) -> Option<HashSet<BrokerAddress>> {
        self.record(uid).map(|r| r.ack_brokers())
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Set the state of a transaction
    pub fn update_state(&self, uid: TransactionUid, target: TxnStatus, persist: bool) -> Result<TransactionState> {
        self.change_state(uid, StateChange::to(target).persist(persist))
    }

    pub fn change_state(&self, uid: TransactionUid, change: StateChange) -> Result<TransactionState> {
        self.apply_change(uid, change, None)
    }

    /// Set the state and persist it, with `work` when the strategy keeps a log.
    /// The record lock is held across the store call so persisted changes of
    /// one transaction are never reordered.
    fn apply_change(
        &self,
        uid: TransactionUid,
        change: StateChange,
        work: Option<&TransactionWork>,
    ) -> Result<TransactionState> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        if record.is_takeover_locked() {
            return Err(TxnError::NotFound(format!(
                "Transaction {} is being taken over by another thread",
                uid
            )));
        }
        let now = self.now();
        let mut data = record.lock();
        let current = data.state.status();
        if current == TxnStatus::TimedOut {
            return Err(TxnError::Timeout(format!("Transaction {} has timed out", uid)));
        }
        if let Some(expected) = change.expected {
            if expected != current {
                return Err(TxnError::Conflict(format!(
                    "Transaction {} is in state {}, expected {}",
                    uid, current, expected
                )));
            }
        }
        data.state.set_status(change.target, change.fail_to);
        if change.target == TxnStatus::Prepared {
            data.state.set_one_phase(change.one_phase);
        }
        data.state.touch(now);
        if change.persist {
            self.persistence
                .update_transaction_state(uid, data.kind, &data.state, work)?;
        }
        log::trace!("Transaction {} {} -> {}", uid, current, change.target);
        Ok(data.state.clone())
    }

    /// Advance the transaction by a client operation, validating the transition
    pub fn apply_operation(&self, uid: TransactionUid, op: TxnOperation, persist: bool) -> Result<TransactionState> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        let (current, target) = {
            let data = record.lock();
            (data.state.status(), data.state.next_state(op)?)
        };
        let change = StateChange::to(target)
            .expecting(current)
            .one_phase(matches!(op, TxnOperation::Commit { one_phase: true }))
            .persist(persist);
        self.change_state(uid, change)
    }

    /// The messages and acknowledgements to persist with the transaction
    pub fn transaction_work(&self, uid: TransactionUid) -> Result<TransactionWork> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        let (published, consumed, stored) = {
            let data = record.lock();
            (
                data.messages.published().to_vec(),
                data.messages.consumed(),
                data.messages.stored_consumers().clone(),
            )
        };
        let messages = &self.collab.messages;

        let mut work = TransactionWork::new();
        for msg in published {
            let Some(info) = messages.resolve(&msg) else {
                log::warn!("Message {} of transaction {} not found, not logging it", msg, uid);
                continue;
            };
            if info.persistent && !info.stored {
                work.add_message(WorkMessage {
                    message: msg,
                    destination: info.destination,
                    payload: info.payload,
                    stored_interests: info.stored_interests,
                });
            }
        }
        for (msg, consumers) in consumed {
            let info = messages.resolve(&msg).ok_or_else(|| {
                TxnError::Conflict(format!("Message {} consumed in transaction {} is gone", msg, uid))
            })?;
            if !(info.persistent && info.local) {
                continue;
            }
            for consumer in consumers {
                let mut ack = TransactionAck::new(msg.clone(), consumer);
                if let Some(sid) = stored.get(&consumer).filter(|sid| **sid != consumer) {
                    ack = ack.with_stored_consumer(*sid);
                }
                work.add_ack(WorkMessageAck {
                    destination: info.destination.clone(),
                    ack,
                });
            }
        }
        Ok(work)
    }

    /// Move to PREPARED, persisting the transaction's work with the state
    pub fn update_state_prepare_with_work(
        &self,
        uid: TransactionUid,
        one_phase: bool,
        persist: bool,
    ) -> Result<TransactionState> {
        let work = self.transaction_work(uid)?;
        let change = StateChange::to(TxnStatus::Prepared).one_phase(one_phase).persist(persist);
        let state = self.apply_change(uid, change, Some(&work))?;
        self.mark_work_stored(&work);
        Ok(state)
    }

    /// Move to COMMITTED, persisting the transaction's work with the state
    pub fn update_state_commit_with_work(&self, uid: TransactionUid, persist: bool) -> Result<TransactionState> {
        let work = self.transaction_work(uid)?;
        let change = StateChange::to(TxnStatus::Committed).persist(persist);
        let state = self.apply_change(uid, change, Some(&work))?;
        self.mark_work_stored(&work);
        Ok(state)
    }

    fn mark_work_stored(&self, work: &TransactionWork) {
        for sent in work.sent_messages() {
            self.collab.messages.mark_stored(&sent.message);
        }
    }

    /// Current state, `None` if unknown, processed or being taken over
    pub fn retrieve_state(&self, uid: TransactionUid) -> Option<TransactionState> {
        let record = self.record(uid)?;
        if record.is_takeover_locked() {
            log::warn!("Transaction {} is being taken over, state not available", uid);
            return None;
        }
        let data = record.lock();
        if data.processed {
            return None;
        }
        Some(data.state.clone())
    }

    /// Current state even when processed or being taken over
    pub fn retrieve_state_for_inquiry(&self, uid: TransactionUid) -> Option<TransactionState> {
        self.record(uid).map(|r| r.state())
    }

    pub fn xid_to_uid(&self, xid: &Xid) -> Option<TransactionUid> {
        self.maps.read().xids.get(xid).copied()
    }

    pub fn uid_to_xid(&self, uid: TransactionUid) -> Option<Xid> {
        self.retrieve_state(uid).and_then(|s| s.xid().cloned())
    }

    /// Transactions in `status`, or every unfinished one
    pub fn transactions(&self, status: Option<TxnStatus>) -> Vec<TransactionUid> {
        self.select(status, |_| true)
    }

    pub fn cluster_transactions(&self, status: Option<TxnStatus>) -> Vec<TransactionUid> {
        self.select(status, |r| r.kind() == TxnKind::Cluster)
    }

    fn select(&self, status: Option<TxnStatus>, filter: impl Fn(&TransactionRecord) -> bool) -> Vec<TransactionUid> {
        let records: Vec<Arc<TransactionRecord>> = self.maps.read().local.values().cloned().collect();
        let mut uids: Vec<TransactionUid> = records
            .iter()
            .filter(|r| filter(r))
            .filter(|r| match status {
                None => {
                    let data = r.lock();
                    let finished = data.processed
                        && (data.kind == TxnKind::Local
                            || data.participants.as_ref().map_or(true, |p| p.is_completed()));
                    !finished
                }
                Some(wanted) => self.retrieve_state(r.uid()).map(|s| s.status()) == Some(wanted),
            })
            .map(|r| r.uid())
            .collect();
        uids.sort();
        uids
    }

    pub fn is_local(&self, uid: TransactionUid) -> bool {
        self.record(uid).map_or(false, |r| r.kind() == TxnKind::Local)
    }

    pub fn is_cluster(&self, uid: TransactionUid) -> bool {
        self.record(uid).map_or(false, |r| r.kind() == TxnKind::Cluster)
    }

    pub fn is_remote(&self, uid: TransactionUid) -> bool {
        self.maps.read().remote.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.maps.read().local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove a finished transaction. A COMMITTED transaction is handed to the
    /// reaper instead, unless reaping is immediate and `noremove` is not set.
    /// With `noremove` the persisted record is kept until [`purge_retained`](Self::purge_retained).
    pub fn remove_transaction(&self, uid: TransactionUid, noremove: bool, persist: bool) -> Result<()> {
        self.remove_transaction_id(uid, noremove, false, persist)
    }

    fn remove_transaction_id(&self, uid: TransactionUid, noremove: bool, from_reaper: bool, persist: bool) -> Result<()> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        let (kind, status) = {
            let data = record.lock();
            (data.kind, data.state.status())
        };

        if !from_reaper && status == TxnStatus::Committed {
            let first = record.processed();
            if kind == TxnKind::Cluster {
                if first {
                    self.reaper.add_cluster(uid, noremove, false);
                }
                return Ok(());
            }
            if noremove || self.config.reap_limit > 0 {
                if first {
                    self.reaper.add_local(uid, noremove);
                }
                return Ok(());
            }
        }

        if !noremove && persist {
            match self.persistence.remove_transaction(uid, kind, status) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    log::debug!("Transaction {} already removed from store: {}", uid, e);
                }
                Err(e) => {
                    log::warn!("Unable to remove transaction {} from store: {}", uid, e);
                    return Err(e);
                }
            }
        }

        self.unregister(uid);
        self.watchdog.remove(uid);
        log::debug!("Removed {} transaction {} ({})", kind, uid, status);
        Ok(())
    }

    /// Delete the persisted record of a committed transaction that was reaped with `noremove`
    pub fn purge_retained(&self, uid: TransactionUid) -> Result<()> {
        let kind = self
            .retained
            .lock()
            .remove(&uid)
            .ok_or_else(|| TxnError::NotFound(format!("No retained transaction {}", uid)))?;
        match self.persistence.remove_transaction(uid, kind, TxnStatus::Committed) {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    pub fn retained_transactions(&self) -> Vec<TransactionUid> {
        let mut uids: Vec<TransactionUid> = self.retained.lock().keys().copied().collect();
        uids.sort();
        uids
    }

    /// Acks are removed together with the transaction; this is intentionally empty
    pub fn remove_transaction_ack(&self, _uid: TransactionUid) -> Result<()> {
        Ok(())
    }

    pub fn remove_transaction_ack_persisted(&self, uid: TransactionUid) -> Result<()> {
        self.persistence.remove_transaction_acks(uid)
    }

    /// Under HA the acks of a remote transaction belong to the shared store
    pub fn remove_remote_transaction_ack(&self, uid: TransactionUid) -> Result<()> {
        if self.config.ha_enabled {
            return Ok(());
        }
        self.remove_transaction_ack_persisted(uid)
    }

    // ------------------------------------------------------------------
    // Detached transactions
    // ------------------------------------------------------------------

    /// The owning connection of `uid` went away
    pub fn detach(&self, uid: TransactionUid) -> Result<()> {
        let record = self.record(uid).ok_or_else(|| TxnError::unknown_transaction(uid))?;
        record.lock().state.detach(self.now());
        self.watchdog.add(uid);
        Ok(())
    }

    /// Track `uid` in the detached watchdog without changing its state
    pub fn add_detached(&self, uid: TransactionUid) {
        self.watchdog.add(uid);
    }

    pub fn detached_transactions(&self) -> Vec<TransactionUid> {
        self.watchdog.detached_ids()
    }

    /// After recovery, start the clock on tracked one-phase PREPARED transactions
    pub fn detach_onephase_prepared(&self) {
        let now = self.now();
        for uid in self.watchdog.detached_ids() {
            let Some(record) = self.record(uid) else {
                continue;
            };
            let mut data = record.lock();
            if data.state.status() == TxnStatus::Prepared && data.state.is_one_phase() && !data.state.is_detached() {
                data.state.detach(now);
                log::info!(
                    "Transaction {} [{}] will time out in {}ms unless resolved",
                    uid,
                    data.state,
                    self.watchdog.effective_timeout(&data.state)
                );
            }
        }
    }

    /// Roll back a transaction on behalf of an administrator or the broker
    pub fn rollback(&self, uid: TransactionUid, reason: RollbackReason) -> Result<()> {
        let state = self
            .retrieve_state_for_inquiry(uid)
            .ok_or_else(|| TxnError::unknown_transaction(uid))?;
        if let Some(handler) = &self.collab.rollback {
            return handler.rollback(uid, &state, reason);
        }
        if let Some(record) = self.record(uid) {
            record.set_in_rollback(true);
        }
        self.update_state(uid, TxnStatus::RolledBack, true)?;
        self.remove_transaction(uid, false, true)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn mark_load_complete(&self) {
        *self.load_complete.lock() = true;
        self.load_cv.notify_all();
    }

    pub fn is_load_complete(&self) -> bool {
        *self.load_complete.lock()
    }

    pub fn wait_load_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.load_complete.lock();
        while !*done {
            if self.load_cv.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        *done
    }

    /// A broker joined or rejoined the cluster
    pub fn broker_link_up(&self, addr: BrokerAddress) {
        log::debug!("Broker {} activated", addr);
        self.reaper.broker_activated(addr);
    }

    /// Stop the reaper and the watchdog. Idempotent.
    pub fn shutdown(&self) {
        log::debug!("Shutting down transaction registry");
        self.reaper.destroy();
        self.watchdog.destroy();
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn debug_state(&self, uid: TransactionUid) -> serde_json::Value {
        let (record, remote) = {
            let maps = self.maps.read();
            (maps.local.get(&uid).cloned(), maps.remote.get(&uid).cloned())
        };
        let mut out = serde_json::Map::new();
        if let Some(record) = record {
            out.insert(uid.to_string(), record.debug_state());
        }
        if let Some(remote) = remote {
            out.insert(format!("{}(remote)", uid), remote.debug_state());
        }
        if out.is_empty() {
            if let Some(serde_json::Value::Object(reaped)) = self.reaper.debug_state(uid) {
                out.extend(reaped);
            } else {
                out.insert(uid.to_string(), serde_json::Value::String("UNKNOWN TID".to_string()));
            }
        }
        serde_json::Value::Object(out)
    }

    pub fn debug_dump(&self) -> serde_json::Value {
        let (local, remote): (Vec<TransactionUid>, Vec<TransactionUid>) = {
            let maps = self.maps.read();
            (maps.local.keys().copied().collect(), maps.remote.keys().copied().collect())
        };
        let transactions: serde_json::Map<String, serde_json::Value> = local
            .iter()
            .chain(remote.iter())
            .map(|uid| (uid.to_string(), self.debug_state(*uid)))
            .collect();
        serde_json::json!({
            "persistence": self.persistence.name(),
            "loadComplete": self.is_load_complete(),
            "TransactionCount": local.len(),
            "TransactionCount(remote)": remote.len(),
            "transactions": transactions,
            "retained": self.retained_transactions().iter().map(|u| u.to_string()).collect::<Vec<_>>(),
            "reaper": self.reaper.debug_dump(),
            "detached": self.watchdog.debug_state(),
        })
    }
}

impl Drop for TransactionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ReapTarget for TransactionRegistry {
    fn is_load_complete(&self) -> bool {
        TransactionRegistry::is_load_complete(self)
    }

    fn wait_load_complete(&self, timeout: Duration) -> bool {
        TransactionRegistry::wait_load_complete(self, timeout)
    }

    fn cluster_transaction_brokers(&self, uid: TransactionUid) -> Result<Vec<TransactionBroker>> {
        TransactionRegistry::cluster_transaction_brokers(self, uid)
    }

    fn complete_local_participant(&self, uid: TransactionUid, addr: &BrokerAddress) -> Result<()> {
        self.complete_cluster_transaction_broker_state(uid, TxnStatus::Committed, addr, true)
    }

    fn reap_transaction(&self, uid: TransactionUid, noremove: bool) -> Result<()> {
        let kind = self.record(uid).map(|r| r.kind());
        self.remove_transaction_id(uid, noremove, true, true)?;
        if noremove {
            if let Some(kind) = kind {
                self.retained.lock().insert(uid, kind);
            }
        }
        Ok(())
    }
}

impl DetachedTarget for TransactionRegistry {
    fn retrieve_state(&self, uid: TransactionUid) -> Option<TransactionState> {
        TransactionRegistry::retrieve_state(self, uid)
    }

    fn retrieve_state_for_inquiry(&self, uid: TransactionUid) -> Option<TransactionState> {
        TransactionRegistry::retrieve_state_for_inquiry(self, uid)
    }

    fn rollback_timed_out(&self, uid: TransactionUid, _state: &TransactionState) -> Result<()> {
        self.rollback(uid, RollbackReason::Timeout)
    }
}

#[cfg(test)]
mod tests;
