//! Deferred removal of committed transactions
//!
//! Committing a transaction and purging its bookkeeping are separate steps.
//! The registry hands committed transactions to the [`CompletionReaper`],
//! which removes them later, either inline on the committing thread when the
//! backlog is over its threshold, or from a periodic sweep.
//!
//! ## Queues
//!
//! - `committed`: local transactions, and cluster transactions whose
//!   participants have all confirmed
//! - `cluster_pending`: committed cluster transactions still waiting on
//!   participants. The sweep re-notifies those participants.
//! - `remote_committed` / `remote_recovered`: remote transactions this broker
//!   committed, remembered for a while so late inquiries can be answered
//!
//! Every entry carries an `inprocessing` guard (an inline reap and the sweep
//! never work on the same entry), a `swipemark` (one visit per sweep) and a
//! `swipeonly` flag (a failed inline reap is retried only by the sweep).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::collaborators::{ClusterBroadcast, Collaborators, FatalErrorHandler};
use crate::config::TxnConfig;
use crate::error::Result;
use crate::timer::{Scheduler, TaskFn, TimerHandle};
use crate::txn::broker::{BrokerAddress, ClusterView, TransactionBroker};
use crate::types::TransactionUid;

pub const REAPER_TIMER_NAME: &str = "TransactionReaper";

/// What the reaper needs from the registry
pub trait ReapTarget: Send + Sync {
    fn is_load_complete(&self) -> bool;

    /// Block until recovery has finished or `timeout` passed. Returns whether it finished.
    fn wait_load_complete(&self, timeout: Duration) -> bool;

    fn cluster_transaction_brokers(&self, uid: TransactionUid) -> Result<Vec<TransactionBroker>>;

    /// Mark this broker's own participation in a committed cluster transaction complete
    fn complete_local_participant(&self, uid: TransactionUid, addr: &BrokerAddress) -> Result<()>;

    /// Remove a committed transaction. With `noremove` only the in-memory record goes.
    fn reap_transaction(&self, uid: TransactionUid, noremove: bool) -> Result<()>;
}

/// Progress of a committed cluster transaction through the sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterCommitState {
    /// Not yet visited by a sweep
    Unprocessed,
    /// Participants were notified at least once
    Processed,
    /// Adopted from a failed broker
    Takeover,
}

#[derive(Debug)]
struct ReapEntry {
    uid: TransactionUid,
    pstate: ClusterCommitState,
    inprocessing: bool,
    swipemark: bool,
    swipeonly: bool,
}

impl ReapEntry {
    fn new(uid: TransactionUid, pstate: ClusterCommitState) -> Self {
        Self {
            uid,
            pstate,
            inprocessing: false,
            swipemark: false,
            swipeonly: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Committed,
    ClusterPending,
    RemoteCommitted,
    RemoteRecovered,
}

#[derive(Debug, Default)]
struct ReapQueues {
    committed: Vec<ReapEntry>,
    cluster_pending: Vec<ReapEntry>,
    remote_committed: Vec<ReapEntry>,
    remote_recovered: Vec<ReapEntry>,
    /// Reaped from memory only; the persisted record is kept
    noremoves: HashSet<TransactionUid>,
}

impl ReapQueues {
    fn queue(&self, q: Queue) -> &Vec<ReapEntry> {
        match q {
            Queue::Committed => &self.committed,
            Queue::ClusterPending => &self.cluster_pending,
            Queue::RemoteCommitted => &self.remote_committed,
            Queue::RemoteRecovered => &self.remote_recovered,
        }
    }

    fn queue_mut(&mut self, q: Queue) -> &mut Vec<ReapEntry> {
        match q {
            Queue::Committed => &mut self.committed,
            Queue::ClusterPending => &mut self.cluster_pending,
            Queue::RemoteCommitted => &mut self.remote_committed,
            Queue::RemoteRecovered => &mut self.remote_recovered,
        }
    }

    fn take(&mut self, q: Queue, uid: TransactionUid) -> Option<ReapEntry> {
        let queue = self.queue_mut(q);
        let pos = queue.iter().position(|e| e.uid == uid)?;
        Some(queue.remove(pos))
    }

    fn entry_mut(&mut self, q: Queue, uid: TransactionUid) -> Option<&mut ReapEntry> {
        self.queue_mut(q).iter_mut().find(|e| e.uid == uid)
    }
}

pub struct CompletionReaper {
    config: Arc<TxnConfig>,
    target: Weak<dyn ReapTarget>,
    cluster_view: Arc<dyn ClusterView>,
    broadcast: Arc<dyn ClusterBroadcast>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    fatal: Arc<dyn FatalErrorHandler>,
    queues: Mutex<ReapQueues>,
    timer: Mutex<Option<TimerHandle>>,
    /// Brokers that (re)connected, with the time they did
    activations: Mutex<HashMap<BrokerAddress, u64>>,
    destroyed: AtomicBool,
    self_ref: Weak<CompletionReaper>,
}

impl CompletionReaper {
    pub fn new(config: Arc<TxnConfig>, target: Weak<dyn ReapTarget>, collab: &Collaborators) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            target,
            cluster_view: Arc::clone(&collab.cluster_view),
            broadcast: Arc::clone(&collab.broadcast),
            clock: Arc::clone(&collab.clock),
            scheduler: Arc::clone(&collab.scheduler),
            fatal: Arc::clone(&collab.fatal),
            queues: Mutex::new(ReapQueues::default()),
            timer: Mutex::new(None),
            activations: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    fn need_reap_one(&self, len: usize) -> bool {
        self.config.reap_limit == 0 || len > self.config.inline_reap_threshold()
    }

    /// A local transaction committed
    pub fn add_local(&self, uid: TransactionUid, noremove: bool) {
        let len = {
            let mut queues = self.queues.lock();
            if noremove {
                queues.noremoves.insert(uid);
            }
            queues.committed.push(ReapEntry::new(uid, ClusterCommitState::Processed));
            queues.committed.len()
        };
        if !self.ensure_timer() {
            return;
        }
        if len > self.config.reap_limit {
            self.wakeup();
        }
        if self.need_reap_one(len) {
            self.run(true);
        }
    }

    /// A cluster transaction committed; it is purged once every participant confirms
    pub fn add_cluster(&self, uid: TransactionUid, noremove: bool, takeover: bool) {
        let pstate = if takeover {
            ClusterCommitState::Takeover
        } else {
            ClusterCommitState::Unprocessed
        };
        {
            let mut queues = self.queues.lock();
            if noremove {
                queues.noremoves.insert(uid);
            }
            queues.cluster_pending.push(ReapEntry::new(uid, pstate));
        }
        if self.ensure_timer() {
            self.wakeup();
        }
    }

    /// One participant of `uid` confirmed. Moves the entry to the committed
    /// queue when it was the last one.
    pub fn cluster_transaction_completed(&self, uid: TransactionUid) {
        if !self.ensure_timer() {
            return;
        }
        self.wakeup();

        let (pending, committed) = {
            let queues = self.queues.lock();
            (queues.cluster_pending.len(), queues.committed.len())
        };
        if !self.need_reap_one(pending) && !self.need_reap_one(committed) {
            return;
        }
        let Some(target) = self.target.upgrade() else {
            return;
        };

        let completed = match target.cluster_transaction_brokers(uid) {
            Ok(brokers) => brokers.iter().all(TransactionBroker::is_completed),
            Err(e) => {
                if e.is_not_found() {
                    log::debug!("Transaction {} completed: {}", uid, e);
                } else {
                    log::warn!("Unable to get participants of transaction {} on completion: {}", uid, e);
                }
                false
            }
        };
        let committed = {
            let mut queues = self.queues.lock();
            if completed {
                let idle = queues
                    .cluster_pending
                    .iter()
                    .any(|e| e.uid == uid && !e.inprocessing);
                if idle {
                    if let Some(mut entry) = queues.take(Queue::ClusterPending, uid) {
                        entry.pstate = ClusterCommitState::Processed;
                        queues.committed.push(entry);
                    }
                }
            }
            queues.committed.len()
        };
        if self.need_reap_one(committed) {
            self.run(true);
        }
    }

    /// A remote transaction this broker participates in committed
    pub fn add_remote(&self, uid: TransactionUid, recovery: bool) {
        let len = {
            let mut queues = self.queues.lock();
            let queue = if recovery {
                &mut queues.remote_recovered
            } else {
                &mut queues.remote_committed
            };
            queue.push(ReapEntry::new(uid, ClusterCommitState::Processed));
            queue.len()
        };
        if !self.ensure_timer() {
            return;
        }
        if len > self.config.reap_limit {
            self.wakeup();
        }
        if self.need_reap_one(len) {
            self.run(true);
        }
    }

    pub fn has_remote(&self, uid: TransactionUid) -> bool {
        let queues = self.queues.lock();
        queues.remote_committed.iter().any(|e| e.uid == uid)
            || queues.remote_recovered.iter().any(|e| e.uid == uid)
    }

    /// A broker connected to the cluster; its pending commit notifications are resent
    pub fn broker_activated(&self, addr: BrokerAddress) {
        self.activations.lock().insert(addr, self.clock.now_millis());
        self.wakeup();
    }

    pub fn committed_count(&self) -> usize {
        self.queues.lock().committed.len()
    }

    pub fn cluster_pending_count(&self) -> usize {
        self.queues.lock().cluster_pending.len()
    }

    pub fn remote_count(&self) -> usize {
        let queues = self.queues.lock();
        queues.remote_committed.len() + queues.remote_recovered.len()
    }

    pub fn is_tracked(&self, uid: TransactionUid) -> bool {
        let queues = self.queues.lock();
        [
            Queue::Committed,
            Queue::ClusterPending,
            Queue::RemoteCommitted,
            Queue::RemoteRecovered,
        ]
        .iter()
        .any(|q| queues.queue(*q).iter().any(|e| e.uid == uid))
    }

    pub fn wakeup(&self) {
        if let Some(timer) = self.timer.lock().as_ref() {
            timer.wakeup();
        }
    }

    /// Stop the sweep and forget every queued entry. Idempotent.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        let mut queues = self.queues.lock();
        queues.committed.clear();
        queues.cluster_pending.clear();
        queues.remote_committed.clear();
        queues.remote_recovered.clear();
    }

    /// Create the sweep timer on first use. A reaper that cannot run means
    /// committed bookkeeping grows without bound, so failure is fatal.
    fn ensure_timer(&self) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return true;
        }
        let reaper = self.self_ref.clone();
        let task: TaskFn = Arc::new(move || {
            if let Some(reaper) = reaper.upgrade() {
                reaper.sweep();
            }
        });
        let interval = self.config.reap_interval;
        match self.scheduler.schedule_periodic(REAPER_TIMER_NAME, interval, interval, task) {
            Ok(handle) => {
                log::info!(
                    "Committed transaction reaper started (limit {}, interval {}s)",
                    self.config.reap_limit,
                    interval.as_secs()
                );
                *timer = Some(handle);
                true
            }
            Err(e) => {
                drop(timer);
                let reason = format!("Unable to start the committed transaction reaper: {}", e);
                log::error!("{}", reason);
                self.fatal.restart(&reason);
                false
            }
        }
    }

    /// Periodic pass over every queue
    pub fn sweep(&self) {
        self.run(false);
        let mut guard = self.queues.lock();
        let queues = &mut *guard;
        for entry in queues
            .cluster_pending
            .iter_mut()
            .chain(queues.committed.iter_mut())
        {
            entry.swipemark = false;
        }
    }

    /// Reap entries. The inline path (`one_only`) reaps at most one entry
    /// per queue and leaves `reap_limit` committed entries in place; the
    /// sweep works until nothing is left to do.
    pub fn run(&self, one_only: bool) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        if !target.is_load_complete() {
            if one_only {
                return;
            }
            log::info!("Transaction reaper waiting for transaction loading to complete");
            if !target.wait_load_complete(self.config.reap_interval) {
                return;
            }
        }

        let activated = if one_only {
            HashSet::new()
        } else {
            self.recent_activations()
        };
        let limit = if one_only { self.config.reap_limit } else { 0 };
        let swipe = !one_only;

        let mut reaped = 0usize;
        let mut rounds = 0usize;
        let mut progressed = false;
        while !self.destroyed.load(Ordering::Acquire) {
            if rounds > 0 && (!progressed || one_only) {
                break;
            }
            progressed = false;
            rounds += 1;

            if !one_only && (!activated.is_empty() || self.has_unprocessed_cluster()) {
                if let Some((uid, pstate)) = self.next_entry(Queue::ClusterPending, 0, true) {
                    progressed = true;
                    self.process_cluster_entry(target.as_ref(), uid, pstate, &activated);
                }
            }

            if let Some((uid, _)) = self.next_entry(Queue::Committed, limit, swipe) {
                progressed = true;
                if self.reap_committed(target.as_ref(), uid) {
                    reaped += 1;
                }
            }

            for queue in [Queue::RemoteCommitted, Queue::RemoteRecovered] {
                if let Some((uid, _)) = self.next_entry(queue, limit, swipe) {
                    progressed = true;
                    self.queues.lock().take(queue, uid);
                    log::debug!("Cleaned up committed remote transaction {}", uid);
                }
            }
        }

        if !one_only {
            log::debug!("Transaction reaper sweep removed {} committed transactions", reaped);
        }
    }

    /// Claim the next entry beyond the first `limit` that is free to work on
    fn next_entry(&self, q: Queue, limit: usize, swipe: bool) -> Option<(TransactionUid, ClusterCommitState)> {
        let mut queues = self.queues.lock();
        let queue = queues.queue_mut(q);
        let mut remaining = queue.len();
        for entry in queue.iter_mut() {
            if remaining <= limit {
                break;
            }
            let skip = entry.inprocessing
                || (!swipe && (entry.swipeonly || entry.swipemark))
                || (swipe && entry.swipemark);
            if skip {
                remaining -= 1;
                continue;
            }
            entry.inprocessing = true;
            if swipe {
                entry.swipemark = true;
            }
            return Some((entry.uid, entry.pstate));
        }
        None
    }

    fn has_unprocessed_cluster(&self) -> bool {
        self.queues
            .lock()
            .cluster_pending
            .iter()
            .any(|e| e.pstate != ClusterCommitState::Processed)
    }

    /// Brokers activated within the notify window. Older activations are dropped.
    fn recent_activations(&self) -> HashSet<BrokerAddress> {
        let now = self.clock.now_millis();
        let window = self.config.reconnect_notify_window.as_millis() as u64;
        let mut activations = self.activations.lock();
        activations.retain(|_, at| now.saturating_sub(*at) <= window);
        activations.keys().cloned().collect()
    }

    fn process_cluster_entry(
        &self,
        target: &dyn ReapTarget,
        uid: TransactionUid,
        pstate: ClusterCommitState,
        activated: &HashSet<BrokerAddress>,
    ) {
        let brokers = match target.cluster_transaction_brokers(uid) {
            Ok(brokers) => brokers,
            Err(e) if e.is_not_found() => {
                log::debug!("Cluster transaction {} no longer registered: {}", uid, e);
                Vec::new()
            }
            Err(e) => {
                log::warn!("Unable to get participants of cluster transaction {}: {}", uid, e);
                if let Some(entry) = self.queues.lock().entry_mut(Queue::ClusterPending, uid) {
                    entry.inprocessing = false;
                }
                return;
            }
        };

        let local = self.cluster_view.local_address();
        let mut completed = true;
        for broker in brokers.iter().filter(|b| !b.is_completed()) {
            let Some(to) = broker.current_address(self.cluster_view.as_ref()) else {
                completed = false;
                if pstate != ClusterCommitState::Processed {
                    log::info!(
                        "Unable to notify participant {} of committed transaction {}: broker unreachable",
                        broker,
                        uid
                    );
                }
                continue;
            };
            let is_self = local.as_ref() == Some(&to);
            if is_self && to == *broker.address() {
                match target.complete_local_participant(uid, &to) {
                    Ok(()) => continue,
                    Err(e) => log::warn!(
                        "Unable to update participant state for {} of transaction {}: {}",
                        to,
                        uid,
                        e
                    ),
                }
            }
            completed = false;

            let notify = is_self || pstate != ClusterCommitState::Processed || activated.contains(&to);
            if !notify {
                continue;
            }
            log::debug!("Sending cluster transaction info for {} to {}", uid, to);
            if let Err(e) = self.broadcast.send_cluster_transaction_info(uid, &to) {
                log::warn!("Unable to notify {} of committed transaction {}: {}", to, uid, e);
            }
        }

        let mut queues = self.queues.lock();
        if completed {
            if let Some(mut entry) = queues.take(Queue::ClusterPending, uid) {
                entry.pstate = ClusterCommitState::Processed;
                entry.inprocessing = false;
                entry.swipemark = false;
                queues.committed.push(entry);
            }
        } else if let Some(entry) = queues.entry_mut(Queue::ClusterPending, uid) {
            entry.pstate = ClusterCommitState::Processed;
            entry.inprocessing = false;
        }
    }

    /// Returns whether the entry left the committed queue
    fn reap_committed(&self, target: &dyn ReapTarget, uid: TransactionUid) -> bool {
        let noremove = self.queues.lock().noremoves.contains(&uid);
        log::trace!("Cleaning up committed transaction {}", uid);
        if let Err(e) = target.reap_transaction(uid, noremove) {
            if !e.is_not_found() {
                log::warn!("Failed to clean up committed transaction {}: {}", uid, e);
                if let Some(entry) = self.queues.lock().entry_mut(Queue::Committed, uid) {
                    entry.inprocessing = false;
                    entry.swipeonly = true;
                }
                return false;
            }
            log::warn!("Cleanup committed transaction: {}", e);
        }
        let mut queues = self.queues.lock();
        queues.take(Queue::Committed, uid);
        queues.noremoves.remove(&uid);
        true
    }

    pub fn debug_state(&self, uid: TransactionUid) -> Option<serde_json::Value> {
        let queues = self.queues.lock();
        let labels = [
            (Queue::Committed, ""),
            (Queue::ClusterPending, "(cluster)"),
            (Queue::RemoteCommitted, "(remote)"),
            (Queue::RemoteRecovered, "(remote-r)"),
        ];
        labels.iter().find_map(|(q, label)| {
            queues
                .queue(*q)
                .iter()
                .any(|e| e.uid == uid)
                .then(|| serde_json::json!({ format!("{}{}", uid, label): "COMMITTED" }))
        })
    }

    pub fn debug_dump(&self) -> serde_json::Value {
        let queues = self.queues.lock();
        let describe = |q: Queue| -> Vec<String> {
            queues
                .queue(q)
                .iter()
                .map(|e| format!("{}:{}:{:?}", e.uid, e.inprocessing, e.pstate))
                .collect()
        };
        serde_json::json!({
            "committedCount": queues.committed.len(),
            "committed": describe(Queue::Committed),
            "clusterPCommittedCount": queues.cluster_pending.len(),
            "clusterPCommitted": describe(Queue::ClusterPending),
            "noremovesCount": queues.noremoves.len(),
            "remoteCommittedCount": queues.remote_committed.len(),
            "remoteRCommittedCount": queues.remote_recovered.len(),
            "timerRunning": self.timer.lock().is_some(),
        })
    }
}
