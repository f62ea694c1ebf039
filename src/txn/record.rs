//! Runtime envelope around a transaction owned by this broker
//!
//! A [`TransactionRecord`] guards its fields with its own mutex, so many
//! transactions progress concurrently while the registry lock only protects
//! map membership. The produced/consumed message tracker is embedded in the
//! record and shares that mutex.

use std::collections::{HashMap, HashSet};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Result, TxnError};
use crate::txn::broker::{BrokerAddress, ParticipantSet, TransactionBroker};
use crate::txn::state::{TransactionState, TxnStatus};
use crate::types::{ConsumerUid, MessageId, TransactionUid, TxnKind};

/// Produced and consumed messages of one transaction, with admission caps
#[derive(Debug)]
pub struct MessageTracker {
    producer_max: usize,
    consumer_max: usize,
    published: Vec<MessageId>,
    /// Insertion order of `consumed` keys
    consumed_order: Vec<MessageId>,
    consumed: HashMap<MessageId, Vec<ConsumerUid>>,
    /// Removed because the remote broker owning the message went down
    removed_remote_down: HashMap<MessageId, Vec<ConsumerUid>>,
    /// Removed because the message was rerouted to another consumer
    removed_rerouted: HashMap<MessageId, Vec<ConsumerUid>>,
    /// consumer -> consumer id the message is stored under
    stored_consumers: HashMap<ConsumerUid, ConsumerUid>,
    /// Broker to forward the acknowledgement of a remote message to
    ack_brokers: HashMap<MessageId, BrokerAddress>,
    /// message -> stored consumer -> consumers, for acks whose transaction
    /// outcome is still being resolved
    orphaned: HashMap<MessageId, HashMap<ConsumerUid, Vec<ConsumerUid>>>,
}

impl MessageTracker {
    pub fn new(producer_max: usize, consumer_max: usize) -> Self {
        Self {
            producer_max,
            consumer_max,
            published: Vec::new(),
            consumed_order: Vec::new(),
            consumed: HashMap::new(),
            removed_remote_down: HashMap::new(),
            removed_rerouted: HashMap::new(),
            stored_consumers: HashMap::new(),
            ack_brokers: HashMap::new(),
            orphaned: HashMap::new(),
        }
    }

    pub fn add_published(&mut self, uid: TransactionUid, msg: MessageId) -> Result<()> {
        if self.published.len() >= self.producer_max {
            return Err(TxnError::ResourceFull(format!(
                "Transaction {} exceeds the limit of {} produced messages",
                uid, self.producer_max
            )));
        }
        self.published.push(msg);
        Ok(())
    }

    /// Record that `consumer` consumed `msg`. The cap counts distinct messages.
    pub fn add_consumed(
        &mut self,
        uid: TransactionUid,
        msg: MessageId,
        consumer: ConsumerUid,
        stored: ConsumerUid,
    ) -> Result<()> {
        if self.consumed.len() >= self.consumer_max {
            return Err(TxnError::ResourceFull(format!(
                "Transaction {} exceeds the limit of {} consumed messages",
                uid, self.consumer_max
            )));
        }
        match self.consumed.get_mut(&msg) {
            Some(consumers) => {
                if consumers.contains(&consumer) {
                    return Err(TxnError::Conflict(format!(
                        "Message {} already acknowledged by consumer {} in transaction {}",
                        msg, consumer, uid
                    )));
                }
                consumers.push(consumer);
            }
            None => {
                self.consumed_order.push(msg.clone());
                self.consumed.insert(msg, vec![consumer]);
            }
        }
        self.stored_consumers.insert(consumer, stored);
        Ok(())
    }

    pub fn is_consumed(&self, msg: &MessageId, consumer: ConsumerUid) -> bool {
        self.consumed
            .get(msg)
            .map_or(false, |consumers| consumers.contains(&consumer))
    }

    /// Move a consumed entry into the rerouted or remote-down bucket and
    /// return the consumer id it is stored under.
    pub fn remove_consumed(
        &mut self,
        uid: TransactionUid,
        msg: &MessageId,
        consumer: ConsumerUid,
        rerouted: bool,
    ) -> Result<ConsumerUid> {
        let consumers = self.consumed.get_mut(msg).ok_or_else(|| {
            TxnError::NotFound(format!("Message {} not consumed in transaction {}", msg, uid))
        })?;
        let pos = consumers.iter().position(|c| *c == consumer).ok_or_else(|| {
            TxnError::NotFound(format!(
                "Message {} not consumed by {} in transaction {}",
                msg, consumer, uid
            ))
        })?;
        consumers.remove(pos);
        if consumers.is_empty() {
            self.consumed.remove(msg);
            self.consumed_order.retain(|m| m != msg);
        }

        let bucket = if rerouted {
            &mut self.removed_rerouted
        } else {
            &mut self.removed_remote_down
        };
        bucket.entry(msg.clone()).or_default().push(consumer);

        Ok(self.stored_consumers.get(&consumer).copied().unwrap_or(consumer))
    }

    pub fn removed_consumed(&self, rerouted: bool) -> HashMap<MessageId, Vec<ConsumerUid>> {
        if rerouted {
            self.removed_rerouted.clone()
        } else {
            self.removed_remote_down.clone()
        }
    }

    pub fn published(&self) -> &[MessageId] {
        &self.published
    }

    /// Consumed messages in the order they were first acknowledged
    pub fn consumed(&self) -> Vec<(MessageId, Vec<ConsumerUid>)> {
        self.consumed_order
            .iter()
            .filter_map(|m| self.consumed.get(m).map(|c| (m.clone(), c.clone())))
            .collect()
    }

    pub fn num_published(&self) -> usize {
        self.published.len()
    }

    pub fn num_consumed(&self) -> usize {
        self.consumed.values().map(Vec::len).sum()
    }

    pub fn stored_consumers(&self) -> &HashMap<ConsumerUid, ConsumerUid> {
        &self.stored_consumers
    }

    pub fn stored_consumer(&self, consumer: ConsumerUid) -> Option<ConsumerUid> {
        self.stored_consumers.get(&consumer).copied()
    }

    /// Remember which broker an acknowledgement has to be forwarded to.
    /// A second, different broker (or a different session of the same one)
    /// means the message was requeued in between.
    pub fn set_ack_broker(&mut self, msg: MessageId, addr: BrokerAddress) -> Result<()> {
        if let Some(existing) = self.ack_brokers.get(&msg) {
            if *existing != addr || existing.broker_session != addr.broker_session {
                return Err(TxnError::Gone(format!(
                    "Message {} requeued: was routed to {}, now {}",
                    msg, existing, addr
                )));
            }
            return Ok(());
        }
        self.ack_brokers.insert(msg, addr);
        Ok(())
    }

    pub fn ack_broker(&self, msg: &MessageId) -> Option<&BrokerAddress> {
        self.ack_brokers.get(msg)
    }

    pub fn ack_brokers(&self) -> &HashMap<MessageId, BrokerAddress> {
        &self.ack_brokers
    }

    pub fn add_orphan_ack(&mut self, msg: MessageId, consumer: ConsumerUid, stored: Option<ConsumerUid>) {
        let stored = stored.unwrap_or(consumer);
        let consumers = self.orphaned.entry(msg).or_default().entry(stored).or_default();
        if !consumers.contains(&consumer) {
            consumers.push(consumer);
        }
    }

    /// Remove an orphaned ack. With `stored` unset, every stored consumer of
    /// the message is searched.
    pub fn remove_orphan_ack(&mut self, msg: &MessageId, consumer: ConsumerUid, stored: Option<ConsumerUid>) -> bool {
        let Some(by_stored) = self.orphaned.get_mut(msg) else {
            return false;
        };
        let mut removed = false;
        by_stored.retain(|sid, consumers| {
            if stored.map_or(true, |s| s == *sid) {
                let before = consumers.len();
                consumers.retain(|c| *c != consumer);
                removed |= consumers.len() != before;
            }
            !consumers.is_empty()
        });
        if by_stored.is_empty() {
            self.orphaned.remove(msg);
        }
        removed
    }

    pub fn orphan_acks(&self) -> HashMap<MessageId, HashMap<ConsumerUid, Vec<ConsumerUid>>> {
        self.orphaned.clone()
    }
}

/// Takeover mutual exclusion. Held by the thread that adopts the record from
/// a failed broker; other threads see the record as locked until it is released.
#[derive(Debug, Default)]
pub struct TakeoverLock {
    owner: Mutex<Option<ThreadId>>,
}

impl TakeoverLock {
    /// Returns false if another thread already holds the lock
    pub fn acquire(&self) -> bool {
        let mut owner = self.owner.lock();
        let me = thread::current().id();
        match *owner {
            Some(holder) if holder != me => false,
            _ => {
                *owner = Some(me);
                true
            }
        }
    }

    pub fn release(&self) {
        *self.owner.lock() = None;
    }

    /// True if locked by a thread other than the caller
    pub fn is_locked_by_other(&self) -> bool {
        let owner = self.owner.lock();
        matches!(*owner, Some(holder) if holder != thread::current().id())
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }
}

/// Fields of a record, guarded by the record mutex
#[derive(Debug)]
pub struct RecordData {
    pub state: TransactionState,
    pub kind: TxnKind,
    pub messages: MessageTracker,
    pub participants: Option<ParticipantSet>,
    pub processed: bool,
    pub in_rollback: bool,
}

/// A transaction owned by this broker (local or cluster)
#[derive(Debug)]
pub struct TransactionRecord {
    uid: TransactionUid,
    takeover: TakeoverLock,
    data: Mutex<RecordData>,
}

impl TransactionRecord {
    pub fn new(uid: TransactionUid, state: TransactionState, producer_max: usize, consumer_max: usize) -> Self {
        Self {
            uid,
            takeover: TakeoverLock::default(),
            data: Mutex::new(RecordData {
                state,
                kind: TxnKind::Local,
                messages: MessageTracker::new(producer_max, consumer_max),
                participants: None,
                processed: false,
                in_rollback: false,
            }),
        }
    }

    pub fn uid(&self) -> TransactionUid {
        self.uid
    }

    /// Lock the record for a compound check-and-mutate
    pub fn lock(&self) -> MutexGuard<'_, RecordData> {
        self.data.lock()
    }

    pub fn takeover_lock(&self) -> &TakeoverLock {
        &self.takeover
    }

    pub fn is_takeover_locked(&self) -> bool {
        self.takeover.is_locked_by_other()
    }

    /// Snapshot of the current state
    pub fn state(&self) -> TransactionState {
        self.data.lock().state.clone()
    }

    pub fn status(&self) -> TxnStatus {
        self.data.lock().state.status()
    }

    pub fn kind(&self) -> TxnKind {
        self.data.lock().kind
    }

    /// Turn this record into a cluster transaction with a fixed participant list
    pub fn set_cluster_brokers(&self, brokers: Vec<TransactionBroker>) {
        let mut data = self.data.lock();
        data.kind = TxnKind::Cluster;
        data.participants = Some(ParticipantSet::new(brokers));
    }

    pub fn cluster_brokers(&self) -> Option<Vec<TransactionBroker>> {
        self.data.lock().participants.as_ref().map(ParticipantSet::to_vec)
    }

    pub fn is_cluster_completed(&self) -> bool {
        self.data
            .lock()
            .participants
            .as_ref()
            .map_or(true, ParticipantSet::is_completed)
    }

    /// Single-shot guard: true only for the first caller
    pub fn processed(&self) -> bool {
        let mut data = self.data.lock();
        let first = !data.processed;
        data.processed = true;
        first
    }

    pub fn is_processed(&self) -> bool {
        self.data.lock().processed
    }

    pub fn set_in_rollback(&self, in_rollback: bool) {
        self.data.lock().in_rollback = in_rollback;
    }

    pub fn is_in_rollback(&self) -> bool {
        self.data.lock().in_rollback
    }

    /// A rolled-back (or rolling back) transaction no longer claims its messages
    pub fn is_consumed_message(&self, msg: &MessageId, consumer: ConsumerUid) -> bool {
        let data = self.data.lock();
        if data.state.status() == TxnStatus::RolledBack || data.in_rollback {
            return false;
        }
        data.messages.is_consumed(msg, consumer)
    }

    pub fn published_messages(&self) -> Vec<MessageId> {
        self.data.lock().messages.published().to_vec()
    }

    pub fn consumed_messages(&self) -> Vec<(MessageId, Vec<ConsumerUid>)> {
        self.data.lock().messages.consumed()
    }

    pub fn num_published(&self) -> usize {
        self.data.lock().messages.num_published()
    }

    pub fn num_consumed(&self) -> usize {
        self.data.lock().messages.num_consumed()
    }

    /// Brokers acknowledgements have to be forwarded to
    pub fn ack_brokers(&self) -> HashSet<BrokerAddress> {
        self.data.lock().messages.ack_brokers().values().cloned().collect()
    }

    pub fn debug_state(&self) -> serde_json::Value {
        let data = self.data.lock();
        let consumed: Vec<String> = data
            .messages
            .consumed()
            .iter()
            .map(|(m, cs)| {
                let cs: Vec<String> = cs.iter().map(|c| c.to_string()).collect();
                format!("{}:[{}]", m, cs.join(","))
            })
            .collect();
        serde_json::json!({
            "uid": self.uid.to_string(),
            "type": data.kind.to_string(),
            "state": data.state.debug_state(),
            "published": data.messages.published().iter().map(|m| m.to_string()).collect::<Vec<_>>(),
            "consumed": consumed,
            "processed": data.processed,
            "inRollback": data.in_rollback,
            "takeoverLocked": self.takeover.is_locked(),
            "brokers": data.participants.as_ref().map(|p| p.iter().map(|b| b.to_string()).collect::<Vec<_>>()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn uid() -> TransactionUid {
        TransactionUid::new(1)
    }

    fn msg(i: usize) -> MessageId {
        MessageId::new(format!("m{}", i))
    }

    #[test]
    fn test_published_cap() {
        let mut tracker = MessageTracker::new(3, 10);
        for i in 0..3 {
            tracker.add_published(uid(), msg(i)).unwrap();
        }
        let err = tracker.add_published(uid(), msg(3)).unwrap_err();
        assert!(matches!(err, TxnError::ResourceFull(_)));
        assert_eq!(tracker.num_published(), 3);
    }

    #[test]
    fn test_consumed_cap() {
        let mut tracker = MessageTracker::new(10, 2);
        tracker.add_consumed(uid(), msg(0), ConsumerUid(1), ConsumerUid(1)).unwrap();
        tracker.add_consumed(uid(), msg(1), ConsumerUid(1), ConsumerUid(1)).unwrap();
        let err = tracker
            .add_consumed(uid(), msg(2), ConsumerUid(1), ConsumerUid(1))
            .unwrap_err();
        assert!(matches!(err, TxnError::ResourceFull(_)));
    }

    #[test]
    fn test_duplicate_consumed_conflicts() {
        let mut tracker = MessageTracker::new(10, 10);
        tracker.add_consumed(uid(), msg(0), ConsumerUid(1), ConsumerUid(1)).unwrap();
        let err = tracker
            .add_consumed(uid(), msg(0), ConsumerUid(1), ConsumerUid(1))
            .unwrap_err();
        assert!(matches!(err, TxnError::Conflict(_)));

        tracker.add_consumed(uid(), msg(0), ConsumerUid(2), ConsumerUid(2)).unwrap();
        assert_eq!(tracker.num_consumed(), 2);
        assert_eq!(tracker.consumed().len(), 1);
    }

    #[test]
    fn test_remove_consumed_buckets() {
        let mut tracker = MessageTracker::new(10, 10);
        tracker.add_consumed(uid(), msg(0), ConsumerUid(1), ConsumerUid(100)).unwrap();
        tracker.add_consumed(uid(), msg(1), ConsumerUid(2), ConsumerUid(2)).unwrap();

        let stored = tracker.remove_consumed(uid(), &msg(0), ConsumerUid(1), true).unwrap();
        assert_eq!(stored, ConsumerUid(100));
        let stored = tracker.remove_consumed(uid(), &msg(1), ConsumerUid(2), false).unwrap();
        assert_eq!(stored, ConsumerUid(2));

        assert!(tracker.removed_consumed(true).contains_key(&msg(0)));
        assert!(tracker.removed_consumed(false).contains_key(&msg(1)));
        assert!(tracker.consumed().is_empty());

        let err = tracker.remove_consumed(uid(), &msg(0), ConsumerUid(1), true).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_consumed_keeps_insertion_order() {
        let mut tracker = MessageTracker::new(10, 10);
        for i in [5, 2, 9] {
            tracker.add_consumed(uid(), msg(i), ConsumerUid(1), ConsumerUid(1)).unwrap();
        }
        let order: Vec<MessageId> = tracker.consumed().into_iter().map(|(m, _)| m).collect();
        assert_eq!(order, vec![msg(5), msg(2), msg(9)]);
    }

    #[test]
    fn test_ack_broker_requeue_is_gone() {
        let mut tracker = MessageTracker::new(10, 10);
        let a = BrokerAddress::new("a", 1).with_broker_session(1);
        tracker.set_ack_broker(msg(0), a.clone()).unwrap();
        tracker.set_ack_broker(msg(0), a.clone()).unwrap();

        let restarted = BrokerAddress::new("a", 1).with_broker_session(2);
        let err = tracker.set_ack_broker(msg(0), restarted).unwrap_err();
        assert!(matches!(err, TxnError::Gone(_)));
    }

    #[test]
    fn test_orphan_acks() {
        let mut tracker = MessageTracker::new(10, 10);
        tracker.add_orphan_ack(msg(0), ConsumerUid(1), Some(ConsumerUid(7)));
        tracker.add_orphan_ack(msg(0), ConsumerUid(2), None);
        assert_eq!(tracker.orphan_acks()[&msg(0)].len(), 2);

        assert!(tracker.remove_orphan_ack(&msg(0), ConsumerUid(1), None));
        assert!(!tracker.remove_orphan_ack(&msg(0), ConsumerUid(1), None));
        assert!(tracker.remove_orphan_ack(&msg(0), ConsumerUid(2), Some(ConsumerUid(2))));
        assert!(tracker.orphan_acks().is_empty());
    }

    #[test]
    fn test_processed_is_single_shot() {
        let rec = TransactionRecord::new(uid(), TransactionState::new(0), 10, 10);
        assert!(rec.processed());
        assert!(!rec.processed());
        assert!(rec.is_processed());
    }

    #[test]
    fn test_rolled_back_record_claims_no_messages() {
        let rec = TransactionRecord::new(uid(), TransactionState::new(0), 10, 10);
        rec.lock()
            .messages
            .add_consumed(uid(), msg(0), ConsumerUid(1), ConsumerUid(1))
            .unwrap();
        assert!(rec.is_consumed_message(&msg(0), ConsumerUid(1)));

        rec.set_in_rollback(true);
        assert!(!rec.is_consumed_message(&msg(0), ConsumerUid(1)));
    }

    #[test]
    fn test_takeover_lock_other_thread() {
        let rec = Arc::new(TransactionRecord::new(uid(), TransactionState::new(0), 10, 10));
        assert!(rec.takeover_lock().acquire());
        assert!(!rec.is_takeover_locked());

        let other = Arc::clone(&rec);
        let seen = std::thread::spawn(move || (other.is_takeover_locked(), other.takeover_lock().acquire()))
            .join()
            .unwrap();
        assert_eq!(seen, (true, false));

        rec.takeover_lock().release();
        let other = Arc::clone(&rec);
        assert!(!std::thread::spawn(move || other.is_takeover_locked()).join().unwrap());
    }

    #[test]
    fn test_cluster_completion() {
        let rec = TransactionRecord::new(uid(), TransactionState::new(0), 10, 10);
        assert!(rec.is_cluster_completed());
        rec.set_cluster_brokers(vec![TransactionBroker::new(BrokerAddress::new("a", 1))]);
        assert_eq!(rec.kind(), TxnKind::Cluster);
        assert!(!rec.is_cluster_completed());
    }
}
