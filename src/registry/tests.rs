use super::*;
use crate::clock::ManualClock;
use crate::collaborators::{FatalErrorHandler, MessageInfo, MessageResolver};
use crate::persist::{MemoryStore, StorePersistence, StoredTransaction};
use crate::reaper::REAPER_TIMER_NAME;
use crate::timer::ManualScheduler;
use crate::txn::broker::StandaloneView;
use crate::txn::state::{EndFlag, StartFlag};
use crate::types::DestinationId;
use crate::watchdog::WATCHDOG_TIMER_NAME;
use std::thread;

struct NoRestart;

impl FatalErrorHandler for NoRestart {
    fn restart(&self, reason: &str) {
        panic!("unexpected restart: {}", reason);
    }
}

#[derive(Default)]
struct FakeMessages {
    infos: Mutex<HashMap<MessageId, MessageInfo>>,
    stored: Mutex<Vec<MessageId>>,
}

impl FakeMessages {
    fn put(&self, msg: &str, persistent: bool, stored: bool, local: bool) {
        self.infos.lock().insert(
            MessageId::new(msg),
            MessageInfo {
                destination: DestinationId("orders".to_string()),
                payload: msg.as_bytes().to_vec(),
                persistent,
                stored,
                local,
                stored_interests: vec![ConsumerUid(1)],
            },
        );
    }
}

impl MessageResolver for FakeMessages {
    fn resolve(&self, msg: &MessageId) -> Option<MessageInfo> {
        self.infos.lock().get(msg).cloned()
    }

    fn mark_stored(&self, msg: &MessageId) {
        self.stored.lock().push(msg.clone());
    }
}

struct Harness {
    registry: Arc<TransactionRegistry>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    scheduler: Arc<ManualScheduler>,
    messages: Arc<FakeMessages>,
}

fn local_addr() -> BrokerAddress {
    BrokerAddress::new("local", 7676)
}

fn peer_addr() -> BrokerAddress {
    BrokerAddress::new("peer", 7677)
}

fn harness(config: TxnConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let scheduler = Arc::new(ManualScheduler::new());
    let messages = Arc::new(FakeMessages::default());
    let collab = Collaborators::standalone()
        .with_cluster(
            Arc::new(StandaloneView::new(Some(local_addr()))),
            Arc::new(crate::collaborators::NoClusterBroadcast),
        )
        .with_messages(messages.clone())
        .with_fatal_handler(Arc::new(NoRestart))
        .with_clock(clock.clone())
        .with_scheduler(scheduler.clone());
    let persistence = Arc::new(StorePersistence::new(store.clone()));
    let registry = TransactionRegistry::new(config, persistence, collab);
    registry.mark_load_complete();
    Harness {
        registry,
        store,
        clock,
        scheduler,
        messages,
    }
}

fn default_harness() -> Harness {
    harness(TxnConfig {
        reap_limit: 10,
        ..Default::default()
    })
}

fn uid(n: u64) -> TransactionUid {
    TransactionUid::new(n)
}

fn started() -> TransactionState {
    TransactionState::new(1_000_000).with_status(TxnStatus::Started)
}

fn msg(s: &str) -> MessageId {
    MessageId::new(s)
}

#[test]
fn test_add_and_retrieve() {
    let h = default_harness();
    let xid = Xid::new(1, b"g1".to_vec(), b"b1".to_vec());
    h.registry
        .add_transaction(uid(1), started().with_xid(xid.clone()), true)
        .unwrap();

    assert_eq!(h.registry.retrieve_state(uid(1)).unwrap().status(), TxnStatus::Started);
    assert_eq!(h.registry.xid_to_uid(&xid), Some(uid(1)));
    assert_eq!(h.registry.uid_to_xid(uid(1)), Some(xid));
    assert_eq!(h.store.status(uid(1)), Some(TxnStatus::Started));
    assert!(h.registry.is_local(uid(1)));
    assert_eq!(h.registry.transactions(None), vec![uid(1)]);
}

#[test]
fn test_duplicate_ids_conflict() {
    let h = default_harness();
    let xid = Xid::new(1, b"g1".to_vec(), b"b1".to_vec());
    h.registry
        .add_transaction(uid(1), started().with_xid(xid.clone()), false)
        .unwrap();

    let err = h.registry.add_transaction(uid(1), started(), false).unwrap_err();
    assert!(matches!(err, TxnError::Conflict(_)));

    let err = h
        .registry
        .add_transaction(uid(2), started().with_xid(xid), false)
        .unwrap_err();
    assert!(matches!(err, TxnError::Conflict(_)));
    assert!(h.registry.retrieve_state(uid(2)).is_none());
}

#[test]
fn test_null_xid_is_not_indexed() {
    let h = default_harness();
    h.registry
        .add_transaction(uid(1), started().with_xid(Xid::null()), false)
        .unwrap();
    h.registry
        .add_transaction(uid(2), started().with_xid(Xid::null()), false)
        .unwrap();
    assert_eq!(h.registry.xid_to_uid(&Xid::null()), None);
}

#[test]
fn test_store_failure_leaves_nothing_registered() {
    let h = default_harness();
    h.store.fail_next_write();
    let err = h.registry.add_transaction(uid(1), started(), true).unwrap_err();
    assert!(matches!(err, TxnError::Store(_)));
    assert!(h.registry.retrieve_state(uid(1)).is_none());

    h.registry.add_transaction(uid(1), started(), true).unwrap();
}

#[test]
fn test_message_admission_rules() {
    let h = default_harness();
    let err = h.registry.add_message(uid(9), msg("m0"), false).unwrap_err();
    assert!(matches!(err, TxnError::Gone(_)));

    h.registry
        .add_transaction(uid(1), TransactionState::new(0).with_status(TxnStatus::Complete), false)
        .unwrap();
    let err = h.registry.add_message(uid(1), msg("m0"), false).unwrap_err();
    assert!(matches!(err, TxnError::PreconditionFailed(_)));
    h.registry.add_message(uid(1), msg("m0"), true).unwrap();

    h.registry
        .add_transaction(uid(2), TransactionState::new(0).with_status(TxnStatus::TimedOut), false)
        .unwrap();
    let err = h.registry.add_message(uid(2), msg("m1"), true).unwrap_err();
    assert!(matches!(err, TxnError::Timeout(_)));
}

#[test]
fn test_acknowledgements() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), true).unwrap();

    let is_xa = h
        .registry
        .add_acknowledgement(uid(1), msg("m0"), ConsumerUid(1), ConsumerUid(100), false, true)
        .unwrap();
    assert!(!is_xa);
    assert_eq!(h.store.ack_count(uid(1)), 1);
    assert!(h.registry.check_acknowledgement(uid(1), &msg("m0"), ConsumerUid(1)).unwrap());
    assert_eq!(h.registry.consumed_in_transaction(&msg("m0"), ConsumerUid(1)), Some(uid(1)));

    let err = h
        .registry
        .add_acknowledgement(uid(1), msg("m0"), ConsumerUid(1), ConsumerUid(100), false, true)
        .unwrap_err();
    assert!(matches!(err, TxnError::Conflict(_)));

    let stored = h
        .registry
        .remove_acknowledgement(uid(1), &msg("m0"), ConsumerUid(1), true)
        .unwrap();
    assert_eq!(stored, ConsumerUid(100));
    assert_eq!(h.registry.consumed_in_transaction(&msg("m0"), ConsumerUid(1)), None);
    assert!(h
        .registry
        .retrieve_removed_consumed(uid(1), true)
        .unwrap()
        .contains_key(&msg("m0")));

    let err = h
        .registry
        .remove_acknowledgement(uid(7), &msg("m0"), ConsumerUid(1), true)
        .unwrap_err();
    assert!(err.is_fatal());

    h.registry.remove_transaction_ack_persisted(uid(1)).unwrap();
    assert_eq!(h.store.ack_count(uid(1)), 0);
}

#[test]
fn test_operations_follow_state_machine() {
    let h = default_harness();
    h.registry
        .add_transaction(uid(1), TransactionState::new(0), true)
        .unwrap();

    h.registry
        .apply_operation(uid(1), TxnOperation::Start(StartFlag::NoFlags), true)
        .unwrap();
    h.registry
        .apply_operation(uid(1), TxnOperation::End(EndFlag::Success), true)
        .unwrap();

    let err = h
        .registry
        .apply_operation(uid(1), TxnOperation::Commit { one_phase: false }, true)
        .unwrap_err();
    assert!(matches!(err, TxnError::Conflict(_)));

    let state = h
        .registry
        .apply_operation(uid(1), TxnOperation::Commit { one_phase: true }, true)
        .unwrap();
    assert_eq!(state.status(), TxnStatus::Committed);
    assert_eq!(h.store.status(uid(1)), Some(TxnStatus::Committed));
}

#[test]
fn test_change_state_expected_mismatch() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), false).unwrap();
    let err = h
        .registry
        .change_state(uid(1), StateChange::to(TxnStatus::Prepared).expecting(TxnStatus::Complete))
        .unwrap_err();
    assert!(matches!(err, TxnError::Conflict(_)));

    let state = h
        .registry
        .change_state(
            uid(1),
            StateChange::to(TxnStatus::Failed).failing_to(TxnStatus::Complete),
        )
        .unwrap();
    assert_eq!(state.fail_from(), Some(TxnStatus::Started));
    assert_eq!(state.fail_to(), Some(TxnStatus::Complete));

    let err = h.registry.update_state(uid(42), TxnStatus::Prepared, false).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_prepare_with_work() {
    let h = default_harness();
    h.messages.put("p0", true, false, true);
    h.messages.put("p1", false, false, true);
    h.messages.put("c0", true, true, true);
    h.messages.put("c1", true, true, false);

    h.registry.add_transaction(uid(1), started(), true).unwrap();
    for m in ["p0", "p1", "ghost"] {
        h.registry.add_message(uid(1), msg(m), false).unwrap();
    }
    for m in ["c0", "c1"] {
        h.registry
            .add_acknowledgement(uid(1), msg(m), ConsumerUid(1), ConsumerUid(1), false, false)
            .unwrap();
    }

    let work = h.registry.transaction_work(uid(1)).unwrap();
    assert_eq!(work.num_sent(), 1);
    assert_eq!(work.sent_messages()[0].message, msg("p0"));
    assert_eq!(work.num_acks(), 1);
    assert_eq!(work.acks()[0].ack.message, msg("c0"));

    let state = h.registry.update_state_prepare_with_work(uid(1), true, true).unwrap();
    assert_eq!(state.status(), TxnStatus::Prepared);
    assert!(state.is_one_phase());
    assert_eq!(*h.messages.stored.lock(), vec![msg("p0")]);
}

#[test]
fn test_work_fails_when_consumed_message_is_gone() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), false).unwrap();
    h.registry
        .add_acknowledgement(uid(1), msg("gone"), ConsumerUid(1), ConsumerUid(1), false, false)
        .unwrap();
    let err = h.registry.update_state_commit_with_work(uid(1), true).unwrap_err();
    assert!(matches!(err, TxnError::Conflict(_)));
    assert_eq!(h.registry.retrieve_state(uid(1)).unwrap().status(), TxnStatus::Started);
}

#[test]
fn test_committed_transaction_is_reaped_by_sweep() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), true).unwrap();
    h.registry.update_state(uid(1), TxnStatus::Committed, true).unwrap();
    h.registry.remove_transaction(uid(1), false, true).unwrap();

    // handed to the reaper: invisible but still stored
    assert!(h.registry.retrieve_state(uid(1)).is_none());
    assert!(h.registry.retrieve_state_for_inquiry(uid(1)).is_some());
    assert!(h.registry.transactions(None).is_empty());
    assert!(h.store.contains(uid(1)));
    assert_eq!(h.registry.reaper().committed_count(), 1);

    // a second remove does not queue it twice
    h.registry.remove_transaction(uid(1), false, true).unwrap();
    assert_eq!(h.registry.reaper().committed_count(), 1);

    h.scheduler.run_named(REAPER_TIMER_NAME);
    assert!(h.registry.retrieve_state_for_inquiry(uid(1)).is_none());
    assert!(!h.store.contains(uid(1)));
    assert_eq!(h.registry.reaper().committed_count(), 0);

    h.registry.add_transaction(uid(1), started(), true).unwrap();
}

#[test]
fn test_immediate_reap_removes_synchronously() {
    let h = harness(TxnConfig::immediate_reap());
    h.registry.add_transaction(uid(1), started(), true).unwrap();
    h.registry.update_state(uid(1), TxnStatus::Committed, true).unwrap();
    h.registry.remove_transaction(uid(1), false, true).unwrap();

    assert!(h.registry.retrieve_state_for_inquiry(uid(1)).is_none());
    assert!(!h.store.contains(uid(1)));
    assert_eq!(h.registry.reaper().committed_count(), 0);
}

#[test]
fn test_noremove_keeps_store_until_purged() {
    let h = harness(TxnConfig::immediate_reap());
    h.registry.add_transaction(uid(1), started(), true).unwrap();
    h.registry.update_state(uid(1), TxnStatus::Committed, true).unwrap();
    h.registry.remove_transaction(uid(1), true, true).unwrap();

    h.scheduler.run_named(REAPER_TIMER_NAME);
    assert!(h.registry.retrieve_state_for_inquiry(uid(1)).is_none());
    assert!(h.store.contains(uid(1)));
    assert_eq!(h.registry.retained_transactions(), vec![uid(1)]);

    h.registry.purge_retained(uid(1)).unwrap();
    assert!(!h.store.contains(uid(1)));
    assert!(h.registry.purge_retained(uid(1)).unwrap_err().is_not_found());
}

#[test]
fn test_rolled_back_transaction_is_removed_directly() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), true).unwrap();
    h.registry.update_state(uid(1), TxnStatus::RolledBack, true).unwrap();
    h.registry.remove_transaction(uid(1), false, true).unwrap();
    assert!(h.registry.retrieve_state_for_inquiry(uid(1)).is_none());
    assert!(!h.store.contains(uid(1)));

    let err = h.registry.remove_transaction(uid(1), false, true).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_transactions_by_status() {
    let h = default_harness();
    h.registry.add_transaction(uid(3), started(), false).unwrap();
    h.registry.add_transaction(uid(1), started(), false).unwrap();
    h.registry
        .add_transaction(uid(2), TransactionState::new(0).with_status(TxnStatus::Prepared), false)
        .unwrap();

    assert_eq!(h.registry.transactions(None), vec![uid(1), uid(2), uid(3)]);
    assert_eq!(h.registry.transactions(Some(TxnStatus::Prepared)), vec![uid(2)]);
    assert_eq!(h.registry.transactions(Some(TxnStatus::Started)), vec![uid(1), uid(3)]);
}

#[test]
fn test_cluster_transaction_completes_through_reaper() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), true).unwrap();
    let brokers = vec![TransactionBroker::new(local_addr()), TransactionBroker::new(peer_addr())];
    h.registry
        .log_cluster_transaction(uid(1), started(), brokers, true, true)
        .unwrap();
    assert!(h.registry.is_cluster(uid(1)));
    assert!(h.registry.has_remote_broker(uid(1)));
    assert_eq!(h.registry.cluster_transactions(None), vec![uid(1)]);

    let err = h
        .registry
        .complete_cluster_transaction_broker_state(uid(1), TxnStatus::Committed, &peer_addr(), true)
        .unwrap_err();
    assert!(err.is_fatal());

    h.registry.update_state(uid(1), TxnStatus::Committed, true).unwrap();
    h.registry
        .complete_cluster_transaction_broker_state(uid(1), TxnStatus::Committed, &peer_addr(), true)
        .unwrap();
    assert!(h
        .registry
        .cluster_transaction_broker(uid(1), &peer_addr())
        .unwrap()
        .is_completed());

    h.registry.remove_transaction(uid(1), false, true).unwrap();
    assert_eq!(h.registry.reaper().cluster_pending_count(), 1);
    assert!(h.store.contains(uid(1)));

    // the sweep completes this broker's own participation, then reaps
    h.scheduler.run_named(REAPER_TIMER_NAME);
    assert_eq!(h.registry.reaper().cluster_pending_count(), 0);
    assert!(h.registry.retrieve_state_for_inquiry(uid(1)).is_none());
    assert!(!h.store.contains(uid(1)));
}

#[test]
fn test_log_cluster_transaction_requires_existing_when_asked() {
    let h = default_harness();
    let err = h
        .registry
        .log_cluster_transaction(uid(1), started(), vec![TransactionBroker::new(peer_addr())], true, true)
        .unwrap_err();
    assert!(err.is_fatal());

    h.store.fail_next_write();
    let err = h
        .registry
        .log_cluster_transaction(uid(1), started(), vec![TransactionBroker::new(peer_addr())], false, true)
        .unwrap_err();
    assert!(matches!(err, TxnError::Store(_)));
    assert!(!h.registry.is_cluster(uid(1)));

    h.registry
        .log_cluster_transaction(uid(1), started(), vec![TransactionBroker::new(peer_addr())], false, true)
        .unwrap();
    assert_eq!(h.store.transaction(uid(1)).unwrap().kind, TxnKind::Cluster);
    assert_eq!(h.registry.cluster_transaction_brokers(uid(1)).unwrap().len(), 1);
}

#[test]
fn test_takeover_lock_hides_record_from_other_threads() {
    let h = default_harness();
    let state = TransactionState::new(0).with_status(TxnStatus::Prepared);
    h.registry
        .add_takeover_transaction(&StoredTransaction::local(uid(1), state))
        .unwrap();
    assert!(h.registry.retrieve_state(uid(1)).is_some());

    let registry = Arc::clone(&h.registry);
    let (visible, update) = thread::spawn(move || {
        let visible = registry.retrieve_state(uid(1)).is_some();
        let update = registry.update_state(uid(1), TxnStatus::Committed, false);
        (visible, update.map(|_| ()))
    })
    .join()
    .unwrap();
    assert!(!visible);
    assert!(update.unwrap_err().is_not_found());

    h.registry.unlock_takeover_transactions(&[uid(1)]);
    let registry = Arc::clone(&h.registry);
    assert!(thread::spawn(move || registry.retrieve_state(uid(1)).is_some())
        .join()
        .unwrap());
}

#[test]
fn test_takeover_one_phase_prepared_is_watched() {
    let h = harness(TxnConfig {
        detached_timeout: Duration::from_secs(10),
        ..Default::default()
    });
    let mut state = TransactionState::new(0).with_status(TxnStatus::Prepared);
    state.set_one_phase(true);
    h.registry
        .add_takeover_transaction(&StoredTransaction::local(uid(1), state))
        .unwrap();
    assert_eq!(h.registry.detached_transactions(), vec![uid(1)]);
}

#[test]
fn test_detached_transaction_times_out() {
    let h = harness(TxnConfig {
        detached_timeout: Duration::from_secs(10),
        ..Default::default()
    });
    h.registry
        .add_transaction(uid(1), TransactionState::new(0).with_status(TxnStatus::Incomplete), true)
        .unwrap();
    h.registry.detach(uid(1)).unwrap();
    assert_eq!(h.registry.detached_transactions(), vec![uid(1)]);

    h.clock.advance(Duration::from_secs(9));
    h.scheduler.run_named(WATCHDOG_TIMER_NAME);
    assert!(h.registry.retrieve_state(uid(1)).is_some());

    h.clock.advance(Duration::from_secs(1));
    h.scheduler.run_named(WATCHDOG_TIMER_NAME);
    assert!(h.registry.retrieve_state_for_inquiry(uid(1)).is_none());
    assert!(!h.store.contains(uid(1)));
    assert!(h.registry.detached_transactions().is_empty());
}

#[test]
fn test_detach_onephase_prepared_starts_clock() {
    let h = harness(TxnConfig {
        detached_timeout: Duration::from_secs(10),
        ..Default::default()
    });
    let mut state = TransactionState::new(0).with_status(TxnStatus::Prepared);
    state.set_one_phase(true);
    h.registry.add_transaction(uid(1), state, false).unwrap();
    h.registry.add_detached(uid(1));
    assert!(!h.registry.retrieve_state(uid(1)).unwrap().is_detached());

    h.registry.detach_onephase_prepared();
    let state = h.registry.retrieve_state(uid(1)).unwrap();
    assert!(state.is_detached());
    assert_eq!(state.detached_time(), 1_000_000);
}

#[test]
fn test_remote_transaction_lifecycle() {
    let h = default_harness();
    let state = TransactionState::new(0).with_status(TxnStatus::Prepared);
    let acks = vec![TransactionAck::new(msg("r0"), ConsumerUid(3))];
    h.registry
        .log_remote_transaction(uid(5), RemoteRegistration::new(state.clone(), acks, peer_addr()), true)
        .unwrap();
    assert!(h.registry.is_remote(uid(5)));
    assert_eq!(h.store.ack_count(uid(5)), 1);
    assert_eq!(h.registry.remote_transaction_acks(uid(5)).unwrap().len(), 1);
    assert_eq!(h.registry.remote_transaction_home_broker(uid(5)).unwrap().address(), &peer_addr());
    assert_eq!(h.registry.remote_transactions(Some(TxnStatus::Prepared)), vec![uid(5)]);

    let err = h
        .registry
        .log_remote_transaction(uid(5), RemoteRegistration::new(state, Vec::new(), peer_addr()), false)
        .unwrap_err();
    assert!(matches!(err, TxnError::Conflict(_)));

    assert!(h
        .registry
        .update_remote_transaction_state(uid(5), TxnStatus::Committed, false, true)
        .unwrap());
    assert_eq!(h.store.status(uid(5)), Some(TxnStatus::Committed));
    let err = h
        .registry
        .update_remote_transaction_state(uid(5), TxnStatus::RolledBack, false, true)
        .unwrap_err();
    assert!(matches!(err, TxnError::NotAllowed(_)));

    // acks still unprocessed: stays registered
    h.registry.remove_remote_transaction(uid(5), true).unwrap();
    assert!(h.registry.is_remote(uid(5)));

    h.registry.mark_remote_transaction_processed(uid(5)).unwrap();
    h.registry.remove_remote_transaction(uid(5), true).unwrap();
    assert!(!h.registry.is_remote(uid(5)));
    assert!(!h.store.contains(uid(5)));

    // still answerable while the reaper remembers the commit
    assert_eq!(
        h.registry.remote_transaction_state(uid(5)).unwrap().status(),
        TxnStatus::Committed
    );
    assert!(!h
        .registry
        .update_remote_transaction_state(uid(5), TxnStatus::Committed, false, true)
        .unwrap());

    h.scheduler.run_named(REAPER_TIMER_NAME);
    assert!(h.registry.remote_transaction_state(uid(5)).is_none());
}

#[test]
fn test_remote_store_failure_rolls_back_registration() {
    let h = default_harness();
    h.store.fail_next_write();
    let state = TransactionState::new(0).with_status(TxnStatus::Prepared);
    let err = h
        .registry
        .log_remote_transaction(uid(5), RemoteRegistration::new(state.clone(), Vec::new(), peer_addr()), true)
        .unwrap_err();
    assert!(matches!(err, TxnError::Store(_)));
    assert!(!h.registry.is_remote(uid(5)));

    h.registry
        .log_remote_transaction(uid(5), RemoteRegistration::new(state, Vec::new(), peer_addr()), true)
        .unwrap();
}

#[test]
fn test_remote_new_transaction_rejects_known_id() {
    let h = default_harness();
    h.registry.add_transaction(uid(5), started(), false).unwrap();
    let state = TransactionState::new(0).with_status(TxnStatus::Prepared);
    let err = h
        .registry
        .log_remote_transaction(
            uid(5),
            RemoteRegistration::new(state, Vec::new(), peer_addr()).new_transaction(true),
            false,
        )
        .unwrap_err();
    assert!(matches!(err, TxnError::Conflict(_)));
}

#[test]
fn test_ha_replay_merges_recovery_acks() {
    let h = harness(TxnConfig::high_availability());
    let state = TransactionState::new(0).with_status(TxnStatus::Prepared);
    let batch = |m: &str| vec![TransactionAck::new(msg(m), ConsumerUid(1))];

    h.registry
        .log_remote_transaction(
            uid(5),
            RemoteRegistration::new(state.clone(), batch("a"), peer_addr()).recovery(true),
            false,
        )
        .unwrap();
    h.registry
        .log_remote_transaction(
            uid(5),
            RemoteRegistration::new(state.clone(), batch("b"), peer_addr()).recovery(true),
            false,
        )
        .unwrap();
    assert_eq!(h.registry.recovery_remote_transaction_acks(uid(5)).unwrap().len(), 2);

    let err = h
        .registry
        .log_remote_transaction(
            uid(5),
            RemoteRegistration::new(state.clone(), batch("c"), local_addr()).recovery(true),
            false,
        )
        .unwrap_err();
    assert!(err.is_fatal());

    let err = h
        .registry
        .log_remote_transaction(uid(5), RemoteRegistration::new(state, batch("d"), peer_addr()), false)
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_prepared_remote_transactions_by_pending_time() {
    let h = default_harness();
    let state = TransactionState::new(0).with_status(TxnStatus::Prepared);
    for n in [5, 6] {
        h.registry
            .log_remote_transaction(uid(n), RemoteRegistration::new(state.clone(), Vec::new(), peer_addr()), false)
            .unwrap();
    }
    h.registry.pending_started_for_remote_prepared(uid(6)).unwrap();
    h.clock.advance(Duration::from_secs(5));

    assert_eq!(h.registry.prepared_remote_transactions(None), vec![uid(5), uid(6)]);
    assert_eq!(
        h.registry.prepared_remote_transactions(Some(Duration::from_secs(5))),
        vec![uid(6)]
    );
    assert!(h
        .registry
        .prepared_remote_transactions(Some(Duration::from_secs(6)))
        .is_empty());
}

#[test]
fn test_orphan_acks_and_ack_brokers() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), false).unwrap();

    h.registry.add_orphan_ack(uid(1), msg("m0"), ConsumerUid(1), None);
    h.registry.add_orphan_ack(uid(9), msg("m0"), ConsumerUid(1), None);
    assert_eq!(h.registry.orphan_acks(uid(1)).unwrap().len(), 1);
    assert!(h.registry.remove_orphan_ack(uid(1), &msg("m0"), ConsumerUid(1), None));
    assert!(h.registry.orphan_acks(uid(1)).unwrap().is_empty());

    h.registry
        .set_ack_broker_address(uid(1), msg("m0"), peer_addr())
        .unwrap();
    assert_eq!(h.registry.ack_broker_address(uid(1), &msg("m0")), Some(peer_addr()));
    assert!(h.registry.ack_brokers(uid(1)).unwrap().contains(&peer_addr()));
    let err = h
        .registry
        .set_ack_broker_address(uid(1), msg("m0"), local_addr())
        .unwrap_err();
    assert!(matches!(err, TxnError::Gone(_)));
}

#[test]
fn test_wait_load_complete() {
    let _ = env_logger::builder().is_test(true).try_init();
    let collab = Collaborators::standalone().with_scheduler(Arc::new(ManualScheduler::new()));
    let registry = TransactionRegistry::new(
        TxnConfig::default(),
        Arc::new(StorePersistence::new(Arc::new(MemoryStore::new()))),
        collab,
    );
    assert!(!registry.wait_load_complete(Duration::from_millis(10)));

    let loader = Arc::clone(&registry);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        loader.mark_load_complete();
    });
    assert!(registry.wait_load_complete(Duration::from_secs(5)));
    handle.join().unwrap();
}

#[test]
fn test_debug_dump() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), false).unwrap();
    let dump = h.registry.debug_dump();
    assert_eq!(dump["persistence"], "store");
    assert_eq!(dump["TransactionCount"], 1);
    assert_eq!(
        h.registry.debug_state(uid(2))[uid(2).to_string()],
        serde_json::json!("UNKNOWN TID")
    );
}

#[test]
fn test_shutdown_is_idempotent() {
    let h = default_harness();
    h.registry.add_transaction(uid(1), started(), false).unwrap();
    h.registry.update_state(uid(1), TxnStatus::Committed, false).unwrap();
    h.registry.remove_transaction(uid(1), false, false).unwrap();
    assert_eq!(h.scheduler.live_count(REAPER_TIMER_NAME), 1);

    h.registry.shutdown();
    h.registry.shutdown();
    assert_eq!(h.scheduler.live_count(REAPER_TIMER_NAME), 0);
}
