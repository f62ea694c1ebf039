//! Startup recovery
//!
//! Reconciles what the persistence strategy kept across a restart with the
//! in-memory registry. Runs once, single-threaded, before the broker accepts
//! traffic:
//!
//! 1. Patch entries that could not be read back ([`LoadFailure`]).
//! 2. Decide per persisted transaction whether it is reopened, rolled back,
//!    kept for commit cleanup or discarded.
//! 3. Replay acknowledgements and logged work into reopened transactions.
//! 4. [`RecoveryLoader::finish`] removes what was scheduled for cleanup and
//!    opens the load gate for the reaper.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::persist::{LoadFailure, StoredRemoteTransaction, StoredTransaction};
use crate::registry::{RemoteRegistration, StateChange, TransactionRegistry};
use crate::txn::state::{TransactionState, TxnStatus};
use crate::txn::work::TransactionAck;
use crate::types::{TransactionUid, TxnKind};

/// A persisted entry removed straight from the store, never registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discarded {
    pub uid: TransactionUid,
    pub kind: TxnKind,
    pub status: TxnStatus,
}

/// Outcome of [`RecoveryLoader::load`]
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Reopened local and cluster transactions (PREPARED)
    pub opened: Vec<TransactionUid>,
    /// Reopened remote transactions (PREPARED)
    pub opened_remote: Vec<TransactionUid>,
    /// Committed transactions waiting for bookkeeping removal
    pub committed: Vec<TransactionUid>,
    pub committed_remote: Vec<TransactionUid>,
    /// Registered, forced to ROLLEDBACK and scheduled for removal
    pub cleared: Vec<TransactionUid>,
    pub discarded: Vec<Discarded>,
    /// Acks whose transaction is gone
    pub ack_only: Vec<TransactionUid>,
    /// Load failures that were patched
    pub failures: Vec<LoadFailure>,
}

impl RecoveryReport {
    pub fn cleared_remote(&self) -> Vec<TransactionUid> {
        self.discarded
            .iter()
            .filter(|d| d.kind == TxnKind::Remote)
            .map(|d| d.uid)
            .collect()
    }
}

pub struct RecoveryLoader {
    registry: Arc<TransactionRegistry>,
}

impl RecoveryLoader {
    pub fn new(registry: Arc<TransactionRegistry>) -> Self {
        Self { registry }
    }

    /// Load and clean up in one go
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = self.load()?;
        self.finish(&report);
        Ok(report)
    }

    /// Rebuild the registry from persistence. Nothing is removed from the
    /// store until [`finish`](Self::finish).
    pub fn load(&self) -> Result<RecoveryReport> {
        let persistence = Arc::clone(self.registry.persistence());
        log::info!("Loading transactions from {} persistence", persistence.name());

        let mut report = RecoveryReport::default();
        for failure in persistence.load_failures()? {
            self.patch(&failure);
            report.failures.push(failure);
        }

        let snapshot = persistence.load()?;
        for txn in &snapshot.transactions {
            self.load_transaction(txn, &mut report);
        }

        let opened: HashSet<TransactionUid> = report.opened.iter().copied().collect();
        let mut ack_uids: Vec<&TransactionUid> = snapshot.acks.keys().collect();
        ack_uids.sort();
        for uid in ack_uids {
            let acks = &snapshot.acks[uid];
            if self.registry.retrieve_state_for_inquiry(*uid).is_none() {
                if !snapshot.remote.iter().any(|r| r.uid == *uid) {
                    log::info!("Removing {} acks of finished transaction {}", acks.len(), uid);
                    report.ack_only.push(*uid);
                }
                continue;
            }
            self.replay_acks(*uid, acks, opened.contains(uid));
        }

        for txn in &snapshot.remote {
            self.load_remote(txn, &mut report);
        }

        log::info!(
            "Loaded transactions: {} open, {} committed, {} rolled back, {} discarded; remote: {} open, {} committed",
            report.opened.len(),
            report.committed.len(),
            report.cleared.len(),
            report.discarded.len(),
            report.opened_remote.len(),
            report.committed_remote.len()
        );
        Ok(report)
    }

    /// Remove what `load` scheduled for cleanup, then let the reaper run.
    /// Cleanup failures are logged; the next restart retries them.
    pub fn finish(&self, report: &RecoveryReport) {
        let registry = &self.registry;
        let persistence = registry.persistence();

        for d in &report.discarded {
            let removed = if d.kind == TxnKind::Remote {
                persistence.remove_remote_transaction(d.uid, d.status)
            } else {
                persistence.remove_transaction(d.uid, d.kind, d.status)
            };
            if let Err(e) = removed {
                if !e.is_not_found() {
                    log::warn!("Unable to remove {} transaction {}: {}", d.kind, d.uid, e);
                }
            }
        }
        for uid in report.cleared.iter().chain(report.committed.iter()) {
            if let Err(e) = registry.remove_transaction(*uid, false, true) {
                log::warn!("Unable to clean up transaction {}: {}", uid, e);
            }
        }
        for uid in &report.committed_remote {
            let removed = registry
                .mark_remote_transaction_processed(*uid)
                .and_then(|()| registry.remove_remote_transaction(*uid, true));
            match removed {
                Ok(()) => registry.reaper().add_remote(*uid, true),
                Err(e) => log::warn!("Unable to clean up remote transaction {}: {}", uid, e),
            }
        }
        for uid in &report.ack_only {
            if let Err(e) = persistence.remove_transaction_acks(*uid) {
                log::warn!("Unable to remove acks of transaction {}: {}", uid, e);
            }
        }

        registry.detach_onephase_prepared();
        registry.mark_load_complete();
        if let Some(local) = registry.collaborators().cluster_view.local_address() {
            registry.broker_link_up(local);
        }
        log::info!("Transaction recovery complete");
    }

    fn now(&self) -> u64 {
        self.registry.collaborators().clock.now_millis()
    }

    /// Make a corrupted entry loadable again. A transaction whose data is
    /// lost becomes a PREPARED one only an operator rolls back.
    fn patch(&self, failure: &LoadFailure) {
        let persistence = self.registry.persistence();
        log::error!("Corrupted transaction entry in store: {}", failure);
        let patched = match failure {
            LoadFailure::MissingKey { .. } | LoadFailure::AckMissingKey { .. } => return,
            LoadFailure::MissingValue { uid }
            | LoadFailure::UnknownType { uid }
            | LoadFailure::MissingState { uid } => {
                persistence.store_transaction(*uid, &TransactionState::new_recovered_prepared(self.now()))
            }
            LoadFailure::MissingBrokers { uid, state } => persistence.store_cluster_transaction(*uid, state, &[]),
            LoadFailure::MissingHome { uid, state } => persistence.store_remote_transaction(*uid, state, &[], None),
            LoadFailure::AckMissingValue { uid } => persistence.remove_transaction_acks(*uid),
        };
        if let Err(e) = patched {
            log::error!("Unable to patch corrupted entry ({}): {}", failure, e);
        }
    }

    fn register(&self, txn: &StoredTransaction, state: TransactionState) -> Result<()> {
        match txn.kind {
            TxnKind::Cluster => {
                let brokers = txn.brokers.clone().unwrap_or_default();
                self.registry
                    .log_cluster_transaction(txn.uid, state, brokers, false, false)
            }
            _ => self.registry.add_transaction(txn.uid, state, false).map(|_| ()),
        }
    }

    fn load_transaction(&self, txn: &StoredTransaction, report: &mut RecoveryReport) {
        let uid = txn.uid;
        let status = txn.state.status();
        if txn.kind == TxnKind::Remote {
            log::error!("Remote transaction {} stored as a local transaction, skipping", uid);
            return;
        }
        let auto_rollback = self.registry.config().auto_rollback;

        let outcome = match status {
            TxnStatus::Created => {
                log::info!("Discarding {} transaction {} that never started", txn.kind, uid);
                report.discarded.push(Discarded {
                    uid,
                    kind: txn.kind,
                    status,
                });
                return;
            }
            TxnStatus::Prepared if !auto_rollback => self.register(txn, txn.state.clone()).map(|()| {
                log::info!("Transaction {} {} is prepared, leaving it open", uid, txn.state);
                if txn.state.is_one_phase() {
                    self.registry.add_detached(uid);
                }
                self.replay_work(txn);
                report.opened.push(uid);
            }),
            TxnStatus::Prepared
            | TxnStatus::Started
            | TxnStatus::Complete
            | TxnStatus::Incomplete
            | TxnStatus::Failed
            | TxnStatus::RolledBack => self.register(txn, txn.state.clone()).and_then(|()| {
                log::info!("Rolling back transaction {} found in state {}", uid, status);
                self.registry.update_state(uid, TxnStatus::RolledBack, true)?;
                report.cleared.push(uid);
                Ok(())
            }),
            TxnStatus::Committed => self.register(txn, txn.state.clone()).map(|()| {
                log::info!("Transaction {} committed, scheduling cleanup", uid);
                report.committed.push(uid);
            }),
            TxnStatus::TimedOut => {
                log::error!(
                    "Transaction {} has unexpected state {} in store, setting it to {}",
                    uid,
                    status,
                    TxnStatus::Prepared
                );
                let state = txn.state.clone().with_status(TxnStatus::Prepared);
                self.register(txn, state).and_then(|()| {
                    self.registry.change_state(uid, StateChange::to(TxnStatus::Prepared).persist(true))?;
                    self.replay_work(txn);
                    report.opened.push(uid);
                    Ok(())
                })
            }
        };
        if let Err(e) = outcome {
            log::error!("Unable to load transaction {} in state {}: {}", uid, status, e);
        }
    }

    /// Feed logged work back into a reopened transaction
    fn replay_work(&self, txn: &StoredTransaction) {
        let Some(work) = &txn.work else {
            return;
        };
        for sent in work.sent_messages() {
            if let Err(e) = self.registry.add_message(txn.uid, sent.message.clone(), true) {
                log::warn!("Unable to replay message {} of transaction {}: {}", sent.message, txn.uid, e);
            }
        }
        for wack in work.acks() {
            let ack = &wack.ack;
            if let Err(e) = self.registry.add_acknowledgement(
                txn.uid,
                ack.message.clone(),
                ack.consumer,
                ack.stored_consumer_or_consumer(),
                true,
                false,
            ) {
                log::warn!("Unable to replay ack of {} in transaction {}: {}", ack.message, txn.uid, e);
            }
        }
    }

    /// Every stored ack is tracked as orphaned until its transaction resolves;
    /// acks of a reopened transaction are consumed by it again so a rollback
    /// redelivers them.
    fn replay_acks(&self, uid: TransactionUid, acks: &[TransactionAck], open: bool) {
        for ack in acks {
            let consumed = self
                .registry
                .consumed_messages(uid)
                .map_or(false, |c| c.iter().any(|(m, cs)| *m == ack.message && cs.contains(&ack.consumer)));
            if open && !consumed {
                if let Err(e) = self.registry.add_acknowledgement(
                    uid,
                    ack.message.clone(),
                    ack.consumer,
                    ack.stored_consumer_or_consumer(),
                    true,
                    false,
                ) {
                    log::warn!("Unable to replay ack of {} in transaction {}: {}", ack.message, uid, e);
                }
            }
            self.registry
                .add_orphan_ack(uid, ack.message.clone(), ack.consumer, ack.stored_consumer);
        }
    }

    fn load_remote(&self, txn: &StoredRemoteTransaction, report: &mut RecoveryReport) {
        let uid = txn.uid;
        let status = txn.state.status();
        let discard = |report: &mut RecoveryReport| {
            report.discarded.push(Discarded {
                uid,
                kind: TxnKind::Remote,
                status,
            });
        };
        let Some(home) = txn.home.clone() else {
            log::error!("Remote transaction {} has no home broker, discarding it", uid);
            discard(report);
            return;
        };
        let ha = self.registry.config().ha_enabled;
        let register = |state: TransactionState| {
            let reg = RemoteRegistration::new(state, txn.acks.clone(), home.clone())
                .recovery(true)
                .new_transaction(true);
            self.registry.log_remote_transaction(uid, reg, false)
        };

        let outcome = match status {
            TxnStatus::Created => {
                discard(report);
                Ok(())
            }
            TxnStatus::Prepared => register(txn.state.clone()).map(|()| {
                log::info!("Remote transaction {} is prepared, home {}", uid, home);
                report.opened_remote.push(uid);
            }),
            TxnStatus::Complete if ha && !txn.acks.is_empty() => {
                // the home broker may still commit after a takeover
                register(txn.state.clone().with_status(TxnStatus::Prepared)).map(|()| {
                    report.opened_remote.push(uid);
                })
            }
            TxnStatus::Started
            | TxnStatus::Complete
            | TxnStatus::Incomplete
            | TxnStatus::Failed
            | TxnStatus::RolledBack => {
                log::info!("Discarding remote transaction {} in state {}", uid, status);
                discard(report);
                Ok(())
            }
            TxnStatus::Committed => register(txn.state.clone()).map(|()| {
                report.committed_remote.push(uid);
            }),
            TxnStatus::TimedOut => {
                log::error!(
                    "Remote transaction {} has unexpected state {} in store, setting it to {}",
                    uid,
                    status,
                    TxnStatus::Prepared
                );
                register(txn.state.clone().with_status(TxnStatus::Prepared)).map(|()| {
                    report.opened_remote.push(uid);
                })
            }
        };
        if let Err(e) = outcome {
            log::error!("Unable to load remote transaction {} in state {}: {}", uid, status, e);
        }
    }
}
