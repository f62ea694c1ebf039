//! Timeout of transactions whose connection went away
//!
//! A transaction that was left COMPLETE, INCOMPLETE or one-phase PREPARED
//! when its client disconnected is "detached". The watchdog tracks detached
//! ids and rolls each one back once it has been detached for longer than
//! its timeout. The timer only exists while something is tracked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::collaborators::Collaborators;
use crate::config::TxnConfig;
use crate::error::Result;
use crate::timer::{Scheduler, TaskFn, TimerHandle};
use crate::txn::state::{TransactionState, TxnStatus};
use crate::types::TransactionUid;

pub const WATCHDOG_TIMER_NAME: &str = "DetachedTransactionReaper";

/// What the watchdog needs from the registry
pub trait DetachedTarget: Send + Sync {
    /// State of a live transaction, `None` once it is processed or taken over
    fn retrieve_state(&self, uid: TransactionUid) -> Option<TransactionState>;

    /// State regardless of processing, `None` only when the id is unknown
    fn retrieve_state_for_inquiry(&self, uid: TransactionUid) -> Option<TransactionState>;

    fn rollback_timed_out(&self, uid: TransactionUid, state: &TransactionState) -> Result<()>;
}

struct Tracked {
    ids: Vec<TransactionUid>,
    timer: Option<TimerHandle>,
}

pub struct DetachedWatchdog {
    config: Arc<TxnConfig>,
    target: Weak<dyn DetachedTarget>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    tracked: Mutex<Tracked>,
    destroyed: AtomicBool,
    self_ref: Weak<DetachedWatchdog>,
}

impl DetachedWatchdog {
    pub fn new(config: Arc<TxnConfig>, target: Weak<dyn DetachedTarget>, collab: &Collaborators) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            target,
            clock: Arc::clone(&collab.clock),
            scheduler: Arc::clone(&collab.scheduler),
            tracked: Mutex::new(Tracked {
                ids: Vec::new(),
                timer: None,
            }),
            destroyed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.detached_watchdog_enabled()
    }

    /// Start tracking `uid`. Does nothing when the watchdog is disabled.
    pub fn add(&self, uid: TransactionUid) {
        log::debug!("Tracking detached transaction {}", uid);
        if !self.is_enabled() || self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let mut tracked = self.tracked.lock();
        if !tracked.ids.contains(&uid) {
            tracked.ids.push(uid);
        }
        if tracked.timer.is_none() {
            tracked.timer = self.schedule();
        }
    }

    pub fn remove(&self, uid: TransactionUid) {
        let mut tracked = self.tracked.lock();
        let before = tracked.ids.len();
        tracked.ids.retain(|id| *id != uid);
        if tracked.ids.len() != before && tracked.ids.is_empty() {
            if let Some(timer) = tracked.timer.take() {
                timer.cancel();
            }
        }
    }

    pub fn detached_ids(&self) -> Vec<TransactionUid> {
        self.tracked.lock().ids.clone()
    }

    pub fn is_tracked(&self, uid: TransactionUid) -> bool {
        self.tracked.lock().ids.contains(&uid)
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        let mut tracked = self.tracked.lock();
        if let Some(timer) = tracked.timer.take() {
            timer.cancel();
        }
        tracked.ids.clear();
    }

    fn schedule(&self) -> Option<TimerHandle> {
        let watchdog = self.self_ref.clone();
        let task: TaskFn = Arc::new(move || {
            if let Some(watchdog) = watchdog.upgrade() {
                watchdog.scan();
            }
        });
        let interval = self.config.detached_timeout;
        log::info!(
            "Scheduling detached transaction reaper every {}s",
            interval.as_secs()
        );
        match self
            .scheduler
            .schedule_periodic(WATCHDOG_TIMER_NAME, interval, interval, task)
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to schedule detached transaction reaper: {}", e);
                None
            }
        }
    }

    /// How long a detached transaction in this state may stay detached, in milliseconds
    pub fn effective_timeout(&self, state: &TransactionState) -> u64 {
        let timeout = self.config.detached_timeout.as_millis() as u64;
        if state.status() == TxnStatus::Prepared && state.is_one_phase() {
            let reconnect = self.config.max_reconnect_interval.as_millis() as u64;
            u64::from(self.config.reconnect_multiplier).saturating_mul(timeout.saturating_add(reconnect))
        } else {
            timeout
        }
    }

    /// One pass over the tracked ids
    pub fn scan(&self) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        let now = self.clock.now_millis();
        for uid in self.detached_ids() {
            if self.destroyed.load(Ordering::Acquire) {
                break;
            }
            let Some(state) = target.retrieve_state(uid) else {
                if target.retrieve_state_for_inquiry(uid).is_none() {
                    self.remove(uid);
                }
                continue;
            };
            let qualifies = match state.status() {
                TxnStatus::Prepared => state.is_one_phase(),
                TxnStatus::Incomplete | TxnStatus::Complete => true,
                _ => false,
            };
            if !qualifies {
                if !self.config.detached_retain_all {
                    self.remove(uid);
                }
                continue;
            }
            if !state.is_detached() {
                continue;
            }

            let deadline = state.detached_time().saturating_add(self.effective_timeout(&state));
            if now < deadline {
                continue;
            }
            log::warn!(
                "Rolling back timed out detached transaction {}[{}]{} created {} detached {}",
                uid,
                state.status(),
                if state.is_one_phase() { " onephase=true" } else { "" },
                state.creation_time(),
                state.detached_time()
            );
            if let Err(e) = target.rollback_timed_out(uid, &state) {
                log::warn!("Failed to roll back timed out detached transaction {}: {}", uid, e);
            }
            self.remove(uid);
        }
    }

    pub fn debug_state(&self) -> serde_json::Value {
        let ids = self.detached_ids();
        let target = self.target.upgrade();
        let states: serde_json::Map<String, serde_json::Value> = ids
            .iter()
            .map(|uid| {
                let state = target
                    .as_ref()
                    .and_then(|t| t.retrieve_state_for_inquiry(*uid))
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "null".to_string());
                (uid.to_string(), serde_json::Value::String(state))
            })
            .collect();
        serde_json::json!({
            "detachedTimeout(s)": self.config.detached_timeout.as_secs(),
            "reconnectionMultiplier": self.config.reconnect_multiplier,
            "maxConnectionReconnectInterval(ms)": self.config.max_reconnect_interval.as_millis() as u64,
            "DetachedTransactionCount": ids.len(),
            "transactions": states,
        })
    }
}
