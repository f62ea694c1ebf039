//! Interfaces to the parts of the broker outside the transaction core
//!
//! The registry only sees these narrow traits: the cluster membership view,
//! the cluster transport (used by the reaper to notify participants), the
//! message delivery layer, the protocol layer's rollback path and the
//! broker's restart hook. [`Collaborators::standalone`] wires harmless
//! defaults for a broker that is not clustered.

use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::timer::{Scheduler, ThreadScheduler};
use crate::txn::broker::{BrokerAddress, ClusterView, StandaloneView};
use crate::txn::state::TransactionState;
use crate::types::{ConsumerUid, DestinationId, MessageId, TransactionUid};

/// Process exit code that asks the broker supervisor for a restart
pub const RESTART_EXIT_CODE: i32 = 255;

/// Cluster transport, used to tell a participant a transaction committed
pub trait ClusterBroadcast: Send + Sync {
    fn send_cluster_transaction_info(&self, uid: TransactionUid, to: &BrokerAddress) -> Result<()>;
}

/// Broadcast for a broker without cluster peers
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClusterBroadcast;

impl ClusterBroadcast for NoClusterBroadcast {
    fn send_cluster_transaction_info(&self, uid: TransactionUid, to: &BrokerAddress) -> Result<()> {
        log::debug!("No cluster transport: not notifying {} of transaction {}", to, uid);
        Ok(())
    }
}

/// What the delivery layer knows about a message
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub destination: DestinationId,
    pub payload: Vec<u8>,
    pub persistent: bool,
    /// Already written to the store
    pub stored: bool,
    /// Owned by this broker (not a remote broker's message)
    pub local: bool,
    pub stored_interests: Vec<ConsumerUid>,
}

/// Message delivery layer
pub trait MessageResolver: Send + Sync {
    /// Look up the in-memory reference of a message
    fn resolve(&self, msg: &MessageId) -> Option<MessageInfo>;

    /// The log entry carrying this message is durable
    fn mark_stored(&self, msg: &MessageId);
}

/// Resolver for tests and brokers without a delivery layer attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMessages;

impl MessageResolver for NoMessages {
    fn resolve(&self, _msg: &MessageId) -> Option<MessageInfo> {
        None
    }

    fn mark_stored(&self, _msg: &MessageId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// Detached transaction exceeded its timeout
    Timeout,
    /// Requested by an administrator
    Admin,
    /// Decided during startup recovery
    Recovery,
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackReason::Timeout => write!(f, "TIMEOUT"),
            RollbackReason::Admin => write!(f, "ADMIN"),
            RollbackReason::Recovery => write!(f, "RECOVERY"),
        }
    }
}

/// Protocol layer rollback, which redelivers the transaction's messages
pub trait RollbackHandler: Send + Sync {
    fn rollback(&self, uid: TransactionUid, state: &TransactionState, reason: RollbackReason) -> Result<()>;
}

/// Escalation for broken invariants
pub trait FatalErrorHandler: Send + Sync {
    fn restart(&self, reason: &str);
}

/// Logs the reason and exits with [`RESTART_EXIT_CODE`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitOnFatal;

impl FatalErrorHandler for ExitOnFatal {
    fn restart(&self, reason: &str) {
        log::error!("Fatal transaction error, broker restart required: {}", reason);
        std::process::exit(RESTART_EXIT_CODE);
    }
}

/// Everything the registry needs from the rest of the broker
#[derive(Clone)]
pub struct Collaborators {
    pub cluster_view: Arc<dyn ClusterView>,
    pub broadcast: Arc<dyn ClusterBroadcast>,
    pub messages: Arc<dyn MessageResolver>,
    /// When unset, timed-out transactions are rolled back in the registry only
    pub rollback: Option<Arc<dyn RollbackHandler>>,
    pub fatal: Arc<dyn FatalErrorHandler>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
}

impl Collaborators {
    pub fn standalone() -> Self {
        Self {
            cluster_view: Arc::new(StandaloneView::default()),
            broadcast: Arc::new(NoClusterBroadcast),
            messages: Arc::new(NoMessages),
            rollback: None,
            fatal: Arc::new(ExitOnFatal),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(ThreadScheduler),
        }
    }

    pub fn with_cluster(mut self, view: Arc<dyn ClusterView>, broadcast: Arc<dyn ClusterBroadcast>) -> Self {
        self.cluster_view = view;
        self.broadcast = broadcast;
        self
    }

    pub fn with_messages(mut self, messages: Arc<dyn MessageResolver>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_rollback_handler(mut self, handler: Arc<dyn RollbackHandler>) -> Self {
        self.rollback = Some(handler);
        self
    }

    pub fn with_fatal_handler(mut self, handler: Arc<dyn FatalErrorHandler>) -> Self {
        self.fatal = handler;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::standalone()
    }
}
