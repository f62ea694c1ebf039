//! Cluster participants of a transaction and their completion state
//!
//! Under high availability a broker's logical identity (its store session) can
//! move to a different physical address after failover. Addresses are therefore
//! resolved through the current [`ClusterView`] every time two participants are
//! compared; nothing caches the resolved address.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TxnError};

/// Network identity of a broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    /// Instance name in HA mode
    pub broker_id: Option<String>,
    /// Session of the store that owns this broker's data
    pub store_session: Option<u64>,
    /// Runtime session of the broker process
    pub broker_session: Option<u64>,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            broker_id: None,
            store_session: None,
            broker_session: None,
        }
    }

    pub fn with_broker_id(mut self, id: impl Into<String>) -> Self {
        self.broker_id = Some(id.into());
        self
    }

    pub fn with_store_session(mut self, session: u64) -> Self {
        self.store_session = Some(session);
        self
    }

    pub fn with_broker_session(mut self, session: u64) -> Self {
        self.broker_session = Some(session);
        self
    }
}

// Sessions are not part of the address identity.
impl PartialEq for BrokerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.broker_id == other.broker_id
    }
}

impl Eq for BrokerAddress {}

impl Hash for BrokerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.broker_id.hash(state);
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mq://{}:{}/", self.host, self.port)?;
        if let Some(id) = &self.broker_id {
            write!(f, "?instName={}", id)?;
        }
        if let Some(ss) = self.store_session {
            write!(f, "[ss={}]", ss)?;
        }
        Ok(())
    }
}

/// Read-only view of cluster membership
pub trait ClusterView: Send + Sync {
    fn ha_enabled(&self) -> bool;

    /// This broker's own address, if it is part of a cluster
    fn local_address(&self) -> Option<BrokerAddress>;

    /// Address of the broker currently owning a store session
    fn store_session_owner(&self, store_session: u64) -> Option<BrokerAddress>;
}

/// Membership view of a broker that is not clustered
#[derive(Debug, Default, Clone)]
pub struct StandaloneView {
    local: Option<BrokerAddress>,
}

impl StandaloneView {
    pub fn new(local: Option<BrokerAddress>) -> Self {
        Self { local }
    }
}

impl ClusterView for StandaloneView {
    fn ha_enabled(&self) -> bool {
        false
    }

    fn local_address(&self) -> Option<BrokerAddress> {
        self.local.clone()
    }

    fn store_session_owner(&self, _store_session: u64) -> Option<BrokerAddress> {
        None
    }
}

/// Resolve where a broker identity currently lives.
///
/// Without HA the static address is the current address. With HA the owner of
/// the identity's store session is looked up; an identity without a store
/// session, or whose session has no current owner, is unreachable.
pub fn resolve_current_address(identity: &BrokerAddress, view: &dyn ClusterView) -> Option<BrokerAddress> {
    if !view.ha_enabled() {
        return Some(identity.clone());
    }
    let session = identity.store_session?;
    view.store_session_owner(session).map(|mut owner| {
        owner.store_session = Some(session);
        owner
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantState {
    Pending,
    Complete,
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantState::Pending => write!(f, "PENDING"),
            ParticipantState::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// One participant broker of a cluster transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionBroker {
    address: BrokerAddress,
    state: ParticipantState,
}

impl TransactionBroker {
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            state: ParticipantState::Pending,
        }
    }

    pub fn completed(address: BrokerAddress) -> Self {
        Self {
            address,
            state: ParticipantState::Complete,
        }
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == ParticipantState::Complete
    }

    pub fn current_address(&self, view: &dyn ClusterView) -> Option<BrokerAddress> {
        resolve_current_address(&self.address, view)
    }

    /// True if `addr` names this participant, directly or through its
    /// current HA location with a matching store session.
    pub fn matches(&self, addr: &BrokerAddress, view: &dyn ClusterView) -> bool {
        if self.address == *addr {
            return true;
        }
        if !view.ha_enabled() || self.address.store_session != addr.store_session {
            return false;
        }
        match (
            resolve_current_address(&self.address, view),
            resolve_current_address(addr, view),
        ) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        }
    }

    /// Take the state carried by `from`. Returns whether anything changed.
    ///
    /// A COMPLETE participant never goes back to PENDING.
    pub fn copy_state(&mut self, from: &TransactionBroker) -> Result<bool> {
        if self.state == ParticipantState::Complete && from.state == ParticipantState::Pending {
            return Err(TxnError::internal(format!(
                "Participant {} can not go from {} back to {}",
                self.address, self.state, from.state
            )));
        }
        if self.state == from.state {
            return Ok(false);
        }
        self.state = from.state;
        Ok(true)
    }
}

impl fmt::Display for TransactionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.state)
    }
}

/// The fixed participant list of a cluster transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSet {
    brokers: Box<[TransactionBroker]>,
}

impl ParticipantSet {
    pub fn new(brokers: Vec<TransactionBroker>) -> Self {
        Self {
            brokers: brokers.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    /// True only when every participant is COMPLETE
    pub fn is_completed(&self) -> bool {
        self.brokers.iter().all(TransactionBroker::is_completed)
    }

    pub fn incomplete_count(&self) -> usize {
        self.brokers.iter().filter(|b| !b.is_completed()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransactionBroker> {
        self.brokers.iter()
    }

    pub fn find(&self, addr: &BrokerAddress, view: &dyn ClusterView) -> Option<&TransactionBroker> {
        self.brokers.iter().find(|b| b.matches(addr, view))
    }

    pub fn find_mut(&mut self, addr: &BrokerAddress, view: &dyn ClusterView) -> Option<&mut TransactionBroker> {
        self.brokers.iter_mut().find(|b| b.matches(addr, view))
    }

    pub fn to_vec(&self) -> Vec<TransactionBroker> {
        self.brokers.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct HaView {
        owners: HashMap<u64, BrokerAddress>,
    }

    impl ClusterView for HaView {
        fn ha_enabled(&self) -> bool {
            true
        }

        fn local_address(&self) -> Option<BrokerAddress> {
            None
        }

        fn store_session_owner(&self, store_session: u64) -> Option<BrokerAddress> {
            self.owners.get(&store_session).cloned()
        }
    }

    fn addr(host: &str) -> BrokerAddress {
        BrokerAddress::new(host, 7676)
    }

    #[test]
    fn test_is_completed_only_when_all_complete() {
        let view = StandaloneView::default();
        let mut set = ParticipantSet::new(vec![
            TransactionBroker::new(addr("a")),
            TransactionBroker::new(addr("b")),
        ]);
        assert!(!set.is_completed());
        assert_eq!(set.incomplete_count(), 2);

        let b = set.find_mut(&addr("a"), &view).unwrap();
        assert!(b.copy_state(&TransactionBroker::completed(addr("a"))).unwrap());
        assert!(!set.is_completed());

        let b = set.find_mut(&addr("b"), &view).unwrap();
        b.copy_state(&TransactionBroker::completed(addr("b"))).unwrap();
        assert!(set.is_completed());
    }

    #[test]
    fn test_copy_state_refuses_regression() {
        let mut b = TransactionBroker::completed(addr("a"));
        let err = b.copy_state(&TransactionBroker::new(addr("a"))).unwrap_err();
        assert!(err.is_fatal());
        assert!(b.is_completed());
    }

    #[test]
    fn test_copy_state_same_state_is_unchanged() {
        let mut b = TransactionBroker::completed(addr("a"));
        assert!(!b.copy_state(&TransactionBroker::completed(addr("a"))).unwrap());
    }

    #[test]
    fn test_static_match_without_ha() {
        let view = StandaloneView::default();
        let b = TransactionBroker::new(addr("a").with_store_session(1));
        assert!(b.matches(&addr("a"), &view));
        assert!(!b.matches(&addr("b").with_store_session(1), &view));
    }

    #[test]
    fn test_ha_match_follows_session_owner() {
        let mut owners = HashMap::new();
        owners.insert(11, addr("new-host"));
        let view = HaView { owners };

        let original = TransactionBroker::new(addr("old-host").with_store_session(11));
        let moved = addr("new-host").with_store_session(11);
        assert!(original.matches(&moved, &view));

        // Same physical broker but a different store session is someone else
        let other_session = addr("new-host").with_store_session(12);
        assert!(!original.matches(&other_session, &view));
    }

    #[test]
    fn test_resolve_current_address() {
        let view = HaView { owners: HashMap::new() };
        assert!(resolve_current_address(&addr("a"), &view).is_none());
        assert!(resolve_current_address(&addr("a").with_store_session(3), &view).is_none());

        let standalone = StandaloneView::default();
        assert_eq!(resolve_current_address(&addr("a"), &standalone), Some(addr("a")));
    }
}
