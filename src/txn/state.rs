//! Transaction state machine
//!
//! ## Legal transitions
//!
//! | Operation                | From                                   | To         |
//! |--------------------------|----------------------------------------|------------|
//! | start                    | CREATED, COMPLETE, STARTED             | STARTED    |
//! | start(join)              | STARTED, COMPLETE                      | STARTED    |
//! | start(resume)            | INCOMPLETE, STARTED                    | STARTED    |
//! | end(suspend)             | STARTED, INCOMPLETE                    | INCOMPLETE |
//! | end(fail)                | STARTED, INCOMPLETE, FAILED            | FAILED     |
//! | end(success / onephase)  | STARTED, INCOMPLETE, COMPLETE          | COMPLETE   |
//! | prepare                  | COMPLETE, PREPARED                     | PREPARED   |
//! | commit(onephase)         | COMPLETE, COMMITTED                    | COMMITTED  |
//! | commit                   | PREPARED, COMMITTED                    | COMMITTED  |
//! | rollback                 | COMPLETE, INCOMPLETE, PREPARED, FAILED, ROLLEDBACK | ROLLEDBACK |
//!
//! Remote transactions only move PREPARED -> COMMITTED and PREPARED -> ROLLEDBACK
//! (each idempotent to itself).

use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TxnError};
use crate::types::{AutoRollback, TransactionUid, Xid};

/// Transaction status. Persisted as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum TxnStatus {
    Created = 0,
    Started = 1,
    Failed = 2,
    Incomplete = 3,
    Complete = 4,
    Prepared = 5,
    Committed = 6,
    RolledBack = 7,
    TimedOut = 8,
}

impl TxnStatus {
    pub const ALL: [TxnStatus; 9] = [
        TxnStatus::Created,
        TxnStatus::Started,
        TxnStatus::Failed,
        TxnStatus::Incomplete,
        TxnStatus::Complete,
        TxnStatus::Prepared,
        TxnStatus::Committed,
        TxnStatus::RolledBack,
        TxnStatus::TimedOut,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            TxnStatus::Created => "CREATED",
            TxnStatus::Started => "STARTED",
            TxnStatus::Failed => "FAILED",
            TxnStatus::Incomplete => "INCOMPLETE",
            TxnStatus::Complete => "COMPLETE",
            TxnStatus::Prepared => "PREPARED",
            TxnStatus::Committed => "COMMITTED",
            TxnStatus::RolledBack => "ROLLEDBACK",
            TxnStatus::TimedOut => "TIMED_OUT",
        }
    }

    /// Render a raw status code, including codes outside the known range
    pub fn describe(code: i32) -> String {
        match TxnStatus::try_from(code) {
            Ok(s) => s.to_string(),
            Err(_) => format!("UNKNOWN({})", code),
        }
    }
}

impl TryFrom<i32> for TxnStatus {
    type Error = String;

    fn try_from(code: i32) -> std::result::Result<Self, Self::Error> {
        usize::try_from(code)
            .ok()
            .and_then(|i| TxnStatus::ALL.get(i).copied())
            .ok_or_else(|| format!("invalid transaction state code {}", code))
    }
}

impl From<TxnStatus> for i32 {
    fn from(s: TxnStatus) -> i32 {
        s.code()
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Flag carried by a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    NoFlags,
    Join,
    Resume,
}

/// Flag carried by an end request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    Suspend,
    Fail,
    Success,
    OnePhase,
}

/// A client operation that advances a local transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOperation {
    Start(StartFlag),
    End(EndFlag),
    Prepare,
    Commit { one_phase: bool },
    Rollback,
}

impl TxnOperation {
    /// States the operation may be applied in, and the state it leads to
    fn rule(self) -> (&'static [TxnStatus], TxnStatus) {
        use TxnStatus::*;
        match self {
            TxnOperation::Start(StartFlag::NoFlags) => (&[Created, Complete, Started], Started),
            TxnOperation::Start(StartFlag::Join) => (&[Started, Complete], Started),
            TxnOperation::Start(StartFlag::Resume) => (&[Incomplete, Started], Started),
            TxnOperation::End(EndFlag::Suspend) => (&[Started, Incomplete], Incomplete),
            TxnOperation::End(EndFlag::Fail) => (&[Started, Incomplete, Failed], Failed),
            TxnOperation::End(EndFlag::Success) | TxnOperation::End(EndFlag::OnePhase) => {
                (&[Started, Incomplete, Complete], Complete)
            }
            TxnOperation::Prepare => (&[Complete, Prepared], Prepared),
            TxnOperation::Commit { one_phase: true } => (&[Complete, Committed], Committed),
            TxnOperation::Commit { one_phase: false } => (&[Prepared, Committed], Committed),
            TxnOperation::Rollback => (
                &[Complete, Incomplete, Prepared, Failed, RolledBack],
                RolledBack,
            ),
        }
    }

    pub fn target(self) -> TxnStatus {
        self.rule().1
    }
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnOperation::Start(StartFlag::NoFlags) => write!(f, "start"),
            TxnOperation::Start(StartFlag::Join) => write!(f, "start(join)"),
            TxnOperation::Start(StartFlag::Resume) => write!(f, "start(resume)"),
            TxnOperation::End(EndFlag::Suspend) => write!(f, "end(suspend)"),
            TxnOperation::End(EndFlag::Fail) => write!(f, "end(fail)"),
            TxnOperation::End(EndFlag::Success) => write!(f, "end(success)"),
            TxnOperation::End(EndFlag::OnePhase) => write!(f, "end(onephase)"),
            TxnOperation::Prepare => write!(f, "prepare"),
            TxnOperation::Commit { one_phase: true } => write!(f, "commit(onephase)"),
            TxnOperation::Commit { one_phase: false } => write!(f, "commit"),
            TxnOperation::Rollback => write!(f, "rollback"),
        }
    }
}

/// Next state for a remote (home elsewhere) transaction
pub fn remote_next_state(uid: TransactionUid, current: TxnStatus, target: TxnStatus) -> Result<TxnStatus> {
    match (target, current) {
        (TxnStatus::Committed, TxnStatus::Prepared | TxnStatus::Committed)
        | (TxnStatus::RolledBack, TxnStatus::Prepared | TxnStatus::RolledBack) => Ok(target),
        _ => Err(TxnError::bad_remote_transition(uid, current, target)),
    }
}

/// Mutable state and metadata of one transaction.
///
/// Detach bookkeeping and the fail-from/fail-to pair are transient and never
/// serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionState {
    state: TxnStatus,
    xid: Option<Xid>,
    auto_rollback: AutoRollback,
    /// Milliseconds since the epoch
    creation_time: u64,
    /// Milliseconds; 0 means the transaction never expires
    lifetime: u64,
    last_access_time: u64,
    one_phase: bool,
    session_less: bool,
    creator: Option<String>,
    user: Option<String>,
    client_id: Option<String>,
    connection_string: Option<String>,
    connection_uid: Option<u64>,
    #[serde(skip)]
    detached: bool,
    #[serde(skip)]
    detached_time: u64,
    #[serde(skip)]
    fail_from: Option<TxnStatus>,
    #[serde(skip)]
    fail_to: Option<TxnStatus>,
}

impl TransactionState {
    pub fn new(creation_time: u64) -> Self {
        Self {
            state: TxnStatus::Created,
            xid: None,
            auto_rollback: AutoRollback::default(),
            creation_time,
            lifetime: 0,
            last_access_time: creation_time,
            one_phase: false,
            session_less: false,
            creator: None,
            user: None,
            client_id: None,
            connection_string: None,
            connection_uid: None,
            detached: false,
            detached_time: 0,
            fail_from: None,
            fail_to: None,
        }
    }

    /// Safe fallback for a persisted record that could not be read back:
    /// PREPARED, rolled back only by an operator, never expiring.
    pub fn new_recovered_prepared(now: u64) -> Self {
        Self::new(now)
            .with_status(TxnStatus::Prepared)
            .with_auto_rollback(AutoRollback::NotPrepared)
            .with_session_less(true)
    }

    pub fn with_xid(mut self, xid: Xid) -> Self {
        self.xid = Some(xid);
        self
    }

    pub fn with_status(mut self, state: TxnStatus) -> Self {
        self.state = state;
        self
    }

    pub fn with_auto_rollback(mut self, policy: AutoRollback) -> Self {
        self.auto_rollback = policy;
        self
    }

    pub fn with_lifetime(mut self, lifetime_ms: u64) -> Self {
        self.lifetime = lifetime_ms;
        self
    }

    pub fn with_session_less(mut self, session_less: bool) -> Self {
        self.session_less = session_less;
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_connection(mut self, connection_uid: u64, connection_string: impl Into<String>) -> Self {
        self.connection_uid = Some(connection_uid);
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn status(&self) -> TxnStatus {
        self.state
    }

    /// Set the status directly. Entering FAILED records where the transaction
    /// failed from and, if given, where it was heading.
    pub fn set_status(&mut self, state: TxnStatus, fail_to: Option<TxnStatus>) {
        if state == TxnStatus::Failed && self.state != TxnStatus::Failed {
            self.fail_from = Some(self.state);
            self.fail_to = fail_to;
        }
        self.state = state;
    }

    /// Compute the state `op` would move this transaction to
    pub fn next_state(&self, op: TxnOperation) -> Result<TxnStatus> {
        let (from, to) = op.rule();
        if from.contains(&self.state) {
            return Ok(to);
        }

        let xid = self.xid.as_ref().map(|x| x.to_string());
        if self.state == TxnStatus::Failed {
            if self.fail_to.is_none()
                && self.fail_from == Some(TxnStatus::Started)
                && matches!(op, TxnOperation::End(_))
            {
                return Err(TxnError::NotModified(format!(
                    "Transaction {} already ended with failure",
                    xid.as_deref().unwrap_or("-")
                )));
            }
            return Err(TxnError::bad_transition(
                op,
                self.state,
                self.fail_from,
                self.fail_to,
                xid.as_deref(),
            ));
        }
        Err(TxnError::bad_transition(op, self.state, None, None, xid.as_deref()))
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    /// True iff an external id is present and is not the null sentinel
    pub fn is_xa(&self) -> bool {
        self.xid.as_ref().map_or(false, |x| !x.is_null())
    }

    pub fn auto_rollback(&self) -> AutoRollback {
        self.auto_rollback
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn lifetime(&self) -> u64 {
        self.lifetime
    }

    pub fn expire_time(&self) -> u64 {
        self.creation_time.saturating_add(self.lifetime)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.lifetime > 0 && now > self.expire_time()
    }

    pub fn last_access_time(&self) -> u64 {
        self.last_access_time
    }

    pub fn touch(&mut self, now: u64) {
        self.last_access_time = now;
    }

    pub fn is_one_phase(&self) -> bool {
        self.one_phase
    }

    pub fn set_one_phase(&mut self, one_phase: bool) {
        self.one_phase = one_phase;
    }

    pub fn is_session_less(&self) -> bool {
        self.session_less
    }

    pub fn creator(&self) -> Option<&str> {
        self.creator.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn connection_string(&self) -> Option<&str> {
        self.connection_string.as_deref()
    }

    pub fn connection_uid(&self) -> Option<u64> {
        self.connection_uid
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn detached_time(&self) -> u64 {
        self.detached_time
    }

    /// Owning connection went away
    pub fn detach(&mut self, now: u64) {
        self.detached = true;
        self.detached_time = now;
        self.connection_uid = None;
    }

    pub fn attach(&mut self, connection_uid: u64) {
        self.detached = false;
        self.detached_time = 0;
        self.connection_uid = Some(connection_uid);
    }

    pub fn fail_from(&self) -> Option<TxnStatus> {
        self.fail_from
    }

    pub fn fail_to(&self) -> Option<TxnStatus> {
        self.fail_to
    }

    /// Human-readable snapshot for administrative dumps
    pub fn debug_state(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state.to_string(),
            "xid": self.xid.as_ref().map(|x| x.to_string()),
            "autoRollback": self.auto_rollback.to_string(),
            "creationTime": self.creation_time,
            "lifetime": self.lifetime,
            "expireTime": self.expire_time(),
            "lastAccessTime": self.last_access_time,
            "onePhase": self.one_phase,
            "sessionLess": self.session_less,
            "creator": self.creator,
            "user": self.user,
            "clientID": self.client_id,
            "connection": self.connection_string,
            "connectionUID": self.connection_uid,
            "detached": self.detached,
            "detachedTime": self.detached_time,
            "failFrom": self.fail_from.map(|s| s.to_string()),
            "failTo": self.fail_to.map(|s| s.to_string()),
        })
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[state={}", self.state)?;
        if let Some(xid) = &self.xid {
            write!(f, ", xid={}", xid)?;
        }
        if self.one_phase {
            write!(f, ", onephase")?;
        }
        if self.detached {
            write!(f, ", detached@{}", self.detached_time)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TxnStatus::*;

    fn state(s: TxnStatus) -> TransactionState {
        TransactionState::new(1_000).with_status(s)
    }

    fn all_ops() -> Vec<TxnOperation> {
        vec![
            TxnOperation::Start(StartFlag::NoFlags),
            TxnOperation::Start(StartFlag::Join),
            TxnOperation::Start(StartFlag::Resume),
            TxnOperation::End(EndFlag::Suspend),
            TxnOperation::End(EndFlag::Fail),
            TxnOperation::End(EndFlag::Success),
            TxnOperation::End(EndFlag::OnePhase),
            TxnOperation::Prepare,
            TxnOperation::Commit { one_phase: true },
            TxnOperation::Commit { one_phase: false },
            TxnOperation::Rollback,
        ]
    }

    fn expected(op: TxnOperation, from: TxnStatus) -> Option<TxnStatus> {
        let legal: &[TxnStatus] = match op {
            TxnOperation::Start(StartFlag::NoFlags) => &[Created, Complete, Started],
            TxnOperation::Start(StartFlag::Join) => &[Started, Complete],
            TxnOperation::Start(StartFlag::Resume) => &[Incomplete, Started],
            TxnOperation::End(EndFlag::Suspend) => &[Started, Incomplete],
            TxnOperation::End(EndFlag::Fail) => &[Started, Incomplete, Failed],
            TxnOperation::End(_) => &[Started, Incomplete, Complete],
            TxnOperation::Prepare => &[Complete, Prepared],
            TxnOperation::Commit { one_phase: true } => &[Complete, Committed],
            TxnOperation::Commit { one_phase: false } => &[Prepared, Committed],
            TxnOperation::Rollback => &[Complete, Incomplete, Prepared, Failed, RolledBack],
        };
        let to = match op {
            TxnOperation::Start(_) => Started,
            TxnOperation::End(EndFlag::Suspend) => Incomplete,
            TxnOperation::End(EndFlag::Fail) => Failed,
            TxnOperation::End(_) => Complete,
            TxnOperation::Prepare => Prepared,
            TxnOperation::Commit { .. } => Committed,
            TxnOperation::Rollback => RolledBack,
        };
        legal.contains(&from).then_some(to)
    }

    #[test]
    fn test_transition_table() {
        for op in all_ops() {
            for from in TxnStatus::ALL {
                let result = state(from).next_state(op);
                match expected(op, from) {
                    Some(to) => assert_eq!(result.unwrap(), to, "{} from {}", op, from),
                    None => assert!(result.is_err(), "{} from {} should fail", op, from),
                }
            }
        }
    }

    #[test]
    fn test_end_after_failure_is_not_modified() {
        let mut ts = state(Started);
        ts.set_status(Failed, None);
        assert_eq!(ts.fail_from(), Some(Started));

        let err = ts.next_state(TxnOperation::End(EndFlag::Success)).unwrap_err();
        assert!(matches!(err, TxnError::NotModified(_)), "{:?}", err);

        // end(fail) from FAILED is simply legal
        assert_eq!(ts.next_state(TxnOperation::End(EndFlag::Fail)).unwrap(), Failed);
    }

    #[test]
    fn test_failed_error_mentions_target() {
        let mut ts = state(Complete);
        ts.set_status(Failed, Some(Prepared));
        let err = ts.next_state(TxnOperation::Commit { one_phase: false }).unwrap_err();
        assert!(matches!(err, TxnError::Conflict(_)));
        let msg = err.to_string();
        assert!(msg.contains("COMPLETE(4)") && msg.contains("PREPARED(5)"), "{}", msg);
    }

    #[test]
    fn test_failed_from_other_state_is_error_on_end() {
        let mut ts = state(Incomplete);
        ts.set_status(Failed, None);
        let err = ts.next_state(TxnOperation::End(EndFlag::Suspend)).unwrap_err();
        assert!(matches!(err, TxnError::Conflict(_)));
        assert!(err.to_string().contains("INCOMPLETE(3)"));
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let ts = state(RolledBack);
        assert_eq!(ts.next_state(TxnOperation::Rollback).unwrap(), RolledBack);
    }

    #[test]
    fn test_fail_from_only_set_on_entry() {
        let mut ts = state(Started);
        ts.set_status(Failed, Some(Complete));
        ts.set_status(Failed, Some(Prepared));
        assert_eq!(ts.fail_from(), Some(Started));
        assert_eq!(ts.fail_to(), Some(Complete));
    }

    #[test]
    fn test_remote_transitions() {
        let uid = TransactionUid::new(9);
        for from in TxnStatus::ALL {
            for to in TxnStatus::ALL {
                let ok = matches!(
                    (to, from),
                    (Committed, Prepared) | (Committed, Committed) | (RolledBack, Prepared) | (RolledBack, RolledBack)
                );
                let result = remote_next_state(uid, from, to);
                assert_eq!(result.is_ok(), ok, "{} -> {}", from, to);
                if let Err(e) = result {
                    assert!(matches!(e, TxnError::NotAllowed(_)));
                }
            }
        }
    }

    #[test]
    fn test_status_display_and_codes() {
        assert_eq!(Prepared.to_string(), "PREPARED(5)");
        assert_eq!(TxnStatus::describe(42), "UNKNOWN(42)");
        assert_eq!(TxnStatus::try_from(7).unwrap(), RolledBack);
        assert!(TxnStatus::try_from(-1).is_err());
    }

    #[test]
    fn test_is_xa() {
        assert!(!TransactionState::new(0).is_xa());
        assert!(!TransactionState::new(0).with_xid(Xid::null()).is_xa());
        assert!(TransactionState::new(0).with_xid(Xid::new(1, b"g".to_vec(), b"b".to_vec())).is_xa());
    }

    #[test]
    fn test_transient_fields_not_serialized() {
        let mut ts = state(Prepared).with_xid(Xid::new(1, b"g".to_vec(), Vec::new()));
        ts.set_one_phase(true);
        ts.detach(5_000);
        let bytes = bincode::serialize(&ts).unwrap();
        let back: TransactionState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.status(), Prepared);
        assert!(back.is_one_phase());
        assert!(!back.is_detached());
        assert_eq!(back.detached_time(), 0);
    }

    #[test]
    fn test_expiry() {
        let ts = TransactionState::new(1_000).with_lifetime(500);
        assert_eq!(ts.expire_time(), 1_500);
        assert!(!ts.is_expired(1_500));
        assert!(ts.is_expired(1_501));
        assert!(!TransactionState::new(0).is_expired(u64::MAX));
    }
}
