//! Per-transaction data: state machine, records, participants and work batches

pub mod state;
pub mod broker;
pub mod record;
pub mod remote;
pub mod work;

// Public API
pub use state::{remote_next_state, EndFlag, StartFlag, TransactionState, TxnOperation, TxnStatus};
pub use broker::{
    resolve_current_address, BrokerAddress, ClusterView, ParticipantSet, ParticipantState,
    StandaloneView, TransactionBroker,
};
pub use record::{MessageTracker, TransactionRecord};
pub use remote::{RemoteAckEntry, RemoteTransactionRecord};
pub use work::{TransactionAck, TransactionWork, WorkMessage, WorkMessageAck};
