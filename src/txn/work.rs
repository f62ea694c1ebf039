//! Durable effect of a transaction
//!
//! In transaction-log mode the messages a transaction produced and the
//! acknowledgements it consumed are written as one [`TransactionWork`] batch
//! together with the PREPARED or COMMITTED state.

use serde::{Deserialize, Serialize};

use crate::types::{ConsumerUid, DestinationId, MessageId};

/// A persisted acknowledgement of a message inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionAck {
    pub message: MessageId,
    pub consumer: ConsumerUid,
    /// Consumer id the message is stored under (durable subscriber), if any
    pub stored_consumer: Option<ConsumerUid>,
}

impl TransactionAck {
    pub fn new(message: MessageId, consumer: ConsumerUid) -> Self {
        Self {
            message,
            consumer,
            stored_consumer: None,
        }
    }

    pub fn with_stored_consumer(mut self, stored: ConsumerUid) -> Self {
        self.stored_consumer = Some(stored);
        self
    }

    /// Consumer id as it is known to the store
    pub fn stored_consumer_or_consumer(&self) -> ConsumerUid {
        self.stored_consumer.unwrap_or(self.consumer)
    }
}

/// A message produced inside the transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub message: MessageId,
    pub destination: DestinationId,
    pub payload: Vec<u8>,
    /// Stored consumers the message is routed to
    pub stored_interests: Vec<ConsumerUid>,
}

/// A message acknowledged inside the transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMessageAck {
    pub destination: DestinationId,
    pub ack: TransactionAck,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionWork {
    sent: Vec<WorkMessage>,
    acks: Vec<WorkMessageAck>,
}

impl TransactionWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, msg: WorkMessage) {
        self.sent.push(msg);
    }

    pub fn add_ack(&mut self, ack: WorkMessageAck) {
        self.acks.push(ack);
    }

    pub fn sent_messages(&self) -> &[WorkMessage] {
        &self.sent
    }

    pub fn acks(&self) -> &[WorkMessageAck] {
        &self.acks
    }

    pub fn num_sent(&self) -> usize {
        self.sent.len()
    }

    pub fn num_acks(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty() && self.acks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_consumer_fallback() {
        let ack = TransactionAck::new(MessageId::new("m1"), ConsumerUid(3));
        assert_eq!(ack.stored_consumer_or_consumer(), ConsumerUid(3));
        let ack = ack.with_stored_consumer(ConsumerUid(9));
        assert_eq!(ack.stored_consumer_or_consumer(), ConsumerUid(9));
    }

    #[test]
    fn test_work_counts() {
        let mut work = TransactionWork::new();
        assert!(work.is_empty());
        work.add_message(WorkMessage {
            message: MessageId::new("m1"),
            destination: DestinationId("q".into()),
            payload: b"hello".to_vec(),
            stored_interests: Vec::new(),
        });
        work.add_ack(WorkMessageAck {
            destination: DestinationId("q".into()),
            ack: TransactionAck::new(MessageId::new("m0"), ConsumerUid(1)),
        });
        assert_eq!(work.num_sent(), 1);
        assert_eq!(work.num_acks(), 1);
        assert!(!work.is_empty());
    }
}
