//! Broadcast envelope carried between RainTree hops.
//!
//! The envelope holds everything a receiver needs to re-derive its own
//! targets: the original sender (to recover the message id and the tree
//! root) and the demotion level the sender acted at, plus one.

use {
    crate::address_book::PeerId,
    serde::{Deserialize, Serialize},
};

/// Application topic a payload is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Votes, proposals and certificates for the consensus engine.
    Consensus,
    /// Transactions and other utility-layer traffic.
    Utility,
    /// Diagnostics; logged by the receiver and otherwise ignored.
    Debug,
    /// A tag this build does not know about. Forwarded untouched.
    Other(u32),
}

/// Which of the sender's assignments produced this envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedundancySlot {
    /// Target at the one-third offset of the sender's view.
    First,
    /// Target at the two-thirds offset of the sender's view.
    Second,
    /// A peer the tree never reaches, covered directly by its ring predecessor.
    Straggler,
}

/// Identity of a logical message: who authored it and the nonce they chose.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// Identity of the originator.
    pub origin: PeerId,
    /// Nonce the originator drew for this message.
    pub nonce: u64,
}

/// Wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Random nonce chosen by the originator.
    pub nonce: u64,
    /// Identity of the node that called `broadcast`.
    pub origin: PeerId,
    /// Demotion level the receiver resumes at.
    pub level: u32,
    /// Assignment of the sender this copy was written under.
    pub slot: RedundancySlot,
    /// Module the payload is routed to on delivery.
    pub topic: Topic,
    /// Opaque application bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Key used for duplicate suppression.
    pub fn id(&self) -> MessageId {
        MessageId {
            origin: self.origin.clone(),
            nonce: self.nonce,
        }
    }

    /// Copy of this envelope readdressed for the next hop.
    pub fn forwarded(&self, level: u32, slot: RedundancySlot) -> Self {
        Self {
            level,
            slot,
            ..self.clone()
        }
    }
}

/// A payload handed to the module layer after local delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Validator that originated the broadcast, not the hop it arrived from.
    pub origin: PeerId,
    /// Originator's nonce; together with `origin` identifies the message.
    pub nonce: u64,
    /// Topic the router dispatches on.
    pub topic: Topic,
    /// Application bytes as passed to `broadcast`.
    pub payload: Vec<u8>,
}

impl From<Envelope> for DeliveredMessage {
    fn from(envelope: Envelope) -> Self {
        Self {
            origin: envelope.origin,
            nonce: envelope.nonce,
            topic: envelope.topic,
            payload: envelope.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_keeps_identity() {
        let envelope = Envelope {
            nonce: 11,
            origin: PeerId::from("val_01"),
            level: 1,
            slot: RedundancySlot::First,
            topic: Topic::Consensus,
            payload: vec![1, 2, 3],
        };
        let next = envelope.forwarded(2, RedundancySlot::Second);
        assert_eq!(next.id(), envelope.id());
        assert_eq!(next.level, 2);
        assert_eq!(next.slot, RedundancySlot::Second);
        assert_eq!(next.payload, envelope.payload);
    }
}
