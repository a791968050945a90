use uuid::Uuid;

use crate::encoding::Event;

/// Messages delivered to the [super::Machine] by the group transport.
#[derive(Debug, Clone)]
pub enum InboundGroupMessage {
    /// A group event destined for an external chain.
    Event(Event),
    /// Another member's signature over a group event.
    PartialSignature {
        process: Uuid,
        nonce: u64,
        partial: Vec<u8>,
    },
}

/// Messages the [super::Machine] asks the group transport to broadcast.
#[derive(Debug, Clone)]
pub enum OutboundGroupMessage {
    /// This member's signature over a pending group event.
    PartialSignature {
        process: Uuid,
        nonce: u64,
        partial: Vec<u8>,
    },
    /// An event observed on an external chain, to be replayed into the group.
    Deliver(Event),
}
