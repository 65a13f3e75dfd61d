use crate::amqp::endpoint::{DeliveryId, LinkId, SessionId};
use crate::amqp::outcome::{DeliveryOutcome, ErrorCondition};

/// A delivery changed: either a message arrived on a receiver link, or the peer updated the
///  state of a message sent on a sender link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeliveryEvent {
    pub link: LinkId,
    pub delivery: DeliveryId,
    pub tag: Vec<u8>,
    /// the delivery's payload can be read
    pub readable: bool,
    /// more transfer frames of this delivery are still to come
    pub partial: bool,
    pub remote_state: Option<DeliveryOutcome>,
    pub remotely_settled: bool,
}

/// Everything the protocol engine reports back to the reactor. The engine echoes local closes
///  as `*LocalClose` events, so local and remote initiated teardown run through the same
///  handlers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// the transport is bound to the connection, SASL and TLS can be configured now
    ConnectionBound,
    ConnectionRemoteOpen,
    ConnectionLocalClose,
    ConnectionRemoteClose { error: Option<ErrorCondition> },
    SessionRemoteOpen(SessionId),
    SessionLocalClose(SessionId),
    SessionRemoteClose { session: SessionId, error: Option<ErrorCondition> },
    LinkRemoteOpen(LinkId),
    LinkLocalClose(LinkId),
    LinkRemoteClose { link: LinkId, error: Option<ErrorCondition> },
    LinkFlow { link: LinkId, credit: u32 },
    Delivery(DeliveryEvent),
    TransportError(ErrorCondition),
    /// the transport is gone for good, no further events will follow
    TransportClosed,
}
