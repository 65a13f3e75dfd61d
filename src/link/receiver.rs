use std::collections::BTreeMap;
use std::sync::Arc;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use crate::amqp::endpoint::{DeliveryId, LinkRole, SessionId};
use crate::amqp::event::DeliveryEvent;
use crate::amqp::message::{AmqpMessage, PropertyValue};
use crate::amqp::outcome::DeliveryOutcome;
use crate::link::{LinkEndpoint, LinkEvents};
use crate::reactor::{invoke_application_callback, ReactorContext};

/// Generic receiver link driver. It never pulls: credit is granted one unit at a time, so at
///  most one inbound message is in flight per link, and a unit is refunded whenever a delivery
///  is settled.
#[derive(Debug)]
pub struct ReceiverLink {
    endpoint: LinkEndpoint,
    credit: u32,
}

impl ReceiverLink {
    pub fn open(ctx: &mut ReactorContext, session: SessionId, name: &str, source_address: &str, client_version: &str) -> anyhow::Result<ReceiverLink> {
        let endpoint = LinkEndpoint::open(ctx, session, name, LinkRole::Receiver, source_address, client_version)?;
        ctx.engine.flow(endpoint.id, 1);
        Ok(ReceiverLink {
            endpoint,
            credit: 1,
        })
    }

    /// credit granted to the peer and not yet used by a delivery
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Reads and decodes a delivery once it is complete. Partial deliveries are left alone,
    ///  the engine reports them again when more frames have arrived.
    ///
    /// A delivery that can not be read or decoded is released right away, so the caller only
    ///  has to settle deliveries for which a message is returned.
    pub fn receive(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) -> Option<AmqpMessage> {
        let _span = self.endpoint.span.clone().entered();
        if !delivery.readable || delivery.partial {
            trace!("delivery {:?} is not complete yet", delivery.delivery);
            return None;
        }
        self.credit = self.credit.saturating_sub(1);

        let decoded = ctx.engine.read(delivery.delivery)
            .and_then(|raw| AmqpMessage::decode(&raw));
        match decoded {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("failed to read delivery {:?}: {} - releasing it", delivery.delivery, e);
                self.settle(ctx, delivery.delivery, DeliveryOutcome::Released);
                None
            }
        }
    }

    /// Settles a delivery with the given outcome and refunds the credit it used
    pub fn settle(&mut self, ctx: &mut ReactorContext, delivery: DeliveryId, outcome: DeliveryOutcome) {
        trace!("settling delivery {:?} on link {} as {:?}", delivery, self.endpoint.name, outcome.code());
        ctx.engine.settle(delivery, Some(outcome));
        ctx.engine.flow(self.endpoint.id, 1);
        self.credit += 1;
    }
}

impl LinkEvents for ReceiverLink {
    fn endpoint(&self) -> &LinkEndpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut LinkEndpoint {
        &mut self.endpoint
    }
}

/// What the application decides about a service-bound message
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcknowledgementType {
    /// the message was processed and is removed from the service's queue
    Complete,
    /// the message goes back to the service's queue to be delivered again
    Abandon,
}

impl AcknowledgementType {
    pub fn outcome(self) -> DeliveryOutcome {
        match self {
            AcknowledgementType::Complete => DeliveryOutcome::Accepted,
            AcknowledgementType::Abandon => DeliveryOutcome::Released,
        }
    }
}

/// A message the service sends to the application, e.g. delivery feedback or a file upload
///  notification. The body is usually JSON, which is left to the application to parse.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceBoundMessage {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub content_type: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub body: Bytes,
}

impl ServiceBoundMessage {
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

impl From<AmqpMessage> for ServiceBoundMessage {
    fn from(message: AmqpMessage) -> Self {
        ServiceBoundMessage {
            body: Bytes::copy_from_slice(message.body.as_bytes()),
            message_id: message.properties.message_id,
            correlation_id: message.properties.correlation_id,
            user_id: message.properties.user_id,
            content_type: message.properties.content_type,
            properties: message.application_properties,
        }
    }
}

pub type MessageProcessor = Arc<dyn Fn(&ServiceBoundMessage) -> AcknowledgementType + Send + Sync>;

/// A receiver link that hands every message to an application provided [MessageProcessor] and
///  settles it according to the processor's decision
pub struct AcknowledgingReceiverLink {
    link: ReceiverLink,
    processor: MessageProcessor,
}

impl AcknowledgingReceiverLink {
    pub fn open(ctx: &mut ReactorContext, session: SessionId, name: &str, source_address: &str, client_version: &str, processor: MessageProcessor) -> anyhow::Result<AcknowledgingReceiverLink> {
        Ok(AcknowledgingReceiverLink {
            link: ReceiverLink::open(ctx, session, name, source_address, client_version)?,
            processor,
        })
    }

    pub fn credit(&self) -> u32 {
        self.link.credit()
    }

    /// Returns the application's decision if the delivery was complete and readable
    pub fn on_delivery(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) -> Option<AcknowledgementType> {
        let message = ServiceBoundMessage::from(self.link.receive(ctx, delivery)?);
        let _span = self.link.endpoint.span.clone().entered();

        let processor = self.processor.clone();
        let acknowledgement = invoke_application_callback(&self.link.endpoint.name, move || processor(&message))
            .unwrap_or(AcknowledgementType::Abandon);

        debug!("{:?} message", acknowledgement);
        self.link.settle(ctx, delivery.delivery, acknowledgement.outcome());
        Some(acknowledgement)
    }
}

impl LinkEvents for AcknowledgingReceiverLink {
    fn endpoint(&self) -> &LinkEndpoint {
        self.link.endpoint()
    }

    fn endpoint_mut(&mut self) -> &mut LinkEndpoint {
        self.link.endpoint_mut()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use super::*;
    use rstest::rstest;
    use crate::amqp::message::MessageBody;
    use crate::test_util::engine::{EngineCall, TestReactor};

    fn message(body: &str) -> AmqpMessage {
        AmqpMessage {
            body: MessageBody::Data(Bytes::copy_from_slice(body.as_bytes())),
            ..Default::default()
        }
    }

    #[test]
    fn test_open_grants_single_credit() {
        let mut reactor = TestReactor::new();
        let session = reactor.engine.open_session_for_test();
        let receiver = ReceiverLink::open(&mut reactor.ctx(), session, "r", "/source", "test/1").unwrap();

        assert_eq!(receiver.credit(), 1);
        assert_eq!(reactor.engine.flows(receiver.endpoint().id), vec![1]);
    }

    #[test]
    fn test_partial_delivery_is_not_read() {
        let mut reactor = TestReactor::new();
        let session = reactor.engine.open_session_for_test();
        let mut receiver = ReceiverLink::open(&mut reactor.ctx(), session, "r", "/source", "test/1").unwrap();

        let mut delivery = reactor.engine.incoming_message(receiver.endpoint().id, &message("x"));
        delivery.partial = true;

        assert_eq!(receiver.receive(&mut reactor.ctx(), &delivery), None);
        assert!(!reactor.engine.calls().contains(&EngineCall::Read(delivery.delivery)));
        assert_eq!(receiver.credit(), 1);
    }

    #[test]
    fn test_undecodable_delivery_is_released() {
        let mut reactor = TestReactor::new();
        let session = reactor.engine.open_session_for_test();
        let mut receiver = ReceiverLink::open(&mut reactor.ctx(), session, "r", "/source", "test/1").unwrap();

        let delivery = reactor.engine.incoming_raw(receiver.endpoint().id, vec![0xff, 0x00]);
        assert_eq!(receiver.receive(&mut reactor.ctx(), &delivery), None);

        assert!(reactor.engine.calls().contains(&EngineCall::Settle { delivery: delivery.delivery, outcome: Some(DeliveryOutcome::Released) }));
        assert_eq!(reactor.engine.flows(receiver.endpoint().id), vec![1, 1]);
        assert_eq!(receiver.credit(), 1);
    }

    #[rstest]
    #[case::complete(AcknowledgementType::Complete, DeliveryOutcome::Accepted)]
    #[case::abandon(AcknowledgementType::Abandon, DeliveryOutcome::Released)]
    fn test_acknowledgement(#[case] acknowledgement: AcknowledgementType, #[case] expected: DeliveryOutcome) {
        let mut reactor = TestReactor::new();
        let session = reactor.engine.open_session_for_test();
        let processed = Arc::new(AtomicUsize::new(0));
        let processed2 = processed.clone();
        let processor: MessageProcessor = Arc::new(move |m: &ServiceBoundMessage| {
            assert_eq!(m.body_as_str(), Some("feedback"));
            processed2.fetch_add(1, Ordering::SeqCst);
            acknowledgement
        });
        let mut receiver = AcknowledgingReceiverLink::open(&mut reactor.ctx(), session, "r", "/source", "test/1", processor).unwrap();
        let link = receiver.endpoint().id;

        for _ in 0..3 {
            let delivery = reactor.engine.incoming_message(link, &message("feedback"));
            assert_eq!(receiver.on_delivery(&mut reactor.ctx(), &delivery), Some(acknowledgement));
            assert!(reactor.engine.calls().contains(&EngineCall::Settle { delivery: delivery.delivery, outcome: Some(expected.clone()) }));
            assert!(receiver.credit() <= 1);
        }

        assert_eq!(processed.load(Ordering::SeqCst), 3);
        // one grant on open plus one refund per settled delivery
        assert_eq!(reactor.engine.flows(link), vec![1, 1, 1, 1]);
        assert_eq!(receiver.credit(), 1);
    }

    #[test]
    fn test_panicking_processor_abandons() {
        let mut reactor = TestReactor::new();
        let session = reactor.engine.open_session_for_test();
        let processor: MessageProcessor = Arc::new(|_: &ServiceBoundMessage| -> AcknowledgementType { panic!("application bug") });
        let mut receiver = AcknowledgingReceiverLink::open(&mut reactor.ctx(), session, "r", "/source", "test/1", processor).unwrap();

        let delivery = reactor.engine.incoming_message(receiver.endpoint().id, &message("x"));
        assert_eq!(receiver.on_delivery(&mut reactor.ctx(), &delivery), Some(AcknowledgementType::Abandon));
        assert_eq!(receiver.credit(), 1);
    }
}
