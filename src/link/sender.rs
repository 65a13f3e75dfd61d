use tracing::{trace, warn};
use crate::amqp::endpoint::{LinkRole, SessionId};
use crate::amqp::event::DeliveryEvent;
use crate::amqp::message::AmqpMessage;
use crate::amqp::outcome::DeliveryOutcome;
use crate::link::delivery_tag::{DeliveryTag, DeliveryTagAllocator};
use crate::link::{LinkEndpoint, LinkEvents};
use crate::reactor::ReactorContext;

pub const INITIAL_ENCODE_BUFFER_SIZE: usize = 1024;

/// Generic sender link driver. Purpose specific senders wrap it and decide what to send and
///  what to do with acknowledgements.
#[derive(Debug)]
pub struct SenderLink {
    endpoint: LinkEndpoint,
    tags: DeliveryTagAllocator,
    encode_buffer: Vec<u8>,
}

impl SenderLink {
    pub fn open(ctx: &mut ReactorContext, session: SessionId, name: &str, target_address: &str, client_version: &str) -> anyhow::Result<SenderLink> {
        Ok(SenderLink {
            endpoint: LinkEndpoint::open(ctx, session, name, LinkRole::Sender, target_address, client_version)?,
            tags: DeliveryTagAllocator::new(),
            encode_buffer: vec![0; INITIAL_ENCODE_BUFFER_SIZE],
        })
    }

    /// Encodes and transmits a message, returning the delivery tag that its acknowledgement will
    ///  carry. `None` means the message was not sent and no acknowledgement will ever arrive.
    pub fn send_message_and_get_delivery_tag(&mut self, ctx: &mut ReactorContext, message: &AmqpMessage) -> Option<DeliveryTag> {
        let _span = self.endpoint.span.clone().entered();
        let tag = self.tags.next_tag();
        let len = self.encode(message);

        match ctx.engine.send(self.endpoint.id, &DeliveryTagAllocator::encode(tag), &self.encode_buffer[..len]) {
            Ok(delivery) => {
                trace!("sent delivery {:?} with tag {}", delivery, tag);
                Some(tag)
            }
            Err(e) => {
                warn!("failed to send message: {}", e);
                None
            }
        }
    }

    fn encode(&mut self, message: &AmqpMessage) -> usize {
        loop {
            match message.encode(&mut self.encode_buffer) {
                Ok(len) => return len,
                Err(_) => {
                    let new_len = self.encode_buffer.len() * 2;
                    trace!("growing encode buffer of link {} to {} bytes", self.endpoint.name, new_len);
                    self.encode_buffer.resize(new_len, 0);
                }
            }
        }
    }

    /// Handles a state update of an outgoing delivery. Once the peer has reached a terminal
    ///  outcome, the delivery is settled locally and its tag and outcome are returned.
    pub fn on_delivery_update(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) -> Option<(DeliveryTag, Option<DeliveryOutcome>)> {
        let _span = self.endpoint.span.enter();
        let terminal = delivery.remotely_settled
            || delivery.remote_state.as_ref().map(|s| s.is_terminal()).unwrap_or(false);
        if !terminal {
            trace!("delivery {:?} is not final yet", delivery.delivery);
            return None;
        }

        ctx.engine.settle(delivery.delivery, None);

        match DeliveryTagAllocator::decode(&delivery.tag) {
            Some(tag) => Some((tag, delivery.remote_state.clone())),
            None => {
                warn!("acknowledgement with unparsable delivery tag {:?} - ignoring", delivery.tag);
                None
            }
        }
    }
}

impl LinkEvents for SenderLink {
    fn endpoint(&self) -> &LinkEndpoint {
        &self.endpoint
    }

    fn endpoint_mut(&mut self) -> &mut LinkEndpoint {
        &mut self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use super::*;
    use crate::amqp::endpoint::{CloseAction, DeliveryId, EndpointState};
    use crate::amqp::message::MessageBody;
    use crate::test_util::engine::{EngineCall, TestReactor};

    fn open_sender(reactor: &mut TestReactor) -> SenderLink {
        let session = reactor.engine.open_session_for_test();
        SenderLink::open(&mut reactor.ctx(), session, "sender", "/messages/devicebound", "test/1").unwrap()
    }

    #[test]
    fn test_open_advertises_versions() {
        let mut reactor = TestReactor::new();
        let sender = open_sender(&mut reactor);

        let spec = reactor.engine.link_spec(sender.endpoint().id).unwrap();
        assert_eq!(spec.role, LinkRole::Sender);
        assert_eq!(spec.address, "/messages/devicebound");
        assert_eq!(spec.properties.get("com.microsoft:api-version").map(|s| s.as_str()), Some("2021-04-12"));
        assert_eq!(spec.properties.get("com.microsoft:client-version").map(|s| s.as_str()), Some("test/1"));
        assert_eq!(sender.endpoint().states.local, EndpointState::Active);
    }

    #[test]
    fn test_sequential_tags() {
        let mut reactor = TestReactor::new();
        let mut sender = open_sender(&mut reactor);

        let tags = (0..3)
            .map(|_| sender.send_message_and_get_delivery_tag(&mut reactor.ctx(), &AmqpMessage::default()))
            .collect::<Vec<_>>();
        assert_eq!(tags, vec![Some(0), Some(1), Some(2)]);

        let sent = reactor.engine.sent_messages(sender.endpoint().id);
        assert_eq!(sent.iter().map(|(tag, _)| tag.clone()).collect::<Vec<_>>(), vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn test_send_failure_returns_none() {
        let mut reactor = TestReactor::new();
        let mut sender = open_sender(&mut reactor);
        reactor.engine.set_fail_sends(true);

        assert_eq!(sender.send_message_and_get_delivery_tag(&mut reactor.ctx(), &AmqpMessage::default()), None);
    }

    #[test]
    fn test_big_message_grows_buffer() {
        let mut reactor = TestReactor::new();
        let mut sender = open_sender(&mut reactor);

        let message = AmqpMessage {
            body: MessageBody::Data(Bytes::from(vec![1u8; 5000])),
            ..Default::default()
        };
        assert_eq!(sender.send_message_and_get_delivery_tag(&mut reactor.ctx(), &message), Some(0));
        assert_eq!(sender.encode_buffer.len(), 8192);
        assert_eq!(reactor.engine.sent_messages(sender.endpoint().id)[0].1, message);
    }

    #[test]
    fn test_acknowledgement_settles() {
        let mut reactor = TestReactor::new();
        let mut sender = open_sender(&mut reactor);
        let link = sender.endpoint().id;

        let mut update = DeliveryEvent {
            link,
            delivery: DeliveryId(77),
            tag: b"12".to_vec(),
            readable: false,
            partial: false,
            remote_state: Some(DeliveryOutcome::Received { section_number: 0, section_offset: 0 }),
            remotely_settled: false,
        };
        assert_eq!(sender.on_delivery_update(&mut reactor.ctx(), &update), None);

        update.remote_state = Some(DeliveryOutcome::Accepted);
        assert_eq!(sender.on_delivery_update(&mut reactor.ctx(), &update), Some((12, Some(DeliveryOutcome::Accepted))));
        assert!(reactor.engine.calls().contains(&EngineCall::Settle { delivery: DeliveryId(77), outcome: None }));

        update.tag = b"not a number".to_vec();
        assert_eq!(sender.on_delivery_update(&mut reactor.ctx(), &update), None);
    }

    #[test]
    fn test_remote_close_closes_locally() {
        let mut reactor = TestReactor::manual();
        let mut sender = open_sender(&mut reactor);
        let link = sender.endpoint().id;
        sender.on_remote_open(&mut reactor.ctx());

        assert_eq!(sender.on_remote_close(&mut reactor.ctx(), None), CloseAction::Nothing);
        assert!(reactor.engine.calls().contains(&EngineCall::CloseLink(link)));
        assert_eq!(sender.on_local_close(&mut reactor.ctx()), CloseAction::CloseParent);
    }
}
