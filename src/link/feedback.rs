use crate::amqp::endpoint::SessionId;
use crate::link::receiver::{AcknowledgingReceiverLink, MessageProcessor};
use crate::reactor::ReactorContext;

pub const FEEDBACK_LINK_NAME: &str = "feedback-receiver";
pub const FEEDBACK_ADDRESS: &str = "/messages/serviceBound/feedback";

/// Delivery feedback for cloud-to-device messages that were sent with an acknowledgement request
pub fn open_feedback_receiver(ctx: &mut ReactorContext, session: SessionId, client_version: &str, processor: MessageProcessor) -> anyhow::Result<AcknowledgingReceiverLink> {
    AcknowledgingReceiverLink::open(ctx, session, FEEDBACK_LINK_NAME, FEEDBACK_ADDRESS, client_version, processor)
}
