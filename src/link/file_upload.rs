use crate::amqp::endpoint::SessionId;
use crate::link::receiver::{AcknowledgingReceiverLink, MessageProcessor};
use crate::reactor::ReactorContext;

pub const FILE_UPLOAD_NOTIFICATION_LINK_NAME: &str = "file-upload-notification-receiver";
pub const FILE_UPLOAD_NOTIFICATION_ADDRESS: &str = "/messages/serviceBound/filenotifications";

pub fn open_file_upload_notification_receiver(ctx: &mut ReactorContext, session: SessionId, client_version: &str, processor: MessageProcessor) -> anyhow::Result<AcknowledgingReceiverLink> {
    AcknowledgingReceiverLink::open(ctx, session, FILE_UPLOAD_NOTIFICATION_LINK_NAME, FILE_UPLOAD_NOTIFICATION_ADDRESS, client_version, processor)
}
