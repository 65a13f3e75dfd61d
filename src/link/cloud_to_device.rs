use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::time::{Duration, SystemTime};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use crate::amqp::endpoint::{CloseAction, SessionId};
use crate::amqp::event::DeliveryEvent;
use crate::amqp::message::{AmqpMessage, MessageBody, MessageProperties, PropertyValue};
use crate::amqp::outcome::ErrorCondition;
use crate::error::IotHubError;
use crate::link::delivery_tag::DeliveryTag;
use crate::link::sender::SenderLink;
use crate::link::{LinkEndpoint, LinkEvents};
use crate::reactor::timer::TimerTask;
use crate::reactor::{invoke_application_callback, ReactorContext};
use crate::response_verification::verify_delivery_outcome;

pub const CLOUD_TO_DEVICE_LINK_NAME: &str = "cloud-to-device-sender";
pub const CLOUD_TO_DEVICE_ADDRESS: &str = "/messages/devicebound";
pub const ACKNOWLEDGEMENT_PROPERTY: &str = "iothub-ack";

/// Which delivery feedback the service reports for a cloud-to-device message
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeliveryAcknowledgement {
    None,
    Positive,
    Negative,
    Full,
}

impl DeliveryAcknowledgement {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryAcknowledgement::None => "none",
            DeliveryAcknowledgement::Positive => "positive",
            DeliveryAcknowledgement::Negative => "negative",
            DeliveryAcknowledgement::Full => "full",
        }
    }
}

/// A message the application sends to a device (or a module on a device)
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CloudToDeviceMessage {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub expiry_time: Option<SystemTime>,
    pub acknowledgement: Option<DeliveryAcknowledgement>,
    pub properties: BTreeMap<String, String>,
    pub payload: Bytes,
}

impl CloudToDeviceMessage {
    pub fn new(payload: impl Into<Bytes>) -> CloudToDeviceMessage {
        CloudToDeviceMessage {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn to_amqp(&self, device_id: &str, module_id: Option<&str>) -> AmqpMessage {
        let to = match module_id {
            Some(module_id) => format!("/devices/{}/modules/{}/messages/devicebound", device_id, module_id),
            None => format!("/devices/{}/messages/devicebound", device_id),
        };
        let absolute_expiry_time = self.expiry_time
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);

        let mut result = AmqpMessage {
            properties: MessageProperties {
                message_id: self.message_id.clone(),
                correlation_id: self.correlation_id.clone(),
                user_id: self.user_id.clone(),
                to: Some(to),
                absolute_expiry_time,
                ..Default::default()
            },
            body: MessageBody::Data(self.payload.clone()),
            ..Default::default()
        };
        for (key, value) in &self.properties {
            result.set_application_property(key, PropertyValue::String(value.clone()));
        }
        if let Some(acknowledgement) = self.acknowledgement {
            result.set_application_property(ACKNOWLEDGEMENT_PROPERTY, acknowledgement.as_str().into());
        }
        result
    }
}

/// Passed to a send callback once the service settled the message, or once it is clear that
///  it never will
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendResult {
    pub success: bool,
    pub error: Option<IotHubError>,
    pub correlation_id: Option<String>,
}

pub type SendContext = Box<dyn Any + Send>;
pub type SendCallback = Box<dyn FnOnce(SendResult, Option<SendContext>) + Send>;

/// An application message waiting to be sent, together with the callback to notify
pub struct PendingSend {
    pub device_id: String,
    pub module_id: Option<String>,
    pub message: CloudToDeviceMessage,
    pub callback: SendCallback,
    pub context: Option<SendContext>,
}

impl PendingSend {
    pub fn new(device_id: &str, module_id: Option<&str>, message: CloudToDeviceMessage, callback: SendCallback, context: Option<SendContext>) -> PendingSend {
        PendingSend {
            device_id: device_id.to_string(),
            module_id: module_id.map(|s| s.to_string()),
            message,
            callback,
            context,
        }
    }

    /// Notifies the application that the message can not be delivered
    pub fn fail(self, error: IotHubError) {
        let result = SendResult {
            success: false,
            error: Some(error),
            correlation_id: self.message.correlation_id.clone(),
        };
        complete(self.callback, result, self.context);
    }
}

impl Debug for PendingSend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSend")
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("message_id", &self.message.message_id)
            .finish()
    }
}

fn complete(callback: SendCallback, result: SendResult, context: Option<SendContext>) {
    invoke_application_callback("cloud-to-device send callback", move || callback(result, context));
}

/// One transmitted message: the protocol message that went out under a delivery tag, the
///  application message it was built from, and the callback and context registered for it.
///  All three associations live and die together.
struct InFlightDelivery {
    protocol_message: AmqpMessage,
    pending: PendingSend,
}

/// Sends cloud-to-device messages. Messages are queued by the reactor (fed from a command
///  channel) and handed to the engine when the send timer fires, so queue and correlation
///  table are only ever touched from the reactor thread.
pub struct CloudToDeviceSenderLink {
    link: SenderLink,
    send_interval: Duration,
    queue: VecDeque<PendingSend>,
    in_flight: FxHashMap<DeliveryTag, InFlightDelivery>,
    closed: bool,
}

impl CloudToDeviceSenderLink {
    pub fn open(ctx: &mut ReactorContext, session: SessionId, client_version: &str, send_interval: Duration) -> anyhow::Result<CloudToDeviceSenderLink> {
        let link = SenderLink::open(ctx, session, CLOUD_TO_DEVICE_LINK_NAME, CLOUD_TO_DEVICE_ADDRESS, client_version)?;
        ctx.schedule(send_interval, TimerTask::CloudToDeviceSend);
        Ok(CloudToDeviceSenderLink {
            link,
            send_interval,
            queue: VecDeque::new(),
            in_flight: FxHashMap::default(),
            closed: false,
        })
    }

    pub fn enqueue(&mut self, pending: PendingSend) {
        if self.closed {
            debug!("cloud-to-device link is closed, failing message for device {}", pending.device_id);
            pending.fail(IotHubError::connection_closed());
            return;
        }
        self.queue.push_back(pending);
    }

    pub fn num_queued(&self) -> usize {
        self.queue.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn on_send_timer(&mut self, ctx: &mut ReactorContext) {
        if self.closed {
            return;
        }
        self.drain(ctx);
        ctx.schedule(self.send_interval, TimerTask::CloudToDeviceSend);
    }

    /// Transmits everything that is queued, in enqueue order. Messages stay queued until the
    ///  service has attached the link.
    pub fn drain(&mut self, ctx: &mut ReactorContext) {
        if !self.link.endpoint().is_open() {
            return;
        }

        while let Some(pending) = self.queue.pop_front() {
            let protocol_message = pending.message.to_amqp(&pending.device_id, pending.module_id.as_deref());
            match self.link.send_message_and_get_delivery_tag(ctx, &protocol_message) {
                Some(tag) => {
                    if let Some(previous) = self.in_flight.insert(tag, InFlightDelivery { protocol_message, pending }) {
                        warn!("delivery tag {} reused while still unacknowledged", tag);
                        previous.pending.fail(IotHubError::Unknown("delivery tag was reused before acknowledgement".to_string()));
                    }
                }
                None => {
                    pending.fail(IotHubError::Transport("failed to send the message".to_string()));
                }
            }
        }
    }

    pub fn on_delivery_update(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) {
        let Some((tag, outcome)) = self.link.on_delivery_update(ctx, delivery) else {
            return;
        };

        match self.in_flight.remove(&tag) {
            Some(in_flight) => {
                let error = verify_delivery_outcome(outcome.as_ref());
                debug!("message {:?} to {:?} acknowledged: {:?}", in_flight.protocol_message.properties.message_id, in_flight.protocol_message.properties.to, error);
                let result = SendResult {
                    success: error.is_none(),
                    error,
                    correlation_id: in_flight.pending.message.correlation_id.clone(),
                };
                complete(in_flight.pending.callback, result, in_flight.pending.context);
            }
            None => warn!("acknowledgement for unknown delivery tag {} - ignoring", tag),
        }
    }

    /// Fails every unacknowledged and every queued message. Later enqueues fail immediately.
    pub fn fail_outstanding(&mut self) {
        self.closed = true;
        if self.in_flight.is_empty() && self.queue.is_empty() {
            return;
        }

        debug!("failing {} unacknowledged and {} queued cloud-to-device messages", self.in_flight.len(), self.queue.len());
        let mut in_flight = self.in_flight.drain()
            .collect::<Vec<_>>();
        in_flight.sort_by_key(|(tag, _)| *tag);
        for (_, delivery) in in_flight {
            delivery.pending.fail(IotHubError::connection_closed());
        }
        for pending in self.queue.drain(..) {
            pending.fail(IotHubError::connection_closed());
        }
    }
}

impl LinkEvents for CloudToDeviceSenderLink {
    fn endpoint(&self) -> &LinkEndpoint {
        self.link.endpoint()
    }

    fn endpoint_mut(&mut self) -> &mut LinkEndpoint {
        self.link.endpoint_mut()
    }

    fn on_local_close(&mut self, ctx: &mut ReactorContext) -> CloseAction {
        self.fail_outstanding();
        self.link.on_local_close(ctx)
    }

    fn on_remote_close(&mut self, ctx: &mut ReactorContext, error: Option<&ErrorCondition>) -> CloseAction {
        self.fail_outstanding();
        self.link.on_remote_close(ctx, error)
    }
}
