use std::sync::Arc;
use anyhow::bail;
use tracing::{debug, warn};
use uuid::Uuid;
use crate::amqp::endpoint::SessionId;
use crate::amqp::event::DeliveryEvent;
use crate::amqp::message::{AmqpMessage, MessageBody, MessageProperties, PropertyValue};
use crate::amqp::outcome::DeliveryOutcome;
use crate::auth::credential::{AccessToken, TokenCredential, TokenType};
use crate::link::receiver::ReceiverLink;
use crate::link::sender::SenderLink;
use crate::link::{LinkEndpoint, LinkEvents};
use crate::reactor::clock::Clock;
use crate::reactor::ReactorContext;

pub const CBS_ADDRESS: &str = "$cbs";
pub const CBS_REPLY_TO: &str = "cbs";
pub const CBS_SENDER_LINK_NAME: &str = "cbs-sender";
pub const CBS_RECEIVER_LINK_NAME: &str = "cbs-receiver";

pub const PUT_TOKEN_OPERATION: &str = "put-token";
pub const OPERATION_KEY: &str = "operation";
pub const TYPE_KEY: &str = "type";
pub const NAME_KEY: &str = "name";
pub const EXPIRATION_KEY: &str = "expiration";
pub const STATUS_CODE_KEY: &str = "status-code";
pub const STATUS_DESCRIPTION_KEY: &str = "status-description";

/// Sends put-token requests to the service's CBS node
pub struct CbsSenderLink {
    link: SenderLink,
    credential: Arc<dyn TokenCredential>,
    token_type: TokenType,
    audience: String,
}

impl CbsSenderLink {
    pub fn open(ctx: &mut ReactorContext, session: SessionId, client_version: &str, credential: Arc<dyn TokenCredential>, token_type: TokenType, audience: &str) -> anyhow::Result<CbsSenderLink> {
        Ok(CbsSenderLink {
            link: SenderLink::open(ctx, session, CBS_SENDER_LINK_NAME, CBS_ADDRESS, client_version)?,
            credential,
            token_type,
            audience: audience.to_string(),
        })
    }

    /// Fetches a fresh token - this blocks until the credential returns - and puts it to the
    ///  service under the given correlation id. Returns the token that was sent. A token that
    ///  has already expired is never sent.
    #[tracing::instrument(level = "debug", skip(self, ctx))]
    pub fn send_authentication_message(&mut self, ctx: &mut ReactorContext, correlation_id: Uuid) -> anyhow::Result<AccessToken> {
        let token = self.credential.get_token()?;
        if token.is_expired_at(ctx.clock.wall_clock()) {
            bail!("the credential returned a token that expired at {} (seconds since the epoch)", token.expiry_epoch_seconds());
        }
        let message = self.put_token_message(&token, correlation_id);

        if self.link.send_message_and_get_delivery_tag(ctx, &message).is_none() {
            bail!("failed to send the put-token request");
        }
        debug!("sent put-token request {} for audience {}", correlation_id, self.audience);
        Ok(token)
    }

    fn put_token_message(&self, token: &AccessToken, correlation_id: Uuid) -> AmqpMessage {
        let mut message = AmqpMessage {
            properties: MessageProperties {
                message_id: Some(correlation_id.to_string()),
                to: Some(CBS_ADDRESS.to_string()),
                reply_to: Some(CBS_REPLY_TO.to_string()),
                ..Default::default()
            },
            body: MessageBody::Value(token.token.clone()),
            ..Default::default()
        };
        message.set_application_property(OPERATION_KEY, PUT_TOKEN_OPERATION.into());
        message.set_application_property(TYPE_KEY, self.token_type.as_str().into());
        message.set_application_property(NAME_KEY, self.audience.as_str().into());
        message.set_application_property(EXPIRATION_KEY, PropertyValue::Long(token.expiry_epoch_seconds()));
        message
    }

    /// The service settles put-token requests on its own, so this only cleans up locally
    pub fn on_delivery_update(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) {
        if let Some((tag, outcome)) = self.link.on_delivery_update(ctx, delivery) {
            debug!("put-token request with tag {} settled by the service: {:?}", tag, outcome.map(|o| o.code()));
        }
    }
}

impl LinkEvents for CbsSenderLink {
    fn endpoint(&self) -> &LinkEndpoint {
        self.link.endpoint()
    }

    fn endpoint_mut(&mut self) -> &mut LinkEndpoint {
        self.link.endpoint_mut()
    }
}

/// The service's answer to the currently outstanding put-token request
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthenticationResponse {
    pub status: i32,
    pub description: String,
}

/// Receives put-token responses. Only a response to the most recent request is reported;
///  anything else is a leftover from a superseded cycle and is released without further effect.
pub struct CbsReceiverLink {
    link: ReceiverLink,
    expected_correlation_id: Option<Uuid>,
}

impl CbsReceiverLink {
    pub fn open(ctx: &mut ReactorContext, session: SessionId, client_version: &str) -> anyhow::Result<CbsReceiverLink> {
        Ok(CbsReceiverLink {
            link: ReceiverLink::open(ctx, session, CBS_RECEIVER_LINK_NAME, CBS_ADDRESS, client_version)?,
            expected_correlation_id: None,
        })
    }

    pub fn set_expected_correlation_id(&mut self, correlation_id: Uuid) {
        self.expected_correlation_id = Some(correlation_id);
    }

    pub fn credit(&self) -> u32 {
        self.link.credit()
    }

    pub fn on_delivery(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) -> Option<AuthenticationResponse> {
        let message = self.link.receive(ctx, delivery)?;

        let expected = self.expected_correlation_id.map(|id| id.to_string());
        let actual = message.properties.correlation_id.as_deref();
        if expected.is_none() || actual != expected.as_deref() {
            debug!("discarding put-token response with correlation id {:?}, expecting {:?}", actual, expected);
            self.link.settle(ctx, delivery.delivery, DeliveryOutcome::Released);
            return None;
        }

        // the response is accepted whatever its status says
        self.link.settle(ctx, delivery.delivery, DeliveryOutcome::Accepted);
        self.expected_correlation_id = None;

        let description = message.application_property(STATUS_DESCRIPTION_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let status = match message.application_property(STATUS_CODE_KEY).and_then(|v| v.as_i32()) {
            Some(status) => status,
            None => {
                warn!("put-token response {:?} has no status code", actual);
                0
            }
        };
        Some(AuthenticationResponse { status, description })
    }
}

impl LinkEvents for CbsReceiverLink {
    fn endpoint(&self) -> &LinkEndpoint {
        self.link.endpoint()
    }

    fn endpoint_mut(&mut self) -> &mut LinkEndpoint {
        self.link.endpoint_mut()
    }
}
