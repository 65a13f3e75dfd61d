use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};
use uuid::Uuid;
use crate::amqp::endpoint::LinkId;
use crate::amqp::event::DeliveryEvent;
use crate::auth::credential::{AccessToken, TokenCredential, TokenType};
use crate::error::IotHubError;
use crate::link::cbs::{CbsReceiverLink, CbsSenderLink};
use crate::link::LinkEvents;
use crate::reactor::timer::TimerTask;
use crate::reactor::ReactorContext;
use crate::session::{SessionEndpoint, SessionEvents};

/// the longest delay the renewal timer is ever scheduled with
pub const MAX_RENEWAL_DELAY: Duration = Duration::from_millis(i32::MAX as u64);
/// the shortest delay the renewal timer is ever scheduled with
pub const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

const SUCCESS_STATUS: i32 = 200;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CbsState {
    SessionOpening,
    LinksOpening,
    Authenticating,
    Authenticated,
    Reauthenticating,
    Closed,
    Failed,
}

/// What the connection learns from the CBS session
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthenticationEvent {
    /// the first token was accepted, application links can be opened
    Authenticated,
    /// a renewed token was accepted
    Renewed,
    /// authentication failed, the session is closing
    Failed(IotHubError),
}

/// Time until a token should be renewed: the given fraction of its remaining lifetime, clamped
///  to [MIN_RENEWAL_DELAY]..=[MAX_RENEWAL_DELAY]
pub fn renewal_delay(expires_on: SystemTime, now: SystemTime, renewal_factor: f64) -> Duration {
    let remaining = expires_on.duration_since(now)
        .unwrap_or(Duration::ZERO)
        .min(MAX_RENEWAL_DELAY * 2);
    remaining.mul_f64(renewal_factor)
        .clamp(MIN_RENEWAL_DELAY, MAX_RENEWAL_DELAY)
}

/// The session towards the service's `$cbs` node. It puts a token as soon as both of its links
///  are attached, and puts a fresh one whenever the renewal timer fires.
pub struct CbsSessionHandler {
    session: SessionEndpoint,
    sender: CbsSenderLink,
    receiver: CbsReceiverLink,
    state: CbsState,
    has_authenticated: bool,
    current_correlation_id: Option<Uuid>,
    current_token: Option<AccessToken>,
    renewal_factor: f64,
}

impl CbsSessionHandler {
    pub fn open(ctx: &mut ReactorContext, credential: Arc<dyn TokenCredential>, token_type: TokenType, audience: &str, client_version: &str, renewal_factor: f64) -> anyhow::Result<CbsSessionHandler> {
        let session = SessionEndpoint::open(ctx)?;
        debug!("opening CBS {}", session.id);
        let sender = CbsSenderLink::open(ctx, session.id, client_version, credential, token_type, audience)?;
        let receiver = CbsReceiverLink::open(ctx, session.id, client_version)?;

        Ok(CbsSessionHandler {
            session,
            sender,
            receiver,
            state: CbsState::SessionOpening,
            has_authenticated: false,
            current_correlation_id: None,
            current_token: None,
            renewal_factor,
        })
    }

    pub fn state(&self) -> CbsState {
        self.state
    }

    pub fn link_ids(&self) -> [LinkId; 2] {
        [self.sender.endpoint().id, self.receiver.endpoint().id]
    }

    pub fn current_correlation_id(&self) -> Option<Uuid> {
        self.current_correlation_id
    }

    pub fn current_token(&self) -> Option<&AccessToken> {
        self.current_token.as_ref()
    }

    pub fn on_session_remote_open(&mut self) {
        self.on_remote_open();
        if self.state == CbsState::SessionOpening {
            self.state = CbsState::LinksOpening;
        }
    }

    /// Authentication starts when the second of the two links is attached, whichever it is
    pub fn on_link_remote_open(&mut self, ctx: &mut ReactorContext, link: LinkId) -> Option<AuthenticationEvent> {
        if let Some(l) = self.link_mut(link) {
            l.on_remote_open(ctx);
        }

        let both_open = self.sender.endpoint().states.is_remotely_active() && self.receiver.endpoint().states.is_remotely_active();
        let waiting = matches!(self.state, CbsState::SessionOpening | CbsState::LinksOpening);
        if both_open && waiting {
            self.authenticate(ctx)
        }
        else {
            None
        }
    }

    /// Starts an authentication cycle: puts a fresh token under a fresh correlation id, and
    ///  schedules the next cycle based on that token's expiry
    pub fn authenticate(&mut self, ctx: &mut ReactorContext) -> Option<AuthenticationEvent> {
        let correlation_id = Uuid::new_v4();
        self.receiver.set_expected_correlation_id(correlation_id);
        self.current_correlation_id = Some(correlation_id);
        self.state = if self.has_authenticated { CbsState::Reauthenticating } else { CbsState::Authenticating };

        match self.sender.send_authentication_message(ctx, correlation_id) {
            Ok(token) => {
                let delay = renewal_delay(token.expires_on, ctx.clock.wall_clock(), self.renewal_factor);
                debug!("authentication request {} sent, renewing in {:?}", correlation_id, delay);
                ctx.timers.cancel(TimerTask::CbsRenewal);
                ctx.schedule(delay, TimerTask::CbsRenewal);
                self.current_token = Some(token);
                None
            }
            Err(e) => {
                self.fail(ctx, IotHubError::Unauthorized(format!("failed to send authentication request: {:#}", e)))
            }
        }
    }

    /// A renewal that comes due while a request is outstanding waits for its response instead
    ///  of superseding it
    pub fn on_renewal_timer(&mut self, ctx: &mut ReactorContext) -> Option<AuthenticationEvent> {
        match self.state {
            CbsState::Authenticated => {
                info!("renewing CBS token");
                self.authenticate(ctx)
            }
            CbsState::Authenticating | CbsState::Reauthenticating => {
                debug!("authentication request {:?} is still outstanding, deferring renewal", self.current_correlation_id);
                ctx.schedule(MIN_RENEWAL_DELAY, TimerTask::CbsRenewal);
                None
            }
            state => {
                debug!("ignoring renewal timer in state {:?}", state);
                None
            }
        }
    }

    pub fn on_delivery(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) -> Option<AuthenticationEvent> {
        if delivery.link == self.sender.endpoint().id {
            self.sender.on_delivery_update(ctx, delivery);
            return None;
        }

        let response = self.receiver.on_delivery(ctx, delivery)?;
        self.handle_authentication_response(ctx, response.status, &response.description)
    }

    /// Called for the response to the outstanding request only - stale responses are filtered
    ///  out by the receiver link
    pub fn handle_authentication_response(&mut self, ctx: &mut ReactorContext, status: i32, description: &str) -> Option<AuthenticationEvent> {
        if matches!(self.state, CbsState::Closed | CbsState::Failed) {
            debug!("ignoring authentication response in state {:?}", self.state);
            return None;
        }
        self.current_correlation_id = None;

        if status != SUCCESS_STATUS {
            error!("authentication failed with status {}: {}", status, description);
            return self.fail(ctx, IotHubError::AuthenticationFailed { status, description: description.to_string() });
        }

        self.state = CbsState::Authenticated;
        if self.has_authenticated {
            debug!("CBS token renewed");
            Some(AuthenticationEvent::Renewed)
        }
        else {
            info!("authenticated via CBS");
            self.has_authenticated = true;
            Some(AuthenticationEvent::Authenticated)
        }
    }

    fn fail(&mut self, ctx: &mut ReactorContext, error: IotHubError) -> Option<AuthenticationEvent> {
        self.close(ctx);
        self.state = CbsState::Failed;
        Some(AuthenticationEvent::Failed(error))
    }
}

impl SessionEvents for CbsSessionHandler {
    fn session(&self) -> &SessionEndpoint {
        &self.session
    }

    fn session_mut(&mut self) -> &mut SessionEndpoint {
        &mut self.session
    }

    fn link_mut(&mut self, link: LinkId) -> Option<&mut dyn LinkEvents> {
        if link == self.sender.endpoint().id {
            Some(&mut self.sender)
        }
        else if link == self.receiver.endpoint().id {
            Some(&mut self.receiver)
        }
        else {
            None
        }
    }

    fn close(&mut self, ctx: &mut ReactorContext) {
        ctx.timers.cancel(TimerTask::CbsRenewal);
        self.sender.endpoint_mut().close(ctx);
        self.receiver.endpoint_mut().close(ctx);
        self.session.close(ctx);
        if self.state != CbsState::Failed {
            self.state = CbsState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::amqp::endpoint::EndpointState;
    use crate::amqp::message::{AmqpMessage, MessageProperties, PropertyValue};
    use crate::amqp::outcome::DeliveryOutcome;
    use crate::auth::credential::MockTokenCredential;
    use crate::auth::sas::FixedSasCredential;
    use crate::link::cbs::{CBS_RECEIVER_LINK_NAME, CBS_SENDER_LINK_NAME, STATUS_CODE_KEY};
    use crate::reactor::clock::Clock;
    use crate::test_util::credential::FixedTokenCredential;
    use crate::test_util::engine::{EngineCall, TestReactor};

    const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

    fn open_handler(reactor: &mut TestReactor) -> CbsSessionHandler {
        let credential = FixedTokenCredential::valid_for(reactor.clock.clone(), TOKEN_LIFETIME);
        CbsSessionHandler::open(&mut reactor.ctx(), Arc::new(credential), TokenType::JsonWebToken, "myhub.azure-devices.net", "test/1", 0.85).unwrap()
    }

    fn put_token_requests(reactor: &TestReactor, handler: &CbsSessionHandler) -> Vec<AmqpMessage> {
        reactor.engine.sent_messages(handler.sender.endpoint().id).into_iter()
            .map(|(_, m)| m)
            .collect()
    }

    fn response(correlation_id: Uuid, status: i32) -> AmqpMessage {
        let mut message = AmqpMessage {
            properties: MessageProperties {
                correlation_id: Some(correlation_id.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        message.set_application_property(STATUS_CODE_KEY, PropertyValue::Int(status));
        message
    }

    fn open_both_links(reactor: &mut TestReactor, handler: &mut CbsSessionHandler) -> Option<AuthenticationEvent> {
        let [sender, receiver] = handler.link_ids();
        handler.on_session_remote_open();
        assert_eq!(handler.on_link_remote_open(&mut reactor.ctx(), sender), None);
        handler.on_link_remote_open(&mut reactor.ctx(), receiver)
    }

    fn respond(reactor: &mut TestReactor, handler: &mut CbsSessionHandler, correlation_id: Uuid, status: i32) -> Option<AuthenticationEvent> {
        let delivery = reactor.engine.incoming_message(handler.receiver.endpoint().id, &response(correlation_id, status));
        handler.on_delivery(&mut reactor.ctx(), &delivery)
    }

    #[test]
    fn test_open_creates_well_known_links() {
        let mut reactor = TestReactor::manual();
        let handler = open_handler(&mut reactor);

        let [sender, receiver] = handler.link_ids();
        assert_eq!(reactor.engine.link_spec(sender).unwrap().name, CBS_SENDER_LINK_NAME);
        assert_eq!(reactor.engine.link_spec(receiver).unwrap().name, CBS_RECEIVER_LINK_NAME);
        assert_eq!(reactor.engine.flows(receiver), vec![1]);
        assert_eq!(handler.state(), CbsState::SessionOpening);
    }

    #[rstest]
    #[case::sender_first(0, 1)]
    #[case::receiver_first(1, 0)]
    fn test_authentication_waits_for_both_links(#[case] first: usize, #[case] second: usize) {
        let mut reactor = TestReactor::manual();
        let mut handler = open_handler(&mut reactor);
        let links = handler.link_ids();
        handler.on_session_remote_open();

        assert_eq!(handler.on_link_remote_open(&mut reactor.ctx(), links[first]), None);
        assert!(put_token_requests(&reactor, &handler).is_empty());
        assert_eq!(handler.state(), CbsState::LinksOpening);

        handler.on_link_remote_open(&mut reactor.ctx(), links[second]);
        assert_eq!(put_token_requests(&reactor, &handler).len(), 1);
        assert_eq!(handler.state(), CbsState::Authenticating);

        // a repeated notification is no new transition
        handler.on_link_remote_open(&mut reactor.ctx(), links[second]);
        assert_eq!(put_token_requests(&reactor, &handler).len(), 1);
    }

    #[test]
    fn test_successful_authentication_and_renewal() {
        let mut reactor = TestReactor::manual();
        let mut handler = open_handler(&mut reactor);
        open_both_links(&mut reactor, &mut handler);

        let first_id = handler.current_correlation_id().unwrap();
        assert_eq!(respond(&mut reactor, &mut handler, first_id, 200), Some(AuthenticationEvent::Authenticated));
        assert_eq!(handler.state(), CbsState::Authenticated);

        assert_eq!(handler.on_renewal_timer(&mut reactor.ctx()), None);
        assert_eq!(handler.state(), CbsState::Reauthenticating);
        let second_id = handler.current_correlation_id().unwrap();
        assert_ne!(first_id, second_id);

        assert_eq!(respond(&mut reactor, &mut handler, second_id, 200), Some(AuthenticationEvent::Renewed));
        assert_eq!(handler.state(), CbsState::Authenticated);

        let requests = put_token_requests(&reactor, &handler);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].properties.message_id, Some(first_id.to_string()));
        assert_eq!(requests[1].properties.message_id, Some(second_id.to_string()));
    }

    #[test]
    fn test_stale_response_is_discarded() {
        let mut reactor = TestReactor::manual();
        let mut handler = open_handler(&mut reactor);
        open_both_links(&mut reactor, &mut handler);
        let first_id = handler.current_correlation_id().unwrap();
        assert_eq!(respond(&mut reactor, &mut handler, first_id, 200), Some(AuthenticationEvent::Authenticated));

        handler.on_renewal_timer(&mut reactor.ctx());
        let second_id = handler.current_correlation_id().unwrap();
        assert_ne!(first_id, second_id);

        // a late duplicate answer to the first cycle
        let delivery = reactor.engine.incoming_message(handler.receiver.endpoint().id, &response(first_id, 401));
        assert_eq!(handler.on_delivery(&mut reactor.ctx(), &delivery), None);
        assert!(reactor.engine.calls().contains(&EngineCall::Settle { delivery: delivery.delivery, outcome: Some(DeliveryOutcome::Released) }));
        assert_eq!(handler.state(), CbsState::Reauthenticating);
        assert_eq!(handler.current_correlation_id(), Some(second_id));

        assert_eq!(respond(&mut reactor, &mut handler, second_id, 200), Some(AuthenticationEvent::Renewed));
    }

    #[test]
    fn test_renewal_waits_for_outstanding_request() {
        let mut reactor = TestReactor::manual();
        let mut handler = open_handler(&mut reactor);
        open_both_links(&mut reactor, &mut handler);
        let id = handler.current_correlation_id().unwrap();
        reactor.timers.cancel(TimerTask::CbsRenewal);

        assert_eq!(handler.on_renewal_timer(&mut reactor.ctx()), None);
        assert_eq!(put_token_requests(&reactor, &handler).len(), 1);
        assert_eq!(handler.current_correlation_id(), Some(id));
        assert_eq!(handler.state(), CbsState::Authenticating);
        assert_eq!(reactor.timers.next_deadline(), Some(reactor.clock.now() + MIN_RENEWAL_DELAY));

        // the deferred timer renews once the response is in
        assert_eq!(respond(&mut reactor, &mut handler, id, 200), Some(AuthenticationEvent::Authenticated));
        assert_eq!(handler.on_renewal_timer(&mut reactor.ctx()), None);
        assert_eq!(put_token_requests(&reactor, &handler).len(), 2);
        assert_eq!(handler.state(), CbsState::Reauthenticating);
    }

    #[test]
    fn test_expired_token_fails_authentication() {
        let mut reactor = TestReactor::manual();
        let credential = FixedSasCredential::new("SharedAccessSignature sr=myhub.azure-devices.net&sig=x&se=1").unwrap();
        let mut handler = CbsSessionHandler::open(&mut reactor.ctx(), Arc::new(credential), TokenType::SharedAccessSignature, "myhub.azure-devices.net", "test/1", 0.85).unwrap();

        let event = open_both_links(&mut reactor, &mut handler);
        assert!(matches!(event, Some(AuthenticationEvent::Failed(IotHubError::Unauthorized(_)))));
        assert_eq!(handler.state(), CbsState::Failed);
        assert!(put_token_requests(&reactor, &handler).is_empty());
        assert!(!reactor.timers.is_scheduled(TimerTask::CbsRenewal));
    }

    #[test]
    fn test_failed_authentication_closes_session() {
        let mut reactor = TestReactor::manual();
        let mut handler = open_handler(&mut reactor);
        open_both_links(&mut reactor, &mut handler);
        let id = handler.current_correlation_id().unwrap();

        let delivery = reactor.engine.incoming_message(handler.receiver.endpoint().id, &response(id, 401));
        let event = handler.on_delivery(&mut reactor.ctx(), &delivery);

        assert!(matches!(event, Some(AuthenticationEvent::Failed(IotHubError::AuthenticationFailed { status: 401, .. }))));
        // the response itself is accepted
        assert!(reactor.engine.calls().contains(&EngineCall::Settle { delivery: delivery.delivery, outcome: Some(DeliveryOutcome::Accepted) }));
        assert_eq!(handler.state(), CbsState::Failed);
        assert_eq!(handler.session().states.local, EndpointState::Closed);
        let [sender, receiver] = handler.link_ids();
        assert!(reactor.engine.calls().contains(&EngineCall::CloseLink(sender)));
        assert!(reactor.engine.calls().contains(&EngineCall::CloseLink(receiver)));
        assert!(!reactor.timers.is_scheduled(TimerTask::CbsRenewal));
    }

    #[test]
    fn test_credential_failure_fails_authentication() {
        let mut reactor = TestReactor::manual();
        let mut credential = MockTokenCredential::new();
        credential.expect_get_token()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("no token for you")));
        let mut handler = CbsSessionHandler::open(&mut reactor.ctx(), Arc::new(credential), TokenType::JsonWebToken, "hub", "test/1", 0.85).unwrap();

        let event = open_both_links(&mut reactor, &mut handler);
        assert!(matches!(event, Some(AuthenticationEvent::Failed(IotHubError::Unauthorized(_)))));
        assert_eq!(handler.state(), CbsState::Failed);
    }

    #[test]
    fn test_renewal_is_scheduled_from_token_expiry() {
        let mut reactor = TestReactor::manual();
        let mut handler = open_handler(&mut reactor);
        let start = reactor.clock.now();
        open_both_links(&mut reactor, &mut handler);

        let expected = start + TOKEN_LIFETIME.mul_f64(0.85);
        assert_eq!(reactor.timers.next_deadline(), Some(expected));
        assert!(reactor.timers.pop_due(expected - Duration::from_millis(1)).is_empty());
        assert_eq!(reactor.timers.pop_due(expected), vec![TimerTask::CbsRenewal]);
    }

    #[rstest]
    #[case::regular(Duration::from_secs(1000), Duration::from_secs(850))]
    #[case::expired(Duration::ZERO, MIN_RENEWAL_DELAY)]
    #[case::almost_expired(Duration::from_millis(100), MIN_RENEWAL_DELAY)]
    #[case::clamped(Duration::from_secs(365 * 24 * 3600), MAX_RENEWAL_DELAY)]
    #[case::far_future(Duration::from_secs(u32::MAX as u64 * 1000), MAX_RENEWAL_DELAY)]
    fn test_renewal_delay(#[case] remaining: Duration, #[case] expected: Duration) {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        assert_eq!(renewal_delay(now + remaining, now, 0.85), expected);
    }

    #[test]
    fn test_renewal_delay_for_token_expired_in_the_past() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        assert_eq!(renewal_delay(now - Duration::from_secs(10), now, 0.85), MIN_RENEWAL_DELAY);
    }
}
