use std::collections::VecDeque;
use std::sync::Arc;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, trace, warn};
use crate::amqp::endpoint::{CloseAction, EndpointState, EndpointStates, LinkId, SessionId};
use crate::amqp::event::{DeliveryEvent, Event};
use crate::amqp::outcome::ErrorCondition;
use crate::config::{ApplicationLinkKind, Authentication, ConnectionConfig, WEBSOCKET_PATH, WEBSOCKET_SUB_PROTOCOL};
use crate::connection::verification::{verify_connection_was_opened, OpenProgress};
use crate::error::{ErrorContext, ErrorProcessor, IotHubError};
use crate::link::cloud_to_device::PendingSend;
use crate::reactor::timer::TimerTask;
use crate::reactor::{invoke_application_callback, ReactorContext};
use crate::response_verification::error_from_condition;
use crate::session::application_session::{ApplicationProcessors, ApplicationSession};
use crate::session::cbs_session::{AuthenticationEvent, CbsSessionHandler};
use crate::session::SessionEvents;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Unbound,
    /// SASL and TLS are negotiating
    Bound,
    AuthenticationPending,
    Authenticated,
    LinksOpening,
    Ready,
    Closing,
    Closed,
}

/// Application code the connection calls back into. It runs on the reactor thread.
#[derive(Clone, Default)]
pub struct ConnectionCallbacks {
    pub processors: ApplicationProcessors,
    pub error_processor: Option<ErrorProcessor>,
    /// called once when all application links are open
    pub on_opened: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Which handler owns a session or link
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum EndpointOwner {
    Cbs,
    Application,
}

/// The root state machine of a connection. The reactor feeds it engine events, timer
///  expirations and application commands; it dispatches them to the CBS and application
///  sessions through explicit tables keyed by session and link id.
pub struct AmqpConnectionHandler {
    config: Arc<ConnectionConfig>,
    callbacks: ConnectionCallbacks,
    state: ConnectionState,
    states: EndpointStates,
    transport_configured: bool,
    cbs: Option<CbsSessionHandler>,
    application: Option<ApplicationSession>,
    sessions: FxHashMap<SessionId, EndpointOwner>,
    links: FxHashMap<LinkId, EndpointOwner>,
    progress: OpenProgress,
    failure: Option<IotHubError>,
    /// sends that arrive before the application session exists
    waiting_sends: VecDeque<PendingSend>,
    finished: bool,
}

impl AmqpConnectionHandler {
    pub fn new(config: Arc<ConnectionConfig>, callbacks: ConnectionCallbacks) -> anyhow::Result<AmqpConnectionHandler> {
        config.validate()?;
        for kind in &config.application_links {
            let registered = match kind {
                ApplicationLinkKind::CloudToDeviceSender => true,
                ApplicationLinkKind::FeedbackReceiver => callbacks.processors.feedback.is_some(),
                ApplicationLinkKind::FileUploadNotificationReceiver => callbacks.processors.file_upload_notification.is_some(),
            };
            if !registered {
                bail!("{:?} is configured, but there is no processor for it", kind);
            }
        }

        Ok(AmqpConnectionHandler {
            config,
            callbacks,
            state: ConnectionState::Unbound,
            states: EndpointStates::default(),
            transport_configured: false,
            cbs: None,
            application: None,
            sessions: FxHashMap::default(),
            links: FxHashMap::default(),
            progress: OpenProgress::default(),
            failure: None,
            waiting_sends: VecDeque::new(),
            finished: false,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The reactor stops once this is true: the connection is closed on both sides, or the
    ///  transport is gone
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn cbs_session(&self) -> Option<&CbsSessionHandler> {
        self.cbs.as_ref()
    }

    /// Gives up on the connection without waiting for the engine: everything not yet delivered
    ///  is failed. Used when the reactor stops before the close cascade completed.
    pub fn abort(&mut self) {
        if !self.finished {
            warn!("aborting connection to {} in state {:?}", self.config.host_name, self.state);
        }
        self.finish();
    }

    pub fn verify_connection_was_opened(&self) -> Result<(), IotHubError> {
        verify_connection_was_opened(&self.progress, self.failure.as_ref())
    }

    /// Creates the transport binding. SASL, TLS and WebSocket framing are configured when the
    ///  engine reports the binding.
    pub fn open(&mut self, ctx: &mut ReactorContext) -> anyhow::Result<()> {
        let port = self.config.protocol.port();
        info!("opening connection to {}:{}", self.config.host_name, port);

        if let Err(e) = ctx.engine.open_connection(&self.config.host_name, port) {
            self.failure = Some(IotHubError::Transport(format!("failed to open connection: {:#}", e)));
            self.finish();
            return Err(e);
        }
        self.states.on_local_open();
        Ok(())
    }

    /// Closes the connection, after closing all of its sessions and links
    pub fn close(&mut self, ctx: &mut ReactorContext) {
        if !self.states.is_locally_active() {
            return;
        }
        info!("closing connection to {}", self.config.host_name);
        self.state = ConnectionState::Closing;

        if let Some(application) = self.application.as_mut() {
            application.close(ctx);
        }
        if let Some(cbs) = self.cbs.as_mut() {
            cbs.close(ctx);
        }
        ctx.timers.cancel(TimerTask::CloudToDeviceSend);
        ctx.timers.cancel(TimerTask::CbsRenewal);

        self.states.close_locally();
        ctx.engine.close_connection(None);
    }

    /// Queues a cloud-to-device message. It is failed right away if the connection can not
    ///  deliver it anymore.
    pub fn enqueue(&mut self, pending: PendingSend) {
        if !self.config.application_links.contains(&ApplicationLinkKind::CloudToDeviceSender) {
            pending.fail(IotHubError::NotAllowed("the connection has no cloud-to-device link".to_string()));
            return;
        }
        if self.finished || matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            pending.fail(IotHubError::ConnectionClosed("the connection is closed".to_string()));
            return;
        }

        match self.application.as_mut() {
            Some(application) => application.enqueue(pending),
            None => self.waiting_sends.push_back(pending),
        }
    }

    pub fn on_timer(&mut self, ctx: &mut ReactorContext, task: TimerTask) {
        trace!("timer {:?} fired", task);
        match task {
            TimerTask::CbsRenewal => {
                let event = match self.cbs.as_mut() {
                    Some(cbs) => cbs.on_renewal_timer(ctx),
                    None => None,
                };
                self.on_authentication_event(ctx, event);
            }
            TimerTask::CloudToDeviceSend => {
                if let Some(application) = self.application.as_mut() {
                    application.on_send_timer(ctx);
                }
            }
        }
    }

    pub fn on_event(&mut self, ctx: &mut ReactorContext, event: Event) {
        trace!("event {:?}", event);
        match event {
            Event::ConnectionBound => self.on_connection_bound(ctx),
            Event::ConnectionRemoteOpen => self.on_connection_remote_open(ctx),
            Event::ConnectionLocalClose => self.on_connection_local_close(),
            Event::ConnectionRemoteClose { error } => self.on_connection_remote_close(ctx, error),
            Event::SessionRemoteOpen(session) => self.on_session_remote_open(ctx, session),
            Event::SessionLocalClose(session) => self.on_session_local_close(ctx, session),
            Event::SessionRemoteClose { session, error } => self.on_session_remote_close(ctx, session, error),
            Event::LinkRemoteOpen(link) => self.on_link_remote_open(ctx, link),
            Event::LinkLocalClose(link) => self.on_link_local_close(ctx, link),
            Event::LinkRemoteClose { link, error } => self.on_link_remote_close(ctx, link, error),
            Event::LinkFlow { link, credit } => trace!("{} has {} credit", link, credit),
            Event::Delivery(delivery) => self.on_delivery(ctx, &delivery),
            Event::TransportError(condition) => self.fail(ctx, IotHubError::Transport(condition.describe())),
            Event::TransportClosed => self.on_transport_closed(),
        }
    }

    /// Configures the transport, once per physical connection attempt. WebSocket framing goes in
    ///  first because it sits beneath SASL.
    fn on_connection_bound(&mut self, ctx: &mut ReactorContext) {
        if self.transport_configured {
            debug!("transport is already configured - ignoring repeated bound notification");
            return;
        }
        self.transport_configured = true;
        self.state = ConnectionState::Bound;

        let config = self.config.clone();
        if config.protocol.uses_websocket() {
            ctx.engine.add_websocket_layer(&config.host_name, WEBSOCKET_PATH, WEBSOCKET_SUB_PROTOCOL);
            if let Some(proxy) = &config.proxy {
                ctx.engine.configure_proxy(proxy);
            }
        }

        match &config.authentication {
            Authentication::SaslPlain { user_name, sas_token } => ctx.engine.configure_sasl_plain(user_name, sas_token),
            Authentication::Cbs { .. } => ctx.engine.configure_sasl_anonymous(),
        }

        if let Err(e) = ctx.engine.configure_tls(&config.tls) {
            self.fail(ctx, IotHubError::Transport(format!("failed to configure TLS: {:#}", e)));
        }
    }

    fn on_connection_remote_open(&mut self, ctx: &mut ReactorContext) {
        debug!("connection opened remotely");
        self.progress.connection_opened_remotely = true;
        self.states.on_remote_open();
        if !self.states.is_locally_active() {
            return;
        }

        let config = self.config.clone();
        match &config.authentication {
            Authentication::Cbs { credential, token_type } => {
                match CbsSessionHandler::open(ctx, credential.clone(), *token_type, &config.host_name, &config.client_version, config.token_renewal_factor) {
                    Ok(cbs) => {
                        self.sessions.insert(cbs.session().id, EndpointOwner::Cbs);
                        for link in cbs.link_ids() {
                            self.links.insert(link, EndpointOwner::Cbs);
                        }
                        self.cbs = Some(cbs);
                        self.state = ConnectionState::AuthenticationPending;
                    }
                    Err(e) => self.fail(ctx, IotHubError::Transport(format!("failed to open the CBS session: {:#}", e))),
                }
            }
            Authentication::SaslPlain { .. } => {
                // SASL PLAIN has authenticated the connection during the handshake
                self.state = ConnectionState::Authenticated;
                self.open_application_session(ctx);
            }
        }
    }

    fn open_application_session(&mut self, ctx: &mut ReactorContext) {
        self.state = ConnectionState::LinksOpening;

        let config = self.config.clone();
        match ApplicationSession::open(ctx, &config, &self.callbacks.processors) {
            Ok(mut application) => {
                self.sessions.insert(application.session().id, EndpointOwner::Application);
                for link in application.link_ids() {
                    self.links.insert(link, EndpointOwner::Application);
                }
                for pending in self.waiting_sends.drain(..) {
                    application.enqueue(pending);
                }
                self.application = Some(application);
            }
            Err(e) => self.fail(ctx, IotHubError::Transport(format!("failed to open the application session: {:#}", e))),
        }
    }

    fn on_authentication_event(&mut self, ctx: &mut ReactorContext, event: Option<AuthenticationEvent>) {
        match event {
            None => {}
            Some(AuthenticationEvent::Authenticated) => {
                if self.state == ConnectionState::AuthenticationPending {
                    self.state = ConnectionState::Authenticated;
                    self.open_application_session(ctx);
                }
            }
            Some(AuthenticationEvent::Renewed) => debug!("CBS token renewed"),
            Some(AuthenticationEvent::Failed(error)) => self.fail(ctx, error),
        }
    }

    fn check_ready(&mut self) {
        let open = self.application.as_ref()
            .map(|a| a.is_open())
            .unwrap_or(false);
        if self.state != ConnectionState::LinksOpening || !open {
            return;
        }

        info!("connection to {} is ready", self.config.host_name);
        self.state = ConnectionState::Ready;
        self.progress.link_opened_remotely = true;
        if let Some(on_opened) = self.callbacks.on_opened.clone() {
            invoke_application_callback("connection opened", move || on_opened());
        }
    }

    fn on_session_remote_open(&mut self, _ctx: &mut ReactorContext, session: SessionId) {
        self.progress.session_opened_remotely = true;
        match self.sessions.get(&session).copied() {
            Some(EndpointOwner::Cbs) => {
                if let Some(cbs) = self.cbs.as_mut() {
                    cbs.on_session_remote_open();
                }
            }
            Some(EndpointOwner::Application) => {
                if let Some(application) = self.application.as_mut() {
                    application.on_remote_open();
                }
                self.check_ready();
            }
            None => warn!("remote open of unknown {}", session),
        }
    }

    fn session_events(&mut self, session: SessionId) -> Option<&mut dyn SessionEvents> {
        match self.sessions.get(&session).copied()? {
            EndpointOwner::Cbs => self.cbs.as_mut().map(|s| s as &mut dyn SessionEvents),
            EndpointOwner::Application => self.application.as_mut().map(|s| s as &mut dyn SessionEvents),
        }
    }

    fn on_session_local_close(&mut self, ctx: &mut ReactorContext, session: SessionId) {
        let action = match self.session_events(session) {
            Some(s) => s.on_local_close(ctx),
            None => return,
        };
        if action == CloseAction::CloseParent {
            self.close(ctx);
        }
    }

    fn on_session_remote_close(&mut self, ctx: &mut ReactorContext, session: SessionId, error: Option<ErrorCondition>) {
        self.remember_remote_error(error.as_ref());
        let action = match self.session_events(session) {
            Some(s) => s.on_remote_close(ctx, error.as_ref()),
            None => return,
        };
        if action == CloseAction::CloseParent {
            self.close(ctx);
        }
    }

    fn on_link_remote_open(&mut self, ctx: &mut ReactorContext, link: LinkId) {
        match self.links.get(&link).copied() {
            Some(EndpointOwner::Cbs) => {
                let event = match self.cbs.as_mut() {
                    Some(cbs) => cbs.on_link_remote_open(ctx, link),
                    None => None,
                };
                self.on_authentication_event(ctx, event);
            }
            Some(EndpointOwner::Application) => {
                self.progress.link_opened_remotely = true;
                if let Some(application) = self.application.as_mut() {
                    application.on_link_remote_open(ctx, link);
                }
                self.check_ready();
            }
            None => warn!("remote open of unknown {}", link),
        }
    }

    fn link_owner(&mut self, link: LinkId) -> Option<&mut dyn SessionEvents> {
        match self.links.get(&link).copied()? {
            EndpointOwner::Cbs => self.cbs.as_mut().map(|s| s as &mut dyn SessionEvents),
            EndpointOwner::Application => self.application.as_mut().map(|s| s as &mut dyn SessionEvents),
        }
    }

    fn on_link_local_close(&mut self, ctx: &mut ReactorContext, link: LinkId) {
        if let Some(session) = self.link_owner(link) {
            session.on_link_local_close(ctx, link);
        }
    }

    fn on_link_remote_close(&mut self, ctx: &mut ReactorContext, link: LinkId, error: Option<ErrorCondition>) {
        self.remember_remote_error(error.as_ref());
        if let Some(session) = self.link_owner(link) {
            session.on_link_remote_close(ctx, link, error.as_ref());
        }
    }

    fn on_delivery(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) {
        match self.links.get(&delivery.link).copied() {
            Some(EndpointOwner::Cbs) => {
                let event = match self.cbs.as_mut() {
                    Some(cbs) => cbs.on_delivery(ctx, delivery),
                    None => None,
                };
                self.on_authentication_event(ctx, event);
            }
            Some(EndpointOwner::Application) => {
                if let Some(application) = self.application.as_mut() {
                    application.on_delivery(ctx, delivery);
                }
            }
            None => warn!("delivery on unknown {} - ignoring", delivery.link),
        }
    }

    fn on_connection_local_close(&mut self) {
        debug!("connection closed locally");
        if self.states.on_local_close() == CloseAction::CloseParent {
            self.finish();
        }
    }

    fn on_connection_remote_close(&mut self, ctx: &mut ReactorContext, error: Option<ErrorCondition>) {
        self.remember_remote_error(error.as_ref());

        if self.states.is_locally_active() {
            let error = match &error {
                Some(condition) => error_from_condition(condition),
                None => IotHubError::ConnectionClosed("the service closed the connection".to_string()),
            };
            warn!("connection closed remotely while in use: {}", error);
            self.report_error(error);
        }
        else {
            debug!("connection closed remotely");
        }

        match self.states.on_remote_close() {
            CloseAction::CloseLocally => self.close(ctx),
            CloseAction::CloseParent => self.finish(),
            CloseAction::Nothing => {}
        }
    }

    fn on_transport_closed(&mut self) {
        if !self.states.is_fully_closed() && self.state != ConnectionState::Closing {
            warn!("transport to {} closed unexpectedly", self.config.host_name);
            if self.failure.is_none() {
                self.failure = Some(IotHubError::Transport("the transport was closed".to_string()));
            }
        }
        self.states.local = EndpointState::Closed;
        self.states.remote = EndpointState::Closed;
        self.finish();
    }

    /// An error condition that the service attached to a close is the best explanation for
    ///  a failed open, so the first one is kept
    fn remember_remote_error(&mut self, error: Option<&ErrorCondition>) {
        if let Some(condition) = error {
            if self.failure.is_none() && self.state != ConnectionState::Closing {
                self.failure = Some(error_from_condition(condition));
            }
        }
    }

    /// Fatal errors: report, remember and close the connection
    fn fail(&mut self, ctx: &mut ReactorContext, error: IotHubError) {
        error!("connection to {} failed: {}", self.config.host_name, error);
        if self.failure.is_none() {
            self.failure = Some(error.clone());
        }
        self.report_error(error);
        self.close(ctx);
    }

    fn report_error(&self, error: IotHubError) {
        if let Some(error_processor) = self.callbacks.error_processor.clone() {
            invoke_application_callback("error processor", move || error_processor(ErrorContext { error }));
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        info!("connection to {} is closed", self.config.host_name);
        self.state = ConnectionState::Closed;
        self.finished = true;

        if let Some(application) = self.application.as_mut() {
            application.fail_outstanding();
        }
        for pending in self.waiting_sends.drain(..) {
            pending.fail(IotHubError::ConnectionClosed("the connection was closed before the message was sent".to_string()));
        }
    }
}
