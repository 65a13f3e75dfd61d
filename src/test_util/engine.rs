use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use crate::amqp::endpoint::{ConnectionId, DeliveryId, LinkId, LinkSpec, SessionId};
use crate::amqp::engine::ProtocolEngine;
use crate::amqp::event::{DeliveryEvent, Event};
use crate::amqp::message::AmqpMessage;
use crate::amqp::outcome::{DeliveryOutcome, ErrorCondition};
use crate::config::{ProxyConfig, TlsConfig};
use crate::connection::handler::AmqpConnectionHandler;
use crate::reactor::clock::{Clock, ManualClock};
use crate::reactor::timer::TimerQueue;
use crate::reactor::ReactorContext;

/// A command that code under test issued to the [SimulatedEngine]
#[derive(Clone, Debug, PartialEq)]
pub enum EngineCall {
    OpenConnection { host_name: String, port: u16 },
    ConfigureSaslPlain { user_name: String },
    ConfigureSaslAnonymous,
    ConfigureTls { verify_peer: bool },
    AddWebSocketLayer { host_name: String, path: String, sub_protocol: String },
    ConfigureProxy { host_name: String, port: u16 },
    OpenSession(SessionId),
    OpenLink(LinkId),
    Flow { link: LinkId, credit: u32 },
    Send { link: LinkId, delivery: DeliveryId },
    Read(DeliveryId),
    Settle { delivery: DeliveryId, outcome: Option<DeliveryOutcome> },
    CloseLink(LinkId),
    CloseSession(SessionId),
    CloseConnection(Option<ErrorCondition>),
}

struct SentDelivery {
    delivery: DeliveryId,
    tag: Vec<u8>,
    message: AmqpMessage,
}

#[derive(Default)]
struct EngineState {
    /// the peer opens whatever is opened locally
    auto_open: bool,
    /// the peer answers every local close with a close of its own
    auto_close: bool,
    fail_sends: bool,
    next_id: u64,
    calls: Vec<EngineCall>,
    events: VecDeque<Event>,
    links: BTreeMap<LinkId, LinkSpec>,
    flows: BTreeMap<LinkId, Vec<u32>>,
    sent: BTreeMap<LinkId, Vec<SentDelivery>>,
    incoming: FxHashMap<DeliveryId, Vec<u8>>,
}

impl EngineState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// An in-memory [ProtocolEngine] that records every command and plays the peer's part. Clones
///  share their state, so a test can keep a handle to an engine that was moved into a reactor.
#[derive(Clone, Default)]
pub struct SimulatedEngine {
    state: Arc<Mutex<EngineState>>,
}

impl SimulatedEngine {
    /// an engine whose peer opens and closes everything it is asked to
    pub fn echoing() -> SimulatedEngine {
        let engine = SimulatedEngine::default();
        {
            let mut state = engine.lock();
            state.auto_open = true;
            state.auto_close = true;
        }
        engine
    }

    /// an engine whose peer does nothing unless a test pushes events explicitly
    pub fn silent() -> SimulatedEngine {
        SimulatedEngine::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fail_sends(&self, value: bool) {
        self.lock().fail_sends = value;
    }

    /// allocates a session id without any events, for tests of individual links
    pub fn open_session_for_test(&self) -> SessionId {
        SessionId(self.lock().next_id())
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn link_spec(&self, link: LinkId) -> Option<LinkSpec> {
        self.lock().links.get(&link).cloned()
    }

    pub fn link_by_name(&self, name: &str) -> Option<LinkId> {
        self.lock().links.iter()
            .find(|(_, spec)| spec.name == name)
            .map(|(id, _)| *id)
    }

    /// all credit grants on a link, in the order they were made
    pub fn flows(&self, link: LinkId) -> Vec<u32> {
        self.lock().flows.get(&link).cloned().unwrap_or_default()
    }

    /// delivery tags and decoded messages sent on a link
    pub fn sent_messages(&self, link: LinkId) -> Vec<(Vec<u8>, AmqpMessage)> {
        self.lock().sent.get(&link)
            .map(|sent| sent.iter().map(|s| (s.tag.clone(), s.message.clone())).collect())
            .unwrap_or_default()
    }

    pub fn push_event(&self, event: Event) {
        self.lock().events.push_back(event);
    }

    pub fn take_pending_events(&self) -> Vec<Event> {
        self.lock().events.drain(..).collect()
    }

    /// Makes a message available on a receiver link and returns the delivery event for it.
    ///  The event is not queued - tests either pass it to a link directly or use
    ///  [SimulatedEngine::deliver_message].
    pub fn incoming_message(&self, link: LinkId, message: &AmqpMessage) -> DeliveryEvent {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        self.incoming_raw(link, buf.to_vec())
    }

    pub fn incoming_raw(&self, link: LinkId, payload: Vec<u8>) -> DeliveryEvent {
        let mut state = self.lock();
        let delivery = DeliveryId(state.next_id());
        state.incoming.insert(delivery, payload);
        DeliveryEvent {
            link,
            delivery,
            tag: delivery.0.to_string().into_bytes(),
            readable: true,
            partial: false,
            remote_state: None,
            remotely_settled: false,
        }
    }

    /// queues an incoming message as a delivery event
    pub fn deliver_message(&self, link: LinkId, message: &AmqpMessage) -> DeliveryEvent {
        let delivery = self.incoming_message(link, message);
        self.push_event(Event::Delivery(delivery.clone()));
        delivery
    }

    /// The peer's settled disposition for a message that was sent with the given tag
    pub fn acknowledgement(&self, link: LinkId, tag: &[u8], outcome: DeliveryOutcome) -> DeliveryEvent {
        let delivery = self.lock().sent.get(&link)
            .and_then(|sent| sent.iter().find(|s| s.tag == tag))
            .map(|s| s.delivery);
        match delivery {
            Some(delivery) => DeliveryEvent {
                link,
                delivery,
                tag: tag.to_vec(),
                readable: false,
                partial: false,
                remote_state: Some(outcome),
                remotely_settled: true,
            },
            None => panic!("no message with tag {:?} was sent on {}", tag, link),
        }
    }
}

#[async_trait]
impl ProtocolEngine for SimulatedEngine {
    fn open_connection(&mut self, host_name: &str, port: u16) -> anyhow::Result<ConnectionId> {
        let mut state = self.lock();
        state.calls.push(EngineCall::OpenConnection { host_name: host_name.to_string(), port });
        state.events.push_back(Event::ConnectionBound);
        if state.auto_open {
            state.events.push_back(Event::ConnectionRemoteOpen);
        }
        Ok(ConnectionId(state.next_id()))
    }

    fn configure_sasl_plain(&mut self, user_name: &str, _password: &str) {
        self.lock().calls.push(EngineCall::ConfigureSaslPlain { user_name: user_name.to_string() });
    }

    fn configure_sasl_anonymous(&mut self) {
        self.lock().calls.push(EngineCall::ConfigureSaslAnonymous);
    }

    fn configure_tls(&mut self, tls: &TlsConfig) -> anyhow::Result<()> {
        self.lock().calls.push(EngineCall::ConfigureTls { verify_peer: tls.verify_peer });
        Ok(())
    }

    fn add_websocket_layer(&mut self, host_name: &str, path: &str, sub_protocol: &str) {
        self.lock().calls.push(EngineCall::AddWebSocketLayer {
            host_name: host_name.to_string(),
            path: path.to_string(),
            sub_protocol: sub_protocol.to_string(),
        });
    }

    fn configure_proxy(&mut self, proxy: &ProxyConfig) {
        self.lock().calls.push(EngineCall::ConfigureProxy { host_name: proxy.host.clone(), port: proxy.port });
    }

    fn open_session(&mut self) -> anyhow::Result<SessionId> {
        let mut state = self.lock();
        let session = SessionId(state.next_id());
        state.calls.push(EngineCall::OpenSession(session));
        if state.auto_open {
            state.events.push_back(Event::SessionRemoteOpen(session));
        }
        Ok(session)
    }

    fn open_link(&mut self, _session: SessionId, spec: &LinkSpec) -> anyhow::Result<LinkId> {
        let mut state = self.lock();
        let link = LinkId(state.next_id());
        state.links.insert(link, spec.clone());
        state.calls.push(EngineCall::OpenLink(link));
        if state.auto_open {
            state.events.push_back(Event::LinkRemoteOpen(link));
        }
        Ok(link)
    }

    fn flow(&mut self, link: LinkId, credit: u32) {
        let mut state = self.lock();
        state.calls.push(EngineCall::Flow { link, credit });
        state.flows.entry(link).or_default().push(credit);
    }

    fn send(&mut self, link: LinkId, delivery_tag: &[u8], payload: &[u8]) -> anyhow::Result<DeliveryId> {
        let mut state = self.lock();
        if state.fail_sends {
            bail!("simulated send failure");
        }
        let message = AmqpMessage::decode(payload)?;
        let delivery = DeliveryId(state.next_id());
        state.calls.push(EngineCall::Send { link, delivery });
        state.sent.entry(link).or_default().push(SentDelivery {
            delivery,
            tag: delivery_tag.to_vec(),
            message,
        });
        Ok(delivery)
    }

    fn read(&mut self, delivery: DeliveryId) -> anyhow::Result<Vec<u8>> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Read(delivery));
        match state.incoming.get(&delivery) {
            Some(payload) => Ok(payload.clone()),
            None => bail!("no readable delivery {:?}", delivery),
        }
    }

    fn settle(&mut self, delivery: DeliveryId, outcome: Option<DeliveryOutcome>) {
        let mut state = self.lock();
        state.incoming.remove(&delivery);
        state.calls.push(EngineCall::Settle { delivery, outcome });
    }

    fn close_link(&mut self, link: LinkId) {
        let mut state = self.lock();
        state.calls.push(EngineCall::CloseLink(link));
        state.events.push_back(Event::LinkLocalClose(link));
        if state.auto_close {
            state.events.push_back(Event::LinkRemoteClose { link, error: None });
        }
    }

    fn close_session(&mut self, session: SessionId) {
        let mut state = self.lock();
        state.calls.push(EngineCall::CloseSession(session));
        state.events.push_back(Event::SessionLocalClose(session));
        if state.auto_close {
            state.events.push_back(Event::SessionRemoteClose { session, error: None });
        }
    }

    fn close_connection(&mut self, error: Option<ErrorCondition>) {
        let mut state = self.lock();
        state.calls.push(EngineCall::CloseConnection(error));
        state.events.push_back(Event::ConnectionLocalClose);
        if state.auto_close {
            state.events.push_back(Event::ConnectionRemoteClose { error: None });
        }
    }

    async fn poll_events(&mut self, timeout: Duration) -> anyhow::Result<Vec<Event>> {
        let events = self.take_pending_events();
        if !events.is_empty() {
            return Ok(events);
        }
        tokio::time::sleep(timeout).await;
        Ok(self.take_pending_events())
    }
}

/// Everything a handler needs to run without a reactor thread: the engine, timers and a
///  manually advanced clock
pub struct TestReactor {
    pub engine: SimulatedEngine,
    pub timers: TimerQueue,
    pub clock: Arc<ManualClock>,
}

impl TestReactor {
    /// a reactor whose peer opens and closes everything
    pub fn new() -> TestReactor {
        TestReactor::with_engine(SimulatedEngine::echoing())
    }

    /// a reactor whose peer stays silent unless told otherwise
    pub fn manual() -> TestReactor {
        TestReactor::with_engine(SimulatedEngine::silent())
    }

    pub fn with_engine(engine: SimulatedEngine) -> TestReactor {
        TestReactor {
            engine,
            timers: TimerQueue::new(),
            clock: Arc::new(ManualClock::new()),
        }
    }

    pub fn ctx(&mut self) -> ReactorContext<'_> {
        ReactorContext {
            engine: &mut self.engine,
            timers: &mut self.timers,
            clock: self.clock.as_ref(),
        }
    }

    /// Feeds queued engine events to the handler until the engine has nothing more to report
    pub fn pump(&mut self, handler: &mut AmqpConnectionHandler) {
        for _ in 0..1000 {
            let events = self.engine.take_pending_events();
            if events.is_empty() {
                return;
            }
            for event in events {
                handler.on_event(&mut self.ctx(), event);
            }
        }
        panic!("engine events did not settle down");
    }

    /// Moves the clock forward, fires all timers that are due and processes the resulting events
    pub fn advance(&mut self, by: Duration, handler: &mut AmqpConnectionHandler) {
        self.clock.advance(by);
        let due = self.timers.pop_due(self.clock.now());
        for task in due {
            handler.on_timer(&mut self.ctx(), task);
        }
        self.pump(handler);
    }
}

impl Default for TestReactor {
    fn default() -> Self {
        TestReactor::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::message::MessageBody;

    #[tokio::test(start_paused = true)]
    async fn test_poll_events() {
        let mut engine = SimulatedEngine::echoing();
        engine.open_connection("hub", 5671).unwrap();
        assert_eq!(engine.poll_events(Duration::from_millis(10)).await.unwrap(), vec![Event::ConnectionBound, Event::ConnectionRemoteOpen]);

        let before = tokio::time::Instant::now();
        assert!(engine.poll_events(Duration::from_millis(10)).await.unwrap().is_empty());
        assert_eq!(tokio::time::Instant::now() - before, Duration::from_millis(10));
    }

    #[test]
    fn test_clones_share_state() {
        let engine = SimulatedEngine::silent();
        let mut clone = engine.clone();
        let session = clone.open_session().unwrap();
        let link = clone.open_link(session, &LinkSpec {
            name: "l".to_string(),
            role: crate::amqp::endpoint::LinkRole::Sender,
            address: "/target".to_string(),
            properties: Default::default(),
        }).unwrap();

        let message = AmqpMessage { body: MessageBody::Value("v".to_string()), ..Default::default() };
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        clone.send(link, b"0", &buf).unwrap();

        assert_eq!(engine.link_by_name("l"), Some(link));
        assert_eq!(engine.sent_messages(link), vec![(b"0".to_vec(), message)]);
        assert!(engine.take_pending_events().is_empty());
    }
}
