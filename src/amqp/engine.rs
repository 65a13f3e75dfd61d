use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::amqp::endpoint::{ConnectionId, DeliveryId, LinkId, LinkSpec, SessionId};
use crate::amqp::event::Event;
use crate::amqp::outcome::{DeliveryOutcome, ErrorCondition};
use crate::config::{ProxyConfig, TlsConfig};

/// The AMQP 1.0 protocol engine that the reactor drives: framing, SASL, TLS, WebSocket
///  tunneling and the socket itself live behind this trait. The engine is owned by exactly one
///  reactor and is only ever called from that reactor's thread.
///
/// Commands take effect asynchronously. Their consequences (remote opens and closes, echoed
///  local closes, deliveries) are reported as [Event]s from [ProtocolEngine::poll_events].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProtocolEngine: Send + 'static {
    /// Creates the transport binding towards `host_name:port` and starts opening the connection
    fn open_connection(&mut self, host_name: &str, port: u16) -> anyhow::Result<ConnectionId>;

    fn configure_sasl_plain(&mut self, user_name: &str, password: &str);

    fn configure_sasl_anonymous(&mut self);

    fn configure_tls(&mut self, tls: &TlsConfig) -> anyhow::Result<()>;

    /// Inserts a WebSocket framing layer beneath the AMQP layer. Must be called before SASL
    ///  negotiation starts.
    fn add_websocket_layer(&mut self, host_name: &str, path: &str, sub_protocol: &str);

    fn configure_proxy(&mut self, proxy: &ProxyConfig);

    fn open_session(&mut self) -> anyhow::Result<SessionId>;

    /// Creates a link with the given name, address and properties, and opens it right away
    fn open_link(&mut self, session: SessionId, spec: &LinkSpec) -> anyhow::Result<LinkId>;

    /// Grants additional credit on a receiver link
    fn flow(&mut self, link: LinkId, credit: u32);

    /// Transmits an encoded message as a single delivery and advances the link to the next
    ///  delivery
    fn send(&mut self, link: LinkId, delivery_tag: &[u8], payload: &[u8]) -> anyhow::Result<DeliveryId>;

    /// Reads the complete payload of a readable, non-partial delivery
    fn read(&mut self, delivery: DeliveryId) -> anyhow::Result<Vec<u8>>;

    /// Applies a local disposition (if any) and settles the delivery. The delivery handle is
    ///  invalid afterwards.
    fn settle(&mut self, delivery: DeliveryId, outcome: Option<DeliveryOutcome>);

    fn close_link(&mut self, link: LinkId);

    fn close_session(&mut self, session: SessionId);

    fn close_connection(&mut self, error: Option<ErrorCondition>);

    /// Waits for protocol activity for at most `timeout`. Implementations must be cancel safe:
    ///  the reactor drops this future when a command arrives first.
    async fn poll_events(&mut self, timeout: Duration) -> anyhow::Result<Vec<Event>>;
}
