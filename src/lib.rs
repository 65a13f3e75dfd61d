//! The AMQP connection, session and link core of an IoT hub service client.
//!
//! A connection runs on a single reactor thread that owns all protocol state. The reactor drives
//!  a [amqp::engine::ProtocolEngine] and dispatches its events to the connection handler, which
//!  authenticates (SASL PLAIN, or CBS tokens that are renewed before they expire), opens the
//!  application links, and correlates message acknowledgements back to application callbacks.
//!  Application threads talk to a running connection through the [client] types only.

pub mod amqp;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod reactor;
pub mod response_verification;
pub mod session;
pub mod test_util;
pub mod util;
