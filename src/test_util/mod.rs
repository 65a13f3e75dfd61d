//! Utilities for testing code that runs on top of a connection without a real AMQP peer. They
//!  are used for testing this crate itself, and they are exported for application testing.

pub mod credential;
pub mod engine;
