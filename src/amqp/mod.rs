//! The contract between the state machines in this crate and the AMQP protocol engine
//!  underneath them.

pub mod endpoint;
pub mod engine;
pub mod event;
pub mod message;
pub mod outcome;
