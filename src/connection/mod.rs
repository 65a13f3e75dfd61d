//! The connection state machine: transport configuration, authentication, and the dispatch of
//!  engine events to the sessions and links that own them.

pub mod handler;
pub mod verification;
