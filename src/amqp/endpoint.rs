use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Handle of a connection inside the protocol engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u64);

/// Handle of a session inside the protocol engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId(pub u64);

/// Handle of a link inside the protocol engine. Links are unique per engine, not per session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LinkId(pub u64);

/// Handle of a single delivery, valid until it is settled locally.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeliveryId(pub u64);

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// State of one side (local or remote) of an AMQP endpoint
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum EndpointState {
    #[default]
    Uninitialized,
    Active,
    Closed,
}

/// What an endpoint driver has to do after a close event was applied to its [EndpointStates]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloseAction {
    Nothing,
    /// the remote peer closed while the local side was still active: close locally
    CloseLocally,
    /// both sides are closed now, so the parent endpoint has to be closed as well
    CloseParent,
}

/// Local and remote state of a connection, session or link.
///
/// The close cascade is symmetric: whichever side closes second completes the endpoint, and
///  a completed endpoint asks its parent to close. A remote close of an endpoint that is
///  still active locally is never ignored - it is answered by a local close.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EndpointStates {
    pub local: EndpointState,
    pub remote: EndpointState,
}

impl EndpointStates {
    pub fn is_locally_active(&self) -> bool {
        self.local == EndpointState::Active
    }

    pub fn is_remotely_active(&self) -> bool {
        self.remote == EndpointState::Active
    }

    pub fn is_fully_closed(&self) -> bool {
        self.local == EndpointState::Closed && self.remote == EndpointState::Closed
    }

    pub fn on_local_open(&mut self) {
        self.local = EndpointState::Active;
    }

    pub fn on_remote_open(&mut self) {
        self.remote = EndpointState::Active;
    }

    /// Marks the local side as closed. Returns `true` if this is a transition, i.e. the
    ///  caller has to tell the engine.
    pub fn close_locally(&mut self) -> bool {
        if self.local == EndpointState::Closed {
            return false;
        }
        self.local = EndpointState::Closed;
        true
    }

    /// Applies the engine's echo of a local close
    pub fn on_local_close(&mut self) -> CloseAction {
        self.local = EndpointState::Closed;
        if self.remote == EndpointState::Closed {
            CloseAction::CloseParent
        }
        else {
            CloseAction::Nothing
        }
    }

    pub fn on_remote_close(&mut self) -> CloseAction {
        self.remote = EndpointState::Closed;
        match self.local {
            EndpointState::Closed => CloseAction::CloseParent,
            _ => CloseAction::CloseLocally,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// Everything the engine needs to attach a link
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkSpec {
    pub name: String,
    pub role: LinkRole,
    /// target address for senders, source address for receivers
    pub address: String,
    pub properties: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use EndpointState::*;

    #[rstest]
    #[case::remote_still_open(Active, CloseAction::Nothing)]
    #[case::remote_never_opened(Uninitialized, CloseAction::Nothing)]
    #[case::remote_already_closed(Closed, CloseAction::CloseParent)]
    fn test_on_local_close(#[case] remote: EndpointState, #[case] expected: CloseAction) {
        let mut states = EndpointStates { local: Active, remote };
        assert_eq!(states.on_local_close(), expected);
        assert_eq!(states.local, Closed);
    }

    #[rstest]
    #[case::local_active(Active, CloseAction::CloseLocally)]
    #[case::local_uninitialized(Uninitialized, CloseAction::CloseLocally)]
    #[case::local_closed(Closed, CloseAction::CloseParent)]
    fn test_on_remote_close(#[case] local: EndpointState, #[case] expected: CloseAction) {
        let mut states = EndpointStates { local, remote: Active };
        assert_eq!(states.on_remote_close(), expected);
        assert_eq!(states.remote, Closed);
    }

    #[test]
    fn test_close_locally_is_idempotent() {
        let mut states = EndpointStates::default();
        states.on_local_open();
        assert!(states.close_locally());
        assert!(!states.close_locally());
        assert!(!states.is_fully_closed());
        assert_eq!(states.on_remote_close(), CloseAction::CloseParent);
        assert!(states.is_fully_closed());
    }
}
