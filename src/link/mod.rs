use std::collections::BTreeMap;
use tracing::{debug, debug_span, warn, Span};
use uuid::Uuid;
use crate::amqp::endpoint::{CloseAction, EndpointStates, LinkId, LinkRole, LinkSpec, SessionId};
use crate::amqp::outcome::ErrorCondition;
use crate::reactor::ReactorContext;

pub mod cbs;
pub mod cloud_to_device;
pub mod delivery_tag;
pub mod feedback;
pub mod file_upload;
pub mod receiver;
pub mod sender;

pub const API_VERSION_PROPERTY: &str = "com.microsoft:api-version";
pub const API_VERSION: &str = "2021-04-12";
pub const CLIENT_VERSION_PROPERTY: &str = "com.microsoft:client-version";

/// Local bookkeeping for one link: identity, address and local / remote state
#[derive(Debug)]
pub struct LinkEndpoint {
    pub id: LinkId,
    pub session: SessionId,
    pub name: String,
    pub address: String,
    /// only used to correlate log output
    pub correlation_id: Uuid,
    /// carries name and correlation id, entered while the link handles an event
    pub span: Span,
    pub states: EndpointStates,
}

impl LinkEndpoint {
    /// Attaches the link with the version properties every link advertises, and opens it right
    ///  away
    pub fn open(ctx: &mut ReactorContext, session: SessionId, name: &str, role: LinkRole, address: &str, client_version: &str) -> anyhow::Result<LinkEndpoint> {
        let mut properties = BTreeMap::new();
        properties.insert(API_VERSION_PROPERTY.to_string(), API_VERSION.to_string());
        properties.insert(CLIENT_VERSION_PROPERTY.to_string(), client_version.to_string());

        let spec = LinkSpec {
            name: name.to_string(),
            role,
            address: address.to_string(),
            properties,
        };
        let id = ctx.engine.open_link(session, &spec)?;

        let correlation_id = Uuid::new_v4();
        let span = debug_span!("link", name = %name, correlation_id = %correlation_id);
        span.in_scope(|| debug!("opening {:?} link {} to {}", role, id, address));

        let mut states = EndpointStates::default();
        states.on_local_open();
        Ok(LinkEndpoint {
            id,
            session,
            name: name.to_string(),
            address: address.to_string(),
            correlation_id,
            span,
            states,
        })
    }

    pub fn is_open(&self) -> bool {
        self.states.is_locally_active() && self.states.is_remotely_active()
    }

    /// Closes the link locally unless it is closed already
    pub fn close(&mut self, ctx: &mut ReactorContext) {
        let _span = self.span.enter();
        if self.states.close_locally() {
            debug!("closing link");
            ctx.engine.close_link(self.id);
        }
    }
}

/// Lifecycle notifications of a link. The default implementations drive the symmetric close
///  cascade; link types with state tied to the link's lifetime extend them.
pub trait LinkEvents {
    fn endpoint(&self) -> &LinkEndpoint;

    fn endpoint_mut(&mut self) -> &mut LinkEndpoint;

    fn on_remote_open(&mut self, _ctx: &mut ReactorContext) {
        let endpoint = self.endpoint_mut();
        let _span = endpoint.span.clone().entered();
        debug!("link opened remotely");
        endpoint.states.on_remote_open();
    }

    /// Returns [CloseAction::CloseParent] if the session has to be closed now
    fn on_local_close(&mut self, _ctx: &mut ReactorContext) -> CloseAction {
        let endpoint = self.endpoint_mut();
        let _span = endpoint.span.clone().entered();
        debug!("link closed locally");
        endpoint.states.on_local_close()
    }

    /// Returns [CloseAction::CloseParent] if the session has to be closed now. A remote close of a
    ///  link that is still active locally is answered by a local close.
    fn on_remote_close(&mut self, ctx: &mut ReactorContext, error: Option<&ErrorCondition>) -> CloseAction {
        let endpoint = self.endpoint_mut();
        let _span = endpoint.span.clone().entered();
        match error {
            Some(error) => warn!("link closed remotely: {}", error.describe()),
            None => debug!("link closed remotely"),
        }

        match endpoint.states.on_remote_close() {
            CloseAction::CloseLocally => {
                endpoint.close(ctx);
                CloseAction::Nothing
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::engine::TestReactor;

    #[test]
    fn test_span_carries_correlation_id() {
        let mut reactor = TestReactor::manual();
        let session = reactor.engine.open_session_for_test();
        let endpoint = LinkEndpoint::open(&mut reactor.ctx(), session, "feedback-receiver", LinkRole::Receiver, "/messages/servicebound/feedback", "test/1").unwrap();

        let metadata = endpoint.span.metadata().unwrap();
        assert_eq!(metadata.name(), "link");
        assert!(metadata.fields().field("name").is_some());
        assert!(metadata.fields().field("correlation_id").is_some());
        assert_ne!(endpoint.correlation_id, Uuid::nil());
    }
}
