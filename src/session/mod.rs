use tracing::{debug, warn};
use crate::amqp::endpoint::{CloseAction, EndpointStates, LinkId, SessionId};
use crate::amqp::outcome::ErrorCondition;
use crate::link::LinkEvents;
use crate::reactor::ReactorContext;

pub mod application_session;
pub mod cbs_session;

#[derive(Debug)]
pub struct SessionEndpoint {
    pub id: SessionId,
    pub states: EndpointStates,
}

impl SessionEndpoint {
    pub fn open(ctx: &mut ReactorContext) -> anyhow::Result<SessionEndpoint> {
        let id = ctx.engine.open_session()?;
        let mut states = EndpointStates::default();
        states.on_local_open();
        Ok(SessionEndpoint { id, states })
    }

    pub fn close(&mut self, ctx: &mut ReactorContext) {
        if self.states.close_locally() {
            debug!("closing {}", self.id);
            ctx.engine.close_session(self.id);
        }
    }
}

/// Lifecycle notifications of a session and the links it owns. A session closes its links
///  before it closes itself, and a link that completes its close takes the session down with it.
pub trait SessionEvents {
    fn session(&self) -> &SessionEndpoint;

    fn session_mut(&mut self) -> &mut SessionEndpoint;

    fn link_mut(&mut self, link: LinkId) -> Option<&mut dyn LinkEvents>;

    /// Closes every link, then the session
    fn close(&mut self, ctx: &mut ReactorContext);

    fn on_remote_open(&mut self) {
        let session = self.session_mut();
        debug!("{} opened remotely", session.id);
        session.states.on_remote_open();
    }

    /// Returns [CloseAction::CloseParent] if the connection has to be closed now
    fn on_local_close(&mut self, _ctx: &mut ReactorContext) -> CloseAction {
        let session = self.session_mut();
        debug!("{} closed locally", session.id);
        session.states.on_local_close()
    }

    /// Returns [CloseAction::CloseParent] if the connection has to be closed now
    fn on_remote_close(&mut self, ctx: &mut ReactorContext, error: Option<&ErrorCondition>) -> CloseAction {
        let session = self.session_mut();
        match (session.states.is_locally_active(), error) {
            (true, Some(error)) => warn!("{} closed remotely while in use: {}", session.id, error.describe()),
            (true, None) => warn!("{} closed remotely while in use", session.id),
            (false, _) => debug!("{} closed remotely", session.id),
        }

        match session.states.on_remote_close() {
            CloseAction::CloseLocally => {
                self.close(ctx);
                CloseAction::Nothing
            }
            other => other,
        }
    }

    fn on_link_local_close(&mut self, ctx: &mut ReactorContext, link: LinkId) {
        let action = match self.link_mut(link) {
            Some(l) => l.on_local_close(ctx),
            None => return,
        };
        if action == CloseAction::CloseParent {
            self.close(ctx);
        }
    }

    fn on_link_remote_close(&mut self, ctx: &mut ReactorContext, link: LinkId, error: Option<&ErrorCondition>) {
        let action = match self.link_mut(link) {
            Some(l) => l.on_remote_close(ctx, error),
            None => return,
        };
        if action == CloseAction::CloseParent {
            self.close(ctx);
        }
    }
}
