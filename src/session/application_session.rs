use anyhow::anyhow;
use tracing::{debug, warn};
use crate::amqp::endpoint::LinkId;
use crate::amqp::event::DeliveryEvent;
use crate::config::{ApplicationLinkKind, ConnectionConfig};
use crate::error::IotHubError;
use crate::link::cloud_to_device::{CloudToDeviceSenderLink, PendingSend};
use crate::link::feedback::open_feedback_receiver;
use crate::link::file_upload::open_file_upload_notification_receiver;
use crate::link::receiver::{AcknowledgingReceiverLink, MessageProcessor};
use crate::link::LinkEvents;
use crate::reactor::ReactorContext;
use crate::session::{SessionEndpoint, SessionEvents};

/// Application handlers for the service-bound receiver links
#[derive(Clone, Default)]
pub struct ApplicationProcessors {
    pub feedback: Option<MessageProcessor>,
    pub file_upload_notification: Option<MessageProcessor>,
}

pub enum ApplicationLink {
    CloudToDevice(CloudToDeviceSenderLink),
    Receiver(AcknowledgingReceiverLink),
}

impl ApplicationLink {
    fn as_link_events(&mut self) -> &mut dyn LinkEvents {
        match self {
            ApplicationLink::CloudToDevice(l) => l,
            ApplicationLink::Receiver(l) => l,
        }
    }

    fn endpoint_id(&self) -> LinkId {
        match self {
            ApplicationLink::CloudToDevice(l) => l.endpoint().id,
            ApplicationLink::Receiver(l) => l.endpoint().id,
        }
    }

    fn is_open(&self) -> bool {
        match self {
            ApplicationLink::CloudToDevice(l) => l.endpoint().is_open(),
            ApplicationLink::Receiver(l) => l.endpoint().is_open(),
        }
    }
}

/// The session that carries the application's links once the connection is authenticated
pub struct ApplicationSession {
    session: SessionEndpoint,
    links: Vec<ApplicationLink>,
}

impl ApplicationSession {
    pub fn open(ctx: &mut ReactorContext, config: &ConnectionConfig, processors: &ApplicationProcessors) -> anyhow::Result<ApplicationSession> {
        let session = SessionEndpoint::open(ctx)?;
        debug!("opening application {} with links {:?}", session.id, config.application_links);

        let mut links = Vec::new();
        for kind in &config.application_links {
            let link = match kind {
                ApplicationLinkKind::CloudToDeviceSender => ApplicationLink::CloudToDevice(
                    CloudToDeviceSenderLink::open(ctx, session.id, &config.client_version, config.send_interval)?),
                ApplicationLinkKind::FeedbackReceiver => {
                    let processor = processors.feedback.clone()
                        .ok_or_else(|| anyhow!("no feedback processor registered"))?;
                    ApplicationLink::Receiver(open_feedback_receiver(ctx, session.id, &config.client_version, processor)?)
                }
                ApplicationLinkKind::FileUploadNotificationReceiver => {
                    let processor = processors.file_upload_notification.clone()
                        .ok_or_else(|| anyhow!("no file upload notification processor registered"))?;
                    ApplicationLink::Receiver(open_file_upload_notification_receiver(ctx, session.id, &config.client_version, processor)?)
                }
            };
            links.push(link);
        }

        Ok(ApplicationSession { session, links })
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        self.links.iter()
            .map(|l| l.endpoint_id())
            .collect()
    }

    /// true once the session and all of its links are attached on both sides
    pub fn is_open(&self) -> bool {
        self.session.states.is_locally_active()
            && self.session.states.is_remotely_active()
            && self.links.iter().all(|l| l.is_open())
    }

    pub fn on_link_remote_open(&mut self, ctx: &mut ReactorContext, link: LinkId) {
        if let Some(l) = self.link_mut(link) {
            l.on_remote_open(ctx);
        }
    }

    pub fn on_delivery(&mut self, ctx: &mut ReactorContext, delivery: &DeliveryEvent) {
        match self.links.iter_mut().find(|l| l.endpoint_id() == delivery.link) {
            Some(ApplicationLink::CloudToDevice(l)) => l.on_delivery_update(ctx, delivery),
            Some(ApplicationLink::Receiver(l)) => {
                l.on_delivery(ctx, delivery);
            }
            None => warn!("delivery for unknown link {} - ignoring", delivery.link),
        }
    }

    fn cloud_to_device(&mut self) -> Option<&mut CloudToDeviceSenderLink> {
        self.links.iter_mut()
            .find_map(|l| match l {
                ApplicationLink::CloudToDevice(l) => Some(l),
                ApplicationLink::Receiver(_) => None,
            })
    }

    pub fn enqueue(&mut self, pending: PendingSend) {
        match self.cloud_to_device() {
            Some(link) => link.enqueue(pending),
            None => pending.fail(IotHubError::NotAllowed("the connection has no cloud-to-device link".to_string())),
        }
    }

    pub fn on_send_timer(&mut self, ctx: &mut ReactorContext) {
        if let Some(link) = self.cloud_to_device() {
            link.on_send_timer(ctx);
        }
    }

    /// Fails everything the cloud-to-device link has not delivered yet
    pub fn fail_outstanding(&mut self) {
        if let Some(link) = self.cloud_to_device() {
            link.fail_outstanding();
        }
    }
}

impl SessionEvents for ApplicationSession {
    fn session(&self) -> &SessionEndpoint {
        &self.session
    }

    fn session_mut(&mut self) -> &mut SessionEndpoint {
        &mut self.session
    }

    fn link_mut(&mut self, link: LinkId) -> Option<&mut dyn LinkEvents> {
        self.links.iter_mut()
            .find(|l| l.endpoint_id() == link)
            .map(|l| l.as_link_events())
    }

    fn close(&mut self, ctx: &mut ReactorContext) {
        for link in &mut self.links {
            link.as_link_events().endpoint_mut().close(ctx);
        }
        self.session.close(ctx);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use super::*;
    use crate::config::{Authentication, ServiceProtocol};
    use crate::link::cloud_to_device::{SendContext, SendResult};
    use crate::link::receiver::{AcknowledgementType, ServiceBoundMessage};
    use crate::test_util::engine::{EngineCall, TestReactor};

    fn config(links: Vec<ApplicationLinkKind>) -> ConnectionConfig {
        let mut config = ConnectionConfig::new("myhub.azure-devices.net", ServiceProtocol::Amqps, Authentication::SaslPlain {
            user_name: "user".to_string(),
            sas_token: "token".to_string(),
        });
        config.application_links = links;
        config
    }

    fn processors() -> ApplicationProcessors {
        let processor: MessageProcessor = Arc::new(|_: &ServiceBoundMessage| AcknowledgementType::Complete);
        ApplicationProcessors {
            feedback: Some(processor.clone()),
            file_upload_notification: Some(processor),
        }
    }

    #[test]
    fn test_opens_configured_links() {
        let mut reactor = TestReactor::manual();
        let session = ApplicationSession::open(&mut reactor.ctx(), &config(vec![ApplicationLinkKind::CloudToDeviceSender, ApplicationLinkKind::FeedbackReceiver]), &processors()).unwrap();

        let names = session.link_ids().iter()
            .map(|id| reactor.engine.link_spec(*id).unwrap().name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["cloud-to-device-sender", "feedback-receiver"]);
        assert!(!session.is_open());
    }

    #[test]
    fn test_missing_processor() {
        let mut reactor = TestReactor::manual();
        let result = ApplicationSession::open(&mut reactor.ctx(), &config(vec![ApplicationLinkKind::FileUploadNotificationReceiver]), &ApplicationProcessors::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_is_open_requires_all_links() {
        let mut reactor = TestReactor::manual();
        let mut session = ApplicationSession::open(&mut reactor.ctx(), &config(vec![ApplicationLinkKind::FeedbackReceiver, ApplicationLinkKind::FileUploadNotificationReceiver]), &processors()).unwrap();
        let links = session.link_ids();

        session.on_remote_open();
        session.on_link_remote_open(&mut reactor.ctx(), links[0]);
        assert!(!session.is_open());
        session.on_link_remote_open(&mut reactor.ctx(), links[1]);
        assert!(session.is_open());
    }

    #[test]
    fn test_link_close_cascades_to_session() {
        let mut reactor = TestReactor::manual();
        let mut session = ApplicationSession::open(&mut reactor.ctx(), &config(vec![ApplicationLinkKind::FeedbackReceiver]), &processors()).unwrap();
        let link = session.link_ids()[0];
        session.on_remote_open();
        session.on_link_remote_open(&mut reactor.ctx(), link);

        // the service detaches the link: it is closed locally, which completes it
        session.on_link_remote_close(&mut reactor.ctx(), link, None);
        assert!(reactor.engine.calls().contains(&EngineCall::CloseLink(link)));
        assert!(!reactor.engine.calls().contains(&EngineCall::CloseSession(session.session().id)));

        session.on_link_local_close(&mut reactor.ctx(), link);
        assert!(reactor.engine.calls().contains(&EngineCall::CloseSession(session.session().id)));
    }

    #[test]
    fn test_enqueue_without_cloud_to_device_link_fails() {
        let mut reactor = TestReactor::manual();
        let mut session = ApplicationSession::open(&mut reactor.ctx(), &config(vec![]), &processors()).unwrap();

        let failed = Arc::new(AtomicBool::new(false));
        let failed2 = failed.clone();
        session.enqueue(PendingSend::new("d1", None, Default::default(), Box::new(move |result: SendResult, _: Option<SendContext>| {
            assert!(matches!(result.error, Some(IotHubError::NotAllowed(_))));
            failed2.store(true, Ordering::SeqCst);
        }), None));
        assert!(failed.load(Ordering::SeqCst));
    }
}
