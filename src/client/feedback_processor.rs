use std::sync::Arc;
use std::time::Duration;
use crate::client::{ClientConnection, EngineFactory};
use crate::config::{ApplicationLinkKind, ConnectionConfig};
use crate::connection::handler::ConnectionCallbacks;
use crate::error::{ErrorProcessor, IotHubError};
use crate::link::receiver::MessageProcessor;
use crate::session::application_session::ApplicationProcessors;

/// Receives delivery feedback for cloud-to-device messages that were sent with an
///  acknowledgement request. The processor's verdict settles each feedback message.
pub struct MessageFeedbackProcessorClient {
    connection: ClientConnection,
    processor: MessageProcessor,
    error_processor: Option<ErrorProcessor>,
}

impl MessageFeedbackProcessorClient {
    pub fn new(mut config: ConnectionConfig, engine_factory: Arc<dyn EngineFactory>, processor: MessageProcessor) -> anyhow::Result<MessageFeedbackProcessorClient> {
        config.application_links = vec![ApplicationLinkKind::FeedbackReceiver];
        Ok(MessageFeedbackProcessorClient {
            connection: ClientConnection::new("feedback-processor", config, engine_factory)?,
            processor,
            error_processor: None,
        })
    }

    pub fn with_error_processor(mut self, error_processor: ErrorProcessor) -> MessageFeedbackProcessorClient {
        self.error_processor = Some(error_processor);
        self
    }

    /// Opens the connection and waits up to `timeout` for the feedback link to be attached
    pub fn start(&mut self, timeout: Duration) -> Result<(), IotHubError> {
        let callbacks = ConnectionCallbacks {
            processors: ApplicationProcessors {
                feedback: Some(self.processor.clone()),
                file_upload_notification: None,
            },
            error_processor: self.error_processor.clone(),
            on_opened: None,
        };
        self.connection.start(callbacks, timeout)
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.connection.stop(timeout)
    }

    pub fn is_running(&self) -> bool {
        self.connection.is_running()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;
    use super::*;
    use crate::amqp::message::{AmqpMessage, MessageBody};
    use crate::amqp::outcome::DeliveryOutcome;
    use crate::client::test_support::engine_factory;
    use crate::config::{Authentication, ServiceProtocol};
    use crate::link::feedback::FEEDBACK_LINK_NAME;
    use crate::link::receiver::{AcknowledgementType, ServiceBoundMessage};
    use crate::test_util::engine::{EngineCall, SimulatedEngine};

    fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_feedback_is_processed_and_settled() {
        let engine = SimulatedEngine::echoing();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let processor: MessageProcessor = Arc::new(move |message: &ServiceBoundMessage| {
            received2.lock().unwrap().push(message.body_as_str().map(|s| s.to_string()));
            AcknowledgementType::Complete
        });

        let config = ConnectionConfig::new("myhub.azure-devices.net", ServiceProtocol::Amqps, Authentication::SaslPlain {
            user_name: "iothubowner@sas.root.myhub".to_string(),
            sas_token: "SharedAccessSignature sr=myhub".to_string(),
        });
        let mut client = MessageFeedbackProcessorClient::new(config, engine_factory(&engine), processor).unwrap();
        client.start(Duration::from_secs(5)).unwrap();
        assert!(client.is_running());

        let link = engine.link_by_name(FEEDBACK_LINK_NAME).unwrap();
        let message = AmqpMessage {
            body: MessageBody::Data("[{\"statusCode\":\"Success\"}]".into()),
            ..Default::default()
        };
        let delivery = engine.deliver_message(link, &message);

        wait_for("the feedback to be processed", || !received.lock().unwrap().is_empty());
        let settle = EngineCall::Settle { delivery: delivery.delivery, outcome: Some(DeliveryOutcome::Accepted) };
        wait_for("the feedback to be settled", || engine.calls().contains(&settle));
        assert_eq!(received.lock().unwrap()[0].as_deref(), Some("[{\"statusCode\":\"Success\"}]"));

        assert!(client.stop(Duration::from_secs(5)));
        assert!(!client.is_running());
    }
}
