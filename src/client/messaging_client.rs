use std::sync::Arc;
use std::time::Duration;
use crate::client::{ClientConnection, EngineFactory};
use crate::config::{ApplicationLinkKind, ConnectionConfig};
use crate::connection::handler::ConnectionCallbacks;
use crate::error::{ErrorProcessor, IotHubError};
use crate::link::cloud_to_device::{CloudToDeviceMessage, PendingSend, SendCallback, SendContext};

/// Sends cloud-to-device messages. Every message's outcome is reported through the callback it
///  was sent with, on the connection's reactor thread.
pub struct MessagingClient {
    connection: ClientConnection,
    error_processor: Option<ErrorProcessor>,
}

impl MessagingClient {
    pub fn new(mut config: ConnectionConfig, engine_factory: Arc<dyn EngineFactory>) -> anyhow::Result<MessagingClient> {
        config.application_links = vec![ApplicationLinkKind::CloudToDeviceSender];
        Ok(MessagingClient {
            connection: ClientConnection::new("messaging-client", config, engine_factory)?,
            error_processor: None,
        })
    }

    pub fn with_error_processor(mut self, error_processor: ErrorProcessor) -> MessagingClient {
        self.error_processor = Some(error_processor);
        self
    }

    pub fn open(&mut self, timeout: Duration) -> Result<(), IotHubError> {
        let callbacks = ConnectionCallbacks {
            error_processor: self.error_processor.clone(),
            ..Default::default()
        };
        self.connection.start(callbacks, timeout)
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_running()
    }

    /// Queues a message for `device_id` (and `module_id` if given). The callback receives the
    ///  service's verdict together with `context`. If the client is not open, it is called
    ///  right away with a connection closed error.
    pub fn send(&self, device_id: &str, module_id: Option<&str>, message: CloudToDeviceMessage, callback: SendCallback, context: Option<SendContext>) {
        let pending = PendingSend::new(device_id, module_id, message, callback, context);
        match self.connection.handle() {
            Some(handle) => handle.send(pending),
            None => pending.fail(IotHubError::ConnectionClosed("the messaging client is not open".to_string())),
        }
    }

    /// Messages that were not acknowledged by then are failed
    pub fn close(&mut self, timeout: Duration) -> bool {
        self.connection.stop(timeout)
    }
}
